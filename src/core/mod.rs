//! Core building blocks: the priority queue for deferred work and the
//! repeating task that drives background loops.

pub mod queue;
pub mod ticker;

pub use queue::{PriorityQueue, QueueEntry, QueueStats};
pub use ticker::RepeatingTask;
