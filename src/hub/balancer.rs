//! Worker selection.

use super::worker::WorkerLoad;

/// Which worker to use and whether it was actually available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Available(usize),
    /// Nothing was available; the last worker is used anyway.
    LastResort(usize),
}

impl Selection {
    pub fn index(self) -> usize {
        match self {
            Selection::Available(i) | Selection::LastResort(i) => i,
        }
    }

    pub fn is_available(self) -> bool {
        matches!(self, Selection::Available(_))
    }
}

/// Pick the available worker with the fewest pending messages, earliest
/// index on ties. Returns `None` only when there are no workers.
pub fn select(loads: &[WorkerLoad], max_pending: usize) -> Option<Selection> {
    let best = loads
        .iter()
        .enumerate()
        .filter(|(_, load)| load.is_available(max_pending))
        .min_by_key(|(i, load)| (load.pending, *i))
        .map(|(i, _)| Selection::Available(i));

    best.or_else(|| loads.len().checked_sub(1).map(Selection::LastResort))
}
