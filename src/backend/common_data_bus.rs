use crate::backend::execution_unit::EU;

/// A result that won arbitration and is broadcast in the current cycle.
#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) struct CDBBroadcast {
    pub(crate) execute_end: u64,
    pub(crate) seq: u64,
    pub(crate) unit_index: usize,
    pub(crate) rs_index: u16,
}

/// The common data bus. Per cycle at most `width` results are broadcast; the
/// instruction that finished executing first goes first, and among those
/// the oldest one.
#[derive(Debug)]
pub(crate) struct CDB {
    width: u8,
}

impl CDB {
    pub(crate) fn new(width: u8) -> CDB {
        CDB { width }
    }

    /// Every result that is ready for broadcast in `cycle`.
    pub(crate) fn collect(units: &[EU], cycle: u64) -> Vec<CDBBroadcast> {
        let mut candidates = Vec::new();
        for (unit_index, eu) in units.iter().enumerate() {
            for (execute_end, seq, rs_index) in eu.ready(cycle) {
                candidates.push(CDBBroadcast { execute_end, seq, unit_index, rs_index });
            }
        }
        candidates
    }

    /// Picks the winners among the candidates. Returns them in broadcast
    /// order together with the number of candidates that have to retry.
    pub(crate) fn arbitrate(&self, mut candidates: Vec<CDBBroadcast>) -> (Vec<CDBBroadcast>, usize) {
        candidates.sort_by_key(|broadcast| (broadcast.execute_end, broadcast.seq));

        let width = self.width as usize;
        let deferred = candidates.len().saturating_sub(width);
        candidates.truncate(width);
        (candidates, deferred)
    }
}
