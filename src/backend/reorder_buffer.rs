use std::fmt;

use crate::error::SimError;
use crate::instructions::instructions::{ArchReg, Value, WordType};

/// Identifies a ROB slot. Tags are handed out in allocation order; the slot
/// index is the tag modulo the capacity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct RobTag(pub u64);

impl fmt::Display for RobTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ROB#{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum ROBSlotState {
    IDLE,
    // allocated at issue, waiting for its result
    ISSUED,
    // the result has been written back over the CDB
    EXECUTED,
}

#[derive(Clone, Debug)]
pub(crate) struct ROBSlot {
    pub(crate) tag: RobTag,
    // sequence number of the owning instruction
    pub(crate) seq: u64,
    pub(crate) state: ROBSlotState,
    pub(crate) sink: Option<ArchReg>,
    pub(crate) result: Option<Value>,
    pub(crate) written_back_at: Option<u64>,
    pub(crate) sb_index: Option<u16>,
    // address of an out of bounds memory access; raised at commit
    pub(crate) fault: Option<WordType>,
}

impl ROBSlot {
    fn new(index: u64) -> ROBSlot {
        ROBSlot {
            tag: RobTag(index),
            seq: 0,
            state: ROBSlotState::IDLE,
            sink: None,
            result: None,
            written_back_at: None,
            sb_index: None,
            fault: None,
        }
    }

    fn reset(&mut self) {
        self.state = ROBSlotState::IDLE;
        self.sink = None;
        self.result = None;
        self.written_back_at = None;
        self.sb_index = None;
        self.fault = None;
    }
}

/// The reorder buffer: a circular FIFO of in-flight instructions.
///
/// Everything before `head` is retired; everything from `tail` on is free.
#[derive(Debug)]
pub(crate) struct ROB {
    capacity: u16,
    head: u64,
    tail: u64,
    slots: Vec<ROBSlot>,
}

impl ROB {
    pub(crate) fn new(capacity: u16) -> Self {
        let mut slots = Vec::with_capacity(capacity as usize);
        for k in 0..capacity {
            slots.push(ROBSlot::new(k as u64));
        }

        Self {
            capacity,
            head: 0,
            tail: 0,
            slots,
        }
    }

    fn to_index(&self, seq: u64) -> usize {
        (seq % self.capacity as u64) as usize
    }

    pub(crate) fn size(&self) -> u16 {
        (self.tail - self.head) as u16
    }

    pub(crate) fn has_space(&self) -> bool {
        self.capacity > self.size()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// True if the tag belongs to an allocated, not yet retired slot.
    pub(crate) fn is_live(&self, tag: RobTag) -> bool {
        self.head <= tag.0 && tag.0 < self.tail
    }

    pub(crate) fn allocate(&mut self, seq: u64, sink: Option<ArchReg>) -> Result<RobTag, SimError> {
        if !self.has_space() {
            return Err(SimError::CapacityExceeded { resource: "reorder buffer" });
        }

        let tag = RobTag(self.tail);
        let index = self.to_index(self.tail);
        self.tail += 1;

        let slot = &mut self.slots[index];
        debug_assert!(slot.state == ROBSlotState::IDLE);
        slot.tag = tag;
        slot.seq = seq;
        slot.sink = sink;
        slot.state = ROBSlotState::ISSUED;
        Ok(tag)
    }

    pub(crate) fn get(&self, tag: RobTag) -> &ROBSlot {
        debug_assert!(self.is_live(tag), "{} is not live", tag);
        &self.slots[self.to_index(tag.0)]
    }

    pub(crate) fn get_mut(&mut self, tag: RobTag) -> &mut ROBSlot {
        debug_assert!(self.is_live(tag), "{} is not live", tag);
        let index = self.to_index(tag.0);
        &mut self.slots[index]
    }

    /// The value of a slot, if it has been written back already.
    pub(crate) fn ready_value(&self, tag: RobTag) -> Option<Value> {
        if !self.is_live(tag) {
            return None;
        }
        let slot = self.get(tag);
        match slot.state {
            ROBSlotState::EXECUTED => slot.result,
            _ => None,
        }
    }

    /// Stores a result delivered by the CDB. The slot is not retired.
    pub(crate) fn resolve(&mut self, tag: RobTag, result: Option<Value>, cycle: u64) {
        let slot = self.get_mut(tag);
        debug_assert!(slot.state == ROBSlotState::ISSUED, "{} resolved twice", tag);
        slot.result = result;
        slot.written_back_at = Some(cycle);
        slot.state = ROBSlotState::EXECUTED;
    }

    /// The oldest in-flight slot.
    pub(crate) fn head(&self) -> Option<&ROBSlot> {
        if self.is_empty() {
            return None;
        }
        Some(&self.slots[self.to_index(self.head)])
    }

    /// True if the oldest slot was written back in an earlier cycle and can
    /// retire in `cycle`.
    pub(crate) fn head_has_executed(&self, cycle: u64) -> bool {
        match self.head() {
            None => false,
            Some(slot) => slot.state == ROBSlotState::EXECUTED
                && slot.written_back_at.map_or(false, |wb| wb < cycle),
        }
    }

    /// Retires the oldest slot if it is ready; otherwise commit stalls and
    /// `None` is returned. The retired slot is handed back by value.
    pub(crate) fn commit_oldest(&mut self, cycle: u64) -> Option<ROBSlot> {
        if !self.head_has_executed(cycle) {
            return None;
        }

        let index = self.to_index(self.head);
        let retired = self.slots[index].clone();
        self.slots[index].reset();
        self.head += 1;
        Some(retired)
    }

    /// Frees every slot younger than `tag`, returning the sequence numbers of
    /// the instructions that owned them.
    pub(crate) fn flush_after(&mut self, tag: RobTag) -> Vec<u64> {
        debug_assert!(self.is_live(tag));

        let mut squashed = Vec::new();
        while self.tail > tag.0 + 1 {
            self.tail -= 1;
            let index = self.to_index(self.tail);
            squashed.push(self.slots[index].seq);
            self.slots[index].reset();
        }
        squashed.reverse();
        squashed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_until_full() {
        let mut rob = ROB::new(2);
        assert_eq!(rob.allocate(0, Some(ArchReg::Int(1))), Ok(RobTag(0)));
        assert_eq!(rob.allocate(1, None), Ok(RobTag(1)));
        assert!(!rob.has_space());
        assert_eq!(rob.allocate(2, None), Err(SimError::CapacityExceeded { resource: "reorder buffer" }));
        assert_eq!(rob.size(), 2);
    }

    #[test]
    fn test_commit_stalls_on_unready_head() {
        let mut rob = ROB::new(4);
        let older = rob.allocate(0, Some(ArchReg::Int(1))).unwrap();
        let younger = rob.allocate(1, Some(ArchReg::Int(2))).unwrap();

        rob.resolve(younger, Some(Value::Int(7)), 3);
        assert!(rob.commit_oldest(4).is_none());

        rob.resolve(older, Some(Value::Int(5)), 4);
        // not in the same cycle as the write back
        assert!(rob.commit_oldest(4).is_none());

        let first = rob.commit_oldest(5).unwrap();
        assert_eq!(first.tag, older);
        assert_eq!(first.result, Some(Value::Int(5)));

        let second = rob.commit_oldest(6).unwrap();
        assert_eq!(second.tag, younger);
        assert!(rob.is_empty());
    }

    #[test]
    fn test_ready_value() {
        let mut rob = ROB::new(4);
        let tag = rob.allocate(0, Some(ArchReg::Float(3))).unwrap();
        assert_eq!(rob.ready_value(tag), None);
        rob.resolve(tag, Some(Value::Float(1.5)), 2);
        assert_eq!(rob.ready_value(tag), Some(Value::Float(1.5)));
    }

    #[test]
    fn test_wraps_around() {
        let mut rob = ROB::new(2);
        for cycle in 0..5u64 {
            let tag = rob.allocate(cycle, None).unwrap();
            rob.resolve(tag, None, cycle);
            let retired = rob.commit_oldest(cycle + 1).unwrap();
            assert_eq!(retired.tag, tag);
            assert_eq!(retired.seq, cycle);
        }
        assert!(rob.is_empty());
    }

    #[test]
    fn test_flush_after() {
        let mut rob = ROB::new(8);
        let branch = rob.allocate(10, None).unwrap();
        rob.allocate(11, Some(ArchReg::Int(1))).unwrap();
        let last = rob.allocate(12, Some(ArchReg::Int(2))).unwrap();

        assert_eq!(rob.flush_after(branch), vec![11, 12]);
        assert_eq!(rob.size(), 1);
        assert!(rob.is_live(branch));
        assert!(!rob.is_live(last));

        // the freed tags are handed out again
        assert_eq!(rob.allocate(13, None), Ok(RobTag(1)));
        assert_eq!(rob.get(RobTag(1)).seq, 13);
    }
}
