use log::warn;

use SBEntryState::{ALLOCATED, COMMITTED, IDLE, READY};

use crate::instructions::instructions::{Value, WordType};

#[derive(Clone, Copy, PartialEq, Debug)]
enum SBEntryState {
    // not used.
    IDLE,
    // it is allocated for a store, the address isn't known yet
    ALLOCATED,
    // the value is stored, but it is still in speculative state. So there
    // is no guarantee that the store is going to be written to main memory
    READY,
    // the value is stored, and is not any longer in speculative state
    // and is guaranteed to be written to main memory
    COMMITTED,
}

#[derive(Debug)]
struct SBEntry {
    // sequence number of the store instruction
    seq: u64,
    value: Value,
    addr: WordType,
    state: SBEntryState,
}

impl SBEntry {
    fn reset(&mut self) {
        self.state = IDLE;
        self.seq = 0;
        self.addr = 0;
        self.value = Value::Int(0);
    }
}

/// The store buffer. Since stores are issued in program order, a slot is
/// allocated in program order, and since the buffer drains to memory from the
/// head, stores become visible in program order.
#[derive(Debug)]
pub(crate) struct SB {
    head: u64,
    tail: u64,
    entries: Vec<SBEntry>,
    capacity: u16,
    lfb_count: u8,
}

impl SB {
    pub(crate) fn new(capacity: u16, lfb_count: u8) -> SB {
        let mut entries = Vec::with_capacity(capacity as usize);
        for _ in 0..capacity {
            entries.push(SBEntry {
                seq: 0,
                value: Value::Int(0),
                addr: 0,
                state: IDLE,
            })
        }

        SB {
            capacity,
            head: 0,
            tail: 0,
            entries,
            lfb_count,
        }
    }

    fn to_index(&self, seq: u64) -> usize {
        (seq % self.capacity as u64) as usize
    }

    pub(crate) fn size(&self) -> u16 {
        (self.tail - self.head) as u16
    }

    pub(crate) fn has_space(&self) -> bool {
        self.size() < self.capacity
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tail == self.head
    }

    pub(crate) fn allocate(&mut self, seq: u64) -> u16 {
        assert!(self.has_space(), "StoreBuffer: can't allocate because there is no space");

        let index = self.to_index(self.tail);
        let sb_entry = &mut self.entries[index];
        sb_entry.state = ALLOCATED;
        sb_entry.seq = seq;
        self.tail += 1;
        index as u16
    }

    pub(crate) fn store(&mut self, index: u16, addr: WordType, value: Value) {
        let sb_entry = &mut self.entries[index as usize];

        match sb_entry.state {
            ALLOCATED => {
                sb_entry.addr = addr;
                sb_entry.value = value;
                sb_entry.state = READY;
            }
            _ => unreachable!("store into sb entry {} in state {:?}", index, sb_entry.state),
        }
    }

    pub(crate) fn commit(&mut self, index: u16) {
        let sb_entry = &mut self.entries[index as usize];

        match sb_entry.state {
            READY => sb_entry.state = COMMITTED,
            _ => unreachable!("commit of sb entry {} in state {:?}", index, sb_entry.state),
        }
    }

    /// Drops the entries of stores younger than `seq`. They sit at the tail,
    /// after every older store.
    pub(crate) fn flush_after(&mut self, seq: u64) -> usize {
        let mut flushed = 0;
        while self.tail > self.head {
            let index = self.to_index(self.tail - 1);
            let sb_entry = &mut self.entries[index];
            if sb_entry.seq <= seq {
                break;
            }
            debug_assert!(sb_entry.state != COMMITTED);
            sb_entry.reset();
            self.tail -= 1;
            flushed += 1;
        }
        flushed
    }

    /// True if a store older than `seq` hasn't computed its address yet; a
    /// load with that sequence number has to wait.
    pub(crate) fn has_unresolved_before(&self, seq: u64) -> bool {
        (self.head..self.tail)
            .map(|k| &self.entries[self.to_index(k)])
            .any(|sb_entry| sb_entry.seq < seq && sb_entry.state == ALLOCATED)
    }

    /// The value of the youngest store older than `seq` to `addr`.
    pub(crate) fn forward(&self, seq: u64, addr: WordType) -> Option<Value> {
        (self.head..self.tail)
            .rev()
            .map(|k| &self.entries[self.to_index(k)])
            .find(|sb_entry| {
                sb_entry.seq < seq
                    && sb_entry.addr == addr
                    && matches!(sb_entry.state, READY | COMMITTED)
            })
            .map(|sb_entry| sb_entry.value)
    }

    /// Writes up to `lfb_count` committed stores to memory.
    pub(crate) fn do_cycle(&mut self, memory: &mut [Value]) {
        for _ in 0..self.lfb_count {
            if self.tail == self.head {
                // store buffer is empty
                break;
            }

            let index = self.to_index(self.head);
            let sb_entry = &mut self.entries[index];
            match sb_entry.state {
                ALLOCATED | READY => return,
                COMMITTED => {
                    // write the store to memory
                    match usize::try_from(sb_entry.addr).ok().and_then(|addr| memory.get_mut(addr)) {
                        Some(word) => *word = sb_entry.value,
                        None => warn!("Dropping store to out of bounds address {}", sb_entry.addr),
                    }
                    sb_entry.reset();
                    self.head += 1;
                }
                IDLE => unreachable!("idle sb entry between head and tail"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarding_picks_youngest_older_store() {
        let mut sb = SB::new(4, 1);
        let first = sb.allocate(1);
        let second = sb.allocate(3);
        let third = sb.allocate(6);
        sb.store(first, 8, Value::Int(10));
        sb.store(second, 8, Value::Int(20));
        sb.store(third, 8, Value::Int(30));

        assert_eq!(sb.forward(5, 8), Some(Value::Int(20)));
        assert_eq!(sb.forward(2, 8), Some(Value::Int(10)));
        assert_eq!(sb.forward(1, 8), None);
        assert_eq!(sb.forward(5, 16), None);
    }

    #[test]
    fn test_unresolved_store_blocks_younger_loads() {
        let mut sb = SB::new(4, 1);
        let index = sb.allocate(2);
        assert!(sb.has_unresolved_before(3));
        assert!(!sb.has_unresolved_before(2));

        sb.store(index, 0, Value::Int(1));
        assert!(!sb.has_unresolved_before(3));
    }

    #[test]
    fn test_drains_committed_stores_in_order() {
        let mut memory = vec![Value::Int(0); 4];
        let mut sb = SB::new(4, 1);
        let first = sb.allocate(0);
        let second = sb.allocate(1);
        sb.store(second, 2, Value::Int(9));

        // the head isn't committed, nothing drains
        sb.commit(second);
        sb.do_cycle(&mut memory);
        assert_eq!(memory[2], Value::Int(0));

        sb.store(first, 1, Value::Int(4));
        sb.commit(first);
        sb.do_cycle(&mut memory);
        assert_eq!(memory[1], Value::Int(4));
        sb.do_cycle(&mut memory);
        assert_eq!(memory[2], Value::Int(9));
        assert!(sb.is_empty());
    }

    #[test]
    fn test_flush_after() {
        let mut sb = SB::new(4, 1);
        sb.allocate(1);
        sb.allocate(4);
        sb.allocate(5);
        assert_eq!(sb.flush_after(3), 2);
        assert_eq!(sb.size(), 1);
        assert!(sb.has_unresolved_before(2));
    }
}
