use std::fmt;
use std::fmt::Display;

use crate::backend::reorder_buffer::RobTag;
use crate::instructions::instructions::{mnemonic, Opcode, Operand, Value, WordType};

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum RSState {
    IDLE,
    // dispatched; waiting for operands or for the unit
    WAITING,
    EXECUTING,
    // executed; waiting for the CDB
    COMPLETED,
}

// A single reservation station
#[derive(Clone, Debug)]
pub(crate) struct RS {
    pub(crate) state: RSState,
    pub(crate) seq: u64,
    pub(crate) pc: usize,
    pub(crate) rob_tag: RobTag,
    pub(crate) opcode: Opcode,
    pub(crate) source: Vec<Operand>,
    pub(crate) dispatch_cycle: u64,
    pub(crate) execute: Option<(u64, u64)>,
    pub(crate) result: Option<Value>,
    pub(crate) fault: Option<WordType>,
    pub(crate) sb_index: Option<u16>,
    pub(crate) branch_target_predicted: Option<usize>,
}

impl RS {
    fn new() -> Self {
        Self {
            state: RSState::IDLE,
            seq: 0,
            pc: 0,
            rob_tag: RobTag(0),
            opcode: Opcode::ADD,
            source: Vec::new(),
            dispatch_cycle: 0,
            execute: None,
            result: None,
            fault: None,
            sb_index: None,
            branch_target_predicted: None,
        }
    }

    fn reset(&mut self) {
        self.state = RSState::IDLE;
        self.source.clear();
        self.execute = None;
        self.result = None;
        self.fault = None;
        self.sb_index = None;
        self.branch_target_predicted = None;
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.state != RSState::IDLE
    }

    pub(crate) fn operands_ready(&self) -> bool {
        self.source.iter().all(Operand::is_ready)
    }

    /// The operand values; only valid once all operands are ready.
    pub(crate) fn values(&self) -> Vec<Value> {
        self.source.iter().filter_map(Operand::get_value).collect()
    }

    /// The cycle the result is available for the CDB.
    pub(crate) fn completion_cycle(&self) -> Option<u64> {
        match self.state {
            RSState::COMPLETED => self.execute.map(|(_, end)| end),
            _ => None,
        }
    }
}

impl Display for RS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RS {}", mnemonic(self.opcode))?;

        for operand in &self.source {
            write!(f, " {}", operand)?;
        }

        write!(f, " -> {}", self.rob_tag)
    }
}

/// What the backend hands to a reservation station at dispatch.
#[derive(Clone, Debug)]
pub(crate) struct Dispatch {
    pub(crate) seq: u64,
    pub(crate) pc: usize,
    pub(crate) rob_tag: RobTag,
    pub(crate) opcode: Opcode,
    pub(crate) source: Vec<Operand>,
    pub(crate) sb_index: Option<u16>,
    pub(crate) branch_target_predicted: Option<usize>,
}

/// A bounded pool of reservation stations owned by one functional unit.
#[derive(Debug)]
pub(crate) struct RSTable {
    free_stack: Vec<u16>,
    pub(crate) capacity: u16,
    array: Vec<RS>,
}

impl RSTable {
    pub(crate) fn new(capacity: u16) -> Self {
        let mut free_stack = Vec::with_capacity(capacity as usize);
        let mut array = Vec::with_capacity(capacity as usize);
        for i in 0..capacity {
            array.push(RS::new());
            // lowest index on top of the stack
            free_stack.push(capacity - 1 - i);
        }

        RSTable {
            capacity,
            array,
            free_stack,
        }
    }

    pub(crate) fn get(&self, rs_index: u16) -> &RS {
        &self.array[rs_index as usize]
    }

    pub(crate) fn get_mut(&mut self, rs_index: u16) -> &mut RS {
        &mut self.array[rs_index as usize]
    }

    pub(crate) fn has_free(&self) -> bool {
        !self.free_stack.is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        !self.has_free()
    }

    #[cfg(test)]
    pub(crate) fn is_idle(&self) -> bool {
        self.free_stack.len() == self.capacity as usize
    }

    #[cfg(test)]
    pub(crate) fn busy_count(&self) -> usize {
        self.capacity as usize - self.free_stack.len()
    }

    /// Claims a free station for the instruction. The caller checks
    /// [`RSTable::is_full`] first.
    pub(crate) fn dispatch(&mut self, dispatch: Dispatch, cycle: u64) -> u16 {
        let rs_index = match self.free_stack.pop() {
            Some(rs_index) => rs_index,
            None => panic!("No free RS"),
        };

        let rs = &mut self.array[rs_index as usize];
        debug_assert!(rs.state == RSState::IDLE);
        rs.state = RSState::WAITING;
        rs.seq = dispatch.seq;
        rs.pc = dispatch.pc;
        rs.rob_tag = dispatch.rob_tag;
        rs.opcode = dispatch.opcode;
        rs.source = dispatch.source;
        rs.dispatch_cycle = cycle;
        rs.sb_index = dispatch.sb_index;
        rs.branch_target_predicted = dispatch.branch_target_predicted;
        rs_index
    }

    pub(crate) fn deallocate(&mut self, rs_index: u16) {
        debug_assert!(!self.free_stack.contains(&rs_index), "RS {} deallocated twice", rs_index);

        self.array[rs_index as usize].reset();
        self.free_stack.push(rs_index);
    }

    /// Indices of the busy stations, oldest instruction first.
    pub(crate) fn busy_by_age(&self) -> Vec<u16> {
        let mut busy: Vec<u16> = (0..self.capacity)
            .filter(|&rs_index| self.array[rs_index as usize].is_busy())
            .collect();
        busy.sort_by_key(|&rs_index| self.array[rs_index as usize].seq);
        busy
    }

    /// Replaces every operand waiting on `tag` by the broadcast value.
    /// Returns the number of operands that woke up.
    pub(crate) fn wakeup(&mut self, tag: RobTag, value: Value) -> usize {
        let mut woken = 0;
        for rs in self.array.iter_mut().filter(|rs| rs.state == RSState::WAITING) {
            for operand in rs.source.iter_mut() {
                if *operand == Operand::Pending(tag) {
                    *operand = Operand::Value(value);
                    woken += 1;
                }
            }
        }
        woken
    }

    /// Frees every station holding an instruction younger than `seq`.
    /// Returns how many were freed.
    pub(crate) fn flush_after(&mut self, seq: u64) -> usize {
        let squashed: Vec<u16> = (0..self.capacity)
            .filter(|&rs_index| {
                let rs = &self.array[rs_index as usize];
                rs.is_busy() && rs.seq > seq
            })
            .collect();

        for &rs_index in &squashed {
            self.deallocate(rs_index);
        }
        squashed.len()
    }
}
