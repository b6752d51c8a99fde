use crate::cpu::CPUConfig;
use crate::instructions::instructions::{Program, Value, WordType};
use crate::memory_subsystem::store_buffer::SB;

/// Word addressed memory plus the store buffer in front of it. There is no
/// cache; every access has the memory unit's fixed latency.
#[derive(Debug)]
pub(crate) struct MemorySubsystem {
    pub(crate) memory: Vec<Value>,
    pub(crate) sb: SB,
}

impl MemorySubsystem {
    pub(crate) fn new(cpu_config: &CPUConfig) -> MemorySubsystem {
        let memory = vec![Value::Int(0); cpu_config.memory_size as usize];
        let sb = SB::new(cpu_config.sb_capacity, cpu_config.lfb_count);

        MemorySubsystem {
            memory,
            sb,
        }
    }

    pub(crate) fn init(&mut self, program: &Program) {
        for word in self.memory.iter_mut() {
            *word = Value::Int(0);
        }

        for &(addr, value) in &program.data_items {
            if let Some(word) = self.word_mut(addr) {
                *word = value;
            }
        }
    }

    fn word_mut(&mut self, addr: WordType) -> Option<&mut Value> {
        let index = usize::try_from(addr).ok()?;
        self.memory.get_mut(index)
    }

    pub(crate) fn in_bounds(&self, addr: WordType) -> bool {
        usize::try_from(addr).map_or(false, |index| index < self.memory.len())
    }

    pub(crate) fn read(&self, addr: WordType) -> Option<Value> {
        let index = usize::try_from(addr).ok()?;
        self.memory.get(index).copied()
    }

    /// A load issued with sequence number `seq`: older stores still in the
    /// store buffer take precedence over memory. `Err` carries the faulting
    /// address.
    pub(crate) fn load(&self, seq: u64, addr: WordType) -> Result<Value, WordType> {
        if !self.in_bounds(addr) {
            return Err(addr);
        }

        match self.sb.forward(seq, addr) {
            Some(value) => Ok(value),
            None => self.read(addr).ok_or(addr),
        }
    }

    pub(crate) fn do_cycle(&mut self) {
        self.sb.do_cycle(&mut self.memory);
    }
}
