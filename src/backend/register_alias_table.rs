use crate::backend::reorder_buffer::{RobTag, ROB};
use crate::cpu::ArgRegFile;
use crate::instructions::instructions::{ArchReg, Operand, RegisterType};

/// The Register Alias Table. This structure is used for the register
/// renaming process. The RAT entry for a given architectural register
/// points to the ROB slot of the youngest in-flight instruction writing it.
/// As long as such an entry exists, it should be used; otherwise the
/// architectural register file holds the value.
///
/// The table is cheap to clone; a clone is the checkpoint stored on a
/// branch, and [`RAT::restore`] puts it back after a misprediction.
#[derive(Clone, Debug, PartialEq)]
pub struct RAT {
    register_count: RegisterType,
    table: Vec<Option<RobTag>>,
}

impl RAT {
    pub fn new(register_count: RegisterType) -> Self {
        // integer file followed by the float file
        let table = vec![None; register_count as usize * 2];
        Self { register_count, table }
    }

    pub fn get(&self, arch_reg: ArchReg) -> Option<RobTag> {
        self.table[arch_reg.flat_index(self.register_count)]
    }

    /// Points `arch_reg` at a new producer, shadowing any older pending write.
    pub(crate) fn set(&mut self, arch_reg: ArchReg, tag: RobTag) {
        let index = arch_reg.flat_index(self.register_count);
        self.table[index] = Some(tag);
    }

    /// Called when `tag` commits. Only when the RAT still points to that tag
    /// the entry is invalidated; a younger write keeps the register renamed.
    pub(crate) fn invalidate(&mut self, arch_reg: ArchReg, tag: RobTag) {
        let index = arch_reg.flat_index(self.register_count);
        if self.table[index] == Some(tag) {
            self.table[index] = None;
        }
    }

    /// Renames a register read: the committed value when the register is
    /// clean, the producer's value when it already wrote back, and the
    /// producer's tag otherwise.
    pub(crate) fn rename_read(&self, arch_reg: ArchReg, rob: &ROB, arch_reg_file: &ArgRegFile) -> Operand {
        match self.get(arch_reg) {
            None => Operand::Value(arch_reg_file.get_value(arch_reg)),
            Some(tag) => match rob.ready_value(tag) {
                Some(value) => Operand::Value(value),
                None => Operand::Pending(tag),
            },
        }
    }

    pub(crate) fn snapshot(&self) -> RAT {
        self.clone()
    }

    /// Replaces the table by a checkpoint. Must run after the ROB has been
    /// flushed: entries whose producer is no longer in flight have committed
    /// in the meantime, so they become clean.
    pub(crate) fn restore(&mut self, snapshot: &RAT, rob: &ROB) {
        debug_assert!(snapshot.register_count == self.register_count);

        for (entry, saved) in self.table.iter_mut().zip(snapshot.table.iter()) {
            *entry = match saved {
                Some(tag) if rob.is_live(*tag) => Some(*tag),
                _ => None,
            };
        }
    }

    /// Number of registers with a pending write.
    pub fn pending_count(&self) -> usize {
        self.table.iter().filter(|entry| entry.is_some()).count()
    }
}
