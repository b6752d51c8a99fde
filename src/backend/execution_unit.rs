use std::fmt;

use log::info;

use crate::backend::reservation_station::{Dispatch, RSState, RSTable, RS};
use crate::backend::reorder_buffer::RobTag;
use crate::cpu::{BranchPrediction, PerfCounters, UnitConfig};
use crate::instructions::instructions::{BranchCorrection, IssuedInstr, Opcode, Value, WordType};
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;

/// The closed set of functional unit kinds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum UnitKind {
    IntegerAdder,
    FloatAdder,
    FloatMultiplier,
    Memory,
    Branch,
}

impl UnitKind {
    pub const ALL: [UnitKind; 5] = [
        UnitKind::IntegerAdder,
        UnitKind::FloatAdder,
        UnitKind::FloatMultiplier,
        UnitKind::Memory,
        UnitKind::Branch,
    ];

    pub fn for_opcode(opcode: Opcode) -> UnitKind {
        match opcode {
            Opcode::ADD | Opcode::ADDI | Opcode::SUB | Opcode::SUBI => UnitKind::IntegerAdder,
            Opcode::ADDD | Opcode::SUBD => UnitKind::FloatAdder,
            Opcode::MULD | Opcode::DIVD => UnitKind::FloatMultiplier,
            Opcode::LD | Opcode::SD => UnitKind::Memory,
            Opcode::BEQ | Opcode::BNE => UnitKind::Branch,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            UnitKind::IntegerAdder => "integer_adder",
            UnitKind::FloatAdder => "float_adder",
            UnitKind::FloatMultiplier => "float_multiplier",
            UnitKind::Memory => "memory",
            UnitKind::Branch => "branch",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The fetch pointer delta for a branch with the given static offset. The
/// frontend continues at `pc + 1 + delta`.
pub(crate) fn predict(policy: BranchPrediction, offset: WordType) -> WordType {
    let taken = match policy {
        BranchPrediction::NotTaken => false,
        BranchPrediction::Taken => true,
        BranchPrediction::BackwardTaken => offset < 0,
    };

    if taken { offset } else { 0 }
}

/// The instruction following `pc` displaced by `offset`. Targets before the
/// start of the program are clamped to it, targets beyond the end saturate.
pub(crate) fn branch_target(pc: usize, offset: WordType) -> usize {
    let target = (pc as WordType).saturating_add(1).saturating_add(offset);
    if target < 0 {
        return 0;
    }
    usize::try_from(target).unwrap_or(usize::MAX)
}

/// A functional unit together with its reservation stations.
#[derive(Debug)]
pub(crate) struct EU {
    pub(crate) kind: UnitKind,
    latency: u64,
    access_latency: u64,
    pipelined: bool,
    pub(crate) rs_table: RSTable,
    trace: bool,
}

#[allow(non_snake_case)]
impl EU {
    pub(crate) fn new(kind: UnitKind, unit_config: &UnitConfig, trace: bool) -> EU {
        EU {
            kind,
            latency: unit_config.latency as u64,
            access_latency: unit_config.access_latency as u64,
            pipelined: unit_config.pipelined,
            rs_table: RSTable::new(unit_config.rs_count),
            trace,
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.rs_table.is_full()
    }

    pub(crate) fn dispatch(&mut self, dispatch: Dispatch, cycle: u64) -> u16 {
        self.rs_table.dispatch(dispatch, cycle)
    }

    fn latency_of(&self, opcode: Opcode) -> u64 {
        match opcode {
            Opcode::LD => self.latency + self.access_latency,
            _ => self.latency,
        }
    }

    fn is_executing(&self) -> bool {
        self.rs_table
            .busy_by_age()
            .into_iter()
            .any(|rs_index| self.rs_table.get(rs_index).state == RSState::EXECUTING)
    }

    fn can_start(&self, rs: &RS, cycle: u64, memory_subsystem: &MemorySubsystem) -> bool {
        if rs.state != RSState::WAITING || rs.dispatch_cycle >= cycle || !rs.operands_ready() {
            return false;
        }

        // a load waits until every older store knows its address
        !(rs.opcode == Opcode::LD && memory_subsystem.sb.has_unresolved_before(rs.seq))
    }

    /// Starts the entries that can start this cycle, then completes the
    /// entries whose execution ends in this cycle.
    pub(crate) fn tick(&mut self,
                       cycle: u64,
                       memory_subsystem: &mut MemorySubsystem,
                       history: &mut [IssuedInstr],
                       perf_counters: &mut PerfCounters) {
        for rs_index in self.rs_table.busy_by_age() {
            if !self.pipelined && self.is_executing() {
                break;
            }

            if !self.can_start(self.rs_table.get(rs_index), cycle, memory_subsystem) {
                continue;
            }

            let latency = self.latency_of(self.rs_table.get(rs_index).opcode);
            let rs = self.rs_table.get_mut(rs_index);
            let interval = (cycle, cycle + latency - 1);
            rs.state = RSState::EXECUTING;
            rs.execute = Some(interval);
            history[rs.seq as usize].stages.execute = Some(interval);

            if self.trace {
                info!("Executing {} cycles {}-{}", rs, interval.0, interval.1);
            }
        }

        for rs_index in self.rs_table.busy_by_age() {
            let rs = self.rs_table.get_mut(rs_index);
            match (rs.state, rs.execute) {
                (RSState::EXECUTING, Some((_, end))) if end == cycle => {}
                _ => continue,
            }

            Self::execute(rs, memory_subsystem, history, cycle);
            rs.state = RSState::COMPLETED;
            perf_counters.execute_cnt += 1;
        }
    }

    fn execute(rs: &mut RS, memory_subsystem: &mut MemorySubsystem, history: &mut [IssuedInstr], cycle: u64) {
        let values = rs.values();
        debug_assert!(values.len() == rs.source.len());

        match rs.opcode {
            Opcode::ADD | Opcode::ADDI => Self::execute_ADD(rs, &values),
            Opcode::SUB | Opcode::SUBI => Self::execute_SUB(rs, &values),
            Opcode::ADDD => Self::execute_ADDD(rs, &values),
            Opcode::SUBD => Self::execute_SUBD(rs, &values),
            Opcode::MULD => Self::execute_MULD(rs, &values),
            Opcode::DIVD => Self::execute_DIVD(rs, &values),
            Opcode::LD => Self::execute_LD(rs, &values, memory_subsystem),
            Opcode::SD => Self::execute_SD(rs, &values, memory_subsystem),
            Opcode::BEQ | Opcode::BNE => Self::execute_branch(rs, &values, history, cycle),
        }
    }

    fn execute_ADD(rs: &mut RS, values: &[Value]) {
        rs.result = Some(Value::Int(values[0].as_int().wrapping_add(values[1].as_int())));
    }

    fn execute_SUB(rs: &mut RS, values: &[Value]) {
        rs.result = Some(Value::Int(values[0].as_int().wrapping_sub(values[1].as_int())));
    }

    fn execute_ADDD(rs: &mut RS, values: &[Value]) {
        rs.result = Some(Value::Float(values[0].as_float() + values[1].as_float()));
    }

    fn execute_SUBD(rs: &mut RS, values: &[Value]) {
        rs.result = Some(Value::Float(values[0].as_float() - values[1].as_float()));
    }

    fn execute_MULD(rs: &mut RS, values: &[Value]) {
        rs.result = Some(Value::Float(values[0].as_float() * values[1].as_float()));
    }

    fn execute_DIVD(rs: &mut RS, values: &[Value]) {
        rs.result = Some(Value::Float(values[0].as_float() / values[1].as_float()));
    }

    fn execute_LD(rs: &mut RS, values: &[Value], memory_subsystem: &MemorySubsystem) {
        let addr = values[0].as_int().wrapping_add(values[1].as_int());
        match memory_subsystem.load(rs.seq, addr) {
            Ok(value) => rs.result = Some(value),
            Err(addr) => {
                rs.fault = Some(addr);
                rs.result = Some(Value::Int(0));
            }
        }
    }

    fn execute_SD(rs: &mut RS, values: &[Value], memory_subsystem: &mut MemorySubsystem) {
        let value = values[0];
        let addr = values[1].as_int().wrapping_add(values[2].as_int());
        if !memory_subsystem.in_bounds(addr) {
            rs.fault = Some(addr);
        }

        // the entry is resolved even when faulting so younger loads can proceed
        if let Some(sb_index) = rs.sb_index {
            memory_subsystem.sb.store(sb_index, addr, value);
        }
    }

    fn execute_branch(rs: &mut RS, values: &[Value], history: &mut [IssuedInstr], cycle: u64) {
        let equal = values[0].matches(&values[1]);
        let taken = match rs.opcode {
            Opcode::BEQ => equal,
            _ => !equal,
        };

        let actual = if taken {
            branch_target(rs.pc, values[2].as_int())
        } else {
            rs.pc + 1
        };

        if rs.branch_target_predicted != Some(actual) {
            history[rs.seq as usize].aux.correction = Some(BranchCorrection {
                target: actual,
                detected_at: cycle,
            });
        }
    }

    /// Completed entries that can be broadcast in `cycle`:
    /// `(execute_end, seq, rs_index)`.
    pub(crate) fn ready(&self, cycle: u64) -> Vec<(u64, u64, u16)> {
        self.rs_table
            .busy_by_age()
            .into_iter()
            .filter_map(|rs_index| {
                let rs = self.rs_table.get(rs_index);
                match rs.completion_cycle() {
                    Some(end) if end <= cycle => Some((end, rs.seq, rs_index)),
                    _ => None,
                }
            })
            .collect()
    }

    /// Removes a completed entry from the unit and frees its station.
    pub(crate) fn take(&mut self, rs_index: u16) -> RS {
        let rs = self.rs_table.get(rs_index).clone();
        debug_assert!(rs.state == RSState::COMPLETED);
        self.rs_table.deallocate(rs_index);
        rs
    }

    pub(crate) fn wakeup(&mut self, tag: RobTag, value: Value) -> usize {
        self.rs_table.wakeup(tag, value)
    }

    pub(crate) fn flush_after(&mut self, seq: u64) -> usize {
        self.rs_table.flush_after(seq)
    }
}
