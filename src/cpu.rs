use std::cell::RefCell;
use std::fs::File;
use std::rc::Rc;

use log::info;
use serde::{Deserialize, Serialize};

use crate::backend::backend::Backend;
use crate::backend::execution_unit::UnitKind;
use crate::backend::register_alias_table::RAT;
use crate::error::{ConfigError, SimError};
use crate::frontend::frontend::Frontend;
use crate::instructions::instructions::{
    mnemonic, source_count, ArchReg, AssertTarget, Assertion, IssuedInstr, Program, RegisterType, Source, Value, WordType,
};
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PerfCounters {
    pub cycle_cnt: u64,
    pub issue_cnt: u64,
    pub execute_cnt: u64,
    pub write_back_cnt: u64,
    pub retire_cnt: u64,
    // results that lost CDB arbitration and had to retry
    pub cdb_deferred_cnt: u64,
    pub branch_good_predict_cnt: u64,
    pub branch_miss_predict_cnt: u64,
    pub pipeline_flushes: u64,
    pub squash_cnt: u64,
}

impl PerfCounters {
    pub fn ipc(&self) -> f32 {
        if self.cycle_cnt == 0 {
            return 0.0;
        }
        self.retire_cnt as f32 / self.cycle_cnt as f32
    }
}

#[derive(Clone, Deserialize, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Trace {
    pub issue: bool,
    pub execute: bool,
    pub write_back: bool,
    pub retire: bool,
    pub pipeline_flush: bool,
    pub cycle: bool,
}

#[derive(Clone, Copy, Deserialize, Serialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BranchPrediction {
    NotTaken,
    Taken,
    // backward branches are loops, so they are predicted taken
    #[default]
    BackwardTaken,
}

fn default_pipelined() -> bool {
    true
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct UnitConfig {
    // the number of cycles an instruction spends executing
    pub latency: u16,
    // the number of reservation stations in front of the unit
    pub rs_count: u16,
    // if a new instruction can start every cycle
    #[serde(default = "default_pipelined")]
    pub pipelined: bool,
    // the additional cycles of a load; only used by the memory unit
    #[serde(default)]
    pub access_latency: u16,
}

impl UnitConfig {
    pub fn new(latency: u16, rs_count: u16) -> UnitConfig {
        UnitConfig {
            latency,
            rs_count,
            pipelined: true,
            access_latency: 0,
        }
    }
}

/// The functional units; a unit that is `None` doesn't exist and the
/// instructions it executes can't be issued.
#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct UnitsConfig {
    pub integer_adder: Option<UnitConfig>,
    pub float_adder: Option<UnitConfig>,
    pub float_multiplier: Option<UnitConfig>,
    pub memory: Option<UnitConfig>,
    pub branch: Option<UnitConfig>,
}

impl Default for UnitsConfig {
    fn default() -> Self {
        UnitsConfig {
            integer_adder: Some(UnitConfig::new(1, 5)),
            float_adder: Some(UnitConfig::new(3, 3)),
            float_multiplier: Some(UnitConfig::new(20, 2)),
            memory: Some(UnitConfig {
                access_latency: 4,
                ..UnitConfig::new(1, 3)
            }),
            branch: Some(UnitConfig::new(3, 5)),
        }
    }
}

impl UnitsConfig {
    pub fn get(&self, kind: UnitKind) -> Option<&UnitConfig> {
        match kind {
            UnitKind::IntegerAdder => self.integer_adder.as_ref(),
            UnitKind::FloatAdder => self.float_adder.as_ref(),
            UnitKind::FloatMultiplier => self.float_multiplier.as_ref(),
            UnitKind::Memory => self.memory.as_ref(),
            UnitKind::Branch => self.branch.as_ref(),
        }
    }

    pub fn get_mut(&mut self, kind: UnitKind) -> &mut Option<UnitConfig> {
        match kind {
            UnitKind::IntegerAdder => &mut self.integer_adder,
            UnitKind::FloatAdder => &mut self.float_adder,
            UnitKind::FloatMultiplier => &mut self.float_multiplier,
            UnitKind::Memory => &mut self.memory,
            UnitKind::Branch => &mut self.branch,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct CPUConfig {
    // the number of integer registers; there are as many float registers
    pub register_count: RegisterType,
    // the capacity of the reorder buffer
    pub rob_capacity: u16,
    // the number of results that can be broadcast per clock cycle
    pub cdb_width: u8,
    // the size of the memory in machine words
    pub memory_size: u32,
    // the capacity of the store buffer
    pub sb_capacity: u16,
    // the number of line fill buffers; currently there are no line fill buffer
    // it is just a limit of the number of stores that can commit to memory
    // per clock cycle (there is also no cache)
    pub lfb_count: u8,
    // a run that takes more cycles is aborted
    pub max_cycles: u64,
    pub branch_prediction: BranchPrediction,
    pub units: UnitsConfig,
    // if processing of a single instruction should be traced (logged)
    pub trace: Trace,
}

impl Default for CPUConfig {
    fn default() -> Self {
        CPUConfig {
            register_count: 32,
            rob_capacity: 128,
            cdb_width: 1,
            memory_size: 1024,
            sb_capacity: 16,
            lfb_count: 1,
            max_cycles: 100_000,
            branch_prediction: BranchPrediction::default(),
            units: UnitsConfig::default(),
            trace: Trace::default(),
        }
    }
}

impl CPUConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("register_count", self.register_count as u64),
            ("rob_capacity", self.rob_capacity as u64),
            ("cdb_width", self.cdb_width as u64),
            ("memory_size", self.memory_size as u64),
            ("sb_capacity", self.sb_capacity as u64),
            ("lfb_count", self.lfb_count as u64),
            ("max_cycles", self.max_cycles),
        ];
        for (name, size) in sizes {
            if size == 0 {
                return Err(ConfigError::Invalid(format!("{} must be larger than 0", name)));
            }
        }

        for kind in UnitKind::ALL {
            if let Some(unit_config) = self.units.get(kind) {
                if unit_config.latency == 0 {
                    return Err(ConfigError::Invalid(format!("units.{}.latency must be larger than 0", kind)));
                }
                if unit_config.rs_count == 0 {
                    return Err(ConfigError::Invalid(format!("units.{}.rs_count must be larger than 0", kind)));
                }
            }
        }

        Ok(())
    }
}

pub fn load_cpu_config(file_path: &str) -> Result<CPUConfig, ConfigError> {
    let file = File::open(file_path)?;
    let config: CPUConfig = serde_yaml::from_reader(file)?;
    config.validate()?;
    Ok(config)
}

/// The outcome of a single program assertion.
#[derive(Clone, Debug, PartialEq)]
pub struct AssertResult {
    pub assertion: Assertion,
    pub actual: Option<Value>,
    pub passed: bool,
}

/// A row of the run report: the stage timestamps of one issued instruction.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InstrReport {
    pub seq: u64,
    pub pc: usize,
    pub instr: String,
    pub issue: Option<u64>,
    pub execute: Option<(u64, u64)>,
    pub write_back: Option<u64>,
    pub commit: Option<(u64, u64)>,
    pub squashed: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Report {
    pub cycles: u64,
    pub ipc: f32,
    pub perf_counters: PerfCounters,
    pub instructions: Vec<InstrReport>,
}

pub struct CPU {
    backend: Backend,
    frontend: Rc<RefCell<Frontend>>,
    memory_subsystem: Rc<RefCell<MemorySubsystem>>,
    arch_reg_file: Rc<RefCell<ArgRegFile>>,
    perf_counters: Rc<RefCell<PerfCounters>>,
    program: Rc<Program>,
    register_count: RegisterType,
    // the current clock cycle; the first cycle is 1
    cycle: u64,
    max_cycles: u64,
    trace: Trace,
}

impl CPU {
    /// Fails with [`SimError::InvalidProgram`] when the program doesn't fit
    /// the configuration, e.g. a hand built program that names a register
    /// beyond `register_count`.
    pub fn new(cpu_config: &CPUConfig, program: Rc<Program>) -> Result<CPU, SimError> {
        validate_program(cpu_config, &program)?;

        let perf_counters = Rc::new(RefCell::new(PerfCounters::default()));

        let memory_subsystem = Rc::new(RefCell::new(
            MemorySubsystem::new(cpu_config)));
        memory_subsystem.borrow_mut().init(&program);

        let arch_reg_file = Rc::new(RefCell::new(
            ArgRegFile::new(cpu_config.register_count)));
        for &(arch_reg, value) in &program.registers {
            arch_reg_file.borrow_mut().set_value(arch_reg, value);
        }

        let frontend = Rc::new(RefCell::new(
            Frontend::new(Rc::clone(&program))));

        let backend = Backend::new(
            cpu_config,
            Rc::clone(&frontend),
            Rc::clone(&memory_subsystem),
            Rc::clone(&arch_reg_file),
            Rc::clone(&perf_counters),
        );

        Ok(CPU {
            backend,
            frontend,
            memory_subsystem,
            arch_reg_file,
            perf_counters,
            program,
            register_count: cpu_config.register_count,
            cycle: 1,
            max_cycles: cpu_config.max_cycles,
            trace: cpu_config.trace.clone(),
        })
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Runs a single clock cycle: committed stores drain to memory, then
    /// issue, execute, write back and commit.
    pub fn do_cycle(&mut self) -> Result<(), SimError> {
        self.perf_counters.borrow_mut().cycle_cnt += 1;

        self.memory_subsystem.borrow_mut().do_cycle();
        self.backend.do_cycle(self.cycle)?;

        if self.trace.cycle {
            let perf_counters = self.perf_counters.borrow();
            info!("[Cycle:{}][Issued={}][Executed={}][Written back={}][Retired={}][IPC={:.2}]",
                  self.cycle,
                  perf_counters.issue_cnt,
                  perf_counters.execute_cnt,
                  perf_counters.write_back_cnt,
                  perf_counters.retire_cnt,
                  perf_counters.ipc());
        }

        self.cycle += 1;
        Ok(())
    }

    /// True while there is an instruction left to issue, an instruction in
    /// flight or a store that hasn't reached memory yet.
    pub fn is_working(&self) -> bool {
        self.frontend.borrow().has_next()
            || !self.backend.is_empty()
            || !self.memory_subsystem.borrow().sb.is_empty()
    }

    pub fn run(&mut self) -> Result<(), SimError> {
        while self.is_working() {
            if self.cycle > self.max_cycles {
                return Err(SimError::CycleLimitExceeded { max_cycles: self.max_cycles });
            }
            self.do_cycle()?;
        }

        info!("Program complete after {} cycles", self.cycle - 1);
        Ok(())
    }

    pub fn history(&self) -> &[IssuedInstr] {
        self.backend.history()
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn rat(&self) -> &RAT {
        self.backend.rat()
    }

    pub fn rob_size(&self) -> u16 {
        self.backend.rob_size()
    }

    pub fn branch_outstanding(&self) -> bool {
        self.backend.branch_outstanding()
    }

    pub fn perf_counters(&self) -> PerfCounters {
        self.perf_counters.borrow().clone()
    }

    /// The committed value of a register.
    pub fn register_value(&self, arch_reg: ArchReg) -> Value {
        self.arch_reg_file.borrow().get_value(arch_reg)
    }

    /// The value of a memory word; `None` for an address outside of memory.
    pub fn memory_value(&self, addr: WordType) -> Option<Value> {
        self.memory_subsystem.borrow().read(addr)
    }

    pub fn register_count(&self) -> RegisterType {
        self.register_count
    }

    pub fn check_asserts(&self) -> Vec<AssertResult> {
        self.program
            .asserts
            .iter()
            .map(|assertion| {
                let actual = match assertion.target {
                    AssertTarget::Register(arch_reg) => Some(self.register_value(arch_reg)),
                    AssertTarget::Memory(addr) => self.memory_value(addr),
                };
                let passed = actual.map_or(false, |value| value.matches(&assertion.expected));
                AssertResult {
                    assertion: assertion.clone(),
                    actual,
                    passed,
                }
            })
            .collect()
    }

    pub fn report(&self) -> Report {
        let perf_counters = self.perf_counters();
        let instructions = self
            .history()
            .iter()
            .map(|issued| InstrReport {
                seq: issued.seq,
                pc: issued.pc,
                instr: issued.instr.to_string(),
                issue: issued.stages.issue,
                execute: issued.stages.execute,
                write_back: issued.stages.write_back,
                commit: issued.stages.commit,
                squashed: issued.stages.squashed,
            })
            .collect();

        Report {
            cycles: perf_counters.cycle_cnt,
            ipc: perf_counters.ipc(),
            perf_counters,
            instructions,
        }
    }
}

/// The architectural register file: the committed value of every integer
/// and float register.
#[derive(Debug)]
pub struct ArgRegFile {
    register_count: RegisterType,
    entries: Vec<Value>,
}

impl ArgRegFile {
    pub fn new(register_count: RegisterType) -> ArgRegFile {
        let mut entries = Vec::with_capacity(register_count as usize * 2);
        for _ in 0..register_count {
            entries.push(Value::Int(0));
        }
        for _ in 0..register_count {
            entries.push(Value::Float(0.0));
        }

        ArgRegFile { register_count, entries }
    }

    pub fn get_value(&self, arch_reg: ArchReg) -> Value {
        self.entries[arch_reg.flat_index(self.register_count)]
    }

    /// Panics when `arch_reg` is beyond the register count; programs are
    /// checked for that before they run.
    pub fn set_value(&mut self, arch_reg: ArchReg, value: Value) {
        let index = arch_reg.flat_index(self.register_count);
        self.entries[index] = value;
    }
}

// The loader guarantees all of this; programs built in code are checked here.
fn validate_program(cpu_config: &CPUConfig, program: &Program) -> Result<(), SimError> {
    let check_register = |arch_reg: ArchReg| match arch_reg {
        ArchReg::Int(reg) | ArchReg::Float(reg) if reg >= cpu_config.register_count => Err(SimError::InvalidProgram(
            format!("register {} is out of range, register_count is {}", arch_reg, cpu_config.register_count))),
        _ => Ok(()),
    };

    for (pc, instr) in program.code.iter().enumerate() {
        let expected = source_count(instr.opcode);
        if instr.source.len() != expected {
            return Err(SimError::InvalidProgram(format!(
                "{} at pc {} has {} sources, expected {}", mnemonic(instr.opcode), pc, instr.source.len(), expected)));
        }

        for source in &instr.source {
            if let Source::Register(arch_reg) = *source {
                check_register(arch_reg)?;
            }
        }
        if let Some(sink) = instr.sink {
            check_register(sink)?;
        }
    }

    for &(arch_reg, _) in &program.registers {
        check_register(arch_reg)?;
    }

    for assertion in &program.asserts {
        if let AssertTarget::Register(arch_reg) = assertion.target {
            check_register(arch_reg)?;
        }
    }

    for &(addr, _) in &program.data_items {
        if addr < 0 || addr >= cpu_config.memory_size as WordType {
            return Err(SimError::InvalidProgram(format!("initial memory address {} is out of range", addr)));
        }
    }

    Ok(())
}
