use std::fmt;
use std::rc::Rc;

use serde::Serialize;

use crate::backend::register_alias_table::RAT;
use crate::backend::reorder_buffer::RobTag;

pub type RegisterType = u16;
pub type WordType = i64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
pub enum Opcode {
    ADD,
    ADDI,
    SUB,
    SUBI,
    ADDD,
    SUBD,
    MULD,
    DIVD,
    LD,
    SD,
    BEQ,
    BNE,
}

pub fn mnemonic(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::ADD => "ADD",
        Opcode::ADDI => "ADDI",
        Opcode::SUB => "SUB",
        Opcode::SUBI => "SUBI",
        Opcode::ADDD => "ADD.D",
        Opcode::SUBD => "SUB.D",
        Opcode::MULD => "MUL.D",
        Opcode::DIVD => "DIV.D",
        Opcode::LD => "LD",
        Opcode::SD => "SD",
        Opcode::BEQ => "BEQ",
        Opcode::BNE => "BNE",
    }
}

pub fn get_opcode(mnemonic: &str) -> Option<Opcode> {
    let string = mnemonic.to_uppercase();
    let mnemonic_uppercased = string.as_str();

    match mnemonic_uppercased {
        "ADD" => Some(Opcode::ADD),
        "ADDI" => Some(Opcode::ADDI),
        "SUB" => Some(Opcode::SUB),
        "SUBI" => Some(Opcode::SUBI),
        "ADDD" | "ADD.D" => Some(Opcode::ADDD),
        "SUBD" | "SUB.D" => Some(Opcode::SUBD),
        "MULD" | "MUL.D" | "MULT.D" => Some(Opcode::MULD),
        "DIVD" | "DIV.D" => Some(Opcode::DIVD),
        "LD" => Some(Opcode::LD),
        "SD" => Some(Opcode::SD),
        "BEQ" => Some(Opcode::BEQ),
        "BNE" => Some(Opcode::BNE),
        _ => None,
    }
}

/// The number of sources an instruction with this opcode carries; loads and
/// stores count the address offset, branches their static offset.
pub fn source_count(opcode: Opcode) -> usize {
    match opcode {
        Opcode::SD | Opcode::BEQ | Opcode::BNE => 3,
        _ => 2,
    }
}

/// True for instructions that can redirect the instruction stream.
pub fn is_control(opcode: Opcode) -> bool {
    matches!(opcode, Opcode::BEQ | Opcode::BNE)
}

/// A logical (architectural) register: `R<n>` lives in the integer file,
/// `F<n>` in the float file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ArchReg {
    Int(RegisterType),
    Float(RegisterType),
}

impl ArchReg {
    /// Position of the register in a table that holds the integer file
    /// followed by the float file.
    pub fn flat_index(&self, register_count: RegisterType) -> usize {
        match *self {
            ArchReg::Int(reg) => reg as usize,
            ArchReg::Float(reg) => register_count as usize + reg as usize,
        }
    }
}

impl fmt::Display for ArchReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchReg::Int(reg) => write!(f, "R{}", reg),
            ArchReg::Float(reg) => write!(f, "F{}", reg),
        }
    }
}

pub fn get_register(name: &str, register_count: RegisterType) -> Option<ArchReg> {
    let mut chars = name.chars();
    let file = chars.next()?.to_ascii_uppercase();
    let digits = chars.as_str();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let reg: RegisterType = digits.parse().ok()?;
    if reg >= register_count {
        return None;
    }

    match file {
        'R' => Some(ArchReg::Int(reg)),
        'F' => Some(ArchReg::Float(reg)),
        _ => None,
    }
}

#[derive(Clone, Copy, PartialEq, Debug, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(WordType),
    Float(f64),
}

impl Value {
    pub fn as_int(&self) -> WordType {
        match *self {
            Value::Int(value) => value,
            Value::Float(value) => value as WordType,
        }
    }

    pub fn as_float(&self) -> f64 {
        match *self {
            Value::Int(value) => value as f64,
            Value::Float(value) => value,
        }
    }

    /// Value equality that compares an integer and a float numerically.
    pub fn matches(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            _ => self.as_float() == other.as_float(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(value) => write!(f, "{}", value),
            Value::Float(value) => write!(f, "{:?}", value),
        }
    }
}

/// A renamed source operand: either the value is known, or it will be
/// delivered by the CDB when the producing ROB slot writes back.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Operand {
    Value(Value),
    Pending(RobTag),
}

impl Operand {
    pub fn is_ready(&self) -> bool {
        matches!(self, Operand::Value(_))
    }

    pub fn get_value(&self) -> Option<Value> {
        match *self {
            Operand::Value(value) => Some(value),
            Operand::Pending(_) => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Value(value) => write!(f, "{}", value),
            Operand::Pending(tag) => write!(f, "{}", tag),
        }
    }
}

/// A source operand as decoded, before renaming.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Source {
    Register(ArchReg),
    Immediate(Value),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Register(reg) => write!(f, "{}", reg),
            Source::Immediate(value) => write!(f, "{}", value),
        }
    }
}

/// A decoded instruction.
///
/// Operand layout per opcode:
/// - arithmetic: `sink = rd`, `source = [rs, rt | imm]`
/// - `LD`: `sink = rd`, `source = [base, offset]`
/// - `SD`: `sink = None`, `source = [value, base, offset]`
/// - `BEQ`/`BNE`: `sink = None`, `source = [rs, rt, offset]` where the
///   offset is relative to the instruction after the branch.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub opcode: Opcode,
    pub source: Vec<Source>,
    pub sink: Option<ArchReg>,
    pub loc: Option<SourceLocation>,
}

impl Instr {
    pub fn new(opcode: Opcode, source: Vec<Source>, sink: Option<ArchReg>) -> Instr {
        Instr { opcode, source, sink, loc: None }
    }

    pub fn is_control(&self) -> bool {
        is_control(self.opcode)
    }

    /// The static branch offset; only meaningful for control instructions.
    pub fn branch_offset(&self) -> WordType {
        match self.source.last() {
            Some(Source::Immediate(value)) => value.as_int(),
            _ => 0,
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", mnemonic(self.opcode))?;

        let sink = self.sink.map(|reg| reg.to_string()).unwrap_or_default();
        match (self.opcode, self.source.as_slice()) {
            (Opcode::LD, [base, offset]) => write!(f, "{}, {}({})", sink, offset, base)?,
            (Opcode::SD, [value, base, offset]) => write!(f, "{}, {}({})", value, offset, base)?,
            (_, sources) => {
                let mut first = true;
                if self.sink.is_some() {
                    write!(f, "{}", sink)?;
                    first = false;
                }
                for source in sources {
                    if !first {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", source)?;
                    first = false;
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StageEvents {
    pub issue: Option<u64>,
    pub execute: Option<(u64, u64)>,
    pub write_back: Option<u64>,
    pub commit: Option<(u64, u64)>,
    pub squashed: Option<u64>,
}

fn fmt_cycle(cycle: Option<u64>) -> String {
    cycle.map(|c| c.to_string()).unwrap_or_else(|| String::from("-"))
}

fn fmt_interval(interval: Option<(u64, u64)>) -> String {
    interval.map(|(start, end)| format!("{}-{}", start, end)).unwrap_or_else(|| String::from("-"))
}

impl fmt::Display for StageEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "issue={:<5} execute={:<9} write_back={:<5} commit={:<9}",
               fmt_cycle(self.issue),
               fmt_interval(self.execute),
               fmt_cycle(self.write_back),
               fmt_interval(self.commit))?;
        if let Some(cycle) = self.squashed {
            write!(f, " squashed={}", cycle)?;
        }
        Ok(())
    }
}

/// Written by the branch unit when its prediction turned out wrong.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BranchCorrection {
    pub target: usize,
    pub detected_at: u64,
}

/// Scheduling data that travels with an issued instruction.
#[derive(Debug, Clone, Default)]
pub struct AuxData {
    // the renaming state at issue of a control instruction
    pub rat_snapshot: Option<RAT>,
    pub branch_target_predicted: Option<usize>,
    pub correction: Option<BranchCorrection>,
}

/// An entry of the issue history. Entries are kept for the whole run,
/// including the ones that got squashed.
#[derive(Debug, Clone)]
pub struct IssuedInstr {
    pub seq: u64,
    pub pc: usize,
    pub instr: Rc<Instr>,
    pub rob_tag: RobTag,
    pub stages: StageEvents,
    pub aux: AuxData,
}

impl IssuedInstr {
    pub fn is_committed(&self) -> bool {
        self.stages.commit.is_some()
    }

    pub fn is_squashed(&self) -> bool {
        self.stages.squashed.is_some()
    }
}

impl fmt::Display for IssuedInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>4} [{:>3}] {:<22} {}", self.seq, self.pc, self.instr.to_string(), self.stages)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AssertTarget {
    Register(ArchReg),
    Memory(WordType),
}

impl fmt::Display for AssertTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssertTarget::Register(reg) => write!(f, "{}", reg),
            AssertTarget::Memory(addr) => write!(f, "[{}]", addr),
        }
    }
}

/// An expected architectural value, checked after the program ran.
#[derive(Debug, Clone, PartialEq)]
pub struct Assertion {
    pub target: AssertTarget,
    pub expected: Value,
    pub loc: Option<SourceLocation>,
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    pub code: Vec<Rc<Instr>>,
    // initial register values
    pub registers: Vec<(ArchReg, Value)>,
    // initial memory words, by address
    pub data_items: Vec<(WordType, Value)>,
    pub asserts: Vec<Assertion>,
}

impl Program {
    pub fn new(code: Vec<Instr>) -> Program {
        Program {
            code: code.into_iter().map(Rc::new).collect(),
            ..Program::default()
        }
    }

    pub fn get_instr(&self, pos: usize) -> Option<Rc<Instr>> {
        self.code.get(pos).map(Rc::clone)
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}
