use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;

use regex::Regex;
use thiserror::Error;

use crate::cpu::CPUConfig;
use crate::instructions::instructions::{
    get_opcode, get_register, mnemonic, ArchReg, AssertTarget, Assertion, Instr, Opcode, Program, RegisterType, Source,
    SourceLocation, Value, WordType,
};

#[derive(Error, Debug, PartialEq)]
pub enum LoadError {
    #[error("File not found: {0}")]
    NotFoundError(String),

    #[error("Failed to read {0}")]
    IOError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Analysis errors: {}", .0.join("; "))]
    AnalysisError(Vec<String>),
}

struct Patterns {
    label: Regex,
    directive: Regex,
    instr: Regex,
    memory_access: Regex,
    integer: Regex,
    float: Regex,
    label_name: Regex,
}

impl Patterns {
    fn new() -> Result<Patterns, LoadError> {
        let regex = |pattern: &str| Regex::new(pattern).map_err(|err| LoadError::ParseError(err.to_string()));

        Ok(Patterns {
            label: regex(r"^([A-Za-z_][A-Za-z0-9_]*)\s*:\s*(.*)$")?,
            directive: regex(r"^\.([A-Za-z_]+)\s+(.*)$")?,
            instr: regex(r"^([A-Za-z][A-Za-z.]*)(?:\s+(.*))?$")?,
            memory_access: regex(r"^(-?\d+)?\s*\(\s*([A-Za-z]\d+)\s*\)$")?,
            integer: regex(r"^-?\d+$")?,
            float: regex(r"^-?\d+\.\d*([eE]-?\d+)?$")?,
            label_name: regex(r"^[A-Za-z_][A-Za-z0-9_]*$")?,
        })
    }
}

// A source line with the comment and the label stripped.
struct Line<'a> {
    text: &'a str,
    loc: SourceLocation,
}

struct Loader {
    register_count: RegisterType,
    memory_size: WordType,
    patterns: Patterns,
    labels: HashMap<String, usize>,
    instr_cnt: usize,
    code: Vec<Instr>,
    registers: Vec<(ArchReg, Value)>,
    data_items: Vec<(WordType, Value)>,
    asserts: Vec<Assertion>,
    errors: Vec<String>,
}

impl Loader {
    fn new(cpu_config: &CPUConfig) -> Result<Loader, LoadError> {
        Ok(Loader {
            register_count: cpu_config.register_count,
            memory_size: cpu_config.memory_size as WordType,
            patterns: Patterns::new()?,
            labels: HashMap::new(),
            instr_cnt: 0,
            code: Vec::new(),
            registers: Vec::new(),
            data_items: Vec::new(),
            asserts: Vec::new(),
            errors: Vec::new(),
        })
    }

    fn load(mut self, src: &str) -> Result<Program, LoadError> {
        let lines = self.first_pass(src);
        self.second_pass(&lines)?;

        if !self.errors.is_empty() {
            return Err(LoadError::AnalysisError(self.errors));
        }

        let mut program = Program::new(self.code);
        program.registers = self.registers;
        program.data_items = self.data_items;
        program.asserts = self.asserts;
        Ok(program)
    }

    // Collects the labels; a label refers to the instruction that follows it.
    fn first_pass<'a>(&mut self, src: &'a str) -> Vec<Line<'a>> {
        let mut lines = Vec::new();

        for (line_index, raw) in src.lines().enumerate() {
            let without_comment = match raw.find(|c| c == '#' || c == ';') {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let column = without_comment.len() - without_comment.trim_start().len() + 1;
            let mut text = without_comment.trim();
            let loc = SourceLocation { line: line_index + 1, column };

            if let Some(captures) = self.patterns.label.captures(text) {
                if let (Some(name), Some(rest)) = (captures.get(1), captures.get(2)) {
                    let name = name.as_str().to_string();
                    if self.labels.insert(name.clone(), self.instr_cnt).is_some() {
                        self.errors.push(format!("{}: duplicate label '{}'", loc, name));
                    }
                    text = rest.as_str().trim();
                }
            }

            if text.is_empty() {
                continue;
            }

            if !text.starts_with('.') {
                self.instr_cnt += 1;
            }
            lines.push(Line { text, loc });
        }

        lines
    }

    fn second_pass(&mut self, lines: &[Line]) -> Result<(), LoadError> {
        for line in lines {
            if line.text.starts_with('.') {
                self.parse_directive(line)?;
            } else {
                let pc = self.code.len();
                match self.parse_instr(line, pc)? {
                    Some(instr) => self.code.push(instr),
                    // keep the positions the labels refer to intact
                    None => self.code.push(Instr::new(Opcode::ADD, vec![], None)),
                }
            }
        }
        Ok(())
    }

    fn parse_directive(&mut self, line: &Line) -> Result<(), LoadError> {
        let captures = self
            .patterns
            .directive
            .captures(line.text)
            .ok_or_else(|| LoadError::ParseError(format!("{}: malformed directive '{}'", line.loc, line.text)))?;
        let name = captures.get(1).map_or("", |m| m.as_str());
        let operands = split_operands(captures.get(2).map_or("", |m| m.as_str()));
        if operands.len() != 2 {
            return Err(LoadError::ParseError(format!("{}: .{} expects 2 operands", line.loc, name)));
        }

        match name {
            "init" | "assert" => {
                let arch_reg = match self.parse_register(operands[0], line) {
                    Some(arch_reg) => arch_reg,
                    None => return Ok(()),
                };
                let value = match self.parse_value_for(arch_reg, operands[1], line) {
                    Some(value) => value,
                    None => return Ok(()),
                };

                if name == "init" {
                    self.registers.push((arch_reg, value));
                } else {
                    self.asserts.push(Assertion {
                        target: AssertTarget::Register(arch_reg),
                        expected: value,
                        loc: Some(line.loc),
                    });
                }
            }
            "mem" | "assert_mem" => {
                let addr = self.parse_integer(operands[0], line)?;
                let value = self.parse_value(operands[1], line)?;
                if addr < 0 || addr >= self.memory_size {
                    self.errors.push(format!("{}: address {} is outside of memory [0, {})", line.loc, addr, self.memory_size));
                    return Ok(());
                }

                if name == "mem" {
                    self.data_items.push((addr, value));
                } else {
                    self.asserts.push(Assertion {
                        target: AssertTarget::Memory(addr),
                        expected: value,
                        loc: Some(line.loc),
                    });
                }
            }
            _ => return Err(LoadError::ParseError(format!("{}: unknown directive '.{}'", line.loc, name))),
        }

        Ok(())
    }

    fn parse_instr(&mut self, line: &Line, pc: usize) -> Result<Option<Instr>, LoadError> {
        let captures = self
            .patterns
            .instr
            .captures(line.text)
            .ok_or_else(|| LoadError::ParseError(format!("{}: malformed instruction '{}'", line.loc, line.text)))?;
        let mnemonic = captures.get(1).map_or("", |m| m.as_str());
        let operands = split_operands(captures.get(2).map_or("", |m| m.as_str()));

        let opcode = get_opcode(mnemonic)
            .ok_or_else(|| LoadError::ParseError(format!("{}: unknown mnemonic '{}'", line.loc, mnemonic)))?;

        let expected = match opcode {
            Opcode::LD | Opcode::SD => 2,
            _ => 3,
        };
        if operands.len() != expected {
            return Err(LoadError::ParseError(format!(
                "{}: {} expects {} operands, found {}", line.loc, mnemonic, expected, operands.len())));
        }

        let instr = match opcode {
            Opcode::ADD | Opcode::SUB => self.parse_register_form(opcode, &operands, line, true),
            Opcode::ADDD | Opcode::SUBD | Opcode::MULD | Opcode::DIVD => {
                self.parse_register_form(opcode, &operands, line, false)
            }
            Opcode::ADDI | Opcode::SUBI => self.parse_immediate_form(opcode, &operands, line)?,
            Opcode::LD => self.parse_load(&operands, line)?,
            Opcode::SD => self.parse_store(&operands, line)?,
            Opcode::BEQ | Opcode::BNE => self.parse_branch(opcode, &operands, line, pc)?,
        };

        Ok(instr.map(|mut instr| {
            instr.loc = Some(line.loc);
            instr
        }))
    }

    // rd, rs, rt with all registers in the integer or all in the float file.
    fn parse_register_form(&mut self, opcode: Opcode, operands: &[&str], line: &Line, integer: bool) -> Option<Instr> {
        let mut regs = Vec::with_capacity(3);
        for operand in operands {
            let arch_reg = self.parse_register(operand, line)?;
            if matches!(arch_reg, ArchReg::Int(_)) != integer {
                self.errors.push(format!("{}: {} can't be used with {}", line.loc, arch_reg, mnemonic(opcode)));
                return None;
            }
            regs.push(arch_reg);
        }

        Some(Instr::new(
            opcode,
            vec![Source::Register(regs[1]), Source::Register(regs[2])],
            Some(regs[0]),
        ))
    }

    fn parse_immediate_form(&mut self, opcode: Opcode, operands: &[&str], line: &Line) -> Result<Option<Instr>, LoadError> {
        let imm = self.parse_integer(operands[2], line)?;
        let rd = self.parse_int_register(operands[0], line);
        let rs = self.parse_int_register(operands[1], line);

        Ok(match (rd, rs) {
            (Some(rd), Some(rs)) => Some(Instr::new(
                opcode,
                vec![Source::Register(rs), Source::Immediate(Value::Int(imm))],
                Some(rd),
            )),
            _ => None,
        })
    }

    fn parse_load(&mut self, operands: &[&str], line: &Line) -> Result<Option<Instr>, LoadError> {
        let (offset, base) = self.parse_memory_access(operands[1], line)?;
        let rd = self.parse_register(operands[0], line);

        Ok(match (rd, base) {
            (Some(rd), Some(base)) => Some(Instr::new(
                Opcode::LD,
                vec![Source::Register(base), Source::Immediate(Value::Int(offset))],
                Some(rd),
            )),
            _ => None,
        })
    }

    fn parse_store(&mut self, operands: &[&str], line: &Line) -> Result<Option<Instr>, LoadError> {
        let (offset, base) = self.parse_memory_access(operands[1], line)?;
        let rs = self.parse_register(operands[0], line);

        Ok(match (rs, base) {
            (Some(rs), Some(base)) => Some(Instr::new(
                Opcode::SD,
                vec![Source::Register(rs), Source::Register(base), Source::Immediate(Value::Int(offset))],
                None,
            )),
            _ => None,
        })
    }

    fn parse_branch(&mut self, opcode: Opcode, operands: &[&str], line: &Line, pc: usize) -> Result<Option<Instr>, LoadError> {
        let rs = self.parse_register(operands[0], line);
        let rt = self.parse_register(operands[1], line);

        let target = operands[2];
        let offset = if self.patterns.integer.is_match(target) {
            let offset = self.parse_integer(target, line)?;
            match (pc as WordType + 1).checked_add(offset) {
                Some(destination) if destination >= 0 && destination <= self.instr_cnt as WordType => offset,
                _ => {
                    self.errors.push(format!("{}: branch offset {} is outside of the program", line.loc, offset));
                    return Ok(None);
                }
            }
        } else if self.patterns.label_name.is_match(target) {
            match self.labels.get(target) {
                Some(&destination) => destination as WordType - (pc as WordType + 1),
                None => {
                    self.errors.push(format!("{}: unknown label '{}'", line.loc, target));
                    return Ok(None);
                }
            }
        } else {
            return Err(LoadError::ParseError(format!("{}: invalid branch target '{}'", line.loc, target)));
        };

        Ok(match (rs, rt) {
            (Some(rs), Some(rt)) => Some(Instr::new(
                opcode,
                vec![Source::Register(rs), Source::Register(rt), Source::Immediate(Value::Int(offset))],
                None,
            )),
            _ => None,
        })
    }

    fn parse_memory_access(&mut self, operand: &str, line: &Line) -> Result<(WordType, Option<ArchReg>), LoadError> {
        let captures = self
            .patterns
            .memory_access
            .captures(operand)
            .ok_or_else(|| LoadError::ParseError(format!("{}: invalid memory access '{}'", line.loc, operand)))?;

        let offset = match captures.get(1) {
            Some(offset) => self.parse_integer(offset.as_str(), line)?,
            None => 0,
        };
        let base = captures.get(2).and_then(|base| self.parse_int_register(base.as_str(), line));
        Ok((offset, base))
    }

    fn parse_register(&mut self, operand: &str, line: &Line) -> Option<ArchReg> {
        let arch_reg = get_register(operand, self.register_count);
        if arch_reg.is_none() {
            self.errors.push(format!("{}: invalid register '{}'", line.loc, operand));
        }
        arch_reg
    }

    fn parse_int_register(&mut self, operand: &str, line: &Line) -> Option<ArchReg> {
        match self.parse_register(operand, line)? {
            ArchReg::Int(reg) => Some(ArchReg::Int(reg)),
            arch_reg => {
                self.errors.push(format!("{}: expected an integer register, found {}", line.loc, arch_reg));
                None
            }
        }
    }

    fn parse_integer(&self, operand: &str, line: &Line) -> Result<WordType, LoadError> {
        operand
            .parse::<WordType>()
            .map_err(|_| LoadError::ParseError(format!("{}: invalid integer '{}'", line.loc, operand)))
    }

    fn parse_value(&self, operand: &str, line: &Line) -> Result<Value, LoadError> {
        if self.patterns.integer.is_match(operand) {
            return Ok(Value::Int(self.parse_integer(operand, line)?));
        }

        if self.patterns.float.is_match(operand) {
            if let Ok(value) = operand.parse::<f64>() {
                return Ok(Value::Float(value));
            }
        }

        Err(LoadError::ParseError(format!("{}: invalid value '{}'", line.loc, operand)))
    }

    // A value for a register: float registers hold floats, integer registers
    // only accept integers.
    fn parse_value_for(&mut self, arch_reg: ArchReg, operand: &str, line: &Line) -> Option<Value> {
        let value = match self.parse_value(operand, line) {
            Ok(value) => value,
            Err(err) => {
                self.errors.push(err.to_string());
                return None;
            }
        };

        match (arch_reg, value) {
            (ArchReg::Float(_), value) => Some(Value::Float(value.as_float())),
            (ArchReg::Int(_), Value::Int(value)) => Some(Value::Int(value)),
            (ArchReg::Int(_), Value::Float(_)) => {
                self.errors.push(format!("{}: {} can't hold {}", line.loc, arch_reg, operand));
                None
            }
        }
    }
}

fn split_operands(operands: &str) -> Vec<&str> {
    operands
        .split(',')
        .map(str::trim)
        .filter(|operand| !operand.is_empty())
        .collect()
}

pub fn load_from_string(cpu_config: &CPUConfig, src: &str) -> Result<Program, LoadError> {
    Loader::new(cpu_config)?.load(src)
}

pub fn load(cpu_config: &CPUConfig, path: &str) -> Result<Program, LoadError> {
    let src = fs::read_to_string(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => LoadError::NotFoundError(path.to_string()),
        _ => LoadError::IOError(format!("{}: {}", path, err)),
    })?;

    load_from_string(cpu_config, &src)
}
