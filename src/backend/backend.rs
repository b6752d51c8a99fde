use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, info};

use crate::backend::common_data_bus::CDB;
use crate::backend::execution_unit::{branch_target, predict, UnitKind, EU};
use crate::backend::register_alias_table::RAT;
use crate::backend::reorder_buffer::ROB;
use crate::backend::reservation_station::Dispatch;
use crate::cpu::{ArgRegFile, BranchPrediction, CPUConfig, PerfCounters, Trace};
use crate::error::SimError;
use crate::frontend::frontend::Frontend;
use crate::instructions::instructions::{AuxData, IssuedInstr, Opcode, Operand, Source, StageEvents};
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;

/// The out of order part of the CPU: renaming, the reorder buffer, the
/// functional units with their reservation stations and the CDB.
pub(crate) struct Backend {
    frontend: Rc<RefCell<Frontend>>,
    arch_reg_file: Rc<RefCell<ArgRegFile>>,
    memory_subsystem: Rc<RefCell<MemorySubsystem>>,
    perf_counters: Rc<RefCell<PerfCounters>>,
    rat: RAT,
    rob: ROB,
    units: Vec<EU>,
    cdb: CDB,
    // every issued instruction, indexed by sequence number
    history: Vec<IssuedInstr>,
    // sequence number of the control instruction that hasn't been resolved yet
    outstanding_branch: Option<u64>,
    branch_prediction: BranchPrediction,
    trace: Trace,
}

impl Backend {
    pub(crate) fn new(cpu_config: &CPUConfig,
                      frontend: Rc<RefCell<Frontend>>,
                      memory_subsystem: Rc<RefCell<MemorySubsystem>>,
                      arch_reg_file: Rc<RefCell<ArgRegFile>>,
                      perf_counters: Rc<RefCell<PerfCounters>>) -> Backend {
        let units = UnitKind::ALL
            .iter()
            .filter_map(|&kind| {
                cpu_config.units.get(kind).map(|unit_config| EU::new(kind, unit_config, cpu_config.trace.execute))
            })
            .collect();

        Backend {
            frontend,
            arch_reg_file,
            memory_subsystem,
            perf_counters,
            rat: RAT::new(cpu_config.register_count),
            rob: ROB::new(cpu_config.rob_capacity),
            units,
            cdb: CDB::new(cpu_config.cdb_width),
            history: Vec::new(),
            outstanding_branch: None,
            branch_prediction: cpu_config.branch_prediction,
            trace: cpu_config.trace.clone(),
        }
    }

    pub(crate) fn do_cycle(&mut self, cycle: u64) -> Result<(), SimError> {
        self.cycle_issue(cycle)?;
        self.cycle_execute(cycle);
        self.cycle_write_back(cycle);
        self.cycle_retire(cycle)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rob.is_empty()
    }

    pub(crate) fn branch_outstanding(&self) -> bool {
        self.outstanding_branch.is_some()
    }

    pub(crate) fn history(&self) -> &[IssuedInstr] {
        &self.history
    }

    pub(crate) fn rat(&self) -> &RAT {
        &self.rat
    }

    pub(crate) fn rob_size(&self) -> u16 {
        self.rob.size()
    }

    fn unit_index(&self, kind: UnitKind) -> Option<usize> {
        self.units.iter().position(|eu| eu.kind == kind)
    }

    // Issues at most one instruction from the instruction stream.
    fn cycle_issue(&mut self, cycle: u64) -> Result<(), SimError> {
        self.recover_from_misprediction(cycle);

        if !self.rob.has_space() {
            debug!("Issue stalled: the ROB is full");
            return Ok(());
        }

        let mut frontend = self.frontend.borrow_mut();
        let pc = frontend.ip_next_fetch();
        let instr = match frontend.peek() {
            None => return Ok(()),
            Some(instr) => instr,
        };

        let kind = UnitKind::for_opcode(instr.opcode);
        let unit_index = match self.unit_index(kind) {
            Some(unit_index) => unit_index,
            // on a predicted path the instruction may never be reached
            None if self.branch_outstanding() => {
                debug!("Issue stalled: [{}] {} has no unit and waits for the outstanding branch", pc, instr);
                return Ok(());
            }
            None => return Err(SimError::UnroutableInstruction { opcode: instr.opcode, pc }),
        };

        if instr.is_control() && self.branch_outstanding() {
            debug!("Issue stalled: [{}] {} waits for the outstanding branch", pc, instr);
            return Ok(());
        }

        if self.units[unit_index].is_full() {
            debug!("Issue stalled: no free reservation station in {}", kind);
            return Ok(());
        }

        let mut memory_subsystem = self.memory_subsystem.borrow_mut();
        if instr.opcode == Opcode::SD && !memory_subsystem.sb.has_space() {
            debug!("Issue stalled: the store buffer is full");
            return Ok(());
        }

        frontend.advance();
        let seq = self.history.len() as u64;

        let rat_snapshot = if instr.is_control() {
            Some(self.rat.snapshot())
        } else {
            None
        };

        // sources are renamed before the sink, so an instruction reading its
        // own destination sees the previous producer
        let source: Vec<Operand> = {
            let arch_reg_file = self.arch_reg_file.borrow();
            instr.source
                .iter()
                .map(|source| match *source {
                    Source::Register(arch_reg) => self.rat.rename_read(arch_reg, &self.rob, &arch_reg_file),
                    Source::Immediate(value) => Operand::Value(value),
                })
                .collect()
        };

        let rob_tag = self.rob.allocate(seq, instr.sink)?;
        if let Some(sink) = instr.sink {
            self.rat.set(sink, rob_tag);
        }

        let sb_index = if instr.opcode == Opcode::SD {
            let sb_index = memory_subsystem.sb.allocate(seq);
            self.rob.get_mut(rob_tag).sb_index = Some(sb_index);
            Some(sb_index)
        } else {
            None
        };

        let branch_target_predicted = if instr.is_control() {
            let delta = predict(self.branch_prediction, instr.branch_offset());
            let target = branch_target(pc, delta);
            if target != frontend.ip_next_fetch() {
                frontend.redirect(target);
            }
            self.outstanding_branch = Some(seq);
            Some(target)
        } else {
            None
        };

        self.units[unit_index].dispatch(Dispatch {
            seq,
            pc,
            rob_tag,
            opcode: instr.opcode,
            source,
            sb_index,
            branch_target_predicted,
        }, cycle);

        if self.trace.issue {
            info!("Issued [{}] {} as {}", pc, instr, rob_tag);
        }

        self.history.push(IssuedInstr {
            seq,
            pc,
            instr,
            rob_tag,
            stages: StageEvents {
                issue: Some(cycle),
                ..StageEvents::default()
            },
            aux: AuxData {
                rat_snapshot,
                branch_target_predicted,
                correction: None,
            },
        });
        self.perf_counters.borrow_mut().issue_cnt += 1;
        Ok(())
    }

    // Applies the correction left behind by a mispredicted branch.
    fn recover_from_misprediction(&mut self, cycle: u64) {
        let seq = match self.outstanding_branch {
            None => return,
            Some(seq) => seq,
        };

        let correction = match self.history[seq as usize].aux.correction {
            None => return,
            Some(correction) => correction,
        };

        self.squash(seq, cycle);
        self.frontend.borrow_mut().redirect(correction.target);
        self.outstanding_branch = None;

        let mut perf_counters = self.perf_counters.borrow_mut();
        perf_counters.branch_miss_predict_cnt += 1;
        perf_counters.pipeline_flushes += 1;
    }

    // Discards every instruction younger than the branch with sequence
    // number `seq` and restores the renaming state of the branch.
    fn squash(&mut self, seq: u64, cycle: u64) {
        let rob_tag = self.history[seq as usize].rob_tag;

        let squashed = self.rob.flush_after(rob_tag);
        for eu in self.units.iter_mut() {
            eu.flush_after(seq);
        }
        self.memory_subsystem.borrow_mut().sb.flush_after(seq);

        if let Some(snapshot) = &self.history[seq as usize].aux.rat_snapshot {
            self.rat.restore(snapshot, &self.rob);
        }

        for &squashed_seq in &squashed {
            self.history[squashed_seq as usize].stages.squashed = Some(cycle);
        }

        if self.trace.pipeline_flush {
            let branch = &self.history[seq as usize];
            match branch.aux.correction {
                Some(correction) => info!(
                    "Pipeline flush after [{}] {} resolved at cycle {}: {} instructions squashed, continuing at {}",
                    branch.pc, branch.instr, correction.detected_at, squashed.len(), correction.target),
                None => info!("Pipeline flush after [{}] {}: {} instructions squashed", branch.pc, branch.instr, squashed.len()),
            }
        }

        self.perf_counters.borrow_mut().squash_cnt += squashed.len() as u64;
    }

    fn cycle_execute(&mut self, cycle: u64) {
        let mut memory_subsystem = self.memory_subsystem.borrow_mut();
        let mut perf_counters = self.perf_counters.borrow_mut();

        for eu in self.units.iter_mut() {
            eu.tick(cycle, &mut memory_subsystem, &mut self.history, &mut perf_counters);
        }
    }

    // Broadcasts the results that win CDB arbitration.
    fn cycle_write_back(&mut self, cycle: u64) {
        let candidates = CDB::collect(&self.units, cycle);
        let (winners, deferred) = self.cdb.arbitrate(candidates);

        let mut perf_counters = self.perf_counters.borrow_mut();
        perf_counters.cdb_deferred_cnt += deferred as u64;

        for broadcast in winners {
            let rs = self.units[broadcast.unit_index].take(broadcast.rs_index);

            self.rob.get_mut(rs.rob_tag).fault = rs.fault;
            self.rob.resolve(rs.rob_tag, rs.result, cycle);

            if let Some(value) = rs.result {
                for eu in self.units.iter_mut() {
                    eu.wakeup(rs.rob_tag, value);
                }
            }

            let entry = &mut self.history[rs.seq as usize];
            entry.stages.write_back = Some(cycle);

            if self.outstanding_branch == Some(rs.seq) && entry.aux.correction.is_none() {
                self.outstanding_branch = None;
                perf_counters.branch_good_predict_cnt += 1;
            }

            if self.trace.write_back {
                match rs.result {
                    Some(value) => info!("Write back [{}] {} = {}", entry.pc, rs.rob_tag, value),
                    None => info!("Write back [{}] {}", entry.pc, rs.rob_tag),
                }
            }

            perf_counters.write_back_cnt += 1;
        }
    }

    // Retires at most one instruction, in program order.
    fn cycle_retire(&mut self, cycle: u64) -> Result<(), SimError> {
        if !self.rob.head_has_executed(cycle) {
            return Ok(());
        }

        if let Some(slot) = self.rob.head() {
            if let Some(address) = slot.fault {
                let pc = self.history[slot.seq as usize].pc;
                return Err(SimError::MemoryFault { address, pc });
            }
        }

        let slot = match self.rob.commit_oldest(cycle) {
            None => return Ok(()),
            Some(slot) => slot,
        };

        if let (Some(sink), Some(value)) = (slot.sink, slot.result) {
            self.arch_reg_file.borrow_mut().set_value(sink, value);
            self.rat.invalidate(sink, slot.tag);
        }

        if let Some(sb_index) = slot.sb_index {
            self.memory_subsystem.borrow_mut().sb.commit(sb_index);
        }

        let entry = &mut self.history[slot.seq as usize];
        entry.stages.commit = Some((cycle, cycle));

        if self.trace.retire {
            info!("Retiring [{}] {}", entry.pc, entry.instr);
        }

        self.perf_counters.borrow_mut().retire_cnt += 1;
        Ok(())
    }
}
