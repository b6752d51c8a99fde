use std::rc::Rc;

use crate::cpu::{BranchPrediction, CPUConfig, UnitConfig, CPU};
use crate::instructions::instructions::{get_register, ArchReg, IssuedInstr, Program, Value};

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::error::SimError;
    use crate::instructions::instructions::Opcode;
    use crate::loader::loader::{load_from_string, LoadError};

    use super::*;

    #[test]
    fn test_single_add_timing() {
        let src = r#"
.init R2, 1
.init R3, 2
    ADD R1, R2, R3
"#;
        let mut harness = TestHarness::default();
        harness.run(src);
        harness.assert_reg_value("R1", Value::Int(3));

        let add = &harness.history()[0];
        assert_eq!(add.stages.issue, Some(1));
        assert_eq!(add.stages.execute, Some((2, 2)));
        assert_eq!(add.stages.write_back, Some(2));
        assert_eq!(add.stages.commit, Some((3, 3)));
        assert_eq!(harness.cpu().perf_counters().cycle_cnt, 3);
    }

    #[test]
    fn test_dependent_add_waits_for_write_back() {
        let src = r#"
.init R2, 1
.init R3, 2
    ADD R1, R2, R3
    ADD R4, R1, R1
"#;
        let mut harness = TestHarness::default();
        harness.run(src);
        harness.assert_reg_value("R4", Value::Int(6));

        let dependent = &harness.history()[1];
        assert_eq!(dependent.stages.issue, Some(2));
        assert_eq!(dependent.stages.execute, Some((3, 3)));
        assert_eq!(dependent.stages.commit, Some((4, 4)));
        harness.check_invariants();
    }

    #[test]
    fn test_same_src_dst_reg() {
        let src = r#"
.init R1, 5
    ADDI R1, R1, 10
    ADDI R1, R1, 10
"#;
        let mut harness = TestHarness::default();
        harness.run(src);
        harness.assert_reg_value("R1", Value::Int(25));
        assert_eq!(harness.cpu().rat().pending_count(), 0);
    }

    #[test]
    fn test_integer_arithmetic() {
        let src = r#"
.init R1, 100
.init R2, 10
    ADD R3, R1, R2
    SUB R4, R2, R1
    SUBI R5, R1, 1
    ADDI R6, R0, -3
"#;
        let mut harness = TestHarness::default();
        harness.run(src);
        harness.assert_reg_value("R3", Value::Int(110));
        harness.assert_reg_value("R4", Value::Int(-90));
        harness.assert_reg_value("R5", Value::Int(99));
        harness.assert_reg_value("R6", Value::Int(-3));
    }

    #[test]
    fn test_float_arithmetic() {
        let src = r#"
.init F2, 6.0
.init F4, 1.5
    ADD.D F0, F2, F4
    SUB.D F6, F2, F4
    MUL.D F8, F2, F4
    DIV.D F10, F2, F4
"#;
        let mut harness = TestHarness::default();
        harness.run(src);
        harness.assert_reg_value("F0", Value::Float(7.5));
        harness.assert_reg_value("F6", Value::Float(4.5));
        harness.assert_reg_value("F8", Value::Float(9.0));
        harness.assert_reg_value("F10", Value::Float(4.0));
        harness.check_invariants();
    }

    #[test]
    fn test_out_of_order_completion_in_order_commit() {
        let src = r#"
.init F2, 2.0
.init F4, 3.0
.init R2, 1
    MUL.D F0, F2, F4
    ADD R1, R2, R2
"#;
        let mut harness = TestHarness::default();
        harness.run(src);

        let history = harness.history();
        let mul = &history[0];
        let add = &history[1];
        assert_eq!(mul.stages.execute, Some((2, 21)));
        assert!(add.stages.write_back < mul.stages.write_back);
        assert!(add.stages.commit > mul.stages.commit);
        harness.assert_reg_value("F0", Value::Float(6.0));
        harness.assert_reg_value("R1", Value::Int(2));
        harness.check_invariants();
    }

    #[test]
    fn test_correctly_predicted_branch() {
        // forward branch, predicted not taken, and not taken
        let src = r#"
.init R1, 1
    BNE R0, R0, 3
    ADD R2, R1, R1
    ADD R3, R1, R1
    ADD R4, R1, R1
"#;
        let mut harness = TestHarness::default();
        harness.run(src);

        let issue_cycles: Vec<Option<u64>> = harness.history().iter().map(|issued| issued.stages.issue).collect();
        assert_eq!(issue_cycles, vec![Some(1), Some(2), Some(3), Some(4)]);
        assert!(harness.history().iter().all(IssuedInstr::is_committed));
        assert!(!harness.history().iter().any(IssuedInstr::is_squashed));

        let perf_counters = harness.cpu().perf_counters();
        assert_eq!(perf_counters.branch_good_predict_cnt, 1);
        assert_eq!(perf_counters.branch_miss_predict_cnt, 0);
        assert_eq!(perf_counters.pipeline_flushes, 0);
        harness.assert_reg_value("R4", Value::Int(2));
        harness.check_invariants();
    }

    #[test]
    fn test_mispredicted_branch() {
        let src = r#"
.init R1, 1
    BEQ R1, R1, target
    ADD R2, R1, R1
    ADD R3, R1, R1
target:
    ADD R4, R1, R1
"#;
        let mut cpu_config = CPUConfig::default();
        cpu_config.units.branch = Some(UnitConfig::new(2, 5));
        let mut harness = TestHarness::new(cpu_config);
        harness.load(src);

        for _ in 0..4 {
            harness.cpu_mut().do_cycle().unwrap();
        }

        let history = harness.history();
        let branch = &history[0];
        assert_eq!(branch.stages.execute, Some((2, 3)));
        assert_eq!(branch.aux.correction.map(|correction| correction.target), Some(3));
        assert_eq!(history[1].stages.squashed, Some(4));
        assert_eq!(history[2].stages.squashed, Some(4));

        // the first instruction issued after the recovery is at the real target
        let recovered = &history[3];
        assert_eq!(recovered.pc, 3);
        assert_eq!(recovered.stages.issue, Some(4));

        // renaming is back to the snapshot of the branch, plus the new issue
        let rat = harness.cpu().rat();
        let snapshot = branch.aux.rat_snapshot.as_ref().unwrap();
        assert_eq!(rat.get(ArchReg::Int(2)), snapshot.get(ArchReg::Int(2)));
        assert_eq!(rat.get(ArchReg::Int(3)), None);
        assert_eq!(rat.get(ArchReg::Int(4)), Some(recovered.rob_tag));

        harness.run_to_end();
        assert!(!harness.history()[1].is_committed());
        assert!(!harness.history()[2].is_committed());
        harness.assert_reg_value("R2", Value::Int(0));
        harness.assert_reg_value("R3", Value::Int(0));
        harness.assert_reg_value("R4", Value::Int(2));

        let perf_counters = harness.cpu().perf_counters();
        assert_eq!(perf_counters.branch_miss_predict_cnt, 1);
        assert_eq!(perf_counters.pipeline_flushes, 1);
        assert_eq!(perf_counters.squash_cnt, 2);
        assert_eq!(harness.cpu().rat(), snapshot_of(&harness, 0));
        harness.check_invariants();
    }

    #[test]
    fn test_branch_waits_for_outstanding_branch() {
        let src = r#"
.init R1, 1
    BEQ R0, R0, 0
    BEQ R0, R0, 0
"#;
        let mut harness = TestHarness::default();
        harness.run(src);

        let history = harness.history();
        // the second branch is issued after the first wrote back
        assert!(history[1].stages.issue > history[0].stages.write_back);
        harness.check_invariants();
    }

    #[test]
    fn test_rob_capacity() {
        let src = r#"
.init R1, 1
    ADD R2, R1, R1
    ADD R3, R1, R1
    ADD R4, R1, R1
    ADD R5, R1, R1
    ADD R6, R1, R1
"#;
        let mut cpu_config = CPUConfig::default();
        cpu_config.rob_capacity = 2;
        let mut harness = TestHarness::new(cpu_config);
        harness.load(src);

        while harness.cpu().is_working() {
            harness.cpu_mut().do_cycle().unwrap();
            assert!(harness.cpu().rob_size() <= 2);
        }

        assert!(harness.history()[2].stages.issue > Some(3));
        harness.assert_reg_value("R6", Value::Int(2));
        harness.check_invariants();
    }

    #[test]
    fn test_cdb_width() {
        let src = r#"
.init R1, 1
    ADD R2, R1, R1
    ADD R3, R1, R1
    ADD R4, R1, R1
    BNE R0, R0, 2
    ADD R5, R1, R1
    ADD R6, R1, R1
"#;
        for cdb_width in 1..=2 {
            let mut cpu_config = CPUConfig::default();
            cpu_config.cdb_width = cdb_width;
            cpu_config.units.branch = Some(UnitConfig::new(1, 5));
            let mut harness = TestHarness::new(cpu_config);
            harness.run(src);
            harness.assert_reg_value("R6", Value::Int(2));
            harness.check_invariants();
        }
    }

    #[test]
    fn test_store_to_load_forwarding() {
        let src = r#"
.init R1, 7
.init R2, 16
    MUL.D F0, F2, F4
    SD R1, 0(R2)
    LD R3, 0(R2)
"#;
        let mut harness = TestHarness::default();
        harness.run(src);

        let history = harness.history();
        let store = &history[1];
        let load = &history[2];
        // the load got its value before the store was committed
        assert!(load.stages.write_back < store.stages.commit.map(|(start, _)| start));
        harness.assert_reg_value("R3", Value::Int(7));
        harness.assert_mem_value(16, Value::Int(7));
        harness.check_invariants();
    }

    #[test]
    fn test_load_waits_for_unresolved_store() {
        let src = r#"
.init F2, 1.5
.init F4, 2.0
.init R2, 8
.mem 8, 1.0
    MUL.D F0, F2, F4
    SD F0, 0(R2)
    LD F6, 0(R2)
"#;
        let mut harness = TestHarness::default();
        harness.run(src);

        let history = harness.history();
        let store_end = history[1].stages.execute.map(|(_, end)| end);
        let load_start = history[2].stages.execute.map(|(start, _)| start);
        assert!(load_start > store_end);
        harness.assert_reg_value("F6", Value::Float(3.0));
        harness.assert_mem_value(8, Value::Float(3.0));
    }

    #[test]
    fn test_load_reads_initial_memory() {
        let src = r#"
.mem 4, 42
.init R1, 2
    LD R2, 2(R1)
"#;
        let mut harness = TestHarness::default();
        harness.run(src);

        let load = &harness.history()[0];
        // latency 1 plus 4 cycles memory access
        assert_eq!(load.stages.execute, Some((2, 6)));
        harness.assert_reg_value("R2", Value::Int(42));
    }

    #[test]
    fn test_committed_store_reaches_memory() {
        let src = r#"
.init R1, 11
.init R2, 3
    SD R1, 5(R2)
"#;
        let mut harness = TestHarness::default();
        harness.run(src);
        harness.assert_mem_value(8, Value::Int(11));
    }

    #[test]
    fn test_squashed_store_never_reaches_memory() {
        let src = r#"
.init R1, 1
.init R2, 5
    BEQ R1, R1, done
    SD R2, 8(R0)
done:
    ADD R3, R1, R1
"#;
        let mut harness = TestHarness::default();
        harness.run(src);

        assert!(harness.history()[1].is_squashed());
        harness.assert_mem_value(8, Value::Int(0));
        harness.assert_reg_value("R3", Value::Int(2));
        harness.check_invariants();
    }

    #[test]
    fn test_unroutable_instruction() {
        let src = r#"
    ADD R1, R0, R0
    MUL.D F0, F2, F4
"#;
        let mut cpu_config = CPUConfig::default();
        cpu_config.units.float_multiplier = None;
        let mut harness = TestHarness::new(cpu_config);

        let result = harness.try_run(src);
        assert_eq!(result, Err(SimError::UnroutableInstruction { opcode: Opcode::MULD, pc: 1 }));
    }

    #[test]
    fn test_unroutable_instruction_on_predicted_path() {
        let src = r#"
.init R1, 1
    BEQ R1, R1, target
    MUL.D F0, F2, F4
target:
    ADD R4, R1, R1
"#;
        let mut cpu_config = CPUConfig::default();
        cpu_config.units.float_multiplier = None;
        let mut harness = TestHarness::new(cpu_config);
        harness.run(src);

        // the taken branch skips MUL.D, so it is never issued
        let history = harness.history();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|issued| issued.instr.opcode != Opcode::MULD));
        assert_eq!(history[1].pc, 2);
        harness.assert_reg_value("R4", Value::Int(2));

        let perf_counters = harness.cpu().perf_counters();
        assert_eq!(perf_counters.branch_miss_predict_cnt, 1);
        assert_eq!(perf_counters.squash_cnt, 0);
        harness.check_invariants();
    }

    #[test]
    fn test_mispredicted_branch_without_younger_instructions() {
        let src = r#"
.init R1, 1
    BEQ R1, R1, target
    ADD R2, R1, R1
target:
    ADD R3, R1, R1
"#;
        let mut cpu_config = CPUConfig::default();
        cpu_config.rob_capacity = 1;
        let mut harness = TestHarness::new(cpu_config);
        harness.load(src);

        while harness.cpu().perf_counters().pipeline_flushes == 0 {
            assert!(harness.cpu().cycle() < 100);
            harness.cpu_mut().do_cycle().unwrap();
        }

        // the branch held the only ROB slot, so nothing was issued after it
        assert_eq!(harness.history().len(), 1);
        assert_eq!(harness.cpu().rat(), snapshot_of(&harness, 0));

        harness.run_to_end();
        let history = harness.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].pc, 2);
        assert!(history.iter().all(|issued| !issued.is_squashed()));
        harness.assert_reg_value("R2", Value::Int(0));
        harness.assert_reg_value("R3", Value::Int(2));

        let perf_counters = harness.cpu().perf_counters();
        assert_eq!(perf_counters.branch_miss_predict_cnt, 1);
        assert_eq!(perf_counters.squash_cnt, 0);
        harness.check_invariants();
    }

    #[test]
    fn test_memory_fault_when_committed() {
        let src = r#"
.init R2, 5000
    LD R1, 0(R2)
"#;
        let mut harness = TestHarness::default();
        let result = harness.try_run(src);
        assert_eq!(result, Err(SimError::MemoryFault { address: 5000, pc: 0 }));
    }

    #[test]
    fn test_memory_fault_when_squashed() {
        let src = r#"
.init R1, 1
.init R2, 5000
    BEQ R1, R1, done
    LD R3, 0(R2)
done:
    ADD R4, R1, R1
"#;
        let mut harness = TestHarness::default();
        harness.run(src);
        assert!(harness.history()[1].is_squashed());
        harness.assert_reg_value("R4", Value::Int(2));
    }

    #[test]
    fn test_cycle_limit() {
        let src = r#"
loop:
    BEQ R0, R0, loop
"#;
        let mut cpu_config = CPUConfig::default();
        cpu_config.max_cycles = 5;
        let mut harness = TestHarness::new(cpu_config);
        let result = harness.try_run(src);
        assert_eq!(result, Err(SimError::CycleLimitExceeded { max_cycles: 5 }));
    }

    #[test]
    fn test_loop_under_every_prediction_policy() {
        let src = r#"
.init R2, 5
loop:
    ADDI R1, R1, 1
    BNE R1, R2, loop
    ADDI R3, R3, 7
.assert R1, 5
.assert R3, 7
"#;
        for branch_prediction in [BranchPrediction::NotTaken, BranchPrediction::Taken, BranchPrediction::BackwardTaken] {
            let mut cpu_config = CPUConfig::default();
            cpu_config.branch_prediction = branch_prediction;
            let mut harness = TestHarness::new(cpu_config);
            harness.run(src);

            harness.assert_reg_value("R1", Value::Int(5));
            harness.assert_reg_value("R3", Value::Int(7));
            assert!(harness.cpu().check_asserts().iter().all(|result| result.passed));
            harness.check_invariants();

            let committed_branches = harness
                .history()
                .iter()
                .filter(|issued| issued.instr.opcode == Opcode::BNE && issued.is_committed())
                .count();
            assert_eq!(committed_branches, 5);
        }
    }

    #[test]
    fn test_failed_assert() {
        let src = r#"
.init R1, 1
    ADDI R1, R1, 1
.assert R1, 3
.assert_mem 0, 0
"#;
        let mut harness = TestHarness::default();
        harness.run(src);

        let results = harness.cpu().check_asserts();
        assert!(!results[0].passed);
        assert_eq!(results[0].actual, Some(Value::Int(2)));
        assert!(results[1].passed);
    }

    #[test]
    fn test_report() {
        let src = r#"
.init R2, 1
    ADD R1, R2, R2
"#;
        let mut harness = TestHarness::default();
        harness.run(src);

        let report = harness.cpu().report();
        assert_eq!(report.cycles, 3);
        assert_eq!(report.instructions.len(), 1);
        assert_eq!(report.instructions[0].commit, Some((3, 3)));

        let yaml = serde_yaml::to_string(&report).unwrap();
        assert!(yaml.contains("instructions"));
    }

    #[test]
    fn test_empty_program() {
        let mut harness = TestHarness::default();
        harness.run("");
        assert!(harness.history().is_empty());
        assert_eq!(harness.cpu().perf_counters().cycle_cnt, 0);
    }

    fn snapshot_of(harness: &TestHarness, seq: usize) -> &crate::backend::register_alias_table::RAT {
        harness.history()[seq].aux.rat_snapshot.as_ref().unwrap()
    }

    struct TestHarness {
        cpu_config: CPUConfig,
        cpu: Option<CPU>,
    }

    impl TestHarness {
        fn default() -> TestHarness {
            TestHarness::new(CPUConfig::default())
        }

        fn new(cpu_config: CPUConfig) -> TestHarness {
            TestHarness {
                cpu_config,
                cpu: None,
            }
        }

        fn load(&mut self, src: &str) {
            let program = self.load_program(src);
            match CPU::new(&self.cpu_config, program) {
                Ok(cpu) => self.cpu = Some(cpu),
                Err(err) => panic!("{}", err),
            }
        }

        fn run(&mut self, src: &str) {
            if let Err(err) = self.try_run(src) {
                panic!("Simulation failed: {}", err);
            }
        }

        fn try_run(&mut self, src: &str) -> Result<(), SimError> {
            self.load(src);
            self.cpu_mut().run()
        }

        fn run_to_end(&mut self) {
            self.cpu_mut().run().unwrap();
        }

        fn load_program(&self, src: &str) -> Rc<Program> {
            match load_from_string(&self.cpu_config, src) {
                Ok(program) => Rc::new(program),
                Err(LoadError::AnalysisError(msg_vec)) => {
                    for msg in &msg_vec {
                        println!("{}", msg);
                    }
                    panic!("Program has {} errors", msg_vec.len());
                }
                Err(err) => panic!("{}", err),
            }
        }

        fn cpu(&self) -> &CPU {
            self.cpu.as_ref().unwrap()
        }

        fn cpu_mut(&mut self) -> &mut CPU {
            self.cpu.as_mut().unwrap()
        }

        fn history(&self) -> &[IssuedInstr] {
            self.cpu().history()
        }

        fn assert_reg_value(&self, name: &str, expected: Value) {
            let arch_reg = get_register(name, self.cpu_config.register_count).unwrap();
            assert_eq!(self.cpu().register_value(arch_reg), expected, "register {}", name);
        }

        fn assert_mem_value(&self, addr: i64, expected: Value) {
            assert_eq!(self.cpu().memory_value(addr), Some(expected), "memory [{}]", addr);
        }

        // Properties every run has to satisfy.
        fn check_invariants(&self) {
            let mut commits_per_cycle: HashMap<u64, usize> = HashMap::new();
            let mut write_backs_per_cycle: HashMap<u64, usize> = HashMap::new();
            let mut last_commit = 0;

            for issued in self.history() {
                let stages = &issued.stages;
                assert!(!(issued.is_committed() && issued.is_squashed()), "{}", issued);

                let issue = stages.issue.unwrap();
                if let Some((start, end)) = stages.execute {
                    assert!(issue < start, "{}", issued);
                    assert!(start <= end, "{}", issued);
                    if let Some(write_back) = stages.write_back {
                        assert!(end <= write_back, "{}", issued);
                    }
                }

                if let Some(write_back) = stages.write_back {
                    *write_backs_per_cycle.entry(write_back).or_default() += 1;
                }

                if let Some((start, end)) = stages.commit {
                    assert_eq!(start, end);
                    assert!(stages.write_back.unwrap() < start, "{}", issued);
                    // program order
                    assert!(start > last_commit, "{}", issued);
                    last_commit = start;
                    *commits_per_cycle.entry(start).or_default() += 1;
                }
            }

            assert!(commits_per_cycle.values().all(|&count| count == 1));
            assert!(write_backs_per_cycle.values().all(|&count| count <= self.cpu_config.cdb_width as usize));
        }
    }
}
