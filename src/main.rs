use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::rc::Rc;

use log::{error, info, warn};
use structopt::StructOpt;

use tomasulo_emulator::cpu::{load_cpu_config, CPUConfig, CPU};
use tomasulo_emulator::loader::loader::{load, LoadError};

const DEFAULT_CONFIG: &str = "cpu.yaml";

#[derive(StructOpt, Debug)]
#[structopt(name = "Tomasulo CPU Emulator")]
struct Opt {
    /// Path of the file to load
    #[structopt(short, long, parse(from_os_str))]
    file: PathBuf,

    /// Sets a custom config file; without it cpu.yaml is used when present
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Writes the stage timestamps and counters of the run as YAML
    #[structopt(short, long, parse(from_os_str))]
    report: Option<PathBuf>,
}

fn load_config(opt: &Opt) -> CPUConfig {
    let (path, explicit) = match &opt.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG), false),
    };

    if !explicit && !path.exists() {
        info!("No {} found, using the default configuration", DEFAULT_CONFIG);
        return CPUConfig::default();
    }

    let path_str = path.to_string_lossy();
    match load_cpu_config(&path_str) {
        Ok(config) => config,
        Err(err) => {
            error!("Failed to load {}. Cause: {}", path_str, err);
            exit(1);
        }
    }
}

fn write_report(cpu: &CPU, path: &Path) {
    let result = File::create(path)
        .map_err(|err| err.to_string())
        .and_then(|file| serde_yaml::to_writer(file, &cpu.report()).map_err(|err| err.to_string()));

    match result {
        Ok(()) => info!("Report written to {}", path.display()),
        Err(err) => warn!("Failed to write report {}. Cause: {}", path.display(), err),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt = Opt::from_args();
    let cpu_config = load_config(&opt);

    let path = opt.file.to_string_lossy();
    info!("Loading {}", path);
    let program = match load(&cpu_config, &path) {
        Ok(program) => Rc::new(program),
        Err(err) => {
            error!("Loading program '{}' failed.", path);
            match err {
                LoadError::AnalysisError(msg_vec) => {
                    for msg in msg_vec {
                        error!("{}", msg);
                    }
                }
                err => error!("{}", err),
            }
            exit(1);
        }
    };

    let mut cpu = match CPU::new(&cpu_config, program) {
        Ok(cpu) => cpu,
        Err(err) => {
            error!("{}", err);
            exit(1);
        }
    };
    let run_result = cpu.run();

    println!("{:>4} [{:>3}] {:<22} stages", "seq", "pc", "instruction");
    for issued in cpu.history() {
        println!("{}", issued);
    }

    let perf_counters = cpu.perf_counters();
    println!();
    println!("Cycles:               {}", perf_counters.cycle_cnt);
    println!("Issued:               {}", perf_counters.issue_cnt);
    println!("Executed:             {}", perf_counters.execute_cnt);
    println!("Written back:         {}", perf_counters.write_back_cnt);
    println!("Retired:              {}", perf_counters.retire_cnt);
    println!("CDB deferrals:        {}", perf_counters.cdb_deferred_cnt);
    println!("Branches predicted:   {}", perf_counters.branch_good_predict_cnt);
    println!("Branches mispredicted:{}", perf_counters.branch_miss_predict_cnt);
    println!("Pipeline flushes:     {}", perf_counters.pipeline_flushes);
    println!("Squashed:             {}", perf_counters.squash_cnt);
    println!("IPC:                  {:.2}", perf_counters.ipc());

    if let Some(report_path) = &opt.report {
        write_report(&cpu, report_path);
    }

    if let Err(err) = run_result {
        error!("Simulation failed: {}", err);
        exit(1);
    }

    let mut failed = 0;
    for result in cpu.check_asserts() {
        let actual = result.actual.map_or_else(|| String::from("-"), |value| value.to_string());
        if result.passed {
            println!("Assert {} == {}: ok", result.assertion.target, result.assertion.expected);
        } else {
            failed += 1;
            println!("Assert {} == {}: FAILED (was {})", result.assertion.target, result.assertion.expected, actual);
        }
    }

    if failed > 0 {
        exit(1);
    }
}
