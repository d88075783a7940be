#![forbid(unsafe_code)]

use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use svr_conformance::verification::RunOutcome;
use svr_conformance::{
    HarnessConfig, SuiteReport, gate_log_path, run_regression_suite, set_verification_log_path,
};
use svr_runner::ProcessSolver;

#[derive(Debug, Clone, Serialize)]
struct RunSummary {
    case: String,
    base_folder: String,
    n_proc: usize,
    status: &'static str,
    reason_code: &'static str,
    reference_version: Option<String>,
    compared_elements: usize,
    failing_elements: usize,
}

#[derive(Debug, Serialize)]
struct GateSummary {
    status: &'static str,
    matrix: String,
    solver: String,
    verification_log: String,
    suite: SuiteReport,
    runs: Vec<RunSummary>,
    report_path: Option<String>,
}

#[derive(Debug)]
struct GateOptions {
    log_path: Option<PathBuf>,
    report_path: Option<PathBuf>,
    matrix_path: Option<PathBuf>,
    case: Option<String>,
    n_proc: Option<usize>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("run_regression_gate failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let options = parse_args()?;
    let mut cfg = HarnessConfig::default_paths();
    if let Some(matrix_path) = &options.matrix_path {
        cfg.matrix_path = matrix_path.clone();
    }
    let solver = ProcessSolver::new(cfg.solver.clone());

    let log_path = gate_log_path(options.log_path, || {
        let ts_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |duration| duration.as_millis());
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../artifacts/logs")
            .join(format!("struct_regression_{ts_millis}.jsonl"))
    });
    set_verification_log_path(Some(log_path.clone()));

    let (suite, outcomes) =
        run_regression_suite(&cfg, &solver, options.case.as_deref(), options.n_proc)?;
    let status = if suite.all_passed() { "pass" } else { "fail" };
    for failure in &suite.failures {
        eprintln!("{failure}");
    }

    let summary = GateSummary {
        status,
        matrix: cfg.matrix_path.display().to_string(),
        solver: cfg.solver.program.clone(),
        verification_log: log_path.display().to_string(),
        suite,
        runs: outcomes.iter().map(summarize_run).collect(),
        report_path: options
            .report_path
            .as_ref()
            .map(|path| path.display().to_string()),
    };

    let summary_json = serde_json::to_string_pretty(&summary)
        .map_err(|err| format!("failed serializing summary: {err}"))?;

    if let Some(report_path) = options.report_path {
        if let Some(parent) = report_path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                format!(
                    "failed creating report directory {}: {err}",
                    parent.display()
                )
            })?;
        }
        fs::write(&report_path, summary_json.as_bytes())
            .map_err(|err| format!("failed writing report {}: {err}", report_path.display()))?;
    }
    println!("{summary_json}");

    if status == "fail" {
        std::process::exit(2);
    }
    Ok(())
}

fn summarize_run(outcome: &RunOutcome) -> RunSummary {
    let (status, reason_code, reference_version, compared_elements, failing_elements) =
        match &outcome.result {
            Ok(report) => (
                "pass",
                "verified",
                report.reference_version.clone(),
                report.compared_elements,
                0,
            ),
            Err(failure) => (
                "fail",
                failure.kind.reason_code(),
                failure.reference_version.clone(),
                failure.kind.compared_elements(),
                failure.kind.failing_elements(),
            ),
        };
    RunSummary {
        case: outcome.case.clone(),
        base_folder: outcome.base_folder.clone(),
        n_proc: outcome.n_proc,
        status,
        reason_code,
        reference_version,
        compared_elements,
        failing_elements,
    }
}

fn parse_args() -> Result<GateOptions, String> {
    let mut log_path: Option<PathBuf> = None;
    let mut report_path: Option<PathBuf> = None;
    let mut matrix_path: Option<PathBuf> = None;
    let mut case: Option<String> = None;
    let mut n_proc: Option<usize> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--log-path" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--log-path requires a value".to_string())?;
                log_path = Some(PathBuf::from(value));
            }
            "--report-path" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--report-path requires a value".to_string())?;
                report_path = Some(PathBuf::from(value));
            }
            "--matrix" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--matrix requires a value".to_string())?;
                matrix_path = Some(PathBuf::from(value));
            }
            "--case" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--case requires a value".to_string())?;
                case = Some(value);
            }
            "--n-proc" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--n-proc requires a value".to_string())?;
                let parsed = value
                    .parse::<usize>()
                    .map_err(|err| format!("invalid --n-proc value '{value}': {err}"))?;
                if parsed == 0 {
                    return Err("--n-proc must be at least 1".to_string());
                }
                n_proc = Some(parsed);
            }
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p svr-conformance --bin run_regression_gate -- [--log-path <path>] [--report-path <path>] [--matrix <path>] [--case <name>] [--n-proc <n>]"
                );
                std::process::exit(0);
            }
            unknown => return Err(format!("unknown argument: {unknown}")),
        }
    }

    Ok(GateOptions {
        log_path,
        report_path,
        matrix_path,
        case,
        n_proc,
    })
}
