#![forbid(unsafe_code)]

pub mod cases;
pub mod reference_store;
pub mod verification;

use crate::cases::VerificationMatrix;
use crate::reference_store::{DirectoryReferenceStore, ReferenceStore};
use crate::verification::{RunOutcome, verify};
use rayon::prelude::*;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use svr_compare::TolerancePolicy;
use svr_reconcile::ReconcilePolicy;
use svr_runner::{RunOptions, Solver, SolverInvocation};

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub cases_root: PathBuf,
    pub reference_root: PathBuf,
    pub matrix_path: PathBuf,
    pub solver: SolverInvocation,
    pub run_options: RunOptions,
    pub tolerance: TolerancePolicy,
    pub reconcile: ReconcilePolicy,
}

impl HarnessConfig {
    /// Paths rooted at this crate, with `SVR_*` environment overrides applied.
    #[must_use]
    pub fn default_paths() -> Self {
        let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        let cases_root = env_path("SVR_CASES_ROOT").unwrap_or_else(|| repo_root.join("tests/cases"));
        let reference_root = env_path("SVR_REFERENCE_ROOT").unwrap_or_else(|| cases_root.clone());

        let mut solver = SolverInvocation::default();
        if let Some(program) = env_value("SVR_SOLVER") {
            solver.program = program;
        }
        if let Some(launcher) = env_value("SVR_MPI_LAUNCHER") {
            solver.launcher = launcher.split_whitespace().map(ToString::to_string).collect();
        }
        if let Some(secs) = env_value("SVR_SOLVER_TIMEOUT_SECS").and_then(|raw| raw.parse::<u64>().ok())
        {
            solver.timeout_ms = secs.saturating_mul(1000);
        }

        Self {
            cases_root,
            reference_root,
            matrix_path: PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                .join("fixtures/verification_matrix.json"),
            solver,
            run_options: RunOptions::default(),
            tolerance: TolerancePolicy::default(),
            reconcile: ReconcilePolicy::default(),
        }
    }

    #[must_use]
    pub fn reference_store(&self) -> DirectoryReferenceStore {
        DirectoryReferenceStore::new(self.reference_root.clone())
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_value(key).map(PathBuf::from)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuiteReport {
    pub suite: String,
    pub case_count: usize,
    pub pass_count: usize,
    pub failures: Vec<String>,
}

impl SuiteReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.case_count == self.pass_count && self.failures.is_empty()
    }

    #[must_use]
    pub fn from_outcomes(suite: &str, outcomes: &[RunOutcome]) -> Self {
        let failures: Vec<String> = outcomes
            .iter()
            .filter_map(|outcome| outcome.result.as_ref().err().map(ToString::to_string))
            .collect();
        Self {
            suite: suite.to_string(),
            case_count: outcomes.len(),
            pass_count: outcomes.len() - failures.len(),
            failures,
        }
    }
}

const VERIFICATION_LOG_ENV: &str = "SVR_VERIFICATION_LOG_PATH";

static VERIFICATION_LOG_PATH: OnceLock<Mutex<Option<PathBuf>>> = OnceLock::new();

pub fn set_verification_log_path(path: Option<PathBuf>) {
    let cell = VERIFICATION_LOG_PATH.get_or_init(|| Mutex::new(None));
    if let Ok(mut slot) = cell.lock() {
        *slot = path;
    }
}

fn resolve_verification_log_path() -> Option<PathBuf> {
    let configured = VERIFICATION_LOG_PATH
        .get()
        .and_then(|cell| cell.lock().ok())
        .and_then(|slot| slot.clone());
    let from_env = std::env::var_os(VERIFICATION_LOG_ENV).map(PathBuf::from);
    configured.or(from_env)
}

/// Log destination for a gate run: `explicit`, then `SVR_VERIFICATION_LOG_PATH`,
/// then `default`.
pub fn gate_log_path(explicit: Option<PathBuf>, default: impl FnOnce() -> PathBuf) -> PathBuf {
    pick_log_path(explicit, env_path(VERIFICATION_LOG_ENV), default)
}

fn pick_log_path(
    explicit: Option<PathBuf>,
    from_env: Option<PathBuf>,
    default: impl FnOnce() -> PathBuf,
) -> PathBuf {
    explicit.or(from_env).unwrap_or_else(default)
}

#[derive(Debug, Serialize)]
struct VerificationLogEntry<'a> {
    ts_unix_ms: u128,
    suite: &'a str,
    case: &'a str,
    base_folder: &'a str,
    n_proc: usize,
    max_step: Option<u32>,
    status: &'static str,
    category: &'static str,
    reason_code: &'static str,
    reference_version: Option<&'a str>,
    compared_elements: usize,
    failing_elements: usize,
    duration_ms: u128,
    detail: Option<String>,
}

fn maybe_append_verification_log(entry: &VerificationLogEntry<'_>) -> Result<(), String> {
    let Some(path) = resolve_verification_log_path() else {
        return Ok(());
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("failed creating {}: {err}", parent.display()))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|err| format!("failed opening {}: {err}", path.display()))?;
    let line = serde_json::to_string(entry)
        .map_err(|err| format!("failed serializing verification log entry: {err}"))?;
    let mut payload = line.into_bytes();
    payload.push(b'\n');
    file.write_all(&payload).map_err(|err| {
        format!(
            "failed appending verification log {}: {err}",
            path.display()
        )
    })
}

fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn log_outcome(suite: &str, outcome: &RunOutcome, duration_ms: u128) -> Result<(), String> {
    let entry = match &outcome.result {
        Ok(report) => VerificationLogEntry {
            ts_unix_ms: now_unix_ms(),
            suite,
            case: &outcome.case,
            base_folder: &outcome.base_folder,
            n_proc: outcome.n_proc,
            max_step: report.max_step,
            status: "pass",
            category: "pass",
            reason_code: "verified",
            reference_version: report.reference_version.as_deref(),
            compared_elements: report.compared_elements,
            failing_elements: 0,
            duration_ms,
            detail: None,
        },
        Err(failure) => VerificationLogEntry {
            ts_unix_ms: now_unix_ms(),
            suite,
            case: &outcome.case,
            base_folder: &outcome.base_folder,
            n_proc: outcome.n_proc,
            max_step: failure.max_step,
            status: "fail",
            category: failure.kind.category(),
            reason_code: failure.kind.reason_code(),
            reference_version: failure.reference_version.as_deref(),
            compared_elements: failure.kind.compared_elements(),
            failing_elements: failure.kind.failing_elements(),
            duration_ms,
            detail: Some(failure.kind.summary_line()),
        },
    };
    maybe_append_verification_log(&entry)
}

/// Runs every `(case, n_proc)` pair of `matrix` in parallel and returns one
/// outcome per pair, in matrix order.
pub fn verify_matrix(
    config: &HarnessConfig,
    store: &dyn ReferenceStore,
    solver: &dyn Solver,
    matrix: &VerificationMatrix,
) -> Result<Vec<RunOutcome>, String> {
    let runs = matrix.runs();
    let timed: Vec<(RunOutcome, u128)> = runs
        .par_iter()
        .map(|spec| {
            let started = Instant::now();
            let result = verify(config, store, solver, spec.case, spec.n_proc);
            let outcome = RunOutcome {
                case: spec.case.name.clone(),
                base_folder: spec.case.base_folder.clone(),
                n_proc: spec.n_proc,
                result,
            };
            (outcome, started.elapsed().as_millis())
        })
        .collect();

    let mut outcomes = Vec::with_capacity(timed.len());
    for (outcome, duration_ms) in timed {
        log_outcome(&matrix.suite, &outcome, duration_ms)?;
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

/// Loads the configured matrix and verifies it against the configured solver.
pub fn run_regression_suite(
    config: &HarnessConfig,
    solver: &dyn Solver,
    case_filter: Option<&str>,
    n_proc_filter: Option<usize>,
) -> Result<(SuiteReport, Vec<RunOutcome>), String> {
    let matrix = VerificationMatrix::load(&config.matrix_path)?.filtered(case_filter, n_proc_filter);
    if matrix.cases.is_empty() {
        return Err(format!(
            "no cases selected from {} (case={case_filter:?} n_proc={n_proc_filter:?})",
            config.matrix_path.display()
        ));
    }
    let store = config.reference_store();
    let outcomes = verify_matrix(config, &store, solver, &matrix)?;
    Ok((SuiteReport::from_outcomes(&matrix.suite, &outcomes), outcomes))
}

#[must_use]
pub fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}
