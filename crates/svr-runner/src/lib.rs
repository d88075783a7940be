#![forbid(unsafe_code)]

//! Solver execution for one `(case, n_proc)` run.
//!
//! Each run gets its own scratch copy of the case folder. The solver writes its
//! output under that copy and the returned [`FreshRun`] owns the directory, so
//! it is removed when the run is dropped, whatever the outcome of verification.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use svr_artifact::{ArtifactError, list_steps};
use tempfile::TempDir;

pub const STDOUT_LOG_NAME: &str = "solver.stdout.log";
pub const STDERR_LOG_NAME: &str = "solver.stderr.log";
const LOG_TAIL_BYTES: u64 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    InvalidRequest(String),
    MissingInput {
        path: PathBuf,
    },
    Workspace {
        path: PathBuf,
        detail: String,
    },
    SpawnFailed {
        program: String,
        detail: String,
    },
    NonZeroExit {
        status: String,
        stdout_tail: String,
        stderr_tail: String,
    },
    Timeout {
        timeout_ms: u64,
        stderr_tail: String,
    },
    MissingOutput {
        path: PathBuf,
        detail: String,
    },
    CorruptOutput {
        path: PathBuf,
        detail: String,
    },
}

impl ExecutionError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "execution_request_invalid",
            Self::MissingInput { .. } => "execution_input_missing",
            Self::Workspace { .. } => "execution_workspace_failed",
            Self::SpawnFailed { .. } => "execution_spawn_failed",
            Self::NonZeroExit { .. } => "execution_nonzero_exit",
            Self::Timeout { .. } => "execution_timeout",
            Self::MissingOutput { .. } => "execution_output_missing",
            Self::CorruptOutput { .. } => "execution_output_corrupt",
        }
    }

    fn workspace(path: &Path, err: impl fmt::Display) -> Self {
        Self::Workspace {
            path: path.to_path_buf(),
            detail: err.to_string(),
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest(msg) => write!(f, "{msg}"),
            Self::MissingInput { path } => {
                write!(f, "case input folder {} does not exist", path.display())
            }
            Self::Workspace { path, detail } => {
                write!(f, "working directory {} failed: {detail}", path.display())
            }
            Self::SpawnFailed { program, detail } => {
                write!(f, "failed to launch solver '{program}': {detail}")
            }
            Self::NonZeroExit {
                status,
                stdout_tail,
                stderr_tail,
            } => write!(
                f,
                "solver exited with {status} stdout={} stderr={}",
                stdout_tail.trim(),
                stderr_tail.trim()
            ),
            Self::Timeout {
                timeout_ms,
                stderr_tail,
            } => write!(
                f,
                "solver killed after exceeding {timeout_ms} ms stderr={}",
                stderr_tail.trim()
            ),
            Self::MissingOutput { path, detail } => {
                write!(f, "solver output missing at {}: {detail}", path.display())
            }
            Self::CorruptOutput { path, detail } => {
                write!(f, "solver output corrupt at {}: {detail}", path.display())
            }
        }
    }
}

impl std::error::Error for ExecutionError {}

/// Everything a [`Solver`] needs to produce output for one run.
#[derive(Debug, Clone)]
pub struct RunRequest<'a> {
    pub case_name: &'a str,
    pub workdir: &'a Path,
    pub output_dir: &'a Path,
    pub n_proc: usize,
    pub max_step: Option<u32>,
}

/// Launch seam between orchestration and the actual solver process.
pub trait Solver: Send + Sync {
    fn run(&self, request: &RunRequest<'_>) -> Result<(), ExecutionError>;
}

impl<F> Solver for F
where
    F: Fn(&RunRequest<'_>) -> Result<(), ExecutionError> + Send + Sync,
{
    fn run(&self, request: &RunRequest<'_>) -> Result<(), ExecutionError> {
        self(request)
    }
}

/// Command line of the external solver. Arguments may use the placeholders
/// `{input}`, `{n_proc}`, `{max_step}`, `{workdir}` and `{output_dir}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverInvocation {
    pub program: String,
    #[serde(default = "default_input_file")]
    pub input_file: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default = "default_launcher")]
    pub launcher: Vec<String>,
    #[serde(default)]
    pub always_launch: bool,
    #[serde(default = "default_max_step_args")]
    pub max_step_args: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_input_file() -> String {
    "solver.xml".to_string()
}

fn default_args() -> Vec<String> {
    vec!["{input}".to_string()]
}

fn default_launcher() -> Vec<String> {
    ["mpiexec", "-n", "{n_proc}"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn default_max_step_args() -> Vec<String> {
    vec!["--max-steps".to_string(), "{max_step}".to_string()]
}

fn default_timeout_ms() -> u64 {
    600_000
}

fn default_poll_interval_ms() -> u64 {
    50
}

impl Default for SolverInvocation {
    fn default() -> Self {
        Self {
            program: "svFSIplus".to_string(),
            input_file: default_input_file(),
            args: default_args(),
            launcher: default_launcher(),
            always_launch: false,
            max_step_args: default_max_step_args(),
            timeout_ms: default_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            env: BTreeMap::new(),
        }
    }
}

impl SolverInvocation {
    /// Full argv for `request`, launcher first when one applies.
    #[must_use]
    pub fn command_line(&self, request: &RunRequest<'_>) -> Vec<String> {
        let render = |template: &str| -> String {
            let mut out = template
                .replace("{input}", &self.input_file)
                .replace("{n_proc}", &request.n_proc.to_string())
                .replace("{workdir}", &request.workdir.display().to_string())
                .replace("{output_dir}", &request.output_dir.display().to_string());
            if let Some(step) = request.max_step {
                out = out.replace("{max_step}", &step.to_string());
            }
            out
        };

        let mut argv = Vec::new();
        if !self.launcher.is_empty() && (request.n_proc > 1 || self.always_launch) {
            argv.extend(self.launcher.iter().map(|arg| render(arg.as_str())));
        }
        argv.push(render(self.program.as_str()));
        argv.extend(self.args.iter().map(|arg| render(arg.as_str())));
        if request.max_step.is_some() {
            argv.extend(self.max_step_args.iter().map(|arg| render(arg.as_str())));
        }
        argv
    }
}

/// Runs the solver as a child process, polling it against the wall-clock budget.
#[derive(Debug, Clone, Default)]
pub struct ProcessSolver {
    invocation: SolverInvocation,
}

impl ProcessSolver {
    #[must_use]
    pub fn new(invocation: SolverInvocation) -> Self {
        Self { invocation }
    }
}

impl Solver for ProcessSolver {
    fn run(&self, request: &RunRequest<'_>) -> Result<(), ExecutionError> {
        let argv = self.invocation.command_line(request);
        let Some((program, args)) = argv.split_first() else {
            return Err(ExecutionError::InvalidRequest(
                "solver command line is empty".to_string(),
            ));
        };

        let stdout_path = request.workdir.join(STDOUT_LOG_NAME);
        let stderr_path = request.workdir.join(STDERR_LOG_NAME);
        let stdout =
            File::create(&stdout_path).map_err(|err| ExecutionError::workspace(&stdout_path, err))?;
        let stderr =
            File::create(&stderr_path).map_err(|err| ExecutionError::workspace(&stderr_path, err))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(request.workdir)
            .envs(&self.invocation.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        let mut child = ChildGuard::spawn(&mut command).map_err(|err| {
            ExecutionError::SpawnFailed {
                program: program.clone(),
                detail: err.to_string(),
            }
        })?;

        let timeout = Duration::from_millis(self.invocation.timeout_ms);
        let poll = Duration::from_millis(self.invocation.poll_interval_ms.max(1));
        let started = Instant::now();
        loop {
            let polled = child
                .try_wait()
                .map_err(|err| ExecutionError::workspace(request.workdir, err))?;
            if let Some(status) = polled {
                if status.success() {
                    return Ok(());
                }
                return Err(ExecutionError::NonZeroExit {
                    status: status.to_string(),
                    stdout_tail: read_tail(&stdout_path),
                    stderr_tail: read_tail(&stderr_path),
                });
            }
            if started.elapsed() >= timeout {
                child.terminate();
                return Err(ExecutionError::Timeout {
                    timeout_ms: self.invocation.timeout_ms,
                    stderr_tail: read_tail(&stderr_path),
                });
            }
            std::thread::sleep(poll);
        }
    }
}

/// Solver child placed in its own process group. Until the child has been
/// reaped, dropping the guard kills the whole group, so launcher ranks and
/// other descendants go down with it on every early return.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    fn spawn(command: &mut Command) -> io::Result<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        Ok(Self {
            child: command.spawn()?,
            reaped: false,
        })
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        self.reaped = status.is_some();
        Ok(status)
    }

    fn terminate(&mut self) {
        if self.reaped {
            return;
        }
        // The leader is still unreaped here, so the group id cannot have been reused.
        kill_process_group(self.child.id());
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.reaped = true;
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let _ = Command::new("kill")
        .args(["-KILL", "--", &format!("-{pgid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

fn read_tail(path: &Path) -> String {
    let Ok(mut file) = File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map_or(0, |meta| meta.len());
    if len > LOG_TAIL_BYTES && file.seek(SeekFrom::Start(len - LOG_TAIL_BYTES)).is_err() {
        return String::new();
    }
    let mut bytes = Vec::new();
    if file.read_to_end(&mut bytes).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Where the run happens and where its output is expected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Output directory relative to the working directory; `{n_proc}` is expanded.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    /// Parent for scratch directories; the system temp dir when unset.
    #[serde(default)]
    pub workdir_root: Option<PathBuf>,
    /// Top-level entries of the case folder that are not copied.
    #[serde(default = "default_excluded_entries")]
    pub excluded_entries: Vec<String>,
}

fn default_output_dir() -> String {
    "{n_proc}-procs".to_string()
}

fn default_excluded_entries() -> Vec<String> {
    vec!["reference".to_string()]
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            workdir_root: None,
            excluded_entries: default_excluded_entries(),
        }
    }
}

/// Output of one completed solver run. Owns the scratch directory.
#[derive(Debug)]
pub struct FreshRun {
    workdir: TempDir,
    output_dir: PathBuf,
    steps: Vec<u32>,
    duration: Duration,
}

impl FreshRun {
    #[must_use]
    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    #[must_use]
    pub fn artifact_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Step indices found in the output directory, ascending.
    #[must_use]
    pub fn steps(&self) -> &[u32] {
        &self.steps
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Removes the working directory now instead of on drop.
    pub fn close(self) -> Result<(), ExecutionError> {
        let path = self.workdir.path().to_path_buf();
        self.workdir
            .close()
            .map_err(|err| ExecutionError::workspace(&path, err))
    }
}

/// Copies `input_dir` into a fresh scratch directory, runs `solver` there and
/// locates its step files.
pub fn execute(
    solver: &dyn Solver,
    case_name: &str,
    input_dir: &Path,
    n_proc: usize,
    max_step: Option<u32>,
    options: &RunOptions,
) -> Result<FreshRun, ExecutionError> {
    if n_proc == 0 {
        return Err(ExecutionError::InvalidRequest(
            "process count must be at least 1".to_string(),
        ));
    }
    if !input_dir.is_dir() {
        return Err(ExecutionError::MissingInput {
            path: input_dir.to_path_buf(),
        });
    }

    let prefix = format!("svr-{}-np{n_proc}-", sanitize(case_name));
    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix);
    let workdir = match &options.workdir_root {
        Some(root) => {
            fs::create_dir_all(root).map_err(|err| ExecutionError::workspace(root, err))?;
            builder.tempdir_in(root)
        }
        None => builder.tempdir(),
    }
    .map_err(|err| ExecutionError::workspace(Path::new(&prefix), err))?;

    copy_case_folder(input_dir, workdir.path(), &options.excluded_entries)?;

    let output_dir = workdir
        .path()
        .join(options.output_dir.replace("{n_proc}", &n_proc.to_string()));
    let request = RunRequest {
        case_name,
        workdir: workdir.path(),
        output_dir: &output_dir,
        n_proc,
        max_step,
    };

    let started = Instant::now();
    solver.run(&request)?;
    let duration = started.elapsed();

    let steps = locate_output(&output_dir)?;
    Ok(FreshRun {
        workdir,
        output_dir,
        steps,
        duration,
    })
}

fn locate_output(output_dir: &Path) -> Result<Vec<u32>, ExecutionError> {
    let steps = list_steps(output_dir).map_err(|err| match err {
        ArtifactError::Missing { path } => ExecutionError::MissingOutput {
            path,
            detail: "output directory was not created".to_string(),
        },
        other => ExecutionError::CorruptOutput {
            path: output_dir.to_path_buf(),
            detail: other.to_string(),
        },
    })?;
    if steps.is_empty() {
        return Err(ExecutionError::MissingOutput {
            path: output_dir.to_path_buf(),
            detail: "no result step files written".to_string(),
        });
    }
    Ok(steps.into_keys().collect())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn copy_case_folder(src: &Path, dst: &Path, excluded: &[String]) -> Result<(), ExecutionError> {
    let entries = fs::read_dir(src).map_err(|err| ExecutionError::workspace(src, err))?;
    for entry in entries {
        let entry = entry.map_err(|err| ExecutionError::workspace(src, err))?;
        let name = entry.file_name();
        if excluded.iter().any(|skip| name.to_str() == Some(skip.as_str())) {
            continue;
        }
        copy_entry(&entry.path(), &dst.join(&name))?;
    }
    Ok(())
}

fn copy_entry(src: &Path, dst: &Path) -> Result<(), ExecutionError> {
    let meta = fs::metadata(src).map_err(|err| ExecutionError::workspace(src, err))?;
    if meta.is_dir() {
        fs::create_dir_all(dst).map_err(|err| ExecutionError::workspace(dst, err))?;
        let entries = fs::read_dir(src).map_err(|err| ExecutionError::workspace(src, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| ExecutionError::workspace(src, err))?;
            copy_entry(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        fs::copy(src, dst).map_err(|err| ExecutionError::workspace(src, err))?;
    }
    Ok(())
}
