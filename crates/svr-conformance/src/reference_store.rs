#![forbid(unsafe_code)]

use crate::HarnessConfig;
use crate::cases::TestCase;
use std::fs;
use std::path::{Path, PathBuf};
use svr_artifact::{
    ArtifactError, ArtifactManifest, ResultArtifact, list_steps, load_artifact, write_manifest,
};
use svr_runner::{Solver, execute};
use tempfile::TempDir;

pub const REFERENCE_DIR_NAME: &str = "reference";

/// Read-only source of reference artifacts, keyed by `(base_folder, folder)`.
/// Cases that share a folder share a reference.
pub trait ReferenceStore: Send + Sync {
    fn locate(&self, case: &TestCase) -> PathBuf;

    fn load(&self, case: &TestCase, max_step: Option<u32>) -> Result<ResultArtifact, ArtifactError> {
        load_artifact(&self.locate(case), &case.fields, max_step)
    }
}

/// `<root>/<base_folder>/<folder>/reference/result_NNN.json`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryReferenceStore {
    root: PathBuf,
}

impl DirectoryReferenceStore {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl ReferenceStore for DirectoryReferenceStore {
    fn locate(&self, case: &TestCase) -> PathBuf {
        case.input_dir(&self.root).join(REFERENCE_DIR_NAME)
    }
}

/// Runs `case` on one process and installs the step files up to its
/// `max_step` as the reference, replacing any previous one.
///
/// The new reference is assembled in a sibling staging directory and renamed
/// into place, so a failed capture leaves the previous reference untouched.
pub fn capture_reference(
    config: &HarnessConfig,
    solver: &dyn Solver,
    case: &TestCase,
) -> Result<ArtifactManifest, String> {
    case.validate()?;
    let target = config.reference_store().locate(case);
    let parent = target
        .parent()
        .ok_or_else(|| format!("{} has no parent directory", target.display()))?;

    let run = execute(
        solver,
        &case.name,
        &case.input_dir(&config.cases_root),
        1,
        case.max_step,
        &config.run_options,
    )
    .map_err(|err| format!("{}: {err}", case.name))?;

    fs::create_dir_all(parent)
        .map_err(|err| format!("failed creating {}: {err}", parent.display()))?;
    let staging = tempfile::Builder::new()
        .prefix(".reference-staging-")
        .tempdir_in(parent)
        .map_err(|err| format!("failed creating staging dir in {}: {err}", parent.display()))?;

    let steps = list_steps(run.artifact_dir()).map_err(|err| err.to_string())?;
    for (step, path) in steps {
        if case.max_step.is_some_and(|bound| step > bound) {
            continue;
        }
        let Some(name) = path.file_name() else {
            continue;
        };
        fs::copy(&path, staging.path().join(name))
            .map_err(|err| format!("failed copying {}: {err}", path.display()))?;
    }

    // The staged copy must itself be a loadable artifact.
    load_artifact(staging.path(), &case.fields, case.max_step)
        .map_err(|err| format!("{}: captured output rejected: {err}", case.name))?;
    let manifest = write_manifest(staging.path()).map_err(|err| err.to_string())?;

    install(staging, &target, parent)?;
    run.close().map_err(|err| err.to_string())?;
    Ok(manifest)
}

/// Renames `staging` to `target`. A previous reference is moved aside first
/// and restored if the rename fails; it is deleted once the swap succeeds.
fn install(staging: TempDir, target: &Path, parent: &Path) -> Result<(), String> {
    let previous = if target.exists() {
        let holder = tempfile::Builder::new()
            .prefix(".reference-previous-")
            .tempdir_in(parent)
            .map_err(|err| format!("failed creating backup dir in {}: {err}", parent.display()))?;
        let aside = holder.path().join(REFERENCE_DIR_NAME);
        fs::rename(target, &aside)
            .map_err(|err| format!("failed moving aside {}: {err}", target.display()))?;
        Some((holder, aside))
    } else {
        None
    };

    if let Err(err) = fs::rename(staging.path(), target) {
        if let Some((holder, aside)) = previous
            && let Err(restore) = fs::rename(&aside, target)
        {
            let _ = holder.keep();
            return Err(format!(
                "failed installing {}: {err}; previous reference left at {}: {restore}",
                target.display(),
                aside.display()
            ));
        }
        return Err(format!("failed installing {}: {err}", target.display()));
    }
    Ok(())
}
