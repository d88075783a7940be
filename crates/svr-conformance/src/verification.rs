#![forbid(unsafe_code)]

use crate::HarnessConfig;
use crate::cases::TestCase;
use crate::reference_store::ReferenceStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use svr_artifact::{ArtifactError, ResultArtifact, load_artifact};
use svr_compare::{ComparisonResult, FieldStepComparison, compare, compare_element};
use svr_reconcile::{EntityCorrespondence, TopologyError, reconcile};
use svr_runner::{ExecutionError, Solver, execute};

/// Per field and step totals of a verification run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldStepSummary {
    pub field: String,
    pub step: u32,
    pub width: usize,
    pub compared_elements: usize,
    pub failing_elements: usize,
    pub failing_entities: Vec<usize>,
    pub max_abs_deviation: f64,
    pub max_rel_deviation: f64,
}

impl FieldStepSummary {
    fn from_comparison(cmp: &FieldStepComparison) -> Self {
        Self {
            field: cmp.field.clone(),
            step: cmp.step,
            width: cmp.width,
            compared_elements: cmp.compared_elements,
            failing_elements: cmp.failures.len(),
            failing_entities: cmp.failing_entities(),
            max_abs_deviation: cmp.max_abs_deviation,
            max_rel_deviation: cmp.max_rel_deviation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationReport {
    pub case: String,
    pub n_proc: usize,
    pub max_step: Option<u32>,
    pub steps: Vec<u32>,
    /// Simulation time of each in-scope step, where the reference records one.
    pub step_times: BTreeMap<u32, f64>,
    pub fields: Vec<String>,
    pub reference_version: Option<String>,
    pub reconcile_strategy: &'static str,
    pub duplicate_entities: usize,
    pub compared_elements: usize,
    pub field_steps: Vec<FieldStepSummary>,
    pub solver_duration_ms: u128,
}

/// Every element that fell outside tolerance, across all fields and steps.
#[derive(Debug, Clone, PartialEq)]
pub struct ToleranceFailure {
    pub compared_elements: usize,
    pub field_steps: Vec<FieldStepSummary>,
    pub mismatches: Vec<ComparisonResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    InvalidCase(String),
    Execution(ExecutionError),
    Reference(ArtifactError),
    Fresh(ArtifactError),
    Shape {
        field: String,
        step: u32,
        detail: String,
    },
    Topology(TopologyError),
    Tolerance(ToleranceFailure),
}

impl FailureKind {
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidCase(_) => "invalid_case",
            Self::Execution(_) => "execution",
            Self::Reference(_) => "reference",
            Self::Fresh(_) => "fresh_output",
            Self::Shape { .. } => "shape",
            Self::Topology(_) => "topology",
            Self::Tolerance(_) => "tolerance",
        }
    }

    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidCase(_) => "case_invalid",
            Self::Execution(err) => err.reason_code(),
            Self::Reference(err) | Self::Fresh(err) => err.reason_code(),
            Self::Shape { .. } => "field_shape_mismatch",
            Self::Topology(err) => err.reason_code(),
            Self::Tolerance(_) => "tolerance_exceeded",
        }
    }

    #[must_use]
    pub fn compared_elements(&self) -> usize {
        match self {
            Self::Tolerance(failure) => failure.compared_elements,
            _ => 0,
        }
    }

    #[must_use]
    pub fn failing_elements(&self) -> usize {
        match self {
            Self::Tolerance(failure) => failure.mismatches.len(),
            _ => 0,
        }
    }

    /// One-line description suitable for a log record.
    #[must_use]
    pub fn summary_line(&self) -> String {
        match self {
            Self::InvalidCase(msg) => msg.clone(),
            Self::Execution(err) => err.to_string(),
            Self::Reference(err) => format!("reference: {err}"),
            Self::Fresh(err) => format!("fresh output: {err}"),
            Self::Shape {
                field,
                step,
                detail,
            } => format!("{field} step {step}: {detail}"),
            Self::Topology(err) => err.to_string(),
            Self::Tolerance(failure) => {
                let first = failure.mismatches.first().map_or(String::new(), |m| {
                    format!(
                        "; first ({}, step={}, entity={}, component={})",
                        m.field, m.step, m.entity, m.component
                    )
                });
                let failing_pairs = failure
                    .field_steps
                    .iter()
                    .filter(|s| s.failing_elements > 0)
                    .count();
                format!(
                    "{} of {} elements outside tolerance in {failing_pairs} field/step pairs{first}",
                    failure.mismatches.len(),
                    failure.compared_elements
                )
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationFailure {
    pub case: String,
    pub n_proc: usize,
    pub max_step: Option<u32>,
    pub reference_version: Option<String>,
    pub kind: FailureKind,
}

impl fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} n_proc={}", self.case, self.n_proc)?;
        if let Some(bound) = self.max_step {
            write!(f, " max_step={bound}")?;
        }
        write!(
            f,
            " reference={} failed [{}]",
            self.reference_version.as_deref().unwrap_or("unversioned"),
            self.kind.reason_code()
        )?;

        let FailureKind::Tolerance(failure) = &self.kind else {
            return write!(f, ": {}", self.kind.summary_line());
        };

        writeln!(
            f,
            ": {} of {} elements outside tolerance",
            failure.mismatches.len(),
            failure.compared_elements
        )?;
        for summary in failure.field_steps.iter().filter(|s| s.failing_elements > 0) {
            writeln!(
                f,
                "  {} step {}: {}/{} elements on {} entities, max |dev| {:.6e}, max rel {:.6e}",
                summary.field,
                summary.step,
                summary.failing_elements,
                summary.compared_elements,
                summary.failing_entities.len(),
                summary.max_abs_deviation,
                summary.max_rel_deviation
            )?;
            for m in failure
                .mismatches
                .iter()
                .filter(|m| m.field == summary.field && m.step == summary.step)
            {
                writeln!(
                    f,
                    "    ({}, step={}, entity={}, component={}) expected={:e} actual={:e} deviation={:e} threshold={:e}",
                    m.field, m.step, m.entity, m.component, m.expected, m.actual, m.deviation, m.threshold
                )?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for VerificationFailure {}

/// Result of one `(case, n_proc)` run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub case: String,
    pub base_folder: String,
    pub n_proc: usize,
    pub result: Result<VerificationReport, VerificationFailure>,
}

impl RunOutcome {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs `case` under `n_proc` processes and checks every selected field at
/// every in-scope step against the stored reference.
///
/// In-scope steps are the reference steps up to `case.max_step`. With a bound,
/// the reference must contain the bound itself. Fresh steps outside the scope
/// are ignored; each in-scope step must be present in the fresh output.
pub fn verify(
    config: &HarnessConfig,
    store: &dyn ReferenceStore,
    solver: &dyn Solver,
    case: &TestCase,
    n_proc: usize,
) -> Result<VerificationReport, VerificationFailure> {
    let fail = |reference_version: Option<&str>, kind: FailureKind| VerificationFailure {
        case: case.name.clone(),
        n_proc,
        max_step: case.max_step,
        reference_version: reference_version.map(ToString::to_string),
        kind,
    };

    case.validate()
        .map_err(|msg| fail(None, FailureKind::InvalidCase(msg)))?;
    config
        .tolerance
        .validate()
        .map_err(|err| fail(None, FailureKind::InvalidCase(err.to_string())))?;

    let reference = store
        .load(case, case.max_step)
        .map_err(|err| fail(None, FailureKind::Reference(err)))?;
    let version = reference.version();
    if let Some(bound) = case.max_step
        && !reference.has_step(bound)
    {
        return Err(fail(
            version,
            FailureKind::Reference(ArtifactError::StepNotFound {
                step: bound,
                location: reference.location().to_path_buf(),
            }),
        ));
    }

    let run = execute(
        solver,
        &case.name,
        &case.input_dir(&config.cases_root),
        n_proc,
        case.max_step,
        &config.run_options,
    )
    .map_err(|err| fail(version, FailureKind::Execution(err)))?;

    let fresh = load_artifact(run.artifact_dir(), &case.fields, case.max_step)
        .map_err(|err| fail(version, FailureKind::Fresh(err)))?;
    for &step in reference.steps() {
        if !fresh.has_step(step) {
            return Err(fail(
                version,
                FailureKind::Fresh(ArtifactError::StepNotFound {
                    step,
                    location: fresh.location().to_path_buf(),
                }),
            ));
        }
    }

    let correspondence = reconcile(fresh.topology(), reference.topology(), &config.reconcile)
        .map_err(|err| fail(version, FailureKind::Topology(err)))?;

    let comparisons = compare_fields(config, case, &reference, &fresh, &correspondence)
        .map_err(|kind| fail(version, kind))?;

    let compared_elements = comparisons.iter().map(|c| c.compared_elements).sum();
    let field_steps: Vec<FieldStepSummary> = comparisons
        .iter()
        .map(FieldStepSummary::from_comparison)
        .collect();
    let mismatches: Vec<ComparisonResult> = comparisons
        .into_iter()
        .flat_map(|c| c.failures)
        .collect();

    if !mismatches.is_empty() {
        return Err(fail(
            version,
            FailureKind::Tolerance(ToleranceFailure {
                compared_elements,
                field_steps,
                mismatches,
            }),
        ));
    }

    Ok(VerificationReport {
        case: case.name.clone(),
        n_proc,
        max_step: case.max_step,
        steps: reference.steps().to_vec(),
        step_times: reference
            .steps()
            .iter()
            .filter_map(|&step| reference.time(step).map(|time| (step, time)))
            .collect(),
        fields: case.fields.clone(),
        reference_version: version.map(ToString::to_string),
        reconcile_strategy: correspondence.strategy().as_str(),
        duplicate_entities: correspondence.duplicates().len(),
        compared_elements,
        field_steps,
        solver_duration_ms: run.duration().as_millis(),
    })
}

/// Field-major, step-minor comparisons over the in-scope steps. Fresh entities
/// that duplicate a reference entity are checked against that entity too.
fn compare_fields(
    config: &HarnessConfig,
    case: &TestCase,
    reference: &ResultArtifact,
    fresh: &ResultArtifact,
    correspondence: &EntityCorrespondence,
) -> Result<Vec<FieldStepComparison>, FailureKind> {
    let mut out = Vec::with_capacity(case.fields.len() * reference.steps().len());

    for field in &case.fields {
        let expected_series = reference.field(field).map_err(FailureKind::Reference)?;
        let actual_series = fresh.field(field).map_err(FailureKind::Fresh)?;
        let policy = case.tolerance_for(field, &config.tolerance);
        let width = expected_series.width();

        for &step in reference.steps() {
            let shape = |detail: String| FailureKind::Shape {
                field: field.clone(),
                step,
                detail,
            };
            if !expected_series.is_compatible_with(actual_series) {
                return Err(shape(format!(
                    "reference is {} but fresh output is {}",
                    expected_series.kind(),
                    actual_series.kind()
                )));
            }
            let (Some(expected), Some(actual)) =
                (expected_series.values(step), actual_series.values(step))
            else {
                return Err(shape("values missing for step".to_string()));
            };

            let aligned = correspondence
                .align(actual, width)
                .map_err(FailureKind::Topology)?;
            let mut cmp = compare(field, step, width, expected, &aligned, &policy)
                .map_err(|err| shape(err.to_string()))?;

            for &(fresh_entity, reference_entity) in correspondence.duplicates() {
                let (Some(expected_tuple), Some(actual_tuple)) = (
                    expected_series.entity(step, reference_entity),
                    actual_series.entity(step, fresh_entity),
                ) else {
                    return Err(shape(format!(
                        "duplicate entity {fresh_entity} has no values"
                    )));
                };
                for (component, (&e, &a)) in expected_tuple.iter().zip(actual_tuple).enumerate() {
                    let result =
                        compare_element(field, step, reference_entity, component, e, a, &policy);
                    cmp.compared_elements += 1;
                    cmp.max_abs_deviation = cmp.max_abs_deviation.max(result.deviation);
                    if e != 0.0 && e.is_finite() {
                        cmp.max_rel_deviation =
                            cmp.max_rel_deviation.max(result.deviation / e.abs());
                    }
                    if !result.within_tolerance {
                        cmp.failures.push(result);
                    }
                }
            }

            out.push(cmp);
        }
    }
    Ok(out)
}
