#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_ABS_TOL: f64 = 1e-10;
pub const DEFAULT_REL_TOL: f64 = 1e-8;

#[derive(Debug, Clone, PartialEq)]
pub enum CompareError {
    InvalidPolicy(String),
    InvalidWidth {
        field: String,
        step: u32,
        width: usize,
        len: usize,
    },
    LengthMismatch {
        field: String,
        step: u32,
        expected: usize,
        actual: usize,
    },
}

impl CompareError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidPolicy(_) => "tolerance_policy_invalid",
            Self::InvalidWidth { .. } => "comparison_width_invalid",
            Self::LengthMismatch { .. } => "comparison_length_mismatch",
        }
    }
}

impl fmt::Display for CompareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPolicy(msg) => write!(f, "{msg}"),
            Self::InvalidWidth {
                field,
                step,
                width,
                len,
            } => write!(
                f,
                "{field} step {step}: {len} values cannot be split into tuples of width {width}"
            ),
            Self::LengthMismatch {
                field,
                step,
                expected,
                actual,
            } => write!(
                f,
                "{field} step {step}: expected {expected} values, got {actual}"
            ),
        }
    }
}

impl std::error::Error for CompareError {}

/// Combined absolute + relative tolerance:
/// `|expected - actual| <= abs_tol + rel_tol * |expected|`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TolerancePolicy {
    pub abs_tol: f64,
    pub rel_tol: f64,
    #[serde(default)]
    pub nan_equal: bool,
}

impl Default for TolerancePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ABS_TOL, DEFAULT_REL_TOL)
    }
}

impl TolerancePolicy {
    #[must_use]
    pub const fn new(abs_tol: f64, rel_tol: f64) -> Self {
        Self {
            abs_tol,
            rel_tol,
            nan_equal: false,
        }
    }

    pub fn validate(&self) -> Result<(), CompareError> {
        for (name, value) in [("abs_tol", self.abs_tol), ("rel_tol", self.rel_tol)] {
            if !value.is_finite() || value < 0.0 {
                return Err(CompareError::InvalidPolicy(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn threshold(&self, expected: f64) -> f64 {
        self.abs_tol + self.rel_tol * expected.abs()
    }

    /// Non-finite values only match themselves; NaN matches NaN when `nan_equal`.
    #[must_use]
    pub fn accepts(&self, expected: f64, actual: f64) -> bool {
        if expected == actual {
            return true;
        }
        if expected.is_nan() || actual.is_nan() {
            return self.nan_equal && expected.is_nan() && actual.is_nan();
        }
        if !expected.is_finite() || !actual.is_finite() {
            return false;
        }
        (expected - actual).abs() <= self.threshold(expected)
    }
}

/// Verdict for one component of one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonResult {
    pub field: String,
    pub step: u32,
    pub entity: usize,
    pub component: usize,
    pub expected: f64,
    pub actual: f64,
    pub deviation: f64,
    pub threshold: f64,
    pub within_tolerance: bool,
}

#[must_use]
pub fn compare_element(
    field: &str,
    step: u32,
    entity: usize,
    component: usize,
    expected: f64,
    actual: f64,
    policy: &TolerancePolicy,
) -> ComparisonResult {
    let within_tolerance = policy.accepts(expected, actual);
    let deviation = if expected == actual {
        0.0
    } else if expected.is_finite() && actual.is_finite() {
        (expected - actual).abs()
    } else if within_tolerance {
        0.0
    } else {
        f64::INFINITY
    };
    ComparisonResult {
        field: field.to_string(),
        step,
        entity,
        component,
        expected,
        actual,
        deviation,
        threshold: policy.threshold(expected),
        within_tolerance,
    }
}

/// Aggregate for one field at one step. Passes iff `failures` is empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldStepComparison {
    pub field: String,
    pub step: u32,
    pub width: usize,
    pub compared_entities: usize,
    pub compared_elements: usize,
    pub max_abs_deviation: f64,
    pub max_rel_deviation: f64,
    pub failures: Vec<ComparisonResult>,
}

impl FieldStepComparison {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    /// Distinct failing entities, ascending.
    #[must_use]
    pub fn failing_entities(&self) -> Vec<usize> {
        let mut entities: Vec<usize> = self.failures.iter().map(|f| f.entity).collect();
        entities.sort_unstable();
        entities.dedup();
        entities
    }
}

/// Compares two aligned arrays of `width`-tuples. Every failing element is
/// collected; the scan never stops early.
pub fn compare(
    field: &str,
    step: u32,
    width: usize,
    expected: &[f64],
    actual: &[f64],
    policy: &TolerancePolicy,
) -> Result<FieldStepComparison, CompareError> {
    policy.validate()?;
    if width == 0 || expected.len() % width != 0 {
        return Err(CompareError::InvalidWidth {
            field: field.to_string(),
            step,
            width,
            len: expected.len(),
        });
    }
    if expected.len() != actual.len() {
        return Err(CompareError::LengthMismatch {
            field: field.to_string(),
            step,
            expected: expected.len(),
            actual: actual.len(),
        });
    }

    let mut max_abs_deviation = 0.0_f64;
    let mut max_rel_deviation = 0.0_f64;
    let mut failures = Vec::new();

    for (idx, (&e, &a)) in expected.iter().zip(actual).enumerate() {
        let result = compare_element(field, step, idx / width, idx % width, e, a, policy);
        if result.deviation > max_abs_deviation {
            max_abs_deviation = result.deviation;
        }
        if e != 0.0 && e.is_finite() {
            let rel = result.deviation / e.abs();
            if rel > max_rel_deviation {
                max_rel_deviation = rel;
            }
        }
        if !result.within_tolerance {
            failures.push(result);
        }
    }

    Ok(FieldStepComparison {
        field: field.to_string(),
        step,
        width,
        compared_entities: expected.len() / width,
        compared_elements: expected.len(),
        max_abs_deviation,
        max_rel_deviation,
        failures,
    })
}
