#![forbid(unsafe_code)]

//! Entity correspondence between a fresh run and its reference.
//!
//! Runs decomposed over different process counts may renumber mesh entities
//! and may emit interface entities once per partition. Identity is taken from
//! persistent global ids when both sides carry them, otherwise from reference
//! coordinates matched on a spatial hash grid.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use svr_artifact::EntityTopology;

pub const DEFAULT_POSITION_TOL: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStrategy {
    #[default]
    Auto,
    GlobalId,
    Geometric,
}

impl ReconcileStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::GlobalId => "global_id",
            Self::Geometric => "geometric",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReconcilePolicy {
    #[serde(default)]
    pub strategy: ReconcileStrategy,
    #[serde(default = "default_position_tol")]
    pub position_tol: f64,
    /// Upper bound on fresh entities that duplicate an already matched
    /// reference entity. `None` allows any number.
    #[serde(default)]
    pub max_duplicate_entities: Option<usize>,
}

fn default_position_tol() -> f64 {
    DEFAULT_POSITION_TOL
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            strategy: ReconcileStrategy::Auto,
            position_tol: DEFAULT_POSITION_TOL,
            max_duplicate_entities: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TopologyError {
    NoIdentity(String),
    InvalidPolicy(String),
    AmbiguousReference {
        first: usize,
        second: usize,
    },
    Mismatch {
        strategy: ReconcileStrategy,
        fresh_entities: usize,
        reference_entities: usize,
        missing: Vec<usize>,
        extra: Vec<usize>,
    },
    TooManyDuplicates {
        duplicates: usize,
        allowed: usize,
    },
    AlignmentLength {
        expected: usize,
        actual: usize,
    },
}

impl TopologyError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::NoIdentity(_) => "topology_identity_unavailable",
            Self::InvalidPolicy(_) => "topology_policy_invalid",
            Self::AmbiguousReference { .. } => "topology_reference_ambiguous",
            Self::Mismatch { .. } => "topology_mismatch",
            Self::TooManyDuplicates { .. } => "topology_duplicates_exceeded",
            Self::AlignmentLength { .. } => "topology_alignment_length",
        }
    }
}

const MAX_LISTED_INDICES: usize = 16;

fn preview(indices: &[usize]) -> String {
    let shown: Vec<String> = indices
        .iter()
        .take(MAX_LISTED_INDICES)
        .map(ToString::to_string)
        .collect();
    if indices.len() > MAX_LISTED_INDICES {
        format!("[{}, ...]", shown.join(", "))
    } else {
        format!("[{}]", shown.join(", "))
    }
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoIdentity(msg) | Self::InvalidPolicy(msg) => write!(f, "{msg}"),
            Self::AmbiguousReference { first, second } => write!(
                f,
                "reference entities {first} and {second} are closer than the position tolerance"
            ),
            Self::Mismatch {
                strategy,
                fresh_entities,
                reference_entities,
                missing,
                extra,
            } => write!(
                f,
                "{} reconciliation failed: fresh={fresh_entities} reference={reference_entities} missing_reference={} {} extra_fresh={} {}",
                strategy.as_str(),
                missing.len(),
                preview(missing),
                extra.len(),
                preview(extra)
            ),
            Self::TooManyDuplicates {
                duplicates,
                allowed,
            } => write!(
                f,
                "{duplicates} duplicate boundary entities exceed the allowance of {allowed}"
            ),
            Self::AlignmentLength { expected, actual } => {
                write!(f, "cannot align {actual} values, expected {expected}")
            }
        }
    }
}

impl std::error::Error for TopologyError {}

/// Fresh-local → reference-canonical entity mapping.
///
/// Every reference entity has exactly one primary fresh entity. Additional
/// fresh entities that resolve to the same reference entity are kept as
/// duplicates so their values can be checked too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityCorrespondence {
    strategy: ReconcileStrategy,
    fresh_for_reference: Vec<usize>,
    reference_for_fresh: Vec<usize>,
    duplicates: Vec<(usize, usize)>,
}

impl EntityCorrespondence {
    #[must_use]
    pub fn identity(entities: usize) -> Self {
        Self {
            strategy: ReconcileStrategy::GlobalId,
            fresh_for_reference: (0..entities).collect(),
            reference_for_fresh: (0..entities).collect(),
            duplicates: Vec::new(),
        }
    }

    #[must_use]
    pub fn strategy(&self) -> ReconcileStrategy {
        self.strategy
    }

    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.duplicates.is_empty()
            && self
                .fresh_for_reference
                .iter()
                .enumerate()
                .all(|(reference, &fresh)| reference == fresh)
    }

    #[must_use]
    pub fn reference_entities(&self) -> usize {
        self.fresh_for_reference.len()
    }

    #[must_use]
    pub fn fresh_entities(&self) -> usize {
        self.reference_for_fresh.len()
    }

    #[must_use]
    pub fn fresh_index(&self, reference: usize) -> Option<usize> {
        self.fresh_for_reference.get(reference).copied()
    }

    #[must_use]
    pub fn reference_index(&self, fresh: usize) -> Option<usize> {
        self.reference_for_fresh.get(fresh).copied()
    }

    /// `(fresh index, reference index)` pairs beyond the primary match.
    #[must_use]
    pub fn duplicates(&self) -> &[(usize, usize)] {
        &self.duplicates
    }

    /// Reorders fresh `width`-tuples into reference order.
    pub fn align(&self, fresh_values: &[f64], width: usize) -> Result<Vec<f64>, TopologyError> {
        let expected = self.fresh_entities() * width;
        if fresh_values.len() != expected {
            return Err(TopologyError::AlignmentLength {
                expected,
                actual: fresh_values.len(),
            });
        }
        if self.is_identity() {
            return Ok(fresh_values.to_vec());
        }
        let mut out = Vec::with_capacity(self.reference_entities() * width);
        for &fresh in &self.fresh_for_reference {
            out.extend_from_slice(&fresh_values[fresh * width..(fresh + 1) * width]);
        }
        Ok(out)
    }
}

pub fn reconcile(
    fresh: &EntityTopology,
    reference: &EntityTopology,
    policy: &ReconcilePolicy,
) -> Result<EntityCorrespondence, TopologyError> {
    let strategy = match policy.strategy {
        ReconcileStrategy::Auto => {
            if fresh.global_ids.is_some() && reference.global_ids.is_some() {
                ReconcileStrategy::GlobalId
            } else {
                ReconcileStrategy::Geometric
            }
        }
        explicit => explicit,
    };

    let matches = match strategy {
        ReconcileStrategy::GlobalId => match_by_global_id(fresh, reference)?,
        _ => match_by_position(fresh, reference, policy.position_tol)?,
    };

    build_correspondence(strategy, matches, reference.entity_count(), policy)
}

fn match_by_global_id(
    fresh: &EntityTopology,
    reference: &EntityTopology,
) -> Result<Vec<Option<usize>>, TopologyError> {
    let (Some(fresh_ids), Some(reference_ids)) = (&fresh.global_ids, &reference.global_ids)
    else {
        return Err(TopologyError::NoIdentity(
            "global id reconciliation requires global_ids on both artifacts".to_string(),
        ));
    };

    let mut by_id: HashMap<u64, usize> = HashMap::with_capacity(reference_ids.len());
    for (index, &id) in reference_ids.iter().enumerate() {
        if let Some(first) = by_id.insert(id, index) {
            return Err(TopologyError::AmbiguousReference {
                first,
                second: index,
            });
        }
    }

    Ok(fresh_ids.iter().map(|id| by_id.get(id).copied()).collect())
}

type Cell = [i64; 3];

/// Cell indices saturate at the `i64` range for coordinates far beyond `tol`.
fn cell_of(point: &[f64; 3], tol: f64) -> Cell {
    [
        (point[0] / tol).floor() as i64,
        (point[1] / tol).floor() as i64,
        (point[2] / tol).floor() as i64,
    ]
}

fn distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

struct PointGrid<'a> {
    points: &'a [[f64; 3]],
    tol: f64,
    cells: HashMap<Cell, Vec<usize>>,
}

impl<'a> PointGrid<'a> {
    fn new(points: &'a [[f64; 3]], tol: f64) -> Self {
        Self {
            points,
            tol,
            cells: HashMap::with_capacity(points.len()),
        }
    }

    fn nearest(&self, point: &[f64; 3]) -> Option<usize> {
        let center = cell_of(point, self.tol);
        let mut best: Option<(usize, f64)> = None;
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    let cell = [
                        center[0].saturating_add(dx),
                        center[1].saturating_add(dy),
                        center[2].saturating_add(dz),
                    ];
                    let Some(candidates) = self.cells.get(&cell) else {
                        continue;
                    };
                    for &index in candidates {
                        let d = distance(point, &self.points[index]);
                        if d <= self.tol && best.is_none_or(|(_, best_d)| d < best_d) {
                            best = Some((index, d));
                        }
                    }
                }
            }
        }
        best.map(|(index, _)| index)
    }

    fn insert(&mut self, index: usize) {
        let cell = cell_of(&self.points[index], self.tol);
        self.cells.entry(cell).or_default().push(index);
    }
}

fn match_by_position(
    fresh: &EntityTopology,
    reference: &EntityTopology,
    tol: f64,
) -> Result<Vec<Option<usize>>, TopologyError> {
    if !tol.is_finite() || tol <= 0.0 {
        return Err(TopologyError::InvalidPolicy(format!(
            "position_tol must be finite and positive, got {tol}"
        )));
    }
    if !fresh.has_points() || !reference.has_points() {
        return Err(TopologyError::NoIdentity(
            "geometric reconciliation requires point coordinates on both artifacts".to_string(),
        ));
    }
    let non_finite = |points: &[[f64; 3]]| points.iter().flatten().any(|c| !c.is_finite());
    if non_finite(&fresh.points) || non_finite(&reference.points) {
        return Err(TopologyError::NoIdentity(
            "point coordinates must be finite".to_string(),
        ));
    }

    let mut grid = PointGrid::new(&reference.points, tol);
    for index in 0..reference.points.len() {
        if let Some(first) = grid.nearest(&reference.points[index]) {
            return Err(TopologyError::AmbiguousReference {
                first,
                second: index,
            });
        }
        grid.insert(index);
    }

    Ok(fresh.points.iter().map(|point| grid.nearest(point)).collect())
}

fn build_correspondence(
    strategy: ReconcileStrategy,
    matches: Vec<Option<usize>>,
    reference_entities: usize,
    policy: &ReconcilePolicy,
) -> Result<EntityCorrespondence, TopologyError> {
    let fresh_entities = matches.len();
    let mut primary: Vec<Option<usize>> = vec![None; reference_entities];
    let mut reference_for_fresh = Vec::with_capacity(fresh_entities);
    let mut duplicates = Vec::new();
    let mut extra = Vec::new();

    for (fresh, matched) in matches.into_iter().enumerate() {
        match matched {
            Some(reference) => {
                reference_for_fresh.push(reference);
                if primary[reference].is_none() {
                    primary[reference] = Some(fresh);
                } else {
                    duplicates.push((fresh, reference));
                }
            }
            None => {
                reference_for_fresh.push(usize::MAX);
                extra.push(fresh);
            }
        }
    }

    let missing: Vec<usize> = primary
        .iter()
        .enumerate()
        .filter_map(|(reference, fresh)| fresh.is_none().then_some(reference))
        .collect();

    if !missing.is_empty() || !extra.is_empty() {
        return Err(TopologyError::Mismatch {
            strategy,
            fresh_entities,
            reference_entities,
            missing,
            extra,
        });
    }
    if let Some(allowed) = policy.max_duplicate_entities
        && duplicates.len() > allowed
    {
        return Err(TopologyError::TooManyDuplicates {
            duplicates: duplicates.len(),
            allowed,
        });
    }

    Ok(EntityCorrespondence {
        strategy,
        fresh_for_reference: primary.into_iter().flatten().collect(),
        reference_for_fresh,
        duplicates,
    })
}
