#![allow(dead_code)]

use std::fs;
use std::path::Path;
use svr_artifact::{
    EntityTopology, FieldKind, FieldPayload, StepFile, step_file_name, write_step_file,
};
use svr_conformance::HarnessConfig;
use svr_conformance::cases::TestCase;
use svr_runner::{ExecutionError, RunRequest, Solver};
use tempfile::TempDir;

pub const SHAPES: &[(&str, FieldKind)] = &[
    ("Displacement", FieldKind::Vector(3)),
    ("Velocity", FieldKind::Vector(3)),
    ("Jacobian", FieldKind::Scalar),
    ("Stress", FieldKind::Tensor(6)),
    ("Strain", FieldKind::Tensor(6)),
    ("Cauchy_stress", FieldKind::Tensor(6)),
    ("Def_grad", FieldKind::Tensor(9)),
    ("VonMises_stress", FieldKind::Scalar),
];

pub fn kind_of(field: &str) -> FieldKind {
    SHAPES
        .iter()
        .find(|(name, _)| *name == field)
        .map_or(FieldKind::Scalar, |(_, kind)| *kind)
}

/// Deterministic stand-in for the structural solver.
///
/// With more than one process it writes entities in reverse order, emits
/// entity 0 a second time at the end (a partition interface copy) and adds a
/// drift far below the default tolerance.
#[derive(Debug, Clone)]
pub struct SyntheticSolver {
    pub fields: Vec<String>,
    pub entities: usize,
    pub steps: u32,
    pub global_ids: bool,
    pub drift: f64,
    /// `(field, step, entity, delta)` added to component 0.
    pub perturb: Vec<(String, u32, usize, f64)>,
    /// Steps above this index are written as unparseable files.
    pub corrupt_after: Option<u32>,
    pub omit_field: Option<String>,
    /// Writes payloads without a kind tag, as older solver builds do.
    pub untagged: bool,
    /// This step is emitted as a directory instead of a step file.
    pub directory_at: Option<u32>,
    pub fail_with: Option<ExecutionError>,
}

impl SyntheticSolver {
    pub fn new(fields: &[&str], entities: usize, steps: u32) -> Self {
        Self {
            fields: fields.iter().map(ToString::to_string).collect(),
            entities,
            steps,
            global_ids: true,
            drift: 1e-13,
            perturb: Vec::new(),
            corrupt_after: None,
            omit_field: None,
            untagged: false,
            directory_at: None,
            fail_with: None,
        }
    }

    pub fn value(field_index: usize, step: u32, entity: usize, component: usize) -> f64 {
        let t = f64::from(step) * 0.1;
        (field_index as f64 + 1.0) * (1.0 + t * (entity as f64 * 0.013).sin())
            + component as f64 * 0.25
    }

    fn point(entity: usize) -> [f64; 3] {
        [
            (entity % 5) as f64 * 0.2,
            ((entity / 5) % 5) as f64 * 0.2,
            (entity / 25) as f64 * 0.2,
        ]
    }

    /// Local write order: canonical entity index per written entity.
    pub fn layout(&self, n_proc: usize) -> Vec<usize> {
        if n_proc == 1 {
            return (0..self.entities).collect();
        }
        let mut order: Vec<usize> = (0..self.entities).rev().collect();
        order.push(0);
        order
    }

    fn write(&self, request: &RunRequest<'_>) -> Result<(), ExecutionError> {
        let layout = self.layout(request.n_proc);
        let topology = EntityTopology {
            global_ids: self
                .global_ids
                .then(|| layout.iter().map(|&e| 1000 + e as u64).collect()),
            points: layout.iter().map(|&e| Self::point(e)).collect(),
        };
        let drift = if request.n_proc > 1 { self.drift } else { 0.0 };
        let to_io = |err: svr_artifact::ArtifactError| ExecutionError::CorruptOutput {
            path: request.output_dir.to_path_buf(),
            detail: err.to_string(),
        };

        for step in 1..=self.steps {
            if self.directory_at == Some(step) {
                fs::create_dir_all(request.output_dir.join(step_file_name(step))).map_err(
                    |err| ExecutionError::CorruptOutput {
                        path: request.output_dir.to_path_buf(),
                        detail: err.to_string(),
                    },
                )?;
                continue;
            }
            if self.corrupt_after.is_some_and(|bound| step > bound) {
                fs::create_dir_all(request.output_dir).map_err(|err| {
                    ExecutionError::CorruptOutput {
                        path: request.output_dir.to_path_buf(),
                        detail: err.to_string(),
                    }
                })?;
                fs::write(request.output_dir.join(step_file_name(step)), b"{ not json")
                    .map_err(|err| ExecutionError::CorruptOutput {
                        path: request.output_dir.to_path_buf(),
                        detail: err.to_string(),
                    })?;
                continue;
            }

            let mut file = StepFile::new(step, &topology);
            file.time = Some(f64::from(step) * 0.1);
            for (field_index, field) in self.fields.iter().enumerate() {
                if self.omit_field.as_deref() == Some(field.as_str()) {
                    continue;
                }
                let kind = kind_of(field);
                let mut values = Vec::with_capacity(layout.len() * kind.width());
                for &entity in &layout {
                    for component in 0..kind.width() {
                        let mut value = Self::value(field_index, step, entity, component) + drift;
                        if component == 0 {
                            for (p_field, p_step, p_entity, delta) in &self.perturb {
                                if p_field == field && *p_step == step && *p_entity == entity {
                                    value += delta;
                                }
                            }
                        }
                        values.push(value);
                    }
                }
                let mut payload = if matches!(kind, FieldKind::Tensor(_)) {
                    FieldPayload::base64(kind, &values)
                } else {
                    FieldPayload::ascii(kind, values)
                };
                if self.untagged {
                    payload.kind = None;
                }
                file = file.with_field(field.clone(), payload);
            }
            write_step_file(request.output_dir, &file).map_err(to_io)?;
        }
        Ok(())
    }
}

impl Solver for SyntheticSolver {
    fn run(&self, request: &RunRequest<'_>) -> Result<(), ExecutionError> {
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        if let Some(bound) = request.max_step
            && self.corrupt_after.is_none()
        {
            let truncated = Self {
                steps: self.steps.min(bound),
                ..self.clone()
            };
            return truncated.write(request);
        }
        self.write(request)
    }
}

/// Scratch case tree plus a config pointing at it.
pub struct Workspace {
    pub root: TempDir,
    pub config: HarnessConfig,
}

impl Workspace {
    pub fn new(cases: &[&TestCase]) -> Self {
        let root = tempfile::tempdir().expect("workspace tempdir");
        let mut config = HarnessConfig::default_paths();
        config.cases_root = root.path().join("cases");
        config.reference_root = root.path().join("cases");
        config.run_options.workdir_root = Some(root.path().join("work"));
        for case in cases {
            let dir = case.input_dir(&config.cases_root);
            fs::create_dir_all(&dir).expect("case dir");
            fs::write(dir.join("solver.xml"), "<svFSIFile/>\n").expect("solver input");
        }
        Self { root, config }
    }

    pub fn work_root(&self) -> &Path {
        self.config
            .run_options
            .workdir_root
            .as_deref()
            .expect("workdir root set")
    }

    /// Number of leftover scratch directories.
    pub fn leftover_workdirs(&self) -> usize {
        fs::read_dir(self.work_root()).map_or(0, |entries| entries.count())
    }
}

pub fn case(name: &str, fields: &[&str]) -> TestCase {
    TestCase::new(name, "struct", fields)
}
