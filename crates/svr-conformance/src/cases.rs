#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use svr_compare::TolerancePolicy;

/// Fields written by the structural equation, in output order.
pub const STRUCT_FIELDS: &[&str] = &[
    "Displacement",
    "Velocity",
    "Jacobian",
    "Stress",
    "Strain",
    "Cauchy_stress",
    "Def_grad",
    "VonMises_stress",
];

pub const MATRIX_SCHEMA_VERSION: u8 = 1;

fn default_process_counts() -> Vec<usize> {
    vec![1, 3]
}

fn default_suite() -> String {
    "struct".to_string()
}

/// One scenario of the regression corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub base_folder: String,
    /// Folder under `base_folder`; the case name when unset.
    #[serde(default)]
    pub folder: Option<String>,
    pub fields: Vec<String>,
    #[serde(default)]
    pub max_step: Option<u32>,
    #[serde(default = "default_process_counts")]
    pub process_counts: Vec<usize>,
    #[serde(default)]
    pub tolerance_overrides: BTreeMap<String, TolerancePolicy>,
}

impl TestCase {
    #[must_use]
    pub fn new(name: &str, base_folder: &str, fields: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            base_folder: base_folder.to_string(),
            folder: None,
            fields: fields.iter().map(ToString::to_string).collect(),
            max_step: None,
            process_counts: default_process_counts(),
            tolerance_overrides: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn folder_name(&self) -> &str {
        self.folder.as_deref().unwrap_or(&self.name)
    }

    #[must_use]
    pub fn input_dir(&self, cases_root: &Path) -> PathBuf {
        cases_root.join(&self.base_folder).join(self.folder_name())
    }

    #[must_use]
    pub fn tolerance_for(&self, field: &str, default: &TolerancePolicy) -> TolerancePolicy {
        self.tolerance_overrides
            .get(field)
            .copied()
            .unwrap_or(*default)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("case name must not be empty".to_string());
        }
        if self.fields.is_empty() {
            return Err(format!("{}: no fields selected", self.name));
        }
        let mut seen = std::collections::BTreeSet::new();
        for field in &self.fields {
            if !seen.insert(field.as_str()) {
                return Err(format!("{}: field {field} listed twice", self.name));
            }
        }
        if self.process_counts.is_empty() || self.process_counts.contains(&0) {
            return Err(format!(
                "{}: process counts must be non-empty and positive, got {:?}",
                self.name, self.process_counts
            ));
        }
        for (field, policy) in &self.tolerance_overrides {
            policy
                .validate()
                .map_err(|err| format!("{}: tolerance for {field}: {err}", self.name))?;
        }
        Ok(())
    }
}

/// The unit of execution: one case under one process count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSpec<'a> {
    pub case: &'a TestCase,
    pub n_proc: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationMatrix {
    pub schema_version: u8,
    #[serde(default = "default_suite")]
    pub suite: String,
    pub cases: Vec<TestCase>,
}

impl VerificationMatrix {
    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = fs::read_to_string(path)
            .map_err(|err| format!("failed reading {}: {err}", path.display()))?;
        let matrix: Self = serde_json::from_str(&raw)
            .map_err(|err| format!("invalid matrix json {}: {err}", path.display()))?;
        matrix.validate()?;
        Ok(matrix)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version != MATRIX_SCHEMA_VERSION {
            return Err(format!(
                "unsupported matrix schema_version {}",
                self.schema_version
            ));
        }
        let mut names = std::collections::BTreeSet::new();
        for case in &self.cases {
            case.validate()?;
            if !names.insert(case.name.as_str()) {
                return Err(format!("case {} defined twice", case.name));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn case(&self, name: &str) -> Option<&TestCase> {
        self.cases.iter().find(|case| case.name == name)
    }

    /// Every `(case, n_proc)` pair, case order first.
    #[must_use]
    pub fn runs(&self) -> Vec<RunSpec<'_>> {
        self.cases
            .iter()
            .flat_map(|case| {
                case.process_counts
                    .iter()
                    .map(move |&n_proc| RunSpec { case, n_proc })
            })
            .collect()
    }

    /// Restricts to one case and/or one process count. A process count filter
    /// drops cases that do not run at that count.
    #[must_use]
    pub fn filtered(mut self, case: Option<&str>, n_proc: Option<usize>) -> Self {
        if let Some(name) = case {
            self.cases.retain(|c| c.name == name);
        }
        if let Some(n_proc) = n_proc {
            self.cases.retain_mut(|c| {
                c.process_counts.retain(|&n| n == n_proc);
                !c.process_counts.is_empty()
            });
        }
        self
    }
}
