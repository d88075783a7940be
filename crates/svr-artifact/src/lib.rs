#![forbid(unsafe_code)]

//! Result artifacts produced by the structural solver.
//!
//! An artifact is a directory of `result_NNN.json` step files. Each step file
//! carries the entity topology (global ids and/or reference coordinates) and a
//! set of named point-data fields. Fields are decoded into a uniform flat
//! representation: `entity_count * width` values per step, components of one
//! entity stored contiguously in their on-disk order.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const ARTIFACT_SCHEMA_VERSION: u8 = 1;
pub const STEP_FILE_PREFIX: &str = "result_";
pub const STEP_FILE_SUFFIX: &str = ".json";
pub const MANIFEST_FILE_NAME: &str = "MANIFEST.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    Missing {
        path: PathBuf,
    },
    Io {
        path: PathBuf,
        detail: String,
    },
    Format {
        path: PathBuf,
        detail: String,
    },
    FieldNotFound {
        field: String,
        step: u32,
        path: PathBuf,
    },
    StepNotFound {
        step: u32,
        location: PathBuf,
    },
    DigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

impl ArtifactError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Missing { .. } => "artifact_missing",
            Self::Io { .. } => "artifact_io_failed",
            Self::Format { .. } => "artifact_format_invalid",
            Self::FieldNotFound { .. } => "artifact_field_not_found",
            Self::StepNotFound { .. } => "artifact_step_not_found",
            Self::DigestMismatch { .. } => "artifact_digest_mismatch",
        }
    }

    fn format(path: &Path, detail: impl Into<String>) -> Self {
        Self::Format {
            path: path.to_path_buf(),
            detail: detail.into(),
        }
    }

    fn io(path: &Path, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            detail: err.to_string(),
        }
    }
}

impl fmt::Display for ArtifactError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { path } => write!(f, "artifact not found at {}", path.display()),
            Self::Io { path, detail } => write!(f, "failed reading {}: {detail}", path.display()),
            Self::Format { path, detail } => {
                write!(f, "malformed artifact {}: {detail}", path.display())
            }
            Self::FieldNotFound { field, step, path } => write!(
                f,
                "field '{field}' not present at step {step} in {}",
                path.display()
            ),
            Self::StepNotFound { step, location } => {
                write!(f, "step {step} not present in {}", location.display())
            }
            Self::DigestMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "digest mismatch for {} expected={expected} actual={actual}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for ArtifactError {}

/// Closed set of field shapes. Every kind flattens to `width()` values per entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Scalar,
    Vector(usize),
    Tensor(usize),
}

impl FieldKind {
    #[must_use]
    pub fn width(self) -> usize {
        match self {
            Self::Scalar => 1,
            Self::Vector(k) | Self::Tensor(k) => k,
        }
    }

    #[must_use]
    pub fn tag(self) -> FieldKindTag {
        match self {
            Self::Scalar => FieldKindTag::Scalar,
            Self::Vector(_) => FieldKindTag::Vector,
            Self::Tensor(_) => FieldKindTag::Tensor,
        }
    }

    pub fn from_parts(tag: Option<FieldKindTag>, components: usize) -> Result<Self, String> {
        if components == 0 {
            return Err("field must have at least one component".to_string());
        }
        match (tag, components) {
            (Some(FieldKindTag::Scalar), 1) | (None, 1) => Ok(Self::Scalar),
            (Some(FieldKindTag::Scalar), n) => {
                Err(format!("scalar field declares {n} components"))
            }
            (Some(FieldKindTag::Vector), n) | (None, n) => Ok(Self::Vector(n)),
            (Some(FieldKindTag::Tensor), n) => Ok(Self::Tensor(n)),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar => write!(f, "scalar"),
            Self::Vector(k) => write!(f, "vector-{k}"),
            Self::Tensor(k) => write!(f, "tensor-{k}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKindTag {
    Scalar,
    Vector,
    Tensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    Ascii,
    Base64,
}

/// On-disk form of one field at one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FieldKindTag>,
    pub components: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<PayloadEncoding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl FieldPayload {
    #[must_use]
    pub fn ascii(kind: FieldKind, values: Vec<f64>) -> Self {
        Self {
            kind: Some(kind.tag()),
            components: kind.width(),
            encoding: None,
            values: Some(values),
            data: None,
        }
    }

    /// Little-endian f64 payload, base64 encoded. Preserves non-finite values,
    /// which the ascii form cannot carry through JSON.
    #[must_use]
    pub fn base64(kind: FieldKind, values: &[f64]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 8);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Self {
            kind: Some(kind.tag()),
            components: kind.width(),
            encoding: Some(PayloadEncoding::Base64),
            values: None,
            data: Some(BASE64.encode(bytes)),
        }
    }

    pub fn decode(&self) -> Result<(FieldKind, Vec<f64>), String> {
        let kind = FieldKind::from_parts(self.kind, self.components)?;
        let values = match self.encoding.unwrap_or(PayloadEncoding::Ascii) {
            PayloadEncoding::Ascii => self
                .values
                .clone()
                .ok_or_else(|| "ascii payload requires 'values'".to_string())?,
            PayloadEncoding::Base64 => {
                let data = self
                    .data
                    .as_deref()
                    .ok_or_else(|| "base64 payload requires 'data'".to_string())?;
                let bytes = BASE64
                    .decode(data.trim())
                    .map_err(|err| format!("base64 decode failed: {err}"))?;
                if bytes.len() % 8 != 0 {
                    return Err(format!(
                        "base64 payload length {} is not a multiple of 8",
                        bytes.len()
                    ));
                }
                bytes
                    .chunks_exact(8)
                    .map(|chunk| {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(chunk);
                        f64::from_le_bytes(raw)
                    })
                    .collect()
            }
        };
        Ok((kind, values))
    }
}

/// One `result_NNN.json` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFile {
    pub schema_version: u8,
    pub step: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_ids: Option<Vec<u64>>,
    #[serde(default)]
    pub points: Vec<[f64; 3]>,
    #[serde(default)]
    pub point_data: BTreeMap<String, FieldPayload>,
}

impl StepFile {
    #[must_use]
    pub fn new(step: u32, topology: &EntityTopology) -> Self {
        Self {
            schema_version: ARTIFACT_SCHEMA_VERSION,
            step,
            time: None,
            global_ids: topology.global_ids.clone(),
            points: topology.points.clone(),
            point_data: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, payload: FieldPayload) -> Self {
        self.point_data.insert(name.into(), payload);
        self
    }

    fn topology(&self, path: &Path) -> Result<EntityTopology, ArtifactError> {
        let topology = EntityTopology {
            global_ids: self.global_ids.clone(),
            points: self.points.clone(),
        };
        if let Some(ids) = &topology.global_ids
            && !topology.points.is_empty()
            && ids.len() != topology.points.len()
        {
            return Err(ArtifactError::format(
                path,
                format!(
                    "global_ids length {} does not match points length {}",
                    ids.len(),
                    topology.points.len()
                ),
            ));
        }
        Ok(topology)
    }
}

/// Entity identity carried by an artifact.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityTopology {
    pub global_ids: Option<Vec<u64>>,
    pub points: Vec<[f64; 3]>,
}

impl EntityTopology {
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.global_ids
            .as_ref()
            .map_or(self.points.len(), Vec::len)
    }

    #[must_use]
    pub fn has_points(&self) -> bool {
        !self.points.is_empty() && self.points.len() == self.entity_count()
    }
}

fn kinds_compatible(a: (FieldKind, bool), b: (FieldKind, bool)) -> bool {
    a.0.width() == b.0.width() && (!a.1 || !b.1 || a.0 == b.0)
}

/// All steps of one field, flattened per step.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSeries {
    kind: FieldKind,
    tagged: bool,
    steps: BTreeMap<u32, Vec<f64>>,
}

impl FieldSeries {
    #[must_use]
    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Whether the kind was stated on disk rather than inferred from the width.
    #[must_use]
    pub fn is_tagged(&self) -> bool {
        self.tagged
    }

    /// Same layout, and the same kind when both sides state one.
    #[must_use]
    pub fn is_compatible_with(&self, other: &FieldSeries) -> bool {
        kinds_compatible((self.kind, self.tagged), (other.kind, other.tagged))
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.kind.width()
    }

    #[must_use]
    pub fn values(&self, step: u32) -> Option<&[f64]> {
        self.steps.get(&step).map(Vec::as_slice)
    }

    #[must_use]
    pub fn entity(&self, step: u32, entity: usize) -> Option<&[f64]> {
        let width = self.width();
        self.values(step)
            .and_then(|values| values.get(entity * width..(entity + 1) * width))
    }

    pub fn steps(&self) -> impl Iterator<Item = u32> + '_ {
        self.steps.keys().copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultArtifact {
    location: PathBuf,
    steps: Vec<u32>,
    times: BTreeMap<u32, f64>,
    topology: EntityTopology,
    fields: BTreeMap<String, FieldSeries>,
    version: Option<String>,
}

impl ResultArtifact {
    #[must_use]
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Loaded step indices, ascending.
    #[must_use]
    pub fn steps(&self) -> &[u32] {
        &self.steps
    }

    #[must_use]
    pub fn has_step(&self, step: u32) -> bool {
        self.steps.binary_search(&step).is_ok()
    }

    #[must_use]
    pub fn time(&self, step: u32) -> Option<f64> {
        self.times.get(&step).copied()
    }

    #[must_use]
    pub fn topology(&self) -> &EntityTopology {
        &self.topology
    }

    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.topology.entity_count()
    }

    pub fn field(&self, name: &str) -> Result<&FieldSeries, ArtifactError> {
        self.fields
            .get(name)
            .ok_or_else(|| ArtifactError::FieldNotFound {
                field: name.to_string(),
                step: self.steps.first().copied().unwrap_or(0),
                path: self.location.clone(),
            })
    }

    /// Combined manifest digest when the artifact ships a `MANIFEST.json`.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

#[must_use]
pub fn step_file_name(step: u32) -> String {
    format!("{STEP_FILE_PREFIX}{step:03}{STEP_FILE_SUFFIX}")
}

#[must_use]
pub fn parse_step_file_name(name: &str) -> Option<u32> {
    let digits = name
        .strip_prefix(STEP_FILE_PREFIX)?
        .strip_suffix(STEP_FILE_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Step index → step file path for every `result_NNN.json` in `dir`.
pub fn list_steps(dir: &Path) -> Result<BTreeMap<u32, PathBuf>, ArtifactError> {
    if !dir.is_dir() {
        return Err(ArtifactError::Missing {
            path: dir.to_path_buf(),
        });
    }
    let entries = fs::read_dir(dir).map_err(|err| ArtifactError::io(dir, &err))?;

    let mut steps = BTreeMap::new();
    for entry in entries {
        let entry = entry.map_err(|err| ArtifactError::io(dir, &err))?;
        let name = entry.file_name();
        let Some(step) = name.to_str().and_then(parse_step_file_name) else {
            continue;
        };
        let path = entry.path();
        if let Some(previous) = steps.insert(step, path.clone()) {
            return Err(ArtifactError::format(
                dir,
                format!(
                    "step {step} provided by both {} and {}",
                    previous.display(),
                    path.display()
                ),
            ));
        }
    }
    Ok(steps)
}

/// Loads `field_names` for every step `<= max_step` (all steps when unbounded).
/// Step files beyond the bound are never opened.
pub fn load_artifact<S: AsRef<str>>(
    dir: &Path,
    field_names: &[S],
    max_step: Option<u32>,
) -> Result<ResultArtifact, ArtifactError> {
    let mut step_paths = list_steps(dir)?;
    if let Some(bound) = max_step {
        step_paths.retain(|step, _| *step <= bound);
    }
    if step_paths.is_empty() {
        return Err(ArtifactError::format(
            dir,
            match max_step {
                Some(bound) => format!("no step files at or below step {bound}"),
                None => "no step files".to_string(),
            },
        ));
    }

    let manifest = load_manifest(dir)?;

    let mut topology: Option<EntityTopology> = None;
    let mut times = BTreeMap::new();
    let mut fields: BTreeMap<String, FieldSeries> = BTreeMap::new();

    for (&step, path) in &step_paths {
        let raw = fs::read(path).map_err(|err| ArtifactError::io(path, &err))?;
        if let Some(manifest) = &manifest {
            manifest.verify_file(path, &raw)?;
        }
        let file: StepFile = serde_json::from_slice(&raw)
            .map_err(|err| ArtifactError::format(path, format!("invalid step json: {err}")))?;
        if file.schema_version != ARTIFACT_SCHEMA_VERSION {
            return Err(ArtifactError::format(
                path,
                format!("unsupported schema_version {}", file.schema_version),
            ));
        }
        if file.step != step {
            return Err(ArtifactError::format(
                path,
                format!("file name says step {step} but content says {}", file.step),
            ));
        }

        let step_topology = file.topology(path)?;
        match &topology {
            None => {
                if step_topology.entity_count() == 0 {
                    return Err(ArtifactError::format(path, "step declares no entities"));
                }
                topology = Some(step_topology);
            }
            Some(first) => {
                if first.entity_count() != step_topology.entity_count() {
                    return Err(ArtifactError::format(
                        path,
                        format!(
                            "entity count {} differs from first step's {}",
                            step_topology.entity_count(),
                            first.entity_count()
                        ),
                    ));
                }
                if first.global_ids != step_topology.global_ids {
                    return Err(ArtifactError::format(
                        path,
                        "global_ids differ from first step",
                    ));
                }
            }
        }
        let entity_count = topology.as_ref().map_or(0, EntityTopology::entity_count);

        if let Some(time) = file.time {
            times.insert(step, time);
        }

        for name in field_names {
            let name = name.as_ref();
            let payload = file
                .point_data
                .get(name)
                .ok_or_else(|| ArtifactError::FieldNotFound {
                    field: name.to_string(),
                    step,
                    path: path.clone(),
                })?;
            let (kind, values) = payload
                .decode()
                .map_err(|detail| ArtifactError::format(path, format!("field '{name}': {detail}")))?;
            let expected_len = entity_count * kind.width();
            if values.len() != expected_len {
                return Err(ArtifactError::format(
                    path,
                    format!(
                        "field '{name}' has {} values, expected {expected_len} ({entity_count} entities x {} components)",
                        values.len(),
                        kind.width()
                    ),
                ));
            }

            let tagged = payload.kind.is_some();
            let series = fields.entry(name.to_string()).or_insert_with(|| FieldSeries {
                kind,
                tagged,
                steps: BTreeMap::new(),
            });
            if !kinds_compatible((series.kind, series.tagged), (kind, tagged)) {
                return Err(ArtifactError::format(
                    path,
                    format!(
                        "field '{name}' changes kind from {} to {kind}",
                        series.kind
                    ),
                ));
            }
            if tagged && !series.tagged {
                series.kind = kind;
                series.tagged = true;
            }
            series.steps.insert(step, values);
        }
    }

    Ok(ResultArtifact {
        location: dir.to_path_buf(),
        steps: step_paths.keys().copied().collect(),
        times,
        topology: topology.unwrap_or_default(),
        fields,
        version: manifest.as_ref().map(ArtifactManifest::version_tag),
    })
}

pub fn write_step_file(dir: &Path, file: &StepFile) -> Result<PathBuf, ArtifactError> {
    fs::create_dir_all(dir).map_err(|err| ArtifactError::io(dir, &err))?;
    let path = dir.join(step_file_name(file.step));
    let raw = serde_json::to_string_pretty(file)
        .map_err(|err| ArtifactError::format(&path, format!("failed serializing step: {err}")))?;
    fs::write(&path, raw).map_err(|err| ArtifactError::io(&path, &err))?;
    Ok(path)
}

/// Digests of every step file in a reference artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub schema_version: u8,
    pub files: BTreeMap<String, String>,
}

impl ArtifactManifest {
    #[must_use]
    pub fn version_tag(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, digest) in &self.files {
            hasher.update(name.as_bytes());
            hasher.update(b":");
            hasher.update(digest.as_bytes());
            hasher.update(b"\n");
        }
        format!("sha256:{}", hex_lower(&hasher.finalize()))
    }

    fn verify_file(&self, path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        let expected = self.files.get(name).ok_or_else(|| {
            ArtifactError::format(path, format!("{MANIFEST_FILE_NAME} has no entry for {name}"))
        })?;
        let actual = sha256_hex(bytes);
        if *expected != actual {
            return Err(ArtifactError::DigestMismatch {
                path: path.to_path_buf(),
                expected: expected.clone(),
                actual,
            });
        }
        Ok(())
    }
}

pub fn load_manifest(dir: &Path) -> Result<Option<ArtifactManifest>, ArtifactError> {
    let path = dir.join(MANIFEST_FILE_NAME);
    if !path.is_file() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path).map_err(|err| ArtifactError::io(&path, &err))?;
    let manifest = serde_json::from_str(&raw)
        .map_err(|err| ArtifactError::format(&path, format!("invalid manifest json: {err}")))?;
    Ok(Some(manifest))
}

/// Digests every step file currently in `dir` and writes `MANIFEST.json`.
pub fn write_manifest(dir: &Path) -> Result<ArtifactManifest, ArtifactError> {
    let mut files = BTreeMap::new();
    for path in list_steps(dir)?.into_values() {
        let bytes = fs::read(&path).map_err(|err| ArtifactError::io(&path, &err))?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        files.insert(name, sha256_hex(&bytes));
    }
    let manifest = ArtifactManifest {
        schema_version: ARTIFACT_SCHEMA_VERSION,
        files,
    };
    let path = dir.join(MANIFEST_FILE_NAME);
    let raw = serde_json::to_string_pretty(&manifest)
        .map_err(|err| ArtifactError::format(&path, format!("failed serializing manifest: {err}")))?;
    fs::write(&path, raw).map_err(|err| ArtifactError::io(&path, &err))?;
    Ok(manifest)
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex_lower(&Sha256::digest(bytes))
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}
