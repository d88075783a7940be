mod common;

use common::{SyntheticSolver, Workspace, case};
use std::fs;
use svr_artifact::{ArtifactError, step_file_name};
use svr_compare::TolerancePolicy;
use svr_conformance::cases::VerificationMatrix;
use svr_conformance::reference_store::{ReferenceStore, capture_reference};
use svr_conformance::verification::{FailureKind, verify};
use svr_conformance::{SuiteReport, set_verification_log_path, verify_matrix};
use svr_reconcile::TopologyError;
use svr_runner::ExecutionError;

const BLOCK_FIELDS: &[&str] = &["Displacement", "Stress"];

#[test]
fn captured_reference_verifies_under_every_process_count() {
    let block = case("block_compression", BLOCK_FIELDS);
    let ws = Workspace::new(&[&block]);
    let solver = SyntheticSolver::new(BLOCK_FIELDS, 100, 5);

    let manifest = capture_reference(&ws.config, &solver, &block).expect("capture");
    assert_eq!(manifest.files.len(), 5);
    let store = ws.config.reference_store();
    assert!(store.locate(&block).join("MANIFEST.json").is_file());

    let single = verify(&ws.config, &store, &solver, &block, 1).expect("n_proc=1 passes");
    assert_eq!(single.steps, vec![1, 2, 3, 4, 5]);
    assert_eq!(single.step_times.len(), 5);
    assert!((single.step_times[&3] - 0.3).abs() < 1e-12);
    assert_eq!(single.compared_elements, 5 * 100 * (3 + 6));
    assert_eq!(single.duplicate_entities, 0);
    assert_eq!(single.reference_version, Some(manifest.version_tag()));

    let parallel = verify(&ws.config, &store, &solver, &block, 3).expect("n_proc=3 passes");
    assert_eq!(parallel.reconcile_strategy, "global_id");
    assert_eq!(parallel.duplicate_entities, 1);
    assert_eq!(parallel.compared_elements, single.compared_elements + 5 * (3 + 6));
    assert!(parallel.field_steps.iter().all(|s| s.failing_elements == 0));

    assert_eq!(ws.leftover_workdirs(), 0, "scratch directories must be removed");
}

#[test]
fn geometric_matching_handles_reordered_entities_without_ids() {
    let block = case("block_compression", BLOCK_FIELDS);
    let ws = Workspace::new(&[&block]);
    let mut solver = SyntheticSolver::new(BLOCK_FIELDS, 60, 2);
    solver.global_ids = false;
    capture_reference(&ws.config, &solver, &block).expect("capture");

    let report = verify(&ws.config, &ws.config.reference_store(), &solver, &block, 3)
        .expect("geometric reconciliation passes");
    assert_eq!(report.reconcile_strategy, "geometric");
    assert_eq!(report.duplicate_entities, 1);
}

#[test]
fn verification_is_idempotent() {
    let block = case("block_compression", BLOCK_FIELDS);
    let ws = Workspace::new(&[&block]);
    let solver = SyntheticSolver::new(BLOCK_FIELDS, 20, 3);
    capture_reference(&ws.config, &solver, &block).expect("capture");
    let store = ws.config.reference_store();

    let first = verify(&ws.config, &store, &solver, &block, 3).expect("first");
    let second = verify(&ws.config, &store, &solver, &block, 3).expect("second");
    assert_eq!(first.field_steps, second.field_steps);
    assert_eq!(first.compared_elements, second.compared_elements);
    assert_eq!(first.reference_version, second.reference_version);
}

#[test]
fn stress_deviation_names_field_step_and_entity() {
    let block = case("block_compression", BLOCK_FIELDS);
    let mut ws = Workspace::new(&[&block]);
    ws.config.tolerance = TolerancePolicy::new(1e-10, 0.0);
    let clean = SyntheticSolver::new(BLOCK_FIELDS, 100, 5);
    capture_reference(&ws.config, &clean, &block).expect("capture");

    let mut drifted = clean.clone();
    drifted
        .perturb
        .push(("Stress".to_string(), 3, 42, 2.0 * ws.config.tolerance.abs_tol));

    for n_proc in [1, 3] {
        let failure = verify(&ws.config, &ws.config.reference_store(), &drifted, &block, n_proc)
            .expect_err("perturbed stress must fail");
        assert_eq!(failure.kind.reason_code(), "tolerance_exceeded");
        let FailureKind::Tolerance(tolerance) = &failure.kind else {
            panic!("expected tolerance failure, got {:?}", failure.kind);
        };
        assert_eq!(tolerance.mismatches.len(), 1, "n_proc={n_proc}");
        let mismatch = &tolerance.mismatches[0];
        assert_eq!(
            (mismatch.field.as_str(), mismatch.step, mismatch.entity, mismatch.component),
            ("Stress", 3, 42, 0)
        );
        if n_proc == 1 {
            assert_eq!(mismatch.expected, SyntheticSolver::value(1, 3, 42, 0));
            assert!((mismatch.actual - mismatch.expected - 2e-10).abs() < 1e-14);
        }

        let rendered = failure.to_string();
        assert!(rendered.contains("block_compression"), "{rendered}");
        assert!(rendered.contains(&format!("n_proc={n_proc}")), "{rendered}");
        assert!(
            rendered.contains("(Stress, step=3, entity=42, component=0)"),
            "{rendered}"
        );
    }
}

#[test]
fn every_failing_element_is_reported() {
    let block = case("block_compression", BLOCK_FIELDS);
    let mut ws = Workspace::new(&[&block]);
    ws.config.tolerance = TolerancePolicy::new(1e-9, 0.0);
    let clean = SyntheticSolver::new(BLOCK_FIELDS, 100, 5);
    capture_reference(&ws.config, &clean, &block).expect("capture");

    let mut drifted = clean.clone();
    drifted.perturb = vec![
        ("Displacement".to_string(), 2, 7, 1e-3),
        ("Stress".to_string(), 4, 0, -1e-3),
        ("Stress".to_string(), 4, 99, 5e-3),
    ];

    let failure = verify(&ws.config, &ws.config.reference_store(), &drifted, &block, 1)
        .expect_err("three perturbed elements");
    assert_eq!(failure.kind.failing_elements(), 3);
    let FailureKind::Tolerance(tolerance) = &failure.kind else {
        panic!("expected tolerance failure");
    };
    let named: Vec<(&str, u32, usize)> = tolerance
        .mismatches
        .iter()
        .map(|m| (m.field.as_str(), m.step, m.entity))
        .collect();
    assert_eq!(
        named,
        vec![("Displacement", 2, 7), ("Stress", 4, 0), ("Stress", 4, 99)]
    );
    let failing_pairs = tolerance
        .field_steps
        .iter()
        .filter(|s| s.failing_elements > 0)
        .count();
    assert_eq!(failing_pairs, 2);
    assert_eq!(tolerance.field_steps.len(), 2 * 5);
    let stress_step4 = tolerance
        .field_steps
        .iter()
        .find(|s| s.field == "Stress" && s.step == 4)
        .expect("stress step 4 summary");
    assert_eq!(stress_step4.failing_entities, vec![0, 99]);
}

#[test]
fn per_field_override_absorbs_drift_in_that_field() {
    let mut block = case("block_compression", BLOCK_FIELDS);
    let mut ws = Workspace::new(&[&block]);
    ws.config.tolerance = TolerancePolicy::new(1e-10, 0.0);
    let clean = SyntheticSolver::new(BLOCK_FIELDS, 10, 2);
    capture_reference(&ws.config, &clean, &block).expect("capture");

    let mut drifted = clean.clone();
    drifted.perturb = vec![("Stress".to_string(), 1, 3, 1e-6)];
    block
        .tolerance_overrides
        .insert("Stress".to_string(), TolerancePolicy::new(1e-5, 0.0));

    verify(&ws.config, &ws.config.reference_store(), &drifted, &block, 1)
        .expect("override absorbs the stress drift");
}

#[test]
fn bounded_case_ignores_steps_beyond_max_step() {
    let fields: Vec<&str> = common::SHAPES.iter().map(|(name, _)| *name).collect();
    let mut gr = case("gr_equilibrated", &fields);
    gr.max_step = Some(11);
    gr.process_counts = vec![1];
    let ws = Workspace::new(&[&gr]);

    let clean = SyntheticSolver::new(&fields, 12, 20);
    let manifest = capture_reference(&ws.config, &clean, &gr).expect("capture");
    assert_eq!(manifest.files.len(), 11);

    let mut overrun = clean.clone();
    overrun.corrupt_after = Some(11);
    let report = verify(&ws.config, &ws.config.reference_store(), &overrun, &gr, 1)
        .expect("corrupt steps past the bound are never read");
    assert_eq!(report.steps, (1..=11).collect::<Vec<u32>>());
    assert_eq!(report.max_step, Some(11));

    let mut beyond = gr.clone();
    beyond.max_step = Some(12);
    let failure = verify(&ws.config, &ws.config.reference_store(), &clean, &beyond, 1)
        .expect_err("bound past the last reference step");
    assert!(matches!(
        failure.kind,
        FailureKind::Reference(ArtifactError::StepNotFound { step: 12, .. })
    ));
}

#[test]
fn fresh_output_missing_an_in_scope_step_fails() {
    let block = case("block_compression", BLOCK_FIELDS);
    let ws = Workspace::new(&[&block]);
    capture_reference(&ws.config, &SyntheticSolver::new(BLOCK_FIELDS, 10, 5), &block)
        .expect("capture");

    let short = SyntheticSolver::new(BLOCK_FIELDS, 10, 3);
    let failure = verify(&ws.config, &ws.config.reference_store(), &short, &block, 1)
        .expect_err("steps 4 and 5 are missing");
    assert!(matches!(
        failure.kind,
        FailureKind::Fresh(ArtifactError::StepNotFound { step: 4, .. })
    ));
}

#[test]
fn missing_field_is_a_format_failure_not_a_tolerance_failure() {
    let block = case("block_compression", BLOCK_FIELDS);
    let ws = Workspace::new(&[&block]);
    let clean = SyntheticSolver::new(BLOCK_FIELDS, 10, 2);
    capture_reference(&ws.config, &clean, &block).expect("capture");

    let mut partial = clean.clone();
    partial.omit_field = Some("Stress".to_string());
    let failure = verify(&ws.config, &ws.config.reference_store(), &partial, &block, 1)
        .expect_err("fresh output lacks Stress");
    assert_eq!(failure.kind.reason_code(), "artifact_field_not_found");
    assert_eq!(failure.kind.category(), "fresh_output");
    match &failure.kind {
        FailureKind::Fresh(ArtifactError::FieldNotFound { field, step, .. }) => {
            assert_eq!((field.as_str(), *step), ("Stress", 1));
        }
        other => panic!("unexpected failure {other:?}"),
    }
}

#[test]
fn solver_failure_is_reported_and_cleaned_up() {
    let block = case("block_compression", BLOCK_FIELDS);
    let ws = Workspace::new(&[&block]);
    capture_reference(&ws.config, &SyntheticSolver::new(BLOCK_FIELDS, 10, 2), &block)
        .expect("capture");

    let mut broken = SyntheticSolver::new(BLOCK_FIELDS, 10, 2);
    broken.fail_with = Some(ExecutionError::NonZeroExit {
        status: "exit status: 1".to_string(),
        stdout_tail: String::new(),
        stderr_tail: "diverged".to_string(),
    });
    let failure = verify(&ws.config, &ws.config.reference_store(), &broken, &block, 3)
        .expect_err("solver failure");
    assert_eq!(failure.kind.reason_code(), "execution_nonzero_exit");
    assert!(failure.to_string().contains("diverged"));
    assert_eq!(ws.leftover_workdirs(), 0);
}

#[test]
fn missing_reference_fails_before_the_solver_runs() {
    let block = case("block_compression", BLOCK_FIELDS);
    let ws = Workspace::new(&[&block]);
    let mut broken = SyntheticSolver::new(BLOCK_FIELDS, 10, 2);
    broken.fail_with = Some(ExecutionError::InvalidRequest("must not run".to_string()));

    let failure = verify(&ws.config, &ws.config.reference_store(), &broken, &block, 1)
        .expect_err("no reference captured");
    assert_eq!(failure.kind.category(), "reference");
    assert_eq!(failure.kind.reason_code(), "artifact_missing");
}

#[test]
fn tampered_reference_is_rejected_by_digest() {
    let block = case("block_compression", BLOCK_FIELDS);
    let ws = Workspace::new(&[&block]);
    let solver = SyntheticSolver::new(BLOCK_FIELDS, 10, 2);
    capture_reference(&ws.config, &solver, &block).expect("capture");

    let step_path = ws
        .config
        .reference_store()
        .locate(&block)
        .join(step_file_name(2));
    let mut raw = fs::read_to_string(&step_path).expect("read step");
    raw.push('\n');
    fs::write(&step_path, raw).expect("tamper step");

    let failure = verify(&ws.config, &ws.config.reference_store(), &solver, &block, 1)
        .expect_err("digest drift");
    assert_eq!(failure.kind.reason_code(), "artifact_digest_mismatch");
}

#[test]
fn topology_mismatch_and_duplicate_budget() {
    let block = case("block_compression", BLOCK_FIELDS);
    let mut ws = Workspace::new(&[&block]);
    capture_reference(&ws.config, &SyntheticSolver::new(BLOCK_FIELDS, 30, 2), &block)
        .expect("capture");

    let smaller = SyntheticSolver::new(BLOCK_FIELDS, 29, 2);
    let failure = verify(&ws.config, &ws.config.reference_store(), &smaller, &block, 1)
        .expect_err("entity 29 is missing");
    match &failure.kind {
        FailureKind::Topology(TopologyError::Mismatch { missing, extra, .. }) => {
            assert_eq!(missing, &vec![29]);
            assert!(extra.is_empty());
        }
        other => panic!("unexpected failure {other:?}"),
    }

    ws.config.reconcile.max_duplicate_entities = Some(0);
    let solver = SyntheticSolver::new(BLOCK_FIELDS, 30, 2);
    let failure = verify(&ws.config, &ws.config.reference_store(), &solver, &block, 3)
        .expect_err("duplicate interface entity over budget");
    assert_eq!(failure.kind.reason_code(), "topology_duplicates_exceeded");
}

#[test]
fn matrix_runs_every_pair_and_logs_each_outcome() {
    let block = case("block_compression", BLOCK_FIELDS);
    let mut robin = case("robin", BLOCK_FIELDS);
    robin.folder = Some("block_compression".to_string());
    let ws = Workspace::new(&[&block, &robin]);
    let solver = SyntheticSolver::new(BLOCK_FIELDS, 25, 3);
    capture_reference(&ws.config, &solver, &block).expect("capture");

    let matrix = VerificationMatrix {
        schema_version: 1,
        suite: "struct".to_string(),
        cases: vec![block, robin],
    };
    let log_path = ws.root.path().join("logs/verification.jsonl");
    set_verification_log_path(Some(log_path.clone()));
    let outcomes = verify_matrix(&ws.config, &ws.config.reference_store(), &solver, &matrix)
        .expect("matrix runs");
    set_verification_log_path(None);

    let pairs: Vec<(&str, usize)> = outcomes
        .iter()
        .map(|o| (o.case.as_str(), o.n_proc))
        .collect();
    assert_eq!(
        pairs,
        vec![
            ("block_compression", 1),
            ("block_compression", 3),
            ("robin", 1),
            ("robin", 3)
        ]
    );
    let report = SuiteReport::from_outcomes(&matrix.suite, &outcomes);
    assert!(report.all_passed(), "{:?}", report.failures);

    let raw = fs::read_to_string(&log_path).expect("log written");
    let entries: Vec<serde_json::Value> = raw
        .lines()
        .map(|line| serde_json::from_str(line).expect("jsonl line"))
        .collect();
    assert_eq!(entries.len(), 4);
    for entry in &entries {
        assert_eq!(entry["status"], "pass");
        assert_eq!(entry["suite"], "struct");
        assert_eq!(entry["base_folder"], "struct");
        assert!(entry["compared_elements"].as_u64().unwrap_or(0) > 0);
    }
    assert_eq!(entries[2]["case"], "robin");
}

#[test]
fn untagged_fresh_output_matches_tagged_reference() {
    let fields = ["Displacement", "Stress", "Def_grad"];
    let block = case("block_compression", &fields);
    let ws = Workspace::new(&[&block]);
    let tagged = SyntheticSolver::new(&fields, 20, 2);
    capture_reference(&ws.config, &tagged, &block).expect("capture");

    let mut untagged = tagged.clone();
    untagged.untagged = true;
    for n_proc in [1, 3] {
        let report = verify(&ws.config, &ws.config.reference_store(), &untagged, &block, n_proc)
            .expect("same widths without kind tags pass");
        assert!(report.field_steps.iter().any(|s| s.field == "Def_grad" && s.width == 9));
    }

    capture_reference(&ws.config, &untagged, &block).expect("untagged capture");
    verify(&ws.config, &ws.config.reference_store(), &tagged, &block, 1)
        .expect("tagged fresh output against an untagged reference");
}

#[test]
fn failed_capture_keeps_previous_reference() {
    let block = case("block_compression", BLOCK_FIELDS);
    let ws = Workspace::new(&[&block]);
    let clean = SyntheticSolver::new(BLOCK_FIELDS, 10, 4);
    let manifest = capture_reference(&ws.config, &clean, &block).expect("capture");

    let store = ws.config.reference_store();
    let reference_dir = store.locate(&block);
    let snapshot = |dir: &std::path::Path| -> Vec<(String, Vec<u8>)> {
        let mut files: Vec<(String, Vec<u8>)> = fs::read_dir(dir)
            .expect("reference dir")
            .map(|entry| {
                let entry = entry.expect("entry");
                (
                    entry.file_name().to_string_lossy().into_owned(),
                    fs::read(entry.path()).expect("reference file"),
                )
            })
            .collect();
        files.sort();
        files
    };
    let before = snapshot(&reference_dir);

    let mut broken = clean.clone();
    broken.directory_at = Some(3);
    capture_reference(&ws.config, &broken, &block).expect_err("step 3 cannot be copied");

    assert_eq!(snapshot(&reference_dir), before);
    let report = verify(&ws.config, &store, &clean, &block, 1).expect("old reference still verifies");
    assert_eq!(report.reference_version, Some(manifest.version_tag()));

    let case_dir = block.input_dir(&ws.config.cases_root);
    let mut entries: Vec<String> = fs::read_dir(&case_dir)
        .expect("case dir")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    entries.sort();
    assert_eq!(entries, vec!["reference", "solver.xml"]);
    assert_eq!(ws.leftover_workdirs(), 0);
}
