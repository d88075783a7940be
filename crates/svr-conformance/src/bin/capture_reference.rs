#![forbid(unsafe_code)]

use svr_conformance::cases::VerificationMatrix;
use svr_conformance::reference_store::{ReferenceStore, capture_reference};
use svr_conformance::{HarnessConfig, relative_display};
use svr_runner::ProcessSolver;

fn main() {
    if let Err(err) = run() {
        eprintln!("capture_reference failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut case_name: Option<String> = None;
    let mut cfg = HarnessConfig::default_paths();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--case" => {
                case_name = Some(
                    args.next()
                        .ok_or_else(|| "--case requires a value".to_string())?,
                );
            }
            "--matrix" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--matrix requires a value".to_string())?;
                cfg.matrix_path = value.into();
            }
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p svr-conformance --bin capture_reference -- --case <name> [--matrix <path>]"
                );
                std::process::exit(0);
            }
            unknown => return Err(format!("unknown argument: {unknown}")),
        }
    }
    let case_name = case_name.ok_or_else(|| "--case is required".to_string())?;

    let matrix = VerificationMatrix::load(&cfg.matrix_path)?;
    let case = matrix
        .case(&case_name)
        .ok_or_else(|| format!("case {case_name} is not in {}", cfg.matrix_path.display()))?;

    let solver = ProcessSolver::new(cfg.solver.clone());
    let manifest = capture_reference(&cfg, &solver, case)?;
    let target = cfg.reference_store().locate(case);

    println!(
        "captured {} step files for {} ({})",
        manifest.files.len(),
        case.name,
        manifest.version_tag()
    );
    println!("wrote {}", relative_display(&cfg.reference_root, &target));
    Ok(())
}
