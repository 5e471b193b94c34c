use landscape_sieve::algs::preconditioner::PreconditionerKind;
use landscape_sieve::physics::config::SurfaceConfig;
use landscape_sieve::surface_error::SurfaceError;

fn parse(json: &str) -> SurfaceConfig {
    serde_json::from_str(json).expect("valid json")
}

#[test]
fn full_input_file_is_resolved() {
    let cfg = parse(
        r#"{
            "domain": {"flowdir": 3},
            "time": {"start": -1000.0, "end": 0.0, "dt": 100.0, "tout": 500.0},
            "spl": {"K": 3.0e-6, "Ff": 0.2, "wgth": 0.5},
            "diffusion": {"hillslopeK": 0.05, "sedimentK": 20.0},
            "sea": {"position": -10.0},
            "solver": {"rtol": 1.0e-10, "preconditioner": "jacobi"},
            "verbose": true
        }"#,
    )
    .validate()
    .unwrap();
    assert_eq!(cfg.flow_dir, 3);
    assert_eq!(cfg.tout, 500.0);
    assert_eq!(cfg.erodibility, 3.0e-6);
    assert_eq!(cfg.frac_fine, 0.2);
    assert_eq!(cfg.wgth, 0.5);
    assert_eq!(cfg.hillslope_k, 0.05);
    assert_eq!(cfg.sediment_k, 20.0);
    assert_eq!(cfg.sea_level, -10.0);
    assert_eq!(cfg.solver.rtol, 1.0e-10);
    assert_eq!(cfg.solver.max_iterations, 10_000);
    assert_eq!(cfg.solver.preconditioner, PreconditionerKind::Jacobi);
    assert!(cfg.verbose);
}

#[test]
fn block_jacobi_alias_selects_ilu() {
    let cfg = parse(r#"{"time": {"start": 0, "end": 1, "dt": 1}, "solver": {"preconditioner": "bjacobi"}}"#);
    assert_eq!(cfg.solver.preconditioner, PreconditionerKind::Ilu0);
}

fn error_key(json: &str) -> &'static str {
    match parse(json).validate() {
        Err(SurfaceError::Config { key, .. }) => key,
        other => panic!("expected a configuration error, got {other:?}"),
    }
}

#[test]
fn configuration_errors_name_the_key() {
    assert_eq!(error_key(r#"{}"#), "time");
    assert_eq!(error_key(r#"{"time": {"end": 10, "dt": 1}}"#), "time.start");
    assert_eq!(error_key(r#"{"time": {"start": 0, "dt": 1}}"#), "time.end");
    assert_eq!(error_key(r#"{"time": {"start": 0, "end": 10}}"#), "time.dt");
    assert_eq!(error_key(r#"{"time": {"start": 0, "end": 10, "dt": -1}}"#), "time.dt");
    assert_eq!(
        error_key(r#"{"time": {"start": 0, "end": 10, "dt": 1}, "spl": {"Ff": 0.1}}"#),
        "spl.K"
    );
    assert_eq!(
        error_key(r#"{"time": {"start": 0, "end": 10, "dt": 1}, "diffusion": {"sedimentK": 1}}"#),
        "diffusion.hillslopeK"
    );
    assert_eq!(
        error_key(r#"{"domain": {"flowdir": 0}, "time": {"start": 0, "end": 10, "dt": 1}}"#),
        "domain.flowdir"
    );
}
