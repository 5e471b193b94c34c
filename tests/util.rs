#![allow(dead_code)]
use landscape_sieve::{
    algs::communicator::{Communicator, RayonComm},
    algs::kernels::ReferenceKernels,
    physics::config::SurfaceConfig,
    physics::surface::SurfaceProcessEngine,
    topology::meshgen::StructuredMesh,
    topology::partition::MeshPartition,
};

/// Run `f` on `n` thread ranks sharing one mailbox; results are rank-ordered.
pub fn run_ranks<T, F>(n: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(RayonComm) -> T + Sync,
{
    let comms = RayonComm::group(n);
    std::thread::scope(|s| {
        let f = &f;
        let handles: Vec<_> = comms
            .into_iter()
            .map(|c| s.spawn(move || f(c)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank panicked"))
            .collect()
    })
}

/// Engine on one partition of `mesh`, with the reference kernels.
pub fn engine_on<C: Communicator>(
    mesh: &StructuredMesh,
    part: MeshPartition,
    comm: C,
    config: &SurfaceConfig,
    global_elevation: &[f64],
) -> SurfaceProcessEngine<C, ReferenceKernels> {
    let kernels = ReferenceKernels::new(mesh.global_topology().unwrap(), &part);
    let local: Vec<f64> = part
        .local_to_global()
        .iter()
        .map(|&g| global_elevation[g])
        .collect();
    SurfaceProcessEngine::new(config, part, comm, kernels, local).unwrap()
}

/// Serial engine over the whole mesh.
pub fn serial_engine(
    mesh: &StructuredMesh,
    config: &SurfaceConfig,
    elevation: &[f64],
) -> SurfaceProcessEngine<landscape_sieve::algs::communicator::NoComm, ReferenceKernels> {
    let part = mesh.serial().unwrap();
    engine_on(
        mesh,
        part,
        landscape_sieve::algs::communicator::NoComm,
        config,
        elevation,
    )
}

/// Elevation rising with distance from `outlet`, no closed depressions.
pub fn bowl(mesh: &StructuredMesh, outlet: usize) -> Vec<f64> {
    let (ox, oy) = mesh.coordinates(outlet);
    (0..mesh.len())
        .map(|g| {
            let (x, y) = mesh.coordinates(g);
            ((x - ox).powi(2) + (y - oy).powi(2)).sqrt() * 0.01
        })
        .collect()
}

/// Tilted plane with a gentle ripple, draining towards the `y = 0` edge.
pub fn tilted(mesh: &StructuredMesh) -> Vec<f64> {
    (0..mesh.len())
        .map(|g| {
            let (x, y) = mesh.coordinates(g);
            10.0 + 0.02 * y + 0.005 * x + 0.5 * (x * 0.013).sin()
        })
        .collect()
}

/// `|a - b| <= tol * (1 + max|a|)` for every entry.
pub fn assert_close(a: &[f64], b: &[f64], tol: f64, what: &str) {
    assert_eq!(a.len(), b.len(), "{what}: length");
    let scale = 1.0 + a.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!(
            (x - y).abs() <= tol * scale,
            "{what}[{i}]: {x} vs {y}"
        );
    }
}
