//! Per-timestep surface-process engine.
//!
//! One [`SurfaceProcessEngine::step`] runs the phases of [`Phase`] in their
//! fixed order. Every phase that communicates is collective, so all ranks
//! must step together.

use std::time::Instant;

use crate::algs::assembly::SparseSystemAssembler;
use crate::algs::collective::agree;
use crate::algs::communicator::Communicator;
use crate::algs::flow_graph::{FlowGraph, FlowGraphBuilder};
use crate::algs::kernels::SurfaceKernels;
use crate::algs::solver::{RichardsonSolver, SolveStats};
use crate::data::csr::DistributedMatrix;
use crate::data::field::GhostedField;
use crate::debug_invariants::expect_len;
use crate::physics::clock::SimulationClock;
use crate::physics::config::{SurfaceConfig, ValidatedConfig};
use crate::surface_error::SurfaceError;
use crate::topology::partition::MeshPartition;

/// Elevation drop at which the erosion limiter reaches one half.
const LIMITER_SCALE: f64 = 1.0e-3;

/// Phases of one timestep, in execution order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    FlowAccumulation,
    ErosionRate,
    ApplyErosion,
    SedimentFlux,
    Deposition,
    HillSlope,
    SedimentDiffusion,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::FlowAccumulation => "Flow Accumulation",
            Phase::ErosionRate => "Bedrock Erosion",
            Phase::ApplyErosion => "Apply Erosion",
            Phase::SedimentFlux => "Sediment Flux",
            Phase::Deposition => "Deposition",
            Phase::HillSlope => "Hillslope Processes",
            Phase::SedimentDiffusion => "Marine Sediment Diffusion",
        }
    }
}

/// What one step did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepReport {
    /// Model time at the end of the step.
    pub time: f64,
    /// Length of the step; shorter than the configured `dt` on a final
    /// partial step.
    pub dt: f64,
    /// Phases that ran; skipped phases are absent.
    pub phases: Vec<Phase>,
    pub solves: Vec<(Phase, SolveStats)>,
    /// The step reached an output time.
    pub output_due: bool,
}

impl StepReport {
    pub fn ran(&self, phase: Phase) -> bool {
        self.phases.contains(&phase)
    }
}

/// Owns the surface fields of one rank and advances them in time.
pub struct SurfaceProcessEngine<C, K> {
    cfg: ValidatedConfig,
    part: MeshPartition,
    comm: C,
    kernels: K,
    clock: SimulationClock,
    solver: RichardsonSolver,
    assembler: SparseSystemAssembler,
    /// Hillslope operator and the step length it was built for.
    diffusion: Option<(f64, DistributedMatrix)>,
    sea_level: f64,
    rain: Vec<f64>,
    h: GhostedField,
    fa: GhostedField,
    eb: GhostedField,
    cum_ed: GhostedField,
    v_sed: GhostedField,
    marine_volume: Vec<f64>,
    first_step: bool,
}

impl<C, K> SurfaceProcessEngine<C, K>
where
    C: Communicator,
    K: SurfaceKernels,
{
    /// Validate `config` and set up the engine. Collective.
    ///
    /// `elevation` holds one value per local node; ghost values are
    /// overwritten from their owners.
    pub fn new(
        config: &SurfaceConfig,
        part: MeshPartition,
        comm: C,
        kernels: K,
        elevation: Vec<f64>,
    ) -> Result<Self, SurfaceError> {
        let cfg = config.validate()?;
        let n = part.npoints();

        let mut assembler = SparseSystemAssembler::new();
        let clock = SimulationClock::new(cfg.t_start, cfg.t_end, cfg.dt, cfg.tout);
        let setup = expect_len("initial elevation", n, elevation.len()).and_then(|_| {
            build_diffusion(&cfg, &part, &kernels, &mut assembler, clock.next_dt())
        });
        let diffusion = agree(&comm, setup)?;

        let mut h = GhostedField::from_values(elevation);
        h.refresh(&part, &comm)?;

        Ok(Self {
            clock,
            solver: RichardsonSolver::new(cfg.solver.clone()),
            sea_level: cfg.sea_level,
            rain: vec![1.0; n],
            fa: GhostedField::zeros(n),
            eb: GhostedField::zeros(n),
            cum_ed: GhostedField::zeros(n),
            v_sed: GhostedField::zeros(n),
            marine_volume: vec![0.0; n],
            first_step: true,
            cfg,
            part,
            comm,
            kernels,
            assembler,
            diffusion,
            h,
        })
    }

    pub fn config(&self) -> &ValidatedConfig {
        &self.cfg
    }

    pub fn partition(&self) -> &MeshPartition {
        &self.part
    }

    pub fn clock(&self) -> &SimulationClock {
        &self.clock
    }

    pub fn elevation(&self) -> &[f64] {
        self.h.local()
    }

    pub fn cumulative_erosion_deposition(&self) -> &[f64] {
        self.cum_ed.local()
    }

    pub fn sediment_flux(&self) -> &[f64] {
        self.v_sed.local()
    }

    pub fn flow_accumulation(&self) -> &[f64] {
        self.fa.local()
    }

    pub fn erosion_rate(&self) -> &[f64] {
        self.eb.local()
    }

    /// Sediment volume that reached the sea during the last step.
    pub fn marine_volume(&self) -> &[f64] {
        &self.marine_volume
    }

    pub fn sea_level(&self) -> f64 {
        self.sea_level
    }

    /// Rainfall per local node, applied from the next step on.
    pub fn set_rainfall(&mut self, rain: &[f64]) -> Result<(), SurfaceError> {
        expect_len("rainfall", self.part.npoints(), rain.len())?;
        self.rain.copy_from_slice(rain);
        Ok(())
    }

    pub fn set_sea_level(&mut self, sea_level: f64) {
        self.sea_level = sea_level;
    }

    /// Add an externally computed elevation change (e.g. tectonics). Collective.
    pub fn apply_elevation_delta(&mut self, delta: &[f64]) -> Result<(), SurfaceError> {
        agree(
            &self.comm,
            expect_len("elevation delta", self.part.npoints(), delta.len()),
        )?;
        self.h.axpy(&self.part, 1.0, delta);
        self.h.refresh(&self.part, &self.comm)
    }

    /// Advance one timestep. Collective.
    pub fn step(&mut self) -> Result<StepReport, SurfaceError> {
        let dt = self.clock.next_dt();
        let mut report = StepReport {
            dt,
            ..StepReport::default()
        };

        let started = Instant::now();
        let (flow, weight_mat) = self.phase_flow_accumulation(&mut report)?;
        self.finish_phase(&mut report, Phase::FlowAccumulation, started);

        let started = Instant::now();
        self.phase_erosion_rate(&flow, dt, &mut report)?;
        self.finish_phase(&mut report, Phase::ErosionRate, started);

        let started = Instant::now();
        self.phase_apply_erosion(dt)?;
        self.finish_phase(&mut report, Phase::ApplyErosion, started);

        let started = Instant::now();
        self.phase_sediment_flux(weight_mat, &mut report)?;
        self.finish_phase(&mut report, Phase::SedimentFlux, started);

        if self.cfg.wgth > 0.0 {
            let started = Instant::now();
            self.phase_deposition(dt)?;
            self.finish_phase(&mut report, Phase::Deposition, started);
        }

        if self.cfg.hillslope_k > 0.0 {
            let started = Instant::now();
            self.phase_hillslope(dt, &mut report)?;
            self.finish_phase(&mut report, Phase::HillSlope, started);
        }

        let started = Instant::now();
        self.phase_sediment_diffusion(&flow);
        self.finish_phase(&mut report, Phase::SedimentDiffusion, started);

        self.first_step = false;
        report.output_due = self.clock.advance();
        report.time = self.clock.time();
        Ok(report)
    }

    /// Step until the end of the time window.
    pub fn run_to_end(&mut self) -> Result<Vec<StepReport>, SurfaceError> {
        let mut reports = Vec::new();
        while !self.clock.is_finished() {
            reports.push(self.step()?);
        }
        Ok(reports)
    }

    fn finish_phase(&self, report: &mut StepReport, phase: Phase, started: Instant) {
        report.phases.push(phase);
        if self.cfg.verbose && self.comm.rank() == 0 {
            log::info!(
                "{} ({:.4} seconds)",
                phase.label(),
                started.elapsed().as_secs_f64()
            );
        }
    }

    fn phase_flow_accumulation(
        &mut self,
        report: &mut StepReport,
    ) -> Result<(FlowGraph, DistributedMatrix), SurfaceError> {
        self.h.refresh(&self.part, &self.comm)?;
        let flow = FlowGraphBuilder::new(&self.kernels, self.cfg.flow_dir).build(
            &self.part,
            &self.comm,
            self.h.local(),
            self.sea_level,
        )?;

        let wa = agree(
            &self.comm,
            self.assembler.build_from_receivers(
                &self.part,
                &flow.receivers,
                flow.receivers.weights(),
                false,
            ),
        )?;
        let weight_mat = self.assembler.transpose(&self.part, &self.comm, &wa)?;
        self.assembler.release(wa);

        let areas = self.part.areas();
        let rhs: Vec<f64> = self.rain.iter().zip(areas).map(|(r, a)| r * a).collect();
        let stats = self.solver.solve(
            &self.part,
            &self.comm,
            &weight_mat,
            &rhs,
            self.fa.global_mut(),
            !self.first_step,
        )?;
        report.solves.push((Phase::FlowAccumulation, stats));
        self.fa.refresh(&self.part, &self.comm)?;
        Ok((flow, weight_mat))
    }

    fn phase_erosion_rate(
        &mut self,
        flow: &FlowGraph,
        dt: f64,
        report: &mut StepReport,
    ) -> Result<(), SurfaceError> {
        let n = self.part.npoints();
        let fd = self.cfg.flow_dir;
        let h_old = self.h.local().to_vec();
        let fa = self.fa.local();
        let graph = &flow.receivers;

        let mut coeffs = vec![0.0; n * fd];
        for i in self.part.owned_nodes() {
            if flow.is_sink(i) {
                continue;
            }
            let kbr = fa[i].max(0.0).sqrt() * self.cfg.erodibility * dt;
            for k in 0..fd {
                let r = graph.receiver(i, k);
                let dist = graph.distance(i, k);
                if r == i || dist <= 0.0 {
                    continue;
                }
                let dh = h_old[i] - h_old[r];
                let limiter = if dh > 0.0 {
                    dh / (dh + LIMITER_SCALE)
                } else {
                    0.0
                };
                coeffs[i * fd + k] = kbr * limiter / dist * graph.weight(i, k);
            }
        }

        // unknown is the drop `hOld - v` of `EbedMat · v = hOld`
        let mut rhs = vec![0.0; n];
        let ebed = self
            .assembler
            .build_from_receivers(&self.part, graph, &coeffs, true)
            .and_then(|ebed| ebed.mul_vec(&h_old, &mut rhs).map(|_| ebed));
        let ebed = agree(&self.comm, ebed)?;
        for i in 0..n {
            rhs[i] = if self.part.is_owned(i) { rhs[i] - h_old[i] } else { 0.0 };
        }
        let mut lowering = vec![0.0; n];
        let stats = self
            .solver
            .solve(&self.part, &self.comm, &ebed, &rhs, &mut lowering, false)?;
        report.solves.push((Phase::ErosionRate, stats));
        self.assembler.release(ebed);

        let eb = self.eb.global_mut();
        eb.fill(0.0);
        for i in self.part.owned_nodes() {
            if !flow.is_sink(i) {
                eb[i] = (lowering[i] / dt).max(0.0);
            }
        }
        self.eb.refresh(&self.part, &self.comm)
    }

    fn phase_apply_erosion(&mut self, dt: f64) -> Result<(), SurfaceError> {
        self.cum_ed.axpy(&self.part, -dt, self.eb.global());
        self.h.axpy(&self.part, -dt, self.eb.global());
        self.cum_ed.refresh(&self.part, &self.comm)?;
        self.h.refresh(&self.part, &self.comm)
    }

    fn phase_sediment_flux(
        &mut self,
        weight_mat: DistributedMatrix,
        report: &mut StepReport,
    ) -> Result<(), SurfaceError> {
        let wgth = self.cfg.wgth;
        let sl = agree(
            &self.comm,
            self.assembler
                .blend(&self.part, &weight_mat, 1.0 - wgth, wgth),
        )?;
        self.assembler.release(weight_mat);

        let keep = 1.0 - self.cfg.frac_fine;
        let areas = self.part.areas();
        let rhs: Vec<f64> = self
            .eb
            .local()
            .iter()
            .zip(areas)
            .map(|(e, a)| e * keep * a)
            .collect();
        let stats = self.solver.solve(
            &self.part,
            &self.comm,
            &sl,
            &rhs,
            self.v_sed.global_mut(),
            !self.first_step,
        )?;
        report.solves.push((Phase::SedimentFlux, stats));
        self.assembler.release(sl);
        self.v_sed.refresh(&self.part, &self.comm)
    }

    fn phase_deposition(&mut self, dt: f64) -> Result<(), SurfaceError> {
        let n = self.part.npoints();
        let wgth = self.cfg.wgth;
        let keep = 1.0 - self.cfg.frac_fine;
        let areas = self.part.areas();
        let v_sed = self.v_sed.local();
        let eb = self.eb.local();

        let mut step_ed = vec![0.0; n];
        for i in self.part.owned_nodes() {
            step_ed[i] = (v_sed[i] - keep * eb[i] * areas[i]) * wgth * dt / (1.0 - wgth) / areas[i];
        }
        self.cum_ed.axpy(&self.part, 1.0, &step_ed);
        self.h.axpy(&self.part, 1.0, &step_ed);
        self.cum_ed.refresh(&self.part, &self.comm)?;
        self.h.refresh(&self.part, &self.comm)
    }

    fn phase_hillslope(&mut self, dt: f64, report: &mut StepReport) -> Result<(), SurfaceError> {
        if self.diffusion.as_ref().is_none_or(|(built_for, _)| *built_for != dt) {
            let rebuilt = build_diffusion(
                &self.cfg,
                &self.part,
                &self.kernels,
                &mut self.assembler,
                dt,
            );
            let rebuilt = agree(&self.comm, rebuilt)?;
            if let Some((_, old)) = std::mem::replace(&mut self.diffusion, rebuilt) {
                self.assembler.release(old);
            }
        }
        let Some((_, diff)) = self.diffusion.as_ref() else {
            return Ok(());
        };
        let h_old = self.h.local().to_vec();
        let stats = self.solver.solve(
            &self.part,
            &self.comm,
            diff,
            &h_old,
            self.h.global_mut(),
            true,
        )?;
        report.solves.push((Phase::HillSlope, stats));

        let step_ed: Vec<f64> = self
            .h
            .global()
            .iter()
            .zip(&h_old)
            .map(|(h, old)| h - old)
            .collect();
        self.cum_ed.axpy(&self.part, 1.0, &step_ed);
        self.cum_ed.refresh(&self.part, &self.comm)?;
        self.h.refresh(&self.part, &self.comm)
    }

    /// Marine transport is not modelled: sediment reaching the sea is only
    /// recorded.
    fn phase_sediment_diffusion(&mut self, flow: &FlowGraph) {
        let v_sed = self.v_sed.local();
        for (i, m) in self.marine_volume.iter_mut().enumerate() {
            *m = if flow.sea[i] { v_sed[i] } else { 0.0 };
        }
    }
}

/// Implicit hillslope operator for a step of length `dt`, or none when
/// diffusion is switched off.
fn build_diffusion<K: SurfaceKernels>(
    cfg: &ValidatedConfig,
    part: &MeshPartition,
    kernels: &K,
    assembler: &mut SparseSystemAssembler,
    dt: f64,
) -> Result<Option<(f64, DistributedMatrix)>, SurfaceError> {
    if cfg.hillslope_k <= 0.0 {
        return Ok(None);
    }
    let n = part.npoints();
    let coeffs = kernels.hillslope_coefficients(n, cfg.hillslope_k * dt);
    if coeffs.diagonal.len() != n {
        return Err(SurfaceError::KernelShape {
            kernel: "hillslope_coefficients",
            expected: n,
            got: coeffs.diagonal.len(),
        });
    }
    let m = assembler.build_from_neighbours(part, &coeffs)?;
    Ok(Some((dt, m)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::algs::kernels::ReferenceKernels;
    use crate::topology::meshgen::StructuredMesh;

    fn line_engine(
        config: SurfaceConfig,
        elevation: Vec<f64>,
    ) -> SurfaceProcessEngine<NoComm, ReferenceKernels> {
        let mesh = StructuredMesh::line(elevation.len(), 100.0).unwrap();
        let part = mesh.serial().unwrap();
        let kernels = ReferenceKernels::new(mesh.global_topology().unwrap(), &part);
        SurfaceProcessEngine::new(&config, part, NoComm, kernels, elevation).unwrap()
    }

    #[test]
    fn skipped_phases_are_absent_from_report() {
        let mut engine = line_engine(
            SurfaceConfig::new(0.0, 1000.0, 1000.0).with_flow_dir(1),
            vec![4.0, 3.0, 2.0, 1.0, 0.5],
        );
        let report = engine.step().unwrap();
        assert!(report.ran(Phase::FlowAccumulation));
        assert!(report.ran(Phase::SedimentDiffusion));
        assert!(!report.ran(Phase::Deposition));
        assert!(!report.ran(Phase::HillSlope));
        assert_eq!(report.solves.len(), 3);
        assert!(report.output_due);
        assert!(engine.clock().is_finished());
    }

    #[test]
    fn accumulation_counts_upstream_area() {
        let mut engine = line_engine(
            SurfaceConfig::new(0.0, 1.0, 1.0).with_flow_dir(1),
            vec![4.0, 3.0, 2.0, 1.0, 0.5],
        );
        engine.step().unwrap();
        let area = 100.0 * 100.0;
        for (i, fa) in engine.flow_accumulation().iter().enumerate() {
            assert!((fa - area * (i + 1) as f64).abs() < 1e-6 * area, "{i}: {fa}");
        }
    }

    #[test]
    fn hillslope_diffusion_smooths_a_bump() {
        let cfg = SurfaceConfig::new(0.0, 1.0, 1.0)
            .with_flow_dir(1)
            .with_spl(0.0, 0.0, 0.0)
            .with_diffusion(100.0);
        let mut engine = line_engine(cfg, vec![1.0, 1.0, 5.0, 1.0, 1.0]);
        let report = engine.step().unwrap();
        assert!(report.ran(Phase::HillSlope));
        let h = engine.elevation();
        assert!(h[2] < 5.0 && h[1] > 1.0);
        assert!((engine.cumulative_erosion_deposition()[2] - (h[2] - 5.0)).abs() < 1e-12);
    }

    #[test]
    fn rainfall_length_is_checked() {
        let mut engine = line_engine(SurfaceConfig::new(0.0, 1.0, 1.0), vec![1.0, 0.0]);
        let err = engine.set_rainfall(&[1.0]).unwrap_err();
        assert!(matches!(err, SurfaceError::LayoutMismatch { .. }));
    }

    fn full_line_config(t_end: f64, dt: f64) -> SurfaceConfig {
        SurfaceConfig::new(0.0, t_end, dt)
            .with_flow_dir(1)
            .with_spl(1.0e-5, 0.0, 0.5)
            .with_diffusion(0.5)
    }

    #[test]
    fn short_window_behaves_like_a_matching_dt() {
        let h0 = vec![40.0, 30.0, 25.0, 10.0, 0.0];
        let mut clipped = line_engine(full_line_config(500.0, 1000.0), h0.clone());
        let mut exact = line_engine(full_line_config(500.0, 500.0), h0);
        let clipped_reports = clipped.run_to_end().unwrap();
        exact.run_to_end().unwrap();

        assert_eq!(clipped_reports.len(), 1);
        assert_eq!(clipped_reports[0].dt, 500.0);
        for (a, b) in clipped
            .cumulative_erosion_deposition()
            .iter()
            .zip(exact.cumulative_erosion_deposition())
        {
            assert!((a - b).abs() < 1e-9 * (1.0 + b.abs()), "{a} vs {b}");
        }
        for (a, b) in clipped.elevation().iter().zip(exact.elevation()) {
            assert!((a - b).abs() < 1e-9 * (1.0 + b.abs()), "{a} vs {b}");
        }
    }

    #[test]
    fn final_partial_step_rebuilds_the_hillslope_operator() {
        let mut engine = line_engine(
            full_line_config(1500.0, 1000.0),
            vec![40.0, 30.0, 25.0, 10.0, 0.0],
        );
        let dts: Vec<f64> = engine
            .run_to_end()
            .unwrap()
            .iter()
            .map(|r| r.dt)
            .collect();
        assert_eq!(dts, vec![1000.0, 500.0]);
        assert_eq!(engine.clock().time(), 1500.0);
        assert_eq!(engine.diffusion.as_ref().map(|(dt, _)| *dt), Some(500.0));
    }
}
