//! Surface-process configuration.
//!
//! [`SurfaceConfig`] mirrors the sections of the model input file and is
//! deserialised by whatever reader the driver uses. [`SurfaceConfig::validate`]
//! resolves defaults and rejects inconsistent values before the first step.

use serde::{Deserialize, Serialize};

use crate::algs::solver::SolverConfig;
use crate::surface_error::SurfaceError;

pub const DEFAULT_FLOW_DIR: usize = 6;
/// Erodibility used when the `spl` section is absent.
pub const DEFAULT_ERODIBILITY: f64 = 1.0e-12;
pub const DEFAULT_SEDIMENT_DIFFUSIVITY: f64 = 10.0;
/// Upper bound applied to `spl.wgth`.
pub const MAX_DEPOSITION_WEIGHT: f64 = 0.999;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainSection {
    #[serde(rename = "flowdir")]
    pub flow_dir: Option<usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSection {
    pub start: Option<f64>,
    pub end: Option<f64>,
    pub dt: Option<f64>,
    pub tout: Option<f64>,
}

/// Stream-power law parameters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SplSection {
    #[serde(rename = "K")]
    pub k: Option<f64>,
    /// Fraction of fines lost from the system.
    #[serde(rename = "Ff")]
    pub frac_fine: Option<f64>,
    /// Deposition weight.
    pub wgth: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffusionSection {
    #[serde(rename = "hillslopeK")]
    pub hillslope_k: Option<f64>,
    #[serde(rename = "sedimentK")]
    pub sediment_k: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SeaSection {
    pub position: Option<f64>,
}

/// Raw configuration tree. Every value is optional here; see [`SurfaceConfig::validate`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    pub domain: DomainSection,
    pub time: Option<TimeSection>,
    pub spl: Option<SplSection>,
    pub diffusion: Option<DiffusionSection>,
    pub sea: Option<SeaSection>,
    pub solver: SolverConfig,
    pub verbose: bool,
}

/// Configuration with defaults resolved and values checked.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedConfig {
    pub flow_dir: usize,
    pub t_start: f64,
    pub t_end: f64,
    pub dt: f64,
    pub tout: f64,
    pub erodibility: f64,
    pub frac_fine: f64,
    pub wgth: f64,
    pub hillslope_k: f64,
    pub sediment_k: f64,
    pub sea_level: f64,
    pub solver: SolverConfig,
    pub verbose: bool,
}

fn required(value: Option<f64>, key: &'static str) -> Result<f64, SurfaceError> {
    match value {
        Some(v) if v.is_finite() => Ok(v),
        Some(v) => Err(SurfaceError::config(key, format!("must be finite, got {v}"))),
        None => Err(SurfaceError::config(key, "is required")),
    }
}

impl SurfaceConfig {
    /// Minimal configuration with just a time window.
    pub fn new(start: f64, end: f64, dt: f64) -> Self {
        Self {
            time: Some(TimeSection {
                start: Some(start),
                end: Some(end),
                dt: Some(dt),
                tout: None,
            }),
            ..Self::default()
        }
    }

    pub fn with_spl(mut self, k: f64, frac_fine: f64, wgth: f64) -> Self {
        self.spl = Some(SplSection {
            k: Some(k),
            frac_fine: Some(frac_fine),
            wgth: Some(wgth),
        });
        self
    }

    pub fn with_diffusion(mut self, hillslope_k: f64) -> Self {
        self.diffusion = Some(DiffusionSection {
            hillslope_k: Some(hillslope_k),
            sediment_k: None,
        });
        self
    }

    pub fn with_sea_level(mut self, position: f64) -> Self {
        self.sea = Some(SeaSection {
            position: Some(position),
        });
        self
    }

    pub fn with_flow_dir(mut self, flow_dir: usize) -> Self {
        self.domain.flow_dir = Some(flow_dir);
        self
    }

    pub fn with_output_interval(mut self, tout: f64) -> Self {
        if let Some(time) = self.time.as_mut() {
            time.tout = Some(tout);
        }
        self
    }

    pub fn with_solver(mut self, solver: SolverConfig) -> Self {
        self.solver = solver;
        self
    }

    /// Resolve defaults and check consistency.
    pub fn validate(&self) -> Result<ValidatedConfig, SurfaceError> {
        let flow_dir = self.domain.flow_dir.unwrap_or(DEFAULT_FLOW_DIR);
        if flow_dir == 0 {
            return Err(SurfaceError::config("domain.flowdir", "must be at least 1"));
        }

        let time = self
            .time
            .as_ref()
            .ok_or_else(|| SurfaceError::config("time", "section is required"))?;
        let t_start = required(time.start, "time.start")?;
        let t_end = required(time.end, "time.end")?;
        let dt = required(time.dt, "time.dt")?;
        if t_end <= t_start {
            return Err(SurfaceError::config(
                "time.end",
                format!("must be greater than time.start ({t_end} <= {t_start})"),
            ));
        }
        if dt <= 0.0 {
            return Err(SurfaceError::config(
                "time.dt",
                format!("must be positive, got {dt}"),
            ));
        }
        let mut tout = time.tout.unwrap_or(t_end - t_start);
        if tout < dt {
            log::warn!("time.tout {tout} is smaller than time.dt, using {dt}");
            tout = dt;
        }

        let (erodibility, frac_fine, mut wgth) = match &self.spl {
            None => (DEFAULT_ERODIBILITY, 0.0, 0.0),
            Some(spl) => (
                required(spl.k, "spl.K")?,
                spl.frac_fine.unwrap_or(0.0),
                spl.wgth.unwrap_or(0.0),
            ),
        };
        if erodibility < 0.0 {
            return Err(SurfaceError::config("spl.K", "must be non-negative"));
        }
        if !(0.0..=1.0).contains(&frac_fine) {
            return Err(SurfaceError::config(
                "spl.Ff",
                format!("must lie in [0, 1], got {frac_fine}"),
            ));
        }
        if wgth < 0.0 {
            return Err(SurfaceError::config("spl.wgth", "must be non-negative"));
        }
        if wgth >= 1.0 {
            log::warn!("spl.wgth {wgth} >= 1, clamped to {MAX_DEPOSITION_WEIGHT}");
            wgth = MAX_DEPOSITION_WEIGHT;
        }

        let (hillslope_k, sediment_k) = match &self.diffusion {
            None => (0.0, DEFAULT_SEDIMENT_DIFFUSIVITY),
            Some(d) => (
                required(d.hillslope_k, "diffusion.hillslopeK")?,
                d.sediment_k.unwrap_or(DEFAULT_SEDIMENT_DIFFUSIVITY),
            ),
        };
        if hillslope_k < 0.0 {
            return Err(SurfaceError::config(
                "diffusion.hillslopeK",
                "must be non-negative",
            ));
        }

        let sea_level = self
            .sea
            .as_ref()
            .and_then(|s| s.position)
            .unwrap_or(0.0);

        let solver = &self.solver;
        if !(solver.rtol >= 0.0) || !(solver.atol >= 0.0) || !(solver.dtol > 0.0) {
            return Err(SurfaceError::config(
                "solver",
                "tolerances must be non-negative and dtol positive",
            ));
        }

        Ok(ValidatedConfig {
            flow_dir,
            t_start,
            t_end,
            dt,
            tout,
            erodibility,
            frac_fine,
            wgth,
            hillslope_k,
            sediment_k,
            sea_level,
            solver: solver.clone(),
            verbose: self.verbose,
        })
    }
}
