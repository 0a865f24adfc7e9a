use serde::{Deserialize, Serialize};

use crate::task::{TaskOutcome, TaskState};

pub const YOUNG_RANGE: (f64, f64) = (0.1, 1e4);
pub const PRESSURE_RANGE: (f64, f64) = (0.0, 10.0);
pub const SCALE_RANGE: (f64, f64) = (0.1, 10.0);
pub const DEFAULT_SCALE: f64 = 1.5;

/// Boundary region held at zero displacement by the solver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DirichletBoundary {
    Fix,
    Outer,
}

impl DirichletBoundary {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirichletBoundary::Fix => "fix",
            DirichletBoundary::Outer => "outer",
        }
    }
}

/// Inputs of one turgor simulation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SimulationParameters {
    /// Young's modulus of the cell walls (MPa)
    pub young: f64,
    /// Poisson's ratio, in [0, 0.5)
    pub poisson: f64,
    pub dirichlet: DirichletBoundary,
    /// Turgor pressure applied on the inner boundary (MPa)
    pub pressure: f64,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            young: 200.0,
            poisson: 0.4,
            dirichlet: DirichletBoundary::Fix,
            pressure: 0.3,
        }
    }
}

impl SimulationParameters {
    pub fn validate(&self) -> Result<(), String> {
        let (young_min, young_max) = YOUNG_RANGE;
        if !(young_min..=young_max).contains(&self.young) {
            return Err(format!(
                "Young's modulus must be within {young_min}..={young_max} MPa, got {}",
                self.young
            ));
        }
        if !(0.0..0.5).contains(&self.poisson) {
            return Err(format!(
                "Poisson's ratio must be within [0, 0.5), got {}",
                self.poisson
            ));
        }
        let (p_min, p_max) = PRESSURE_RANGE;
        if !(p_min..=p_max).contains(&self.pressure) {
            return Err(format!(
                "Pressure must be within {p_min}..={p_max} MPa, got {}",
                self.pressure
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshRequest {
    #[serde(default = "default_scale")]
    pub scale: f64,
}

fn default_scale() -> f64 {
    DEFAULT_SCALE
}

impl Default for MeshRequest {
    fn default() -> Self {
        Self {
            scale: DEFAULT_SCALE,
        }
    }
}

pub fn validate_scale(scale: f64) -> Result<(), String> {
    let (min, max) = SCALE_RANGE;
    if !(min..=max).contains(&scale) {
        return Err(format!("Mesh scale must be within {min}..={max}, got {scale}"));
    }
    Ok(())
}

/// Per-session view state. Starts with nothing displayed and no mesh.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ViewState {
    pub plot_displayed: bool,
    pub mesh_ready: bool,
    pub preview_available: bool,
    pub result_available: bool,
    pub geometry: Option<String>,
    pub mesh_scale: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub created_at: String,
    pub view: ViewState,
    pub parameters: Option<SimulationParameters>,
    pub solve_state: Option<TaskState>,
    /// `mesh` or `preview` while one of those steps runs
    pub active_step: Option<String>,
}

/// Result of a blocking external step (mesh generation, preview).
#[derive(Debug, Clone, Serialize)]
pub struct StepResponse {
    pub status: TaskState,
    pub exit_code: Option<i32>,
    pub message: String,
    pub log: Vec<String>,
    pub duration_ms: u64,
}

impl StepResponse {
    pub fn from_outcome(outcome: &TaskOutcome, message: impl Into<String>) -> Self {
        Self {
            status: outcome.state,
            exit_code: outcome.exit_code,
            message: message.into(),
            log: outcome.log.clone(),
            duration_ms: outcome.duration_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SolveStatusResponse {
    pub job_id: String,
    pub status: TaskState,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub plot_available: bool,
    pub archive_available: bool,
    pub log: Vec<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogChunkResponse {
    pub status: TaskState,
    pub from: usize,
    pub next: usize,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub from: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_form_defaults() {
        let params = SimulationParameters::default();
        assert_eq!(params.young, 200.0);
        assert_eq!(params.poisson, 0.4);
        assert_eq!(params.dirichlet, DirichletBoundary::Fix);
        assert_eq!(params.pressure, 0.3);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn poisson_upper_bound_is_exclusive() {
        let params = SimulationParameters {
            poisson: 0.5,
            ..Default::default()
        };
        assert!(params.validate().is_err());

        let params = SimulationParameters {
            poisson: 0.0,
            ..Default::default()
        };
        assert!(params.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_young_and_pressure() {
        let soft = SimulationParameters {
            young: 0.05,
            ..Default::default()
        };
        assert!(soft.validate().is_err());

        let negative = SimulationParameters {
            pressure: -0.1,
            ..Default::default()
        };
        assert!(negative.validate().is_err());
    }

    #[test]
    fn boundary_deserializes_lowercase() {
        let json = r#"{"young":10.0,"poisson":0.3,"dirichlet":"outer","pressure":1.0}"#;
        let params: SimulationParameters = serde_json::from_str(json).unwrap();
        assert_eq!(params.dirichlet, DirichletBoundary::Outer);
    }

    #[test]
    fn scale_bounds() {
        assert!(validate_scale(0.1).is_ok());
        assert!(validate_scale(10.0).is_ok());
        assert!(validate_scale(0.05).is_err());
        assert!(validate_scale(f64::NAN).is_err());
    }
}
