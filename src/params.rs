//! Single-row CSV record of the simulation inputs read by the solver process.

use std::path::{Path, PathBuf};

use crate::models::SimulationParameters;

pub struct ParameterStore {
    path: PathBuf,
}

impl ParameterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrites the record with `params`. Every call rewrites the file,
    /// even when the values did not change.
    pub fn save(&self, params: &SimulationParameters) -> Result<(), ParamsError> {
        params
            .validate()
            .map_err(ParamsError::ValidationError)?;

        let mut writer = csv::Writer::from_path(&self.path)
            .map_err(|e| ParamsError::IoError(format!("Failed to open {:?}: {}", self.path, e)))?;
        writer
            .serialize(params)
            .map_err(|e| ParamsError::CsvError(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| ParamsError::IoError(format!("Failed to write {:?}: {}", self.path, e)))?;

        tracing::info!(
            "Saved parameters: E={} MPa, nu={}, dirichlet={}, p={} MPa",
            params.young,
            params.poisson,
            params.dirichlet.as_str(),
            params.pressure
        );
        Ok(())
    }

    /// Reads back the current record; `Ok(None)` when nothing was saved yet.
    pub fn load(&self) -> Result<Option<SimulationParameters>, ParamsError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let mut reader = csv::Reader::from_path(&self.path)
            .map_err(|e| ParamsError::IoError(format!("Failed to open {:?}: {}", self.path, e)))?;
        let mut rows = reader.deserialize::<SimulationParameters>();
        match rows.next() {
            Some(row) => row
                .map(Some)
                .map_err(|e| ParamsError::CsvError(e.to_string())),
            None => Err(ParamsError::CsvError(format!(
                "{:?} has a header but no parameter row",
                self.path
            ))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("CSV error: {0}")]
    CsvError(String),
}
