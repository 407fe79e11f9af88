//! TOML configuration of an evaluation run.

use serde::Deserialize;

use optlearn::{EiConfig, GaussianProcessModel, SquareExponential};

use crate::error::{CliError, CliResult};

/// Complete run configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Evaluator parameters.
    pub evaluator: EiConfig,
    /// Model hyperparameters and training data.
    pub gaussian_process: GpSection,
    /// Candidate batch.
    pub points: PointsSection,
}

/// `[gaussian_process]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct GpSection {
    pub signal_variance: f64,
    pub length_scales: Vec<f64>,
    #[serde(default)]
    pub points: Vec<Vec<f64>>,
    #[serde(default)]
    pub values: Vec<f64>,
    /// Per-observation noise variance; defaults to 1e-6 for every observation.
    #[serde(default)]
    pub noise: Option<Vec<f64>>,
}

/// `[points]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct PointsSection {
    pub to_sample: Vec<Vec<f64>>,
    #[serde(default)]
    pub being_sampled: Vec<Vec<f64>>,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub gradients: bool,
}

impl RunConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> CliResult<Self> {
        let config: RunConfig = toml::from_str(text)?;
        config.evaluator.validate()?;
        Ok(config)
    }

    /// Spatial dimension, one per length scale.
    pub fn dim(&self) -> usize {
        self.gaussian_process.length_scales.len()
    }

    /// Fit the configured model.
    pub fn build_gp(&self) -> CliResult<GaussianProcessModel> {
        let gp = &self.gaussian_process;
        let dim = self.dim();
        let points = flatten("gaussian_process.points", &gp.points, dim)?;
        let noise = gp
            .noise
            .clone()
            .unwrap_or_else(|| vec![1e-6; gp.values.len()]);
        let covariance = SquareExponential::new(gp.signal_variance, gp.length_scales.clone())?;
        Ok(GaussianProcessModel::new(
            covariance, dim, &points, &gp.values, &noise,
        )?)
    }

    /// Candidates, flattened to `[num_to_sample][dim]`.
    pub fn points_to_sample(&self) -> CliResult<Vec<f64>> {
        flatten("points.to_sample", &self.points.to_sample, self.dim())
    }

    /// Running experiments, flattened to `[num_being_sampled][dim]`.
    pub fn points_being_sampled(&self) -> CliResult<Vec<f64>> {
        flatten("points.being_sampled", &self.points.being_sampled, self.dim())
    }
}

fn flatten(what: &str, rows: &[Vec<f64>], dim: usize) -> CliResult<Vec<f64>> {
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != dim) {
        return Err(CliError::Config(format!(
            "{what}[{i}] has {} coordinates, expected {dim}",
            row.len()
        )));
    }
    Ok(rows.iter().flatten().copied().collect())
}
