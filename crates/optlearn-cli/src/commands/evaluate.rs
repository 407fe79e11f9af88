//! `optlearn evaluate` command - Evaluate EI (and its gradient) for a candidate batch.

use std::fs;
use std::sync::Arc;
use std::time::Instant;

use colored::Colorize;
use tracing::debug;

use optlearn::prelude::*;
use optlearn::{is_cuda_available, MemoryTrackerStats};

use crate::config::RunConfig;
use crate::error::{CliError, CliResult};

use super::BackendKind;

/// Result of one evaluation run.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReport {
    /// Backend that ran the kernels.
    pub backend: String,
    /// Monte-Carlo draws actually performed.
    pub effective_draws: usize,
    /// EI estimate.
    pub expected_improvement: f64,
    /// Gradient w.r.t. the candidates, when requested.
    pub gradient: Option<Vec<f64>>,
    /// Device memory counters after the run.
    pub memory: MemoryTrackerStats,
}

/// Execute the `evaluate` command.
pub fn execute(config_path: &str, backend: BackendKind, gradient: bool) -> CliResult<()> {
    let text = fs::read_to_string(config_path)?;
    let config = RunConfig::from_toml(&text)?;
    let with_gradient = gradient || config.points.gradients;

    println!("{} Evaluating expected improvement", "→".bright_cyan());
    println!("  {} Config: {}", "•".dimmed(), config_path.bright_yellow());
    println!(
        "  {} Candidates: {} (+{} being sampled), dim {}",
        "•".dimmed(),
        config.points.to_sample.len().to_string().bright_yellow(),
        config.points.being_sampled.len(),
        config.dim()
    );

    let start = Instant::now();
    let report = match backend {
        BackendKind::Cpu => run(&config, Arc::new(CpuBackend::new()), with_gradient)?,
        BackendKind::Cuda => {
            if !is_cuda_available() {
                return Err(CliError::FeatureNotAvailable(
                    "CUDA backend".to_string(),
                    "cuda".to_string(),
                ));
            }
            run(&config, Arc::new(CudaBackend::new()?), with_gradient)?
        }
    };
    let elapsed = start.elapsed();

    print_report(&report, config.dim());
    println!(
        "\n{} Done in {:.2?}",
        "✓".bright_green(),
        elapsed
    );
    Ok(())
}

/// Fit the GP, build evaluator and state, and evaluate on `backend`.
pub fn run<B: ComputeBackend>(
    config: &RunConfig,
    backend: Arc<B>,
    with_gradient: bool,
) -> CliResult<EvaluationReport> {
    let gp = config.build_gp()?;
    let to_sample = config.points_to_sample()?;
    let being_sampled = config.points_being_sampled()?;

    let evaluator = ExpectedImprovementEvaluator::new(&gp, Arc::clone(&backend), &config.evaluator)?;
    let mut state = ExpectedImprovementState::new(
        &evaluator,
        &to_sample,
        &being_sampled,
        config.points.to_sample.len(),
        config.points.being_sampled.len(),
        with_gradient,
        PhiloxRng::new(config.points.seed, 0),
    )?;

    let expected_improvement = evaluator.compute_expected_improvement(&mut state)?;
    let gradient = if with_gradient {
        let mut grad = vec![0.0; state.get_problem_size()];
        evaluator.compute_grad_expected_improvement(&mut state, &mut grad)?;
        Some(grad)
    } else {
        None
    };
    debug!("EI={} on {}", expected_improvement, backend.name());

    drop(state);
    Ok(EvaluationReport {
        backend: backend.name().to_string(),
        effective_draws: evaluator.effective_draws(),
        expected_improvement,
        gradient,
        memory: backend.memory_tracker().stats(),
    })
}

fn print_report(report: &EvaluationReport, dim: usize) {
    println!();
    println!("{}:", "Result".bright_white().underline());
    println!("  Backend:          {}", report.backend.bright_white());
    println!("  Effective draws:  {}", report.effective_draws);
    println!(
        "  EI:               {}",
        format!("{:.6e}", report.expected_improvement).bright_green()
    );

    if let Some(gradient) = &report.gradient {
        println!("  Gradient:");
        for (p, row) in gradient.chunks(dim.max(1)).enumerate() {
            let coords: Vec<String> = row.iter().map(|g| format!("{g:+.6e}")).collect();
            println!("    point {}: [{}]", p, coords.join(", "));
        }
    }

    println!(
        "  Device memory:    peak {} bytes, {} allocations, {} live",
        report.memory.peak_bytes, report.memory.total_allocations, report.memory.active_allocations
    );
}
