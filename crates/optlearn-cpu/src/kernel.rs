//! Reference Monte-Carlo EI kernels.
//!
//! One Monte-Carlo draw turns `num_union` independent standard normals `z`
//! into a joint posterior sample `y = mu + L z` and scores the improvement
//! `max(0, best_so_far - min_i y_i)`. The gradient path differentiates that
//! improvement pathwise through the mean and Cholesky gradients.

use optlearn_core::backend::KernelParams;
use optlearn_montecarlo::{NormalSource, PhiloxRng};

/// Improvement of one joint sample and the index of its minimum.
///
/// Returns `(0.0, None)` when no component beats `best_so_far` or when the
/// union is empty.
pub fn sample_improvement(
    mu: &[f64],
    chol: &[f64],
    normals: &[f64],
    best_so_far: f64,
) -> (f64, Option<usize>) {
    let n = mu.len();
    let mut winner = None;
    let mut min_value = f64::INFINITY;

    for i in 0..n {
        let row = &chol[i * n..i * n + i + 1];
        let value = mu[i]
            + row
                .iter()
                .zip(&normals[..=i])
                .map(|(l, z)| l * z)
                .sum::<f64>();
        if value < min_value {
            min_value = value;
            winner = Some(i);
        }
    }

    let improvement = best_so_far - min_value;
    if improvement > 0.0 {
        (improvement, winner)
    } else {
        (0.0, None)
    }
}

/// Add the pathwise derivative of one draw's improvement to `grad`.
///
/// `grad` is `[num_to_sample][dim]`. Only the winning point's sample value
/// moves the improvement, and `d improvement = -d y_winner`.
pub fn accumulate_grad_improvement(
    winner: usize,
    normals: &[f64],
    grad_mu: &[f64],
    grad_chol: &[f64],
    num_union: usize,
    num_to_sample: usize,
    dim: usize,
    grad: &mut [f64],
) {
    let n = num_union;
    for p in 0..num_to_sample {
        for d in 0..dim {
            let slot = p * dim + d;
            let chol_row = &grad_chol[(slot * n + winner) * n..(slot * n + winner) * n + winner + 1];
            let mut dy = chol_row
                .iter()
                .zip(&normals[..=winner])
                .map(|(l, z)| l * z)
                .sum::<f64>();
            if winner == p {
                dy += grad_mu[slot];
            }
            grad[slot] -= dy;
        }
    }
}

/// Normals consumed by one device thread, in draw order.
enum ThreadNormals<'a> {
    /// Philox stream `(seed, thread)`.
    Generated(PhiloxRng),
    /// Slice of externally supplied draws for this thread.
    Fixed { draws: &'a [f64], offset: usize },
}

impl<'a> ThreadNormals<'a> {
    fn for_thread(params: &KernelParams, thread: usize, fixed: Option<&'a [f64]>) -> Self {
        match fixed {
            Some(draws) => ThreadNormals::Fixed {
                draws,
                offset: thread * params.draws_per_thread * params.num_union,
            },
            None => ThreadNormals::Generated(PhiloxRng::new(params.seed, thread as u64)),
        }
    }

    fn next_draw(&mut self, out: &mut [f64]) {
        match self {
            ThreadNormals::Generated(rng) => rng.fill_normal(out),
            ThreadNormals::Fixed { draws, offset } => {
                out.copy_from_slice(&draws[*offset..*offset + out.len()]);
                *offset += out.len();
            }
        }
    }
}

/// Sum of improvements over every draw of every thread in `block`.
pub fn ei_block_partial(
    params: &KernelParams,
    mu: &[f64],
    chol: &[f64],
    fixed: Option<&[f64]>,
    block: usize,
) -> f64 {
    let tpb = params.grid.threads_per_block;
    let mut normals = vec![0.0; params.num_union];
    let mut sum = 0.0;

    for thread in block * tpb..(block + 1) * tpb {
        let mut stream = ThreadNormals::for_thread(params, thread, fixed);
        for _ in 0..params.draws_per_thread {
            stream.next_draw(&mut normals);
            sum += sample_improvement(mu, chol, &normals, params.best_so_far).0;
        }
    }
    sum
}

/// Sum of improvement gradients over every draw of every thread in `block`.
///
/// Returns `[num_to_sample][dim]` partial sums.
pub fn grad_ei_block_partial(
    params: &KernelParams,
    mu: &[f64],
    chol: &[f64],
    grad_mu: &[f64],
    grad_chol: &[f64],
    fixed: Option<&[f64]>,
    block: usize,
) -> Vec<f64> {
    let tpb = params.grid.threads_per_block;
    let mut normals = vec![0.0; params.num_union];
    let mut grad = vec![0.0; params.num_to_sample * params.dim];

    for thread in block * tpb..(block + 1) * tpb {
        let mut stream = ThreadNormals::for_thread(params, thread, fixed);
        for _ in 0..params.draws_per_thread {
            stream.next_draw(&mut normals);
            if let (_, Some(winner)) = sample_improvement(mu, chol, &normals, params.best_so_far) {
                accumulate_grad_improvement(
                    winner,
                    &normals,
                    grad_mu,
                    grad_chol,
                    params.num_union,
                    params.num_to_sample,
                    params.dim,
                    &mut grad,
                );
            }
        }
    }
    grad
}

#[cfg(test)]
mod tests {
    use super::*;
    use optlearn_core::LaunchGrid;

    fn params(num_union: usize, num_to_sample: usize, dim: usize) -> KernelParams {
        KernelParams {
            num_union,
            num_to_sample,
            dim,
            best_so_far: 0.0,
            draws_per_thread: 2,
            grid: LaunchGrid::new(2, 2),
            seed: 11,
        }
    }

    #[test]
    fn test_sample_improvement_single_point() {
        let (imp, winner) = sample_improvement(&[0.0], &[2.0], &[-0.5], 0.0);
        assert_eq!(imp, 1.0);
        assert_eq!(winner, Some(0));

        let (imp, winner) = sample_improvement(&[0.0], &[2.0], &[0.5], 0.0);
        assert_eq!(imp, 0.0);
        assert_eq!(winner, None);
    }

    #[test]
    fn test_sample_improvement_uses_lower_triangle() {
        // L = [[1, 0], [0.5, 2]], z = [1, -1] -> y = [1 + 1, 0.5 - 2] = [2, -1.5]
        let mu = [1.0, 0.0];
        let chol = [1.0, 99.0, 0.5, 2.0];
        let (imp, winner) = sample_improvement(&mu, &chol, &[1.0, -1.0], 0.0);
        assert_eq!(winner, Some(1));
        assert!((imp - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_empty_union_has_no_improvement() {
        assert_eq!(sample_improvement(&[], &[], &[], 10.0), (0.0, None));
    }

    #[test]
    fn test_grad_winner_term() {
        // One point, dim 1: y = mu + l z, d imp/dx = -(dmu + dl z)
        let mut grad = vec![0.0];
        accumulate_grad_improvement(0, &[2.0], &[0.5], &[0.25], 1, 1, 1, &mut grad);
        assert!((grad[0] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_grad_non_winner_skips_mean() {
        // Two points, derivative w.r.t. point 0, winner is point 1.
        let grad_mu = [3.0];
        // grad_chol[0][0] = [[0, 0], [0.5, 0.0]]
        let grad_chol = [0.0, 0.0, 0.5, 0.0];
        let mut grad = vec![0.0];
        accumulate_grad_improvement(1, &[2.0, 1.0], &grad_mu, &grad_chol, 2, 1, 1, &mut grad);
        assert!((grad[0] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_fixed_draws_follow_thread_layout() {
        let p = params(1, 1, 1);
        // 4 threads x 2 draws x 1 point; block 1 owns threads 2 and 3
        let draws = [0.0, 0.0, 0.0, 0.0, -1.0, -2.0, -3.0, 0.5];
        let partial = ei_block_partial(&p, &[0.0], &[1.0], Some(&draws), 1);
        assert!((partial - 6.0).abs() < 1e-12);
        let partial = ei_block_partial(&p, &[0.0], &[1.0], Some(&draws), 0);
        assert_eq!(partial, 0.0);
    }

    #[test]
    fn test_generated_draws_are_deterministic() {
        let p = params(2, 1, 1);
        let chol = [1.0, 0.0, 0.3, 0.9];
        let a = ei_block_partial(&p, &[0.1, -0.2], &chol, None, 0);
        let b = ei_block_partial(&p, &[0.1, -0.2], &chol, None, 0);
        assert_eq!(a, b);
    }
}
