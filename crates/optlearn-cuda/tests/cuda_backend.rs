//! Device tests; they skip when no CUDA device is visible.

#![cfg(feature = "cuda")]

use optlearn_core::backend::{ComputeBackend, EiKernelArgs, GradEiKernelArgs, KernelParams};
use optlearn_core::{DeviceBuffer, EiError, LaunchGrid};
use optlearn_cpu::CpuBackend;
use optlearn_cuda::{is_cuda_available, CudaBackend};

fn params(num_union: usize, num_to_sample: usize, dim: usize) -> KernelParams {
    KernelParams {
        num_union,
        num_to_sample,
        dim,
        best_so_far: 0.2,
        draws_per_thread: 3,
        grid: LaunchGrid::new(32, 4),
        seed: 2024,
    }
}

fn inputs() -> (Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>) {
    let mu = vec![0.1, -0.3];
    let chol = vec![1.0, 0.0, 0.4, 0.8];
    let grad_mu = vec![0.5, -0.2];
    let grad_chol = vec![0.1, 0.0, 0.3, -0.2, 0.0, 0.0, 0.2, 0.1];
    (mu, chol, grad_mu, grad_chol)
}

fn cpu_partials(p: &KernelParams) -> (Vec<f64>, Vec<f64>) {
    let cpu = CpuBackend::new();
    cpu.activate(0).unwrap();
    let (mu, chol, grad_mu, grad_chol) = inputs();
    let mut ei = vec![0.0; p.ei_storage_len()];
    let mut grad = vec![0.0; p.grad_ei_storage_len()];
    cpu.launch_ei(EiKernelArgs {
        mu: &mu,
        chol_var: &chol,
        ei_storage: &mut ei,
        random_numbers: None,
        params: *p,
    })
    .unwrap();
    cpu.launch_grad_ei(GradEiKernelArgs {
        mu: &mu,
        chol_var: &chol,
        grad_mu: &grad_mu,
        grad_chol_var: &grad_chol,
        grad_ei_storage: &mut grad,
        random_numbers: None,
        params: *p,
    })
    .unwrap();
    (ei, grad)
}

#[test]
fn test_activation_binds_one_device() {
    if !is_cuda_available() {
        return;
    }
    let backend = CudaBackend::new().unwrap();
    backend.activate(0).unwrap();
    assert_eq!(backend.active_device(), Some(0));

    let err = backend.activate(backend.device_count()).unwrap_err();
    assert!(matches!(err, EiError::GpuActivation { .. }));
}

#[test]
fn test_round_trip_copy() {
    if !is_cuda_available() {
        return;
    }
    let backend = CudaBackend::new().unwrap();
    backend.activate(0).unwrap();
    let mut buf = DeviceBuffer::new(&backend, 4, "mu").unwrap();
    buf.upload(&backend, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let mut out = [0.0; 4];
    buf.download(&backend, &mut out).unwrap();
    assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_kernels_match_cpu_emulation() {
    if !is_cuda_available() {
        return;
    }
    let p = params(2, 1, 2);
    let (expected_ei, expected_grad) = cpu_partials(&p);

    let backend = CudaBackend::new().unwrap();
    backend.activate(0).unwrap();
    let (mu, chol, grad_mu, grad_chol) = inputs();
    let upload = |data: &[f64], label| {
        let mut buf = DeviceBuffer::new(&backend, data.len(), label).unwrap();
        buf.upload(&backend, data).unwrap();
        buf
    };
    let mu = upload(&mu, "mu");
    let chol = upload(&chol, "chol_var");
    let grad_mu = upload(&grad_mu, "grad_mu");
    let grad_chol = upload(&grad_chol, "grad_chol_var");
    let mut ei = DeviceBuffer::new(&backend, p.ei_storage_len(), "ei_storage").unwrap();
    let mut grad = DeviceBuffer::new(&backend, p.grad_ei_storage_len(), "grad_ei_storage").unwrap();

    backend
        .launch_ei(EiKernelArgs {
            mu: mu.raw(),
            chol_var: chol.raw(),
            ei_storage: ei.raw_mut(),
            random_numbers: None,
            params: p,
        })
        .unwrap();
    backend
        .launch_grad_ei(GradEiKernelArgs {
            mu: mu.raw(),
            chol_var: chol.raw(),
            grad_mu: grad_mu.raw(),
            grad_chol_var: grad_chol.raw(),
            grad_ei_storage: grad.raw_mut(),
            random_numbers: None,
            params: p,
        })
        .unwrap();

    let mut got_ei = vec![0.0; p.ei_storage_len()];
    ei.download(&backend, &mut got_ei).unwrap();
    let mut got_grad = vec![0.0; p.grad_ei_storage_len()];
    grad.download(&backend, &mut got_grad).unwrap();

    for (a, b) in got_ei.iter().zip(&expected_ei) {
        assert!((a - b).abs() < 1e-9, "{a} vs {b}");
    }
    for (a, b) in got_grad.iter().zip(&expected_grad) {
        assert!((a - b).abs() < 1e-9, "{a} vs {b}");
    }
}
