//! Error types for Expected Improvement evaluation.

use thiserror::Error;

/// Result type alias using [`EiError`].
pub type Result<T> = std::result::Result<T, EiError>;

/// Errors raised by the evaluator, its states and the compute backends.
///
/// None of these are recovered inside the crate. A failed compute call aborts
/// that single evaluation and the caller decides whether to skip, retry or
/// abort the optimization run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EiError {
    /// Device memory allocation or deallocation failed.
    ///
    /// The state owning the buffer must be rebuilt before reuse.
    #[error("GPU resource error: {message}")]
    GpuResource {
        /// Diagnostic message reported by the backend.
        message: String,
    },

    /// Kernel launch or host/device transfer failed.
    #[error("GPU execution error: {message}")]
    GpuExecution {
        /// Diagnostic message reported by the backend.
        message: String,
    },

    /// Device activation failed (wrong device id, no device present).
    #[error("GPU activation error on device {device_id}: {message}")]
    GpuActivation {
        /// Device that could not be activated.
        device_id: usize,
        /// Diagnostic message reported by the backend.
        message: String,
    },

    /// Parameters cannot describe a valid evaluation.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The state was not set up for the requested operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Gaussian process collaborator failure.
    #[error("Model error: {0}")]
    Model(String),

    /// Backend was compiled out or is not present on this host.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl EiError {
    /// Wrap a backend status as a resource failure.
    pub fn resource(status: impl std::fmt::Display) -> Self {
        EiError::GpuResource {
            message: status.to_string(),
        }
    }

    /// Wrap a backend status as an execution failure.
    pub fn execution(status: impl std::fmt::Display) -> Self {
        EiError::GpuExecution {
            message: status.to_string(),
        }
    }

    /// Wrap a backend status as an activation failure for `device_id`.
    pub fn activation(device_id: usize, status: impl std::fmt::Display) -> Self {
        EiError::GpuActivation {
            device_id,
            message: status.to_string(),
        }
    }

    /// Returns true if this error comes from the device backend.
    pub fn is_gpu_error(&self) -> bool {
        matches!(
            self,
            EiError::GpuResource { .. }
                | EiError::GpuExecution { .. }
                | EiError::GpuActivation { .. }
        )
    }
}

/// Fail with [`EiError::InvalidConfiguration`] unless `actual == expected`.
pub(crate) fn check_len(what: &str, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(EiError::InvalidConfiguration(format!(
            "{what}: expected {expected} values, got {actual}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_message_is_preserved() {
        let err = EiError::execution("CUDA_ERROR_LAUNCH_FAILED");
        assert_eq!(
            err.to_string(),
            "GPU execution error: CUDA_ERROR_LAUNCH_FAILED"
        );
        assert!(err.is_gpu_error());
    }

    #[test]
    fn test_activation_names_device() {
        let err = EiError::activation(3, "invalid device ordinal");
        assert!(err.to_string().contains("device 3"));
        assert!(err.to_string().contains("invalid device ordinal"));
    }

    #[test]
    fn test_configuration_errors_are_not_gpu_errors() {
        assert!(!EiError::InvalidConfiguration("num_mc is zero".into()).is_gpu_error());
        assert!(!EiError::InvalidState("no gradients".into()).is_gpu_error());
    }

    #[test]
    fn test_check_len() {
        assert!(check_len("mean", 4, 4).is_ok());
        let err = check_len("mean", 3, 4).unwrap_err();
        assert_eq!(
            err,
            EiError::InvalidConfiguration("mean: expected 4 values, got 3".into())
        );
    }
}
