//! Error types for the VE OS service.
//!
//! One central error enum is used across the DMA manager, the signal
//! subsystem and the transfer facade. Request handlers convert an error into
//! a negated Linux errno before answering the pseudo process, so every
//! variant knows its errno mapping.

use thiserror::Error;

/// Result type alias for service operations.
pub type Result<T> = core::result::Result<T, VeosError>;

/// Main service error type.
#[derive(Debug, Error)]
#[must_use = "service errors must be handled, not silently discarded"]
pub enum VeosError {
    /// A caller-supplied argument was rejected.
    #[error("invalid argument '{name}': {value}")]
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },

    /// An address failed an alignment or range check.
    #[error("invalid address: {addr:#018x}")]
    InvalidAddress { addr: u64 },

    /// Virtual-to-physical translation failed.
    #[error("translation fault at {addr:#018x}")]
    TranslationFault { addr: u64 },

    /// A task or other identified resource was not found.
    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: u64 },

    /// The caller is not allowed to perform the operation.
    #[error("permission denied for operation: {operation}")]
    PermissionDenied { operation: &'static str },

    /// A bounded resource (queue slots, pending-signal budget) ran out.
    #[error("resource exhausted: {resource}")]
    ResourceExhausted { resource: &'static str },

    /// An allocation-backed request cannot be satisfied.
    #[error("out of memory: {requested} bytes requested")]
    OutOfMemory { requested: u64 },

    /// The DMA engine or another device reported a hardware error.
    #[error("hardware error on {device}: code {code:#x}")]
    HardwareError { device: &'static str, code: u32 },

    /// The resource is in use and the operation cannot proceed.
    #[error("{resource} is busy")]
    Busy { resource: &'static str },

    /// A bounded wait expired.
    #[error("timeout during {operation}")]
    Timeout { operation: &'static str },

    /// The operation was canceled, typically by engine shutdown.
    #[error("{operation} was canceled")]
    Canceled { operation: &'static str },

    /// A subsystem was used before it was brought up.
    #[error("subsystem not initialized: {subsystem}")]
    NotInitialized { subsystem: &'static str },

    /// Underlying OS I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VeosError {
    /// Negated Linux errno for the wire protocol.
    pub fn errno(&self) -> i64 {
        let e = match self {
            Self::InvalidArgument { .. } | Self::InvalidAddress { .. } => libc::EINVAL,
            Self::TranslationFault { .. } => libc::EFAULT,
            Self::NotFound { .. } => libc::ESRCH,
            Self::PermissionDenied { .. } => libc::EPERM,
            Self::ResourceExhausted { .. } => libc::EAGAIN,
            Self::OutOfMemory { .. } => libc::ENOMEM,
            Self::HardwareError { .. } => libc::EIO,
            Self::Busy { .. } => libc::EBUSY,
            Self::Timeout { .. } => libc::ETIMEDOUT,
            Self::Canceled { .. } => libc::ECANCELED,
            Self::NotInitialized { .. } => libc::EIO,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        };
        -(e as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        let err = VeosError::InvalidArgument {
            name: "length",
            value: "not 8-byte aligned",
        };
        assert_eq!(err.errno(), -(libc::EINVAL as i64));

        let err = VeosError::NotFound {
            resource: "task",
            id: 42,
        };
        assert_eq!(err.errno(), -(libc::ESRCH as i64));

        let err = VeosError::TranslationFault { addr: 0x6000_0000 };
        assert_eq!(err.errno(), -(libc::EFAULT as i64));
    }

    #[test]
    fn test_display_names_the_argument() {
        let err = VeosError::InvalidArgument {
            name: "srcaddr",
            value: "unaligned",
        };
        assert!(format!("{err}").contains("srcaddr"));
    }
}
