//! Error types for graph construction, compilation and execution.

use ash::vk;
use thiserror::Error;

/// Coarse classification of a [`GraphError`].
///
/// Every error belongs to exactly one phase of the graph lifecycle:
/// construction, compilation, per-frame usage, or the native device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected at graph-construction time (wiring, handles, options).
    Configuration,
    /// Rejected during compilation (topology, element setup).
    Compile,
    /// Rejected at record/dispatch/accessor time.
    Usage,
    /// A native Vulkan call failed.
    Device,
}

/// Errors produced by the graph engine.
///
/// All errors are unrecoverable at the point of detection: a failing
/// `setup` or `compile_from` leaves the graph in a condemned state that
/// must be discarded, not reused.
#[derive(Debug, Error)]
pub enum GraphError {
    /// An input slot was wired to an element that does not satisfy the
    /// consumer's capability predicate.
    #[error("type mismatch: {element} slot {slot} cannot accept '{candidate}': {reason}")]
    TypeMismatch {
        element: String,
        slot: u32,
        candidate: String,
        reason: &'static str,
    },

    /// An input slot index is outside the range an element declares.
    #[error("{element}: input slot {slot} is out of range")]
    SlotOutOfRange { element: String, slot: u32 },

    /// A node handle does not refer to a node in the graph.
    #[error("unknown node handle")]
    UnknownNode,

    /// An executor option is invalid (e.g. zero paths).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The graph contains a cyclic dependency and cannot be ordered.
    #[error("graph contains a cyclic dependency")]
    CyclicDependency,

    /// An input redirection chain loops back on itself.
    #[error("redirect cycle while resolving input slot {slot} of {element}")]
    RedirectCycle { element: String, slot: u32 },

    /// A required input slot was never wired.
    #[error("{element}: missing required input at slot {slot}")]
    MissingInput { element: String, slot: u32 },

    /// An element rejected its own configuration during setup
    /// (zero-length input, unbindable capability, bad dimensions).
    #[error("{element}: {reason}")]
    InvalidElement { element: String, reason: String },

    /// Shader loading or compilation failed.
    #[error("shader error: {0}")]
    Shader(String),

    /// `record` was invoked before `setup`.
    #[error("{element}: recorded before setup")]
    NotInitialized { element: String },

    /// `setup` was invoked more than once on the same element.
    #[error("{element}: setup invoked more than once")]
    AlreadyInitialized { element: String },

    /// Push constants were declared (non-void `P`) but no values were set.
    #[error("{element}: push constants declared but no values supplied")]
    MissingPushConstants { element: String },

    /// A path identifier is outside `0..number_paths`.
    #[error("path {path} out of range ({paths} paths)")]
    PathOutOfRange { path: u32, paths: u32 },

    /// A host-side helper was misused (oversized transfer, wrong state).
    #[error("{element}: {reason}")]
    InvalidUsage { element: String, reason: String },

    /// A binding accessor was called on an element lacking that capability.
    #[error("{element} does not expose a {capability} binding")]
    MissingCapability {
        element: String,
        capability: &'static str,
    },

    /// Device bring-up failed (no instance, no suitable GPU, no queue).
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// A native Vulkan call returned a non-success status.
    #[error("device error: {call} returned {result:?}")]
    Device {
        call: &'static str,
        result: vk::Result,
    },

    /// A fence wait exceeded its bounded timeout. Distinguished from
    /// other device errors; never silently retried.
    #[error("timed out waiting for fence after {0} ns")]
    FenceTimeout(u64),
}

impl GraphError {
    /// Wrap a failing native call.
    pub fn device(call: &'static str, result: vk::Result) -> Self {
        Self::Device { call, result }
    }

    /// Which lifecycle phase this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TypeMismatch { .. }
            | Self::SlotOutOfRange { .. }
            | Self::UnknownNode
            | Self::InvalidConfiguration(_) => ErrorKind::Configuration,

            Self::CyclicDependency
            | Self::RedirectCycle { .. }
            | Self::MissingInput { .. }
            | Self::InvalidElement { .. }
            | Self::Shader(_) => ErrorKind::Compile,

            Self::NotInitialized { .. }
            | Self::AlreadyInitialized { .. }
            | Self::MissingPushConstants { .. }
            | Self::PathOutOfRange { .. }
            | Self::InvalidUsage { .. }
            | Self::MissingCapability { .. } => ErrorKind::Usage,

            Self::InitializationFailed(_) | Self::Device { .. } | Self::FenceTimeout(_) => {
                ErrorKind::Device
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphError::CyclicDependency;
        assert_eq!(err.to_string(), "graph contains a cyclic dependency");

        let err = GraphError::NotInitialized {
            element: "double".to_string(),
        };
        assert_eq!(err.to_string(), "double: recorded before setup");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            GraphError::TypeMismatch {
                element: "a".into(),
                slot: 0,
                candidate: "b".into(),
                reason: "no buffer",
            }
            .kind(),
            ErrorKind::Configuration
        );
        assert_eq!(GraphError::CyclicDependency.kind(), ErrorKind::Compile);
        assert_eq!(
            GraphError::PathOutOfRange { path: 3, paths: 2 }.kind(),
            ErrorKind::Usage
        );
        assert_eq!(GraphError::FenceTimeout(1).kind(), ErrorKind::Device);
        assert_eq!(
            GraphError::device("vkQueueSubmit", vk::Result::ERROR_DEVICE_LOST).kind(),
            ErrorKind::Device
        );
    }
}
