//! Controller-specific error types.
//!
//! Errors are grouped into three classes that decide what the worker does
//! with a failed key: transient failures are retried with backoff, invariant
//! violations are reported on the resource status and retried, and fatal
//! errors stop the process.

use ipam::IpamError;
use kube::Error as KubeError;
use sdn_client::SdnError;
use std::fmt;
use thiserror::Error;

/// How a failure is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Requeue with backoff
    Transient,
    /// Bad input or conflicting state; report on the resource and retry with backoff
    InvariantViolation,
    /// Terminate the process
    Fatal,
}

/// Bootstrap step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootstrapPhase {
    AwaitLeadership,
    SyncCaches,
    InitDefaultVpc,
    InitTopology,
    InitIpam,
    GarbageCollect,
    StartWorkers,
    Running,
}

impl fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootstrapPhase::AwaitLeadership => "AwaitLeadership",
            BootstrapPhase::SyncCaches => "SyncCaches",
            BootstrapPhase::InitDefaultVpc => "InitDefaultVpc",
            BootstrapPhase::InitTopology => "InitTopology",
            BootstrapPhase::InitIpam => "InitIpam",
            BootstrapPhase::GarbageCollect => "GarbageCollect",
            BootstrapPhase::StartWorkers => "StartWorkers",
            BootstrapPhase::Running => "Running",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in the SDN Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Logical network control plane error
    #[error("SDN error: {0}")]
    Sdn(#[from] SdnError),

    /// Address allocation error
    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Referenced object is not (yet) in the cache
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource spec conflicts with other resources or is malformed
    #[error("Invalid resource {resource}: {reason}")]
    InvalidResource { resource: String, reason: String },

    /// Bootstrap phase failed
    #[error("Bootstrap failed in phase {phase}: {reason}")]
    Bootstrap { phase: BootstrapPhase, reason: String },

    /// Leader election failure
    #[error("Leader election failed: {0}")]
    LeaderElection(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            ControllerError::Kube(_) | ControllerError::NotFound(_) | ControllerError::Watch(_) => {
                ErrorClass::Transient
            }
            ControllerError::Sdn(e) if e.is_retryable() => ErrorClass::Transient,
            ControllerError::Sdn(_) => ErrorClass::InvariantViolation,
            ControllerError::Ipam(_) | ControllerError::InvalidResource { .. } => {
                ErrorClass::InvariantViolation
            }
            ControllerError::InvalidConfig(_)
            | ControllerError::Bootstrap { .. }
            | ControllerError::LeaderElection(_) => ErrorClass::Fatal,
        }
    }

    /// Wraps any error as a failure of `phase`.
    pub fn bootstrap(phase: BootstrapPhase, reason: impl fmt::Display) -> Self {
        ControllerError::Bootstrap {
            phase,
            reason: reason.to_string(),
        }
    }

    /// True for a Kubernetes 404.
    pub fn is_not_found(&self) -> bool {
        match self {
            ControllerError::Kube(KubeError::Api(response)) => response.code == 404,
            ControllerError::NotFound(_) => true,
            _ => false,
        }
    }
}
