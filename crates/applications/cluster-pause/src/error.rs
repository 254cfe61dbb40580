//! Error types for the pause/resume orchestrator

use std::time::Duration;
use thiserror::Error;

/// Orchestrator result type
pub type Result<T> = std::result::Result<T, PauseError>;

/// Errors that can occur while pausing or resuming an environment
#[derive(Error, Debug)]
pub enum PauseError {
    /// EC2 SDK error
    #[error("AWS error: {0}")]
    Aws(#[from] aws_sdk_ec2::Error),

    /// Generic AWS service error (RDS, Auto Scaling)
    #[error("AWS service error: {0}")]
    AwsService(String),

    /// AWS API throttled the request; safe to retry
    #[error("AWS throttled the request: {0}")]
    Throttled(String),

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Kubeconfig or in-cluster credentials could not be loaded
    #[error("Kubernetes credentials error: {0}")]
    Credentials(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A bounded wait elapsed before its condition held
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Managed-database clusters did not reach the target state in time
    #[error("Timed out waiting for database clusters to be {target} (waited {timeout:?})")]
    ClustersNotConverged {
        /// Target status the clusters never reached
        target: String,
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// Nodes could not be tainted within the retry budget
    #[error("Nodes could not be tainted after {attempts} attempts: {last_error}")]
    NodeTaintFailed {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        last_error: String,
    },

    /// Nodes could not be untainted within the retry budget
    #[error("Nodes could not be untainted after {attempts} attempts: {last_error}")]
    NodeUntaintFailed {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        last_error: String,
    },

    /// The cluster-autoscaler deployment could not be scaled
    #[error("Failed scaling {deployment} to {replicas} replicas: {cause}")]
    ScaleFailed {
        /// Deployment name
        deployment: String,
        /// Requested replica count
        replicas: i32,
        /// Underlying failure
        cause: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A pipeline step failed; the transition stopped here
    #[error("step '{step}' failed: {source}")]
    Step {
        /// Human-readable step name
        step: &'static str,
        /// Underlying failure
        #[source]
        source: Box<PauseError>,
    },
}

impl PauseError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a credentials error
    pub fn credentials(err: impl std::fmt::Display) -> Self {
        Self::Credentials(err.to_string())
    }

    /// Convert from EC2 SDK error
    pub fn from_ec2<E>(err: E) -> Self
    where
        aws_sdk_ec2::Error: From<E>,
    {
        Self::Aws(aws_sdk_ec2::Error::from(err))
    }

    /// Convert from generic AWS SDK error
    pub fn from_aws<E>(err: E) -> Self
    where
        E: std::error::Error,
    {
        Self::AwsService(aws_sdk_ec2::error::DisplayErrorContext(err).to_string())
    }

    /// Whether the failure is worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Throttled(_) => true,
            Self::Step { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Whether the failure is a convergence timeout rather than an API rejection
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::ClustersNotConverged { .. } => true,
            Self::Step { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

/// Attach the failing pipeline step to an error
pub trait StepExt<T> {
    /// Wrap the error, if any, with the step name
    fn step(self, step: &'static str) -> Result<T>;
}

impl<T> StepExt<T> for Result<T> {
    fn step(self, step: &'static str) -> Result<T> {
        self.map_err(|source| PauseError::Step {
            step,
            source: Box::new(source),
        })
    }
}
