//! # Cluster Pause
//!
//! Pauses and resumes a whole EKS environment: its Kubernetes nodes and system
//! workloads, EC2 instances, RDS Aurora clusters and Auto Scaling groups.
//!
//! ## Architecture
//!
//! ```text
//! pipeline::{StopPipeline, StartPipeline}
//! ├── TaintController        ──┐
//! ├── TolerationReconciler     ├── ClusterApi (kube)
//! ├── PodController          ──┘
//! ├── ComputeController      ───── ComputeApi (EC2)
//! ├── DatabaseController     ───── DatabaseApi (RDS)
//! └── AutoscalingController  ───── AutoscalingApi (ASG)
//! ```
//!
//! Controllers own the algorithms; the `*Api` traits are thin provider seams with
//! one production implementation each. Every wait is a poll of external state
//! (see [`wait`]), and every run re-discovers the environment from its tags.
//!
//! ## Marker
//!
//! A `start_stop` taint with effect `NoExecute` keeps ordinary pods off the nodes
//! while an environment is stopped or coming back. System workloads carry a
//! matching toleration on start, and a deliberately non-matching one on stop so
//! the taint evicts them as well.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod autoscaling;
pub mod cluster;
pub mod config;
pub mod database;
pub mod error;
pub mod instance;
pub mod pipeline;
pub mod pods;
pub mod retry;
pub mod taint;
pub mod toleration;
pub mod wait;

#[cfg(test)]
pub(crate) mod fake;

// ============================================================================
// Public exports - Transitions
// ============================================================================

pub use pipeline::{
    Collaborators, Environment, PauseAction, StartPipeline, StopPipeline, TransitionSummary,
};

// ============================================================================
// Public exports - Controllers and provider seams
// ============================================================================

// Error handling
pub use error::{PauseError, Result, StepExt};

// Configuration
pub use config::{Marker, PauseConfig};

// Kubernetes
pub use cluster::{ClusterApi, ClusterConnector, KubeCluster, KubeConnector, WorkloadKind};
pub use pods::{Evacuation, PodController, PodScope};
pub use taint::TaintController;
pub use toleration::{ReconcileReport, TolerationReconciler};

// EC2
pub use instance::{
    ComputeApi, ComputeController, DEFAULT_REGION, Ec2Compute, Ec2Instance, InstanceState,
    load_aws_config,
};

// RDS
pub use database::{DatabaseApi, DatabaseController, DbCluster, RdsDatabase};

// Auto Scaling
pub use autoscaling::{
    AsgAutoscaling, AutoscalingApi, AutoscalingController, RESUME_PROCESSES, ScalingProcess,
};

// Waiting and retries
pub use retry::RetryPolicy;
pub use wait::{Progress, poll_until, poll_until_deadline};
