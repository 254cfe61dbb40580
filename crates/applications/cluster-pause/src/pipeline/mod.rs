//! Environment transitions
//!
//! ```text
//!            stop                          start
//! RUNNING ──────────► STOPPING ──► STOPPED ──────────► STARTING ──► RUNNING
//!          suspend ASG                       scale autoscaler 0
//!          tolerate(no_toleration)           taint, tolerate(test)
//!          taint, evacuate                   start EC2, wait nodes
//!          stop EC2, delete pods             start RDS, etcd quorum
//!          detach volumes, stop RDS          untaint, restart, resume ASG
//! ```
//!
//! Each pipeline is a strictly sequential script. A failing step aborts the run and
//! the error names the step. Nothing is checkpointed: a rerun re-discovers state
//! and the per-step operations tolerate already-applied work.

mod start;
mod stop;

pub use start::StartPipeline;
pub use stop::StopPipeline;

use crate::autoscaling::AutoscalingApi;
use crate::cluster::{ClusterApi, ClusterConnector};
use crate::config::PauseConfig;
use crate::database::DatabaseApi;
use crate::error::{PauseError, Result, StepExt};
use crate::instance::ComputeApi;
use crate::pods::Evacuation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// The environment being transitioned, identified by its namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    namespace: String,
}

impl Environment {
    /// Create an environment; the namespace must not be blank
    pub fn new(namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into().trim().to_string();
        if namespace.is_empty() {
            return Err(PauseError::config("Environment namespace must not be empty"));
        }
        Ok(Self { namespace })
    }

    /// Namespace (the cluster tag value)
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.namespace)
    }
}

/// Requested transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PauseAction {
    /// STOPPED → RUNNING
    Start,
    /// RUNNING → STOPPED
    Stop,
}

impl PauseAction {
    /// Operator-facing description shown before confirmation
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Start => "About to start an eks cluster",
            Self::Stop => "About to stop an eks cluster",
        }
    }
}

impl std::fmt::Display for PauseAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Stop => f.write_str("stop"),
        }
    }
}

/// External systems a transition drives
#[derive(Clone)]
pub struct Collaborators {
    /// Produces fresh Kubernetes clients
    pub connector: Arc<dyn ClusterConnector>,
    /// EC2 instances and volumes
    pub compute: Arc<dyn ComputeApi>,
    /// RDS clusters
    pub database: Arc<dyn DatabaseApi>,
    /// Auto Scaling groups
    pub autoscaling: Arc<dyn AutoscalingApi>,
}

impl Collaborators {
    /// Re-acquire the cluster client; tokens may have expired during a long wait
    pub(crate) async fn cluster(&self, step: &'static str) -> Result<Arc<dyn ClusterApi>> {
        debug!(step, "Acquiring cluster client");
        self.connector.connect().await.step(step)
    }
}

/// What a transition touched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionSummary {
    /// Action performed
    pub action: PauseAction,
    /// Environment namespace
    pub namespace: String,
    /// When the transition began
    pub started_at: DateTime<Utc>,
    /// When the transition finished
    pub finished_at: Option<DateTime<Utc>>,
    /// Instances started or stopped
    pub instances: Vec<String>,
    /// Database clusters started or stopped
    pub database_clusters: Vec<String>,
    /// Scaling groups suspended or resumed
    pub autoscaling_groups: Vec<String>,
    /// Nodes patched by the taint step
    pub nodes_tainted: usize,
    /// Nodes patched by the untaint step
    pub nodes_untainted: usize,
    /// Workloads whose tolerations were patched
    pub workloads_patched: Vec<String>,
    /// Pods deleted across all restart steps
    pub pods_deleted: usize,
    /// Volumes detached
    pub volumes_detached: Vec<String>,
    /// Outcome of the evacuation wait (stop only)
    pub evacuation: Option<Evacuation>,
}

impl TransitionSummary {
    pub(crate) fn begin(action: PauseAction, env: &Environment) -> Self {
        Self {
            action,
            namespace: env.namespace().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            instances: Vec::new(),
            database_clusters: Vec::new(),
            autoscaling_groups: Vec::new(),
            nodes_tainted: 0,
            nodes_untainted: 0,
            workloads_patched: Vec::new(),
            pods_deleted: 0,
            volumes_detached: Vec::new(),
            evacuation: None,
        }
    }

    pub(crate) fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }

    /// Wall-clock duration, once finished
    pub fn duration_secs(&self) -> Option<i64> {
        self.finished_at.map(|end| (end - self.started_at).num_seconds())
    }
}

/// Run `action` against `env`
pub async fn run(
    action: PauseAction,
    env: &Environment,
    include_database: bool,
    config: PauseConfig,
    collaborators: Collaborators,
) -> Result<TransitionSummary> {
    match action {
        PauseAction::Start => {
            StartPipeline::new(config, collaborators)
                .run(env, include_database)
                .await
        }
        PauseAction::Stop => {
            StopPipeline::new(config, collaborators)
                .run(env, include_database)
                .await
        }
    }
}
