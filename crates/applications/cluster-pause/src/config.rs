//! Transition configuration
//!
//! Every constant the pipelines depend on lives in [`PauseConfig`]. The defaults
//! match the production EKS environments; tests shrink the timings.

use crate::retry::RetryPolicy;
use k8s_openapi::api::core::v1::{Taint, Toleration};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Tag key (and value = namespace) marking every provider resource of an environment
pub const DEFAULT_CLUSTER_TAG_KEY: &str = "KubernetesCluster";

/// Key of the scheduling-exclusion taint and its matching toleration
pub const MARKER_KEY: &str = "start_stop";

/// Effect of the exclusion taint
pub const MARKER_EFFECT: &str = "NoExecute";

/// Taint value applied to nodes during both transitions
pub const TAINT_VALUE: &str = "test";

/// Toleration value written on stop; never matches [`TAINT_VALUE`]
pub const STOP_TOLERATION_VALUE: &str = "no_toleration";

/// Toleration value written on start; matches [`TAINT_VALUE`]
pub const START_TOLERATION_VALUE: &str = "test";

/// Namespace of the cluster-autoscaler deployment and of etcd
pub const KUBE_SYSTEM: &str = "kube-system";

/// Legacy DNS namespace that also hosts system workloads
pub const LEGACY_SKYDNS: &str = "legacy-skydns";

/// Cluster-autoscaler deployment name
pub const CLUSTER_AUTOSCALER: &str = "cluster-autoscaler";

/// The exclusion marker: a fixed key and effect, with a per-use value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    /// Taint/toleration key
    pub key: String,
    /// Taint effect
    pub effect: String,
}

impl Default for Marker {
    fn default() -> Self {
        Self {
            key: MARKER_KEY.to_string(),
            effect: MARKER_EFFECT.to_string(),
        }
    }
}

impl Marker {
    /// Node taint carrying `value`
    pub fn taint(&self, value: &str) -> Taint {
        Taint {
            key: self.key.clone(),
            value: Some(value.to_string()),
            effect: self.effect.clone(),
            time_added: None,
        }
    }

    /// Pod toleration matching `value` exactly
    pub fn toleration(&self, value: &str) -> Toleration {
        Toleration {
            key: Some(self.key.clone()),
            operator: Some("Equal".to_string()),
            value: Some(value.to_string()),
            ..Default::default()
        }
    }

    /// Whether `taint` is this marker, whatever its value
    pub fn is_taint(&self, taint: &Taint) -> bool {
        taint.key == self.key
    }

    /// Whether `toleration` targets this marker
    pub fn is_toleration(&self, toleration: &Toleration) -> bool {
        toleration.key.as_deref() == Some(self.key.as_str())
    }
}

/// Configuration shared by the stop and start pipelines
#[derive(Debug, Clone)]
pub struct PauseConfig {
    /// Tag key identifying environment instances and scaling groups
    pub cluster_tag_key: String,

    /// Exclusion marker
    pub marker: Marker,

    /// Taint value applied on stop
    pub stop_taint_value: String,

    /// Taint value applied on start
    pub start_taint_value: String,

    /// Toleration value written to system workloads on stop
    pub stop_toleration_value: String,

    /// Toleration value written to system workloads on start
    pub start_toleration_value: String,

    /// Namespaces whose workloads get the marker toleration
    pub system_namespaces: Vec<String>,

    /// Daemon sets eligible for toleration patching
    pub daemon_set_allow_list: Vec<String>,

    /// Workloads left untouched on start, per namespace
    pub start_excludes: HashMap<String, Vec<String>>,

    /// Namespace of the cluster-autoscaler deployment
    pub autoscaler_namespace: String,

    /// Name of the cluster-autoscaler deployment
    pub autoscaler_deployment: String,

    /// Replicas restored when the cluster-autoscaler is re-enabled
    pub autoscaler_replicas: i32,

    /// Namespace of the etcd pods
    pub etcd_namespace: String,

    /// Label selector of the etcd pods
    pub etcd_selector: String,

    /// Minimum number of etcd pods for quorum
    pub etcd_quorum: usize,

    /// Interval between convergence checks
    pub poll_interval: Duration,

    /// Deadline for managed-database convergence
    pub database_deadline: Duration,

    /// Upper bound of the stop-side pod evacuation wait
    pub evacuation_timeout: Duration,

    /// Retry policy for node taint/untaint passes
    pub taint_retry: RetryPolicy,

    /// Retry policy for throttled scaling-group calls
    pub autoscaling_retry: RetryPolicy,

    /// Settle time before untainting on start
    pub pre_untaint_wait: Duration,

    /// Settle time after untainting on start
    pub post_untaint_wait: Duration,

    /// Grace window before releasing scaling groups, and again before restarting unready pods
    pub grace_window: Duration,

    /// Number of progress log lines per grace window
    pub grace_steps: u32,
}

impl Default for PauseConfig {
    fn default() -> Self {
        let mut start_excludes = HashMap::new();
        start_excludes.insert(KUBE_SYSTEM.to_string(), vec![CLUSTER_AUTOSCALER.to_string()]);

        Self {
            cluster_tag_key: DEFAULT_CLUSTER_TAG_KEY.to_string(),
            marker: Marker::default(),
            stop_taint_value: TAINT_VALUE.to_string(),
            start_taint_value: TAINT_VALUE.to_string(),
            stop_toleration_value: STOP_TOLERATION_VALUE.to_string(),
            start_toleration_value: START_TOLERATION_VALUE.to_string(),
            system_namespaces: vec![KUBE_SYSTEM.to_string(), LEGACY_SKYDNS.to_string()],
            daemon_set_allow_list: vec!["aws-node".to_string(), "kube-proxy".to_string()],
            start_excludes,
            autoscaler_namespace: KUBE_SYSTEM.to_string(),
            autoscaler_deployment: CLUSTER_AUTOSCALER.to_string(),
            autoscaler_replicas: 1,
            etcd_namespace: KUBE_SYSTEM.to_string(),
            etcd_selector: "app=etcd".to_string(),
            etcd_quorum: 3,
            poll_interval: Duration::from_secs(crate::wait::DEFAULT_POLL_INTERVAL_SECS),
            database_deadline: Duration::from_secs(30 * 60),
            evacuation_timeout: Duration::from_secs(60),
            taint_retry: RetryPolicy::new(15, Duration::from_secs(10)),
            autoscaling_retry: RetryPolicy::new(5, Duration::from_secs(5)),
            pre_untaint_wait: Duration::from_secs(60),
            post_untaint_wait: Duration::from_secs(10),
            grace_window: Duration::from_secs(10 * 60),
            grace_steps: 10,
        }
    }
}

impl PauseConfig {
    /// Set the environment tag key
    pub fn with_cluster_tag_key(mut self, key: impl Into<String>) -> Self {
        self.cluster_tag_key = key.into();
        self
    }

    /// Set the managed-database deadline
    pub fn with_database_deadline(mut self, deadline: Duration) -> Self {
        self.database_deadline = deadline;
        self
    }

    /// Set the grace window used twice during start
    pub fn with_grace_window(mut self, window: Duration) -> Self {
        self.grace_window = window;
        self
    }

    /// Names excluded from start-side toleration patching in `namespace`
    pub fn start_excludes_for(&self, namespace: &str) -> &[String] {
        self.start_excludes
            .get(namespace)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}
