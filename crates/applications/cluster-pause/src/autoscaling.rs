//! Auto Scaling group process control
//!
//! While an environment is paused its scaling groups must not replace the stopped
//! instances, so every process is suspended. On resume only a fixed subset comes
//! back: `AZRebalance` stays suspended to avoid churning instances right after they
//! warmed up.

use crate::error::{PauseError, Result};
use crate::retry::{RetryPolicy, retry_transient};
use async_trait::async_trait;
use aws_sdk_autoscaling::Client as AsgClient;
use aws_sdk_autoscaling::error::ProvideErrorMetadata;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Page size of the scaling group search
const DESCRIBE_PAGE_SIZE: i32 = 100;

/// Auto Scaling processes that can be suspended individually
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalingProcess {
    /// Launch
    Launch,
    /// Terminate
    Terminate,
    /// AddToLoadBalancer
    AddToLoadBalancer,
    /// AlarmNotification
    AlarmNotification,
    /// AZRebalance
    AzRebalance,
    /// HealthCheck
    HealthCheck,
    /// ReplaceUnhealthy
    ReplaceUnhealthy,
    /// ScheduledActions
    ScheduledActions,
    /// RemoveFromLoadBalancerLowPriority
    RemoveFromLoadBalancerLowPriority,
}

impl ScalingProcess {
    /// Every process the controller manages: the resumed set plus `AZRebalance`
    pub const ALL: [ScalingProcess; 9] = [
        Self::Launch,
        Self::Terminate,
        Self::AddToLoadBalancer,
        Self::AlarmNotification,
        Self::AzRebalance,
        Self::HealthCheck,
        Self::ReplaceUnhealthy,
        Self::ScheduledActions,
        Self::RemoveFromLoadBalancerLowPriority,
    ];

    /// AWS process name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Launch => "Launch",
            Self::Terminate => "Terminate",
            Self::AddToLoadBalancer => "AddToLoadBalancer",
            Self::AlarmNotification => "AlarmNotification",
            Self::AzRebalance => "AZRebalance",
            Self::HealthCheck => "HealthCheck",
            Self::ReplaceUnhealthy => "ReplaceUnhealthy",
            Self::ScheduledActions => "ScheduledActions",
            Self::RemoveFromLoadBalancerLowPriority => "RemoveFromLoadBalancerLowPriority",
        }
    }
}

/// Processes resumed when an environment starts. `AZRebalance` is deliberately absent.
pub const RESUME_PROCESSES: [ScalingProcess; 8] = [
    ScalingProcess::AddToLoadBalancer,
    ScalingProcess::AlarmNotification,
    ScalingProcess::HealthCheck,
    ScalingProcess::Launch,
    ScalingProcess::RemoveFromLoadBalancerLowPriority,
    ScalingProcess::ReplaceUnhealthy,
    ScalingProcess::ScheduledActions,
    ScalingProcess::Terminate,
];

/// Provider operations on scaling groups
#[async_trait]
pub trait AutoscalingApi: Send + Sync {
    /// Names of the groups whose cluster tag equals `namespace`
    async fn find_groups(&self, namespace: &str) -> Result<Vec<String>>;

    /// Suspend every process of a group
    async fn suspend_all(&self, group: &str) -> Result<()>;

    /// Resume the given processes of a group
    async fn resume(&self, group: &str, processes: &[ScalingProcess]) -> Result<()>;
}

/// [`AutoscalingApi`] over `aws-sdk-autoscaling`
#[derive(Clone)]
pub struct AsgAutoscaling {
    client: AsgClient,
    cluster_tag_key: String,
}

impl AsgAutoscaling {
    /// Create from an Auto Scaling client
    pub fn new(client: AsgClient, cluster_tag_key: impl Into<String>) -> Self {
        Self {
            client,
            cluster_tag_key: cluster_tag_key.into(),
        }
    }

    /// Create from AWS config
    pub fn from_config(config: &aws_config::SdkConfig, cluster_tag_key: impl Into<String>) -> Self {
        Self::new(AsgClient::new(config), cluster_tag_key)
    }
}

/// Map an SDK error, keeping throttling distinguishable
fn classify<E>(err: E) -> PauseError
where
    E: ProvideErrorMetadata + std::error::Error,
{
    match err.code() {
        Some("Throttling") | Some("ThrottlingException") => {
            PauseError::Throttled(err.message().unwrap_or("rate exceeded").to_string())
        }
        _ => PauseError::from_aws(err),
    }
}

#[async_trait]
impl AutoscalingApi for AsgAutoscaling {
    async fn find_groups(&self, namespace: &str) -> Result<Vec<String>> {
        let mut pages = self
            .client
            .describe_auto_scaling_groups()
            .max_records(DESCRIBE_PAGE_SIZE)
            .into_paginator()
            .send();

        let mut groups = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(classify)?;
            for group in page.auto_scaling_groups() {
                let tagged = group.tags().iter().any(|tag| {
                    tag.key() == Some(self.cluster_tag_key.as_str())
                        && tag.value() == Some(namespace)
                });
                if tagged {
                    groups.push(group.auto_scaling_group_name().to_string());
                }
            }
        }

        debug!(namespace, count = groups.len(), "Found scaling groups");
        Ok(groups)
    }

    async fn suspend_all(&self, group: &str) -> Result<()> {
        self.client
            .suspend_processes()
            .auto_scaling_group_name(group)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn resume(&self, group: &str, processes: &[ScalingProcess]) -> Result<()> {
        self.client
            .resume_processes()
            .auto_scaling_group_name(group)
            .set_scaling_processes(Some(processes.iter().map(|p| p.as_str().to_string()).collect()))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }
}

/// Suspends and resumes the scaling groups of an environment
pub struct AutoscalingController {
    autoscaling: Arc<dyn AutoscalingApi>,
    policy: RetryPolicy,
}

impl AutoscalingController {
    /// Create an autoscaling controller; throttled calls are retried under `policy`
    pub fn new(autoscaling: Arc<dyn AutoscalingApi>, policy: RetryPolicy) -> Self {
        Self { autoscaling, policy }
    }

    /// Suspend every process of every environment group.
    ///
    /// Returns the groups suspended; an environment without groups is a no-op.
    pub async fn suspend(&self, namespace: &str) -> Result<Vec<String>> {
        let groups = self.discover(namespace).await?;

        if groups.is_empty() {
            info!(namespace, "No autoscaling groups to be suspended, skipping");
            return Ok(groups);
        }

        info!(namespace, count = groups.len(), "Suspending autoscaling groups");
        for group in &groups {
            info!(group = %group, "Suspending");
            retry_transient("suspend processes", self.policy, || {
                self.autoscaling.suspend_all(group)
            })
            .await?;
        }

        Ok(groups)
    }

    /// Resume [`RESUME_PROCESSES`] on every environment group.
    pub async fn resume(&self, namespace: &str) -> Result<Vec<String>> {
        let groups = self.discover(namespace).await?;

        info!(namespace, count = groups.len(), "Resuming autoscaling groups");
        for group in &groups {
            info!(group = %group, "Resuming");
            retry_transient("resume processes", self.policy, || {
                self.autoscaling.resume(group, &RESUME_PROCESSES)
            })
            .await?;
        }

        Ok(groups)
    }

    async fn discover(&self, namespace: &str) -> Result<Vec<String>> {
        retry_transient("describe autoscaling groups", self.policy, || {
            self.autoscaling.find_groups(namespace)
        })
        .await
    }
}
