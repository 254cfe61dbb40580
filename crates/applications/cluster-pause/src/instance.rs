//! EC2 instance lifecycle
//!
//! Starts and stops the instances of an environment. Membership is discovered on
//! every call from the cluster tag and the instance state, and the SDK waiters are
//! trusted for convergence.

use crate::error::{PauseError, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ec2::client::Waiters;
use aws_sdk_ec2::types::{Filter, Instance, InstanceStateName};
use aws_sdk_ec2::Client;
use aws_types::region::Region;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default AWS region
pub const DEFAULT_REGION: &str = "us-east-1";

/// Longest the SDK waiters may block (40 checks at 15s, like the CLI waiters)
pub const DEFAULT_WAITER_TIMEOUT_SECS: u64 = 600;

/// Load AWS config for `region`, falling back to [`DEFAULT_REGION`]
pub async fn load_aws_config(region: Option<String>) -> aws_config::SdkConfig {
    let region_str = region.unwrap_or_else(|| DEFAULT_REGION.to_string());
    debug!("Loading AWS config for region: {}", region_str);

    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region_str))
        .load()
        .await
}

/// Instance state tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    /// Instance is pending
    Pending,
    /// Instance is running
    Running,
    /// Instance is stopping
    Stopping,
    /// Instance is stopped
    Stopped,
    /// Instance is shutting down
    ShuttingDown,
    /// Instance is terminated
    Terminated,
}

impl InstanceState {
    /// Value of the `instance-state-name` filter
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
        }
    }

    fn from_aws(state: &InstanceStateName) -> Self {
        match state {
            InstanceStateName::Pending => Self::Pending,
            InstanceStateName::Running => Self::Running,
            InstanceStateName::Stopping => Self::Stopping,
            InstanceStateName::Stopped => Self::Stopped,
            InstanceStateName::ShuttingDown => Self::ShuttingDown,
            InstanceStateName::Terminated => Self::Terminated,
            _ => Self::Pending,
        }
    }
}

/// An environment instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ec2Instance {
    /// Instance ID
    pub id: String,

    /// Current state
    pub state: InstanceState,

    /// Private DNS name (the Kubernetes node name on EKS)
    pub private_dns: Option<String>,
}

impl Ec2Instance {
    /// Create from AWS instance
    pub fn from_aws_instance(instance: &Instance) -> Result<Self> {
        let state = instance
            .state()
            .and_then(|s| s.name())
            .map(InstanceState::from_aws)
            .ok_or_else(|| PauseError::config("Missing instance state"))?;

        let id = instance
            .instance_id()
            .ok_or_else(|| PauseError::config("Missing instance ID"))?;

        Ok(Self {
            id: id.to_string(),
            state,
            private_dns: instance.private_dns_name().map(str::to_string),
        })
    }
}

/// Provider operations on compute instances and their volumes
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Instances tagged with `namespace` currently in `state`
    async fn find_instances(
        &self,
        namespace: &str,
        state: InstanceState,
    ) -> Result<Vec<Ec2Instance>>;

    /// Bulk start
    async fn start_instances(&self, ids: &[String]) -> Result<()>;

    /// Bulk stop
    async fn stop_instances(&self, ids: &[String]) -> Result<()>;

    /// Block until every instance reports `running`
    async fn wait_running(&self, ids: &[String]) -> Result<()>;

    /// Block until every instance reports `stopped`
    async fn wait_stopped(&self, ids: &[String]) -> Result<()>;

    /// In-use persistent volumes owned by the environment
    async fn find_volumes(&self, namespace: &str) -> Result<Vec<String>>;

    /// Force-detach a volume
    async fn detach_volume(&self, volume_id: &str) -> Result<()>;
}

/// [`ComputeApi`] over `aws-sdk-ec2`
#[derive(Clone)]
pub struct Ec2Compute {
    client: Client,
    cluster_tag_key: String,
    waiter_timeout: Duration,
}

impl Ec2Compute {
    /// Create from an EC2 client
    pub fn new(client: Client, cluster_tag_key: impl Into<String>) -> Self {
        Self {
            client,
            cluster_tag_key: cluster_tag_key.into(),
            waiter_timeout: Duration::from_secs(DEFAULT_WAITER_TIMEOUT_SECS),
        }
    }

    /// Create from AWS config
    pub fn from_config(config: &aws_config::SdkConfig, cluster_tag_key: impl Into<String>) -> Self {
        Self::new(Client::new(config), cluster_tag_key)
    }

    /// Set the SDK waiter timeout
    pub fn with_waiter_timeout(mut self, timeout: Duration) -> Self {
        self.waiter_timeout = timeout;
        self
    }
}

#[async_trait]
impl ComputeApi for Ec2Compute {
    async fn find_instances(
        &self,
        namespace: &str,
        state: InstanceState,
    ) -> Result<Vec<Ec2Instance>> {
        debug!(namespace, state = state.as_filter(), "Describing instances");

        let mut pages = self
            .client
            .describe_instances()
            .filters(
                Filter::builder()
                    .name(format!("tag:{}", self.cluster_tag_key))
                    .values(namespace)
                    .build(),
            )
            .filters(
                Filter::builder()
                    .name("instance-state-name")
                    .values(state.as_filter())
                    .build(),
            )
            .into_paginator()
            .send();

        let mut instances = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(PauseError::from_ec2)?;
            for reservation in page.reservations() {
                for instance in reservation.instances() {
                    instances.push(Ec2Instance::from_aws_instance(instance)?);
                }
            }
        }

        Ok(instances)
    }

    async fn start_instances(&self, ids: &[String]) -> Result<()> {
        self.client
            .start_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(PauseError::from_ec2)?;
        Ok(())
    }

    async fn stop_instances(&self, ids: &[String]) -> Result<()> {
        self.client
            .stop_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(PauseError::from_ec2)?;
        Ok(())
    }

    async fn wait_running(&self, ids: &[String]) -> Result<()> {
        self.client
            .wait_until_instance_running()
            .set_instance_ids(Some(ids.to_vec()))
            .wait(self.waiter_timeout)
            .await
            .map_err(PauseError::from_aws)?;
        Ok(())
    }

    async fn wait_stopped(&self, ids: &[String]) -> Result<()> {
        self.client
            .wait_until_instance_stopped()
            .set_instance_ids(Some(ids.to_vec()))
            .wait(self.waiter_timeout)
            .await
            .map_err(PauseError::from_aws)?;
        Ok(())
    }

    async fn find_volumes(&self, namespace: &str) -> Result<Vec<String>> {
        let response = self
            .client
            .describe_volumes()
            .filters(
                Filter::builder()
                    .name(format!("tag:kubernetes.io/cluster/{}", namespace))
                    .values("owned")
                    .build(),
            )
            .filters(
                Filter::builder()
                    .name("tag-key")
                    .values("kubernetes.io/created-for/pv/name")
                    .build(),
            )
            .filters(Filter::builder().name("status").values("in-use").build())
            .send()
            .await
            .map_err(PauseError::from_ec2)?;

        Ok(response
            .volumes()
            .iter()
            .filter_map(|v| v.volume_id().map(str::to_string))
            .collect())
    }

    async fn detach_volume(&self, volume_id: &str) -> Result<()> {
        self.client
            .detach_volume()
            .volume_id(volume_id)
            .force(true)
            .send()
            .await
            .map_err(PauseError::from_ec2)?;
        Ok(())
    }
}

/// Starts and stops the instances of an environment
pub struct ComputeController {
    compute: Arc<dyn ComputeApi>,
}

impl ComputeController {
    /// Create a compute controller
    pub fn new(compute: Arc<dyn ComputeApi>) -> Self {
        Self { compute }
    }

    /// Start every stopped instance and wait until they run.
    ///
    /// Returns the IDs that were started.
    pub async fn start_instances(&self, namespace: &str) -> Result<Vec<String>> {
        let ids = self.ids_in_state(namespace, InstanceState::Stopped).await?;

        if ids.is_empty() {
            info!(namespace, "No instances to be started, skipping");
            return Ok(ids);
        }

        info!(namespace, instances = ?ids, "Starting instances");
        self.compute.start_instances(&ids).await?;

        info!(count = ids.len(), "Waiting for instances to be running");
        self.compute.wait_running(&ids).await?;

        info!(count = ids.len(), "Instances running");
        Ok(ids)
    }

    /// Stop every running instance and wait until they stop.
    ///
    /// Returns the IDs that were stopped.
    pub async fn stop_instances(&self, namespace: &str) -> Result<Vec<String>> {
        let ids = self.ids_in_state(namespace, InstanceState::Running).await?;

        if ids.is_empty() {
            info!(namespace, "No instances to be stopped, skipping");
            return Ok(ids);
        }

        info!(namespace, instances = ?ids, "Stopping instances");
        self.compute.stop_instances(&ids).await?;

        info!(count = ids.len(), "Waiting for instances to be stopped");
        self.compute.wait_stopped(&ids).await?;

        info!(count = ids.len(), "Instances stopped");
        Ok(ids)
    }

    /// Number of running environment instances
    pub async fn running_count(&self, namespace: &str) -> Result<usize> {
        Ok(self.compute.find_instances(namespace, InstanceState::Running).await?.len())
    }

    /// Force-detach every in-use environment volume. Failures are logged and skipped.
    ///
    /// Returns the IDs that were detached.
    pub async fn detach_volumes(&self, namespace: &str) -> Result<Vec<String>> {
        let volumes = self.compute.find_volumes(namespace).await?;
        let mut detached = Vec::with_capacity(volumes.len());

        for volume in volumes {
            info!(volume = %volume, "Detaching volume");
            match self.compute.detach_volume(&volume).await {
                Ok(()) => detached.push(volume),
                Err(e) => {
                    warn!(volume = %volume, error = %e, "Volume cannot be detached, ignoring")
                }
            }
        }

        Ok(detached)
    }

    async fn ids_in_state(&self, namespace: &str, state: InstanceState) -> Result<Vec<String>> {
        Ok(self
            .compute
            .find_instances(namespace, state)
            .await?
            .into_iter()
            .map(|i| i.id)
            .collect())
    }
}
