//! Managed-database (RDS Aurora) cluster lifecycle
//!
//! Clusters belong to an environment when their identifier contains the
//! namespace. Start/stop is issued once per qualifying cluster; convergence is then
//! polled with a deadline so a stuck cluster fails the transition instead of
//! hanging it.

use crate::error::{PauseError, Result};
use crate::wait::{Progress, poll_until_deadline};
use async_trait::async_trait;
use aws_sdk_rds::Client as RdsClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Cluster status reported when the cluster serves traffic
pub const STATUS_AVAILABLE: &str = "available";

/// Cluster status reported when the cluster is stopped
pub const STATUS_STOPPED: &str = "stopped";

/// A managed-database cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbCluster {
    /// Cluster identifier
    pub identifier: String,
    /// Provider status (`available`, `stopped`, `starting`, ...)
    pub status: String,
}

/// Provider operations on managed-database clusters
#[async_trait]
pub trait DatabaseApi: Send + Sync {
    /// Every cluster in the account/region
    async fn list_clusters(&self) -> Result<Vec<DbCluster>>;

    /// Start one cluster
    async fn start_cluster(&self, identifier: &str) -> Result<()>;

    /// Stop one cluster
    async fn stop_cluster(&self, identifier: &str) -> Result<()>;
}

/// [`DatabaseApi`] over `aws-sdk-rds`
#[derive(Clone)]
pub struct RdsDatabase {
    client: RdsClient,
}

impl RdsDatabase {
    /// Create from an RDS client
    pub fn new(client: RdsClient) -> Self {
        Self { client }
    }

    /// Create from AWS config
    pub fn from_config(config: &aws_config::SdkConfig) -> Self {
        Self::new(RdsClient::new(config))
    }
}

#[async_trait]
impl DatabaseApi for RdsDatabase {
    async fn list_clusters(&self) -> Result<Vec<DbCluster>> {
        let mut pages = self.client.describe_db_clusters().into_paginator().send();
        let mut clusters = Vec::new();

        while let Some(page) = pages.next().await {
            let page = page.map_err(PauseError::from_aws)?;
            for cluster in page.db_clusters() {
                let (Some(identifier), Some(status)) =
                    (cluster.db_cluster_identifier(), cluster.status())
                else {
                    continue;
                };
                clusters.push(DbCluster {
                    identifier: identifier.to_string(),
                    status: status.to_string(),
                });
            }
        }

        debug!(count = clusters.len(), "Described database clusters");
        Ok(clusters)
    }

    async fn start_cluster(&self, identifier: &str) -> Result<()> {
        self.client
            .start_db_cluster()
            .db_cluster_identifier(identifier)
            .send()
            .await
            .map_err(PauseError::from_aws)?;
        Ok(())
    }

    async fn stop_cluster(&self, identifier: &str) -> Result<()> {
        self.client
            .stop_db_cluster()
            .db_cluster_identifier(identifier)
            .send()
            .await
            .map_err(PauseError::from_aws)?;
        Ok(())
    }
}

/// Direction of a database transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Start,
    Stop,
}

impl Transition {
    /// Status a cluster must have to be mutated
    fn source(&self) -> &'static str {
        match self {
            Self::Start => STATUS_STOPPED,
            Self::Stop => STATUS_AVAILABLE,
        }
    }

    /// Status every cluster must reach
    fn target(&self) -> &'static str {
        match self {
            Self::Start => STATUS_AVAILABLE,
            Self::Stop => STATUS_STOPPED,
        }
    }
}

/// Starts and stops the managed-database clusters of an environment
pub struct DatabaseController {
    database: Arc<dyn DatabaseApi>,
    poll_interval: Duration,
    deadline: Duration,
}

impl DatabaseController {
    /// Create a database controller
    pub fn new(
        database: Arc<dyn DatabaseApi>,
        poll_interval: Duration,
        deadline: Duration,
    ) -> Self {
        Self {
            database,
            poll_interval,
            deadline,
        }
    }

    /// Start every stopped environment cluster and wait until all are available.
    ///
    /// Returns the identifiers that were started.
    pub async fn start_clusters(&self, namespace: &str) -> Result<Vec<String>> {
        self.transition(namespace, Transition::Start).await
    }

    /// Stop every available environment cluster and wait until all are stopped.
    ///
    /// Returns the identifiers that were stopped.
    pub async fn stop_clusters(&self, namespace: &str) -> Result<Vec<String>> {
        self.transition(namespace, Transition::Stop).await
    }

    async fn transition(&self, namespace: &str, transition: Transition) -> Result<Vec<String>> {
        let clusters = self.database.list_clusters().await?;
        let owned: Vec<&DbCluster> = clusters
            .iter()
            .filter(|c| c.identifier.contains(namespace))
            .collect();

        let mutate: Vec<String> = owned
            .iter()
            .filter(|c| c.status == transition.source())
            .map(|c| c.identifier.clone())
            .collect();

        if mutate.is_empty() {
            info!(
                namespace,
                target = transition.target(),
                "No database clusters to transition, skipping"
            );
        }

        for identifier in &mutate {
            info!(
                cluster = %identifier,
                target = transition.target(),
                "Transitioning database cluster"
            );
            match transition {
                Transition::Start => self.database.start_cluster(identifier).await?,
                Transition::Stop => self.database.stop_cluster(identifier).await?,
            }
        }

        let pending: Vec<String> = owned
            .iter()
            .filter(|c| c.status != transition.target())
            .map(|c| c.identifier.clone())
            .collect();

        self.wait_for(&pending, transition.target()).await?;
        Ok(mutate)
    }

    async fn wait_for(&self, pending: &[String], target: &'static str) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }

        let database = &self.database;
        poll_until_deadline("database clusters", self.poll_interval, self.deadline, || async move {
            let clusters = database.list_clusters().await?;
            let converged = clusters
                .iter()
                .filter(|c| pending.contains(&c.identifier) && c.status == target)
                .count();
            Ok(Progress::count(converged, pending.len(), &format!("clusters {}", target)))
        })
        .await
        .map_err(|err| match err {
            PauseError::Timeout(timeout) => PauseError::ClustersNotConverged {
                target: target.to_string(),
                timeout,
            },
            other => other,
        })
    }
}
