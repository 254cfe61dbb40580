//! Node tainting
//!
//! Applies and removes the exclusion taint across the whole fleet. Node patches are
//! not atomic across nodes and race with the node controller, so each fleet pass is
//! retried from the top. Every failed taint pass, the last one included, is
//! compensated with an untaint pass.

use crate::cluster::{ClusterApi, NodeInfo};
use crate::config::Marker;
use crate::error::{PauseError, Result};
use crate::retry::{RetryPolicy, retry_with_compensation};
use k8s_openapi::api::core::v1::Taint;
use std::sync::Arc;
use tracing::{debug, info};

/// Adds and removes the exclusion taint on every node
pub struct TaintController {
    cluster: Arc<dyn ClusterApi>,
    marker: Marker,
    policy: RetryPolicy,
}

impl TaintController {
    /// Create a taint controller
    pub fn new(cluster: Arc<dyn ClusterApi>, marker: Marker, policy: RetryPolicy) -> Self {
        Self {
            cluster,
            marker,
            policy,
        }
    }

    /// Taint every node with the marker carrying `value`.
    ///
    /// Returns the number of nodes patched in the successful pass.
    pub async fn taint(&self, value: &str) -> Result<usize> {
        let taint = self.marker.taint(value);
        info!(key = %taint.key, value, effect = %taint.effect, "Tainting nodes");

        let patched = retry_with_compensation(
            "taint nodes",
            self.policy,
            |_| true,
            || self.taint_pass(&taint),
            || async { self.untaint_pass().await.map(|_| ()) },
        )
        .await
        .map_err(|exhausted| PauseError::NodeTaintFailed {
            attempts: exhausted.attempts,
            last_error: exhausted.last_error.to_string(),
        })?;

        info!(nodes = patched, "Nodes tainted");
        Ok(patched)
    }

    /// Remove the marker from every node, keeping every other taint.
    ///
    /// Returns the number of nodes patched in the successful pass.
    pub async fn untaint(&self) -> Result<usize> {
        info!(key = %self.marker.key, "Untainting nodes");

        let patched = retry_with_compensation(
            "untaint nodes",
            self.policy,
            |_| true,
            || self.untaint_pass(),
            || async { Ok(()) },
        )
        .await
        .map_err(|exhausted| PauseError::NodeUntaintFailed {
            attempts: exhausted.attempts,
            last_error: exhausted.last_error.to_string(),
        })?;

        info!(nodes = patched, "Nodes untainted");
        Ok(patched)
    }

    async fn taint_pass(&self, taint: &Taint) -> Result<usize> {
        let nodes = self.cluster.list_nodes().await?;

        for node in &nodes {
            debug!(node = %node.name, "Patching node");
            let taints = with_marker(&self.marker, taint, node);
            self.cluster.patch_node_taints(&node.name, &taints).await?;
        }

        Ok(nodes.len())
    }

    async fn untaint_pass(&self) -> Result<usize> {
        let nodes = self.cluster.list_nodes().await?;
        let mut patched = 0;

        for node in &nodes {
            let Some(taints) = without_marker(&self.marker, node) else {
                debug!(node = %node.name, "Node not tainted, skipping");
                continue;
            };

            debug!(node = %node.name, "Patching node");
            self.cluster.patch_node_taints(&node.name, &taints).await?;
            patched += 1;
        }

        Ok(patched)
    }
}

/// Marker first, then every non-marker taint of the node in its original order
fn with_marker(marker: &Marker, taint: &Taint, node: &NodeInfo) -> Vec<Taint> {
    std::iter::once(taint.clone())
        .chain(node.taints.iter().filter(|t| !marker.is_taint(t)).cloned())
        .collect()
}

/// The node's taints minus the marker, or `None` when the node has no marker
fn without_marker(marker: &Marker, node: &NodeInfo) -> Option<Vec<Taint>> {
    if !node.taints.iter().any(|t| marker.is_taint(t)) {
        return None;
    }

    Some(
        node.taints
            .iter()
            .filter(|t| !marker.is_taint(t))
            .cloned()
            .collect(),
    )
}
