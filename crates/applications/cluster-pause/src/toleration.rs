//! Workload toleration reconciliation
//!
//! Merges the marker toleration into the pod templates of the system workloads.
//! Any existing toleration for the marker key is dropped first, so applying the
//! same marker twice is a no-op and switching values replaces rather than appends.
//! Rescheduling happens asynchronously and is not awaited here.

use crate::cluster::{ClusterApi, Workload, WorkloadKind};
use crate::config::Marker;
use crate::error::Result;
use k8s_openapi::api::core::v1::Toleration;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of one namespace reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Namespace reconciled
    pub namespace: String,
    /// Workloads patched, as `Kind/name`
    pub patched: Vec<String>,
    /// Workloads skipped because they were excluded
    pub excluded: Vec<String>,
}

/// Writes the marker toleration into workload pod templates
pub struct TolerationReconciler {
    cluster: Arc<dyn ClusterApi>,
    marker: Marker,
    daemon_set_allow_list: Vec<String>,
}

impl TolerationReconciler {
    /// Create a reconciler. Only daemon sets named in `daemon_set_allow_list` are touched.
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        marker: Marker,
        daemon_set_allow_list: Vec<String>,
    ) -> Self {
        Self {
            cluster,
            marker,
            daemon_set_allow_list,
        }
    }

    /// Give every eligible workload in `namespace` the marker toleration with `value`,
    /// skipping names in `exclude`.
    pub async fn reconcile(
        &self,
        namespace: &str,
        value: &str,
        exclude: &[String],
    ) -> Result<ReconcileReport> {
        info!(namespace, value, "Reconciling workload tolerations");

        let toleration = self.marker.toleration(value);
        let mut report = ReconcileReport {
            namespace: namespace.to_string(),
            ..Default::default()
        };

        for kind in WorkloadKind::ALL {
            let workloads = self.cluster.list_workloads(kind, namespace).await?;

            for workload in workloads.iter().filter(|w| self.is_eligible(w)) {
                let label = format!("{}/{}", workload.kind, workload.name);

                if exclude.contains(&workload.name) {
                    info!(workload = %label, "Skipping excluded workload");
                    report.excluded.push(label);
                    continue;
                }

                debug!(workload = %label, "Patching tolerations");
                let tolerations =
                    merge_toleration(&self.marker, &toleration, &workload.tolerations);
                self.cluster
                    .patch_workload_tolerations(kind, namespace, &workload.name, &tolerations)
                    .await?;
                report.patched.push(label);
            }
        }

        info!(
            namespace,
            patched = report.patched.len(),
            excluded = report.excluded.len(),
            "Tolerations reconciled"
        );
        Ok(report)
    }

    fn is_eligible(&self, workload: &Workload) -> bool {
        match workload.kind {
            WorkloadKind::Deployment | WorkloadKind::StatefulSet => true,
            WorkloadKind::DaemonSet => self.daemon_set_allow_list.contains(&workload.name),
            // Owned replica sets are patched through their deployment
            WorkloadKind::ReplicaSet => !workload.owned,
        }
    }
}

/// Marker first, then every other toleration in its original order
fn merge_toleration(
    marker: &Marker,
    toleration: &Toleration,
    existing: &[Toleration],
) -> Vec<Toleration> {
    std::iter::once(toleration.clone())
        .chain(existing.iter().filter(|t| !marker.is_toleration(t)).cloned())
        .collect()
}
