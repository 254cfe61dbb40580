//! RUNNING → STOPPED

use super::{Collaborators, Environment, PauseAction, TransitionSummary};
use crate::autoscaling::AutoscalingController;
use crate::config::PauseConfig;
use crate::database::DatabaseController;
use crate::error::{Result, StepExt};
use crate::instance::ComputeController;
use crate::pods::{PodController, PodScope};
use crate::taint::TaintController;
use crate::toleration::TolerationReconciler;
use tracing::info;

/// Pauses an environment
pub struct StopPipeline {
    config: PauseConfig,
    collaborators: Collaborators,
}

impl StopPipeline {
    /// Create a stop pipeline
    pub fn new(config: PauseConfig, collaborators: Collaborators) -> Self {
        Self { config, collaborators }
    }

    /// Stop `env`, including its database clusters when `include_database` is set.
    ///
    /// Order matters: scaling groups are frozen before anything else so they do not
    /// replace what the later steps stop, and system workloads lose their toleration
    /// before the taint lands so the taint evicts them too.
    pub async fn run(
        &self,
        env: &Environment,
        include_database: bool,
    ) -> Result<TransitionSummary> {
        let namespace = env.namespace();
        let config = &self.config;
        let mut summary = TransitionSummary::begin(PauseAction::Stop, env);
        info!(namespace, include_database, "Stopping environment");

        // 1
        let autoscaling = AutoscalingController::new(
            self.collaborators.autoscaling.clone(),
            config.autoscaling_retry,
        );
        summary.autoscaling_groups = autoscaling
            .suspend(namespace)
            .await
            .step("suspend autoscaling groups")?;

        // 2
        let cluster = self.collaborators.cluster("reconcile stop tolerations").await?;
        let reconciler = TolerationReconciler::new(
            cluster.clone(),
            config.marker.clone(),
            config.daemon_set_allow_list.clone(),
        );
        for system_namespace in &config.system_namespaces {
            let report = reconciler
                .reconcile(system_namespace, &config.stop_toleration_value, &[])
                .await
                .step("reconcile stop tolerations")?;
            summary.workloads_patched.extend(report.patched);
        }

        // 3
        let taints =
            TaintController::new(cluster.clone(), config.marker.clone(), config.taint_retry);
        summary.nodes_tainted = taints
            .taint(&config.stop_taint_value)
            .await
            .step("taint nodes")?;

        // 4
        summary.evacuation = Some(
            PodController::new(cluster, config.poll_interval)
                .wait_for_evacuation(&config.system_namespaces, config.evacuation_timeout)
                .await
                .step("wait for pod evacuation")?,
        );

        // 5
        let compute = ComputeController::new(self.collaborators.compute.clone());
        summary.instances = compute.stop_instances(namespace).await.step("stop instances")?;

        // 6
        let cluster = self.collaborators.cluster("delete pods").await?;
        summary.pods_deleted = PodController::new(cluster, config.poll_interval)
            .restart(&PodScope::All, false)
            .await
            .step("delete pods")?;

        // 7
        summary.volumes_detached = compute.detach_volumes(namespace).await.step("detach volumes")?;

        // 8
        if include_database {
            summary.database_clusters = DatabaseController::new(
                self.collaborators.database.clone(),
                config.poll_interval,
                config.database_deadline,
            )
            .stop_clusters(namespace)
            .await
            .step("stop database clusters")?;
        } else {
            info!(namespace, "Skipping database clusters");
        }

        let summary = summary.finish();
        info!(
            namespace,
            instances = summary.instances.len(),
            database_clusters = summary.database_clusters.len(),
            autoscaling_groups = summary.autoscaling_groups.len(),
            "Environment stopped"
        );
        Ok(summary)
    }
}
