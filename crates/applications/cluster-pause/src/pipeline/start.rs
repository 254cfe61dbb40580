//! STOPPED → RUNNING
//!
//! Nodes come up tainted so that only the system workloads (which now tolerate the
//! marker) land on them first. Once etcd has quorum the taint is lifted, system pods
//! are restarted onto the fresh nodes and, after a grace window, the scaling groups
//! and the cluster-autoscaler are handed back.

use super::{Collaborators, Environment, PauseAction, TransitionSummary};
use crate::autoscaling::AutoscalingController;
use crate::config::PauseConfig;
use crate::database::DatabaseController;
use crate::error::{Result, StepExt};
use crate::instance::ComputeController;
use crate::pods::{PodController, PodScope};
use crate::taint::TaintController;
use crate::toleration::TolerationReconciler;
use crate::wait::grace_window;
use tracing::info;

/// Resumes an environment
pub struct StartPipeline {
    config: PauseConfig,
    collaborators: Collaborators,
}

impl StartPipeline {
    /// Create a start pipeline
    pub fn new(config: PauseConfig, collaborators: Collaborators) -> Self {
        Self { config, collaborators }
    }

    /// Start `env`, including its database clusters when `include_database` is set.
    pub async fn run(
        &self,
        env: &Environment,
        include_database: bool,
    ) -> Result<TransitionSummary> {
        let namespace = env.namespace();
        let config = &self.config;
        let system = PodScope::Namespaces(config.system_namespaces.clone());
        let mut summary = TransitionSummary::begin(PauseAction::Start, env);
        info!(namespace, include_database, "Starting environment");

        // 1
        let cluster = self.collaborators.cluster("disable cluster-autoscaler").await?;
        cluster
            .scale_deployment(&config.autoscaler_namespace, &config.autoscaler_deployment, 0)
            .await
            .step("disable cluster-autoscaler")?;

        // 2
        let taints = TaintController::new(cluster, config.marker.clone(), config.taint_retry);
        summary.nodes_tainted = taints
            .taint(&config.start_taint_value)
            .await
            .step("taint nodes")?;

        // 3
        let cluster = self.collaborators.cluster("reconcile start tolerations").await?;
        let reconciler = TolerationReconciler::new(
            cluster,
            config.marker.clone(),
            config.daemon_set_allow_list.clone(),
        );
        for system_namespace in &config.system_namespaces {
            let report = reconciler
                .reconcile(
                    system_namespace,
                    &config.start_toleration_value,
                    config.start_excludes_for(system_namespace),
                )
                .await
                .step("reconcile start tolerations")?;
            summary.workloads_patched.extend(report.patched);
        }

        // 4
        let compute = ComputeController::new(self.collaborators.compute.clone());
        summary.instances = compute.start_instances(namespace).await.step("start instances")?;

        // 5
        let expected = compute.running_count(namespace).await.step("count running instances")?;
        let cluster = self.collaborators.cluster("wait for nodes").await?;
        PodController::new(cluster, config.poll_interval)
            .wait_for_nodes(expected)
            .await
            .step("wait for nodes")?;

        // 6
        if include_database {
            summary.database_clusters = DatabaseController::new(
                self.collaborators.database.clone(),
                config.poll_interval,
                config.database_deadline,
            )
            .start_clusters(namespace)
            .await
            .step("start database clusters")?;
        } else {
            info!(namespace, "Skipping database clusters");
        }

        // 7
        let cluster = self.collaborators.cluster("restart etcd").await?;
        PodController::new(cluster, config.poll_interval)
            .recycle_etcd(&config.etcd_namespace, &config.etcd_selector, config.etcd_quorum)
            .await
            .step("restart etcd")?;

        // 8
        info!(
            wait_secs = config.pre_untaint_wait.as_secs(),
            "Letting system pods settle before untainting"
        );
        tokio::time::sleep(config.pre_untaint_wait).await;
        let cluster = self.collaborators.cluster("untaint nodes").await?;
        let taints =
            TaintController::new(cluster.clone(), config.marker.clone(), config.taint_retry);
        summary.nodes_untainted = taints
            .untaint()
            .await
            .step("untaint nodes")?;
        tokio::time::sleep(config.post_untaint_wait).await;

        // 9: every pod inside the system namespaces
        summary.pods_deleted += PodController::new(cluster, config.poll_interval)
            .restart(&system, false)
            .await
            .step("restart system pods")?;

        // 10
        grace_window("resuming autoscaling groups", config.grace_window, config.grace_steps).await;

        // 11
        let cluster = self.collaborators.cluster("resume autoscaling").await?;
        let autoscaling = AutoscalingController::new(
            self.collaborators.autoscaling.clone(),
            config.autoscaling_retry,
        );
        summary.autoscaling_groups = autoscaling
            .resume(namespace)
            .await
            .step("resume autoscaling groups")?;
        cluster
            .scale_deployment(
                &config.autoscaler_namespace,
                &config.autoscaler_deployment,
                config.autoscaler_replicas,
            )
            .await
            .step("enable cluster-autoscaler")?;

        // 12: not-Ready pods inside the system namespaces
        grace_window("restarting unready pods", config.grace_window, config.grace_steps).await;
        let cluster = self.collaborators.cluster("restart unready pods").await?;
        summary.pods_deleted += PodController::new(cluster, config.poll_interval)
            .restart(&system, true)
            .await
            .step("restart unready pods")?;

        let summary = summary.finish();
        info!(
            namespace,
            instances = summary.instances.len(),
            database_clusters = summary.database_clusters.len(),
            autoscaling_groups = summary.autoscaling_groups.len(),
            "Environment started"
        );
        Ok(summary)
    }
}
