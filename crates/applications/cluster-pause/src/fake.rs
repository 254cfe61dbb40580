//! In-memory collaborators for tests
//!
//! Each fake keeps its state behind a `Mutex` and records the mutating calls it
//! receives, so tests can assert on both the resulting state and the call log.

use crate::autoscaling::{AutoscalingApi, ScalingProcess};
use crate::cluster::{ClusterApi, ClusterConnector, NodeInfo, PodInfo, Workload, WorkloadKind};
use crate::database::{DatabaseApi, DbCluster, STATUS_AVAILABLE, STATUS_STOPPED};
use crate::error::{PauseError, Result};
use crate::instance::{ComputeApi, Ec2Instance, InstanceState};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Taint, Toleration};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

fn injected(what: &str) -> PauseError {
    PauseError::Io(std::io::Error::other(format!("injected failure: {}", what)))
}

/// Time-stamped calls shared across fakes, for asserting cross-provider ordering
#[derive(Clone, Default)]
pub(crate) struct Journal(Arc<Mutex<Vec<(Instant, String)>>>);

impl Journal {
    fn record(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push((Instant::now(), event.into()));
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|(_, e)| e.clone()).collect()
    }

    /// When `event` was recorded, for each occurrence
    pub fn times_of(&self, event: &str) -> Vec<Instant> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e == event)
            .map(|(at, _)| *at)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct FakePod {
    info: PodInfo,
    labels: Vec<(String, String)>,
}

#[derive(Default)]
struct ClusterState {
    nodes: Vec<NodeInfo>,
    joining: Vec<(usize, NodeInfo)>,
    node_lists: usize,
    workloads: Vec<Workload>,
    pods: Vec<FakePod>,
    node_patch_calls: usize,
    node_patch_log: Vec<(String, usize)>,
    fail_patches_at: HashSet<usize>,
    fail_patches_for: HashSet<String>,
    fail_all_patches: bool,
    deleted: Vec<String>,
    fail_deletes: HashSet<String>,
    unbind_after_lists: Option<usize>,
    pod_lists: usize,
    scales: Vec<(String, i32)>,
    fail_scale: bool,
}

/// In-memory Kubernetes cluster
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<ClusterState>,
    journal: Journal,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scale, pod listing and pod deletion calls land here
    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    pub fn add_node(&self, name: &str, taints: Vec<Taint>) {
        self.state.lock().unwrap().nodes.push(NodeInfo {
            name: name.to_string(),
            taints,
            ready: true,
        });
    }

    /// Node that registers (Ready) once `lists` node listings have happened
    pub fn join_node_after(&self, name: &str, lists: usize) {
        self.state.lock().unwrap().joining.push((
            lists,
            NodeInfo {
                name: name.to_string(),
                taints: vec![],
                ready: true,
            },
        ));
    }

    pub fn set_node_ready(&self, name: &str, ready: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(node) = state.nodes.iter_mut().find(|n| n.name == name) {
            node.ready = ready;
        }
    }

    pub fn node(&self, name: &str) -> NodeInfo {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .iter()
            .find(|n| n.name == name)
            .cloned()
            .unwrap_or_else(|| panic!("no node {}", name))
    }

    /// Successful node patches only
    pub fn node_patch_count(&self) -> usize {
        self.state.lock().unwrap().node_patch_log.len()
    }

    /// Successful node patches as `(node, taint count after the patch)`
    pub fn node_patch_log(&self) -> Vec<(String, usize)> {
        self.state.lock().unwrap().node_patch_log.clone()
    }

    /// Fail the node patch calls at these 1-based positions
    pub fn fail_node_patches_at(&self, positions: &[usize]) {
        self.state.lock().unwrap().fail_patches_at.extend(positions.iter().copied());
    }

    /// Fail every patch of this node
    pub fn fail_node_patches_for(&self, name: &str) {
        self.state.lock().unwrap().fail_patches_for.insert(name.to_string());
    }

    pub fn fail_all_node_patches(&self) {
        self.state.lock().unwrap().fail_all_patches = true;
    }

    pub fn add_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        tolerations: Vec<Toleration>,
        owned: bool,
    ) {
        self.state.lock().unwrap().workloads.push(Workload {
            kind,
            name: name.to_string(),
            namespace: namespace.to_string(),
            tolerations,
            owned,
        });
    }

    pub fn workload(&self, kind: WorkloadKind, namespace: &str, name: &str) -> Workload {
        let state = self.state.lock().unwrap();
        state
            .workloads
            .iter()
            .find(|w| w.kind == kind && w.namespace == namespace && w.name == name)
            .cloned()
            .unwrap_or_else(|| panic!("no {} {}/{}", kind, namespace, name))
    }

    pub fn add_pod(
        &self,
        namespace: &str,
        name: &str,
        node: Option<&str>,
        ready: bool,
        labels: &[(&str, &str)],
    ) {
        self.state.lock().unwrap().pods.push(FakePod {
            info: PodInfo {
                name: name.to_string(),
                namespace: namespace.to_string(),
                node_name: node.map(str::to_string),
                ready,
            },
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        });
    }

    pub fn pod(&self, namespace: &str, name: &str) -> PodInfo {
        let state = self.state.lock().unwrap();
        state
            .pods
            .iter()
            .find(|p| p.info.namespace == namespace && p.info.name == name)
            .map(|p| p.info.clone())
            .unwrap_or_else(|| panic!("no pod {}/{}", namespace, name))
    }

    /// Every pod loses its node binding once `lists` pod listings have happened
    pub fn unbind_pods_after(&self, lists: usize) {
        self.state.lock().unwrap().unbind_after_lists = Some(lists);
    }

    /// Pods deleted, as `namespace/name`, in call order
    pub fn deleted_pods(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn fail_pod_delete(&self, name: &str) {
        self.state.lock().unwrap().fail_deletes.insert(name.to_string());
    }

    /// Scale calls as `(namespace/name, replicas)`
    pub fn scales(&self) -> Vec<(String, i32)> {
        self.state.lock().unwrap().scales.clone()
    }

    pub fn fail_scale(&self) {
        self.state.lock().unwrap().fail_scale = true;
    }
}

fn selector_matches(labels: &[(String, String)], selector: &str) -> bool {
    selector.split(',').all(|term| match term.split_once('=') {
        Some((key, value)) => labels.iter().any(|(k, v)| k == key.trim() && v == value.trim()),
        None => labels.iter().any(|(k, _)| k == term.trim()),
    })
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let mut state = self.state.lock().unwrap();
        state.node_lists += 1;

        let lists = state.node_lists;
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.joining)
            .into_iter()
            .partition(|(after, _)| *after <= lists);
        state.joining = waiting;
        state.nodes.extend(ready.into_iter().map(|(_, node)| node));

        Ok(state.nodes.clone())
    }

    async fn patch_node_taints(&self, node: &str, taints: &[Taint]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.node_patch_calls += 1;

        let call = state.node_patch_calls;
        if state.fail_all_patches
            || state.fail_patches_at.contains(&call)
            || state.fail_patches_for.contains(node)
        {
            return Err(injected("node patch"));
        }

        let entry = state
            .nodes
            .iter_mut()
            .find(|n| n.name == node)
            .ok_or_else(|| PauseError::config(format!("node {} not found", node)))?;
        entry.taints = taints.to_vec();
        state.node_patch_log.push((node.to_string(), taints.len()));
        Ok(())
    }

    async fn list_workloads(&self, kind: WorkloadKind, namespace: &str) -> Result<Vec<Workload>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .workloads
            .iter()
            .filter(|w| w.kind == kind && w.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn patch_workload_tolerations(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        tolerations: &[Toleration],
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let workload = state
            .workloads
            .iter_mut()
            .find(|w| w.kind == kind && w.namespace == namespace && w.name == name)
            .ok_or_else(|| {
                PauseError::config(format!("{} {}/{} not found", kind, namespace, name))
            })?;
        workload.tolerations = tolerations.to_vec();
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Vec<PodInfo>> {
        self.journal.record(format!("list pods {}", namespace.unwrap_or("*")));
        let mut state = self.state.lock().unwrap();
        state.pod_lists += 1;

        if state.unbind_after_lists.is_some_and(|after| state.pod_lists > after) {
            for pod in &mut state.pods {
                pod.info.node_name = None;
            }
        }

        Ok(state
            .pods
            .iter()
            .filter(|p| namespace.is_none_or(|ns| p.info.namespace == ns))
            .filter(|p| selector.is_none_or(|s| selector_matches(&p.labels, s)))
            .map(|p| p.info.clone())
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_deletes.contains(name) {
            return Err(injected("pod delete"));
        }

        self.journal.record(format!("delete {}/{}", namespace, name));
        state.deleted.push(format!("{}/{}", namespace, name));
        // The owning controller recreates the pod, which comes back ready
        if let Some(pod) = state
            .pods
            .iter_mut()
            .find(|p| p.info.namespace == namespace && p.info.name == name)
        {
            pod.info.ready = true;
        }
        Ok(())
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let deployment = format!("{}/{}", namespace, name);
        if state.fail_scale {
            return Err(PauseError::ScaleFailed {
                deployment,
                replicas,
                cause: "injected failure".to_string(),
            });
        }
        self.journal.record(format!("scale {}={}", deployment, replicas));
        state.scales.push((deployment, replicas));
        Ok(())
    }
}

/// Connector handing out the same [`FakeCluster`], recording each connection in its journal
pub(crate) struct FakeConnector {
    cluster: Arc<FakeCluster>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(cluster: Arc<FakeCluster>) -> Self {
        Self {
            cluster,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterConnector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn ClusterApi>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.cluster.journal.record("connect");
        Ok(self.cluster.clone())
    }
}

// ---------------------------------------------------------------------------
// Compute
// ---------------------------------------------------------------------------

/// Mutating calls received by [`FakeCompute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ComputeCall {
    Start(Vec<String>),
    Stop(Vec<String>),
    WaitRunning(Vec<String>),
    WaitStopped(Vec<String>),
    Detach(String),
}

#[derive(Default)]
struct ComputeState {
    instances: Vec<(String, InstanceState)>,
    volumes: Vec<String>,
    calls: Vec<ComputeCall>,
    fail_waiters: bool,
    fail_detach: HashSet<String>,
}

/// In-memory EC2; every instance belongs to every environment
#[derive(Default)]
pub(crate) struct FakeCompute {
    state: Mutex<ComputeState>,
}

impl FakeCompute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_instance(&self, id: &str, state: InstanceState) {
        self.state.lock().unwrap().instances.push((id.to_string(), state));
    }

    pub fn state(&self, id: &str) -> InstanceState {
        let state = self.state.lock().unwrap();
        state
            .instances
            .iter()
            .find(|(i, _)| i == id)
            .map(|(_, s)| *s)
            .unwrap_or_else(|| panic!("no instance {}", id))
    }

    pub fn calls(&self) -> Vec<ComputeCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn fail_waiters(&self) {
        self.state.lock().unwrap().fail_waiters = true;
    }

    pub fn add_volume(&self, id: &str) {
        self.state.lock().unwrap().volumes.push(id.to_string());
    }

    pub fn fail_detach(&self, id: &str) {
        self.state.lock().unwrap().fail_detach.insert(id.to_string());
    }

    fn set_state(&self, ids: &[String], to: InstanceState) {
        let mut state = self.state.lock().unwrap();
        for (id, s) in state.instances.iter_mut() {
            if ids.contains(id) {
                *s = to;
            }
        }
    }
}

#[async_trait]
impl ComputeApi for FakeCompute {
    async fn find_instances(
        &self,
        _namespace: &str,
        state: InstanceState,
    ) -> Result<Vec<Ec2Instance>> {
        let current = self.state.lock().unwrap();
        Ok(current
            .instances
            .iter()
            .filter(|(_, s)| *s == state)
            .map(|(id, s)| Ec2Instance {
                id: id.clone(),
                state: *s,
                private_dns: None,
            })
            .collect())
    }

    async fn start_instances(&self, ids: &[String]) -> Result<()> {
        self.state.lock().unwrap().calls.push(ComputeCall::Start(ids.to_vec()));
        self.set_state(ids, InstanceState::Running);
        Ok(())
    }

    async fn stop_instances(&self, ids: &[String]) -> Result<()> {
        self.state.lock().unwrap().calls.push(ComputeCall::Stop(ids.to_vec()));
        self.set_state(ids, InstanceState::Stopped);
        Ok(())
    }

    async fn wait_running(&self, ids: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ComputeCall::WaitRunning(ids.to_vec()));
        if state.fail_waiters {
            return Err(injected("instance_running waiter"));
        }
        Ok(())
    }

    async fn wait_stopped(&self, ids: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ComputeCall::WaitStopped(ids.to_vec()));
        if state.fail_waiters {
            return Err(injected("instance_stopped waiter"));
        }
        Ok(())
    }

    async fn find_volumes(&self, _namespace: &str) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().volumes.clone())
    }

    async fn detach_volume(&self, volume_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_detach.contains(volume_id) {
            return Err(injected("volume detach"));
        }
        state.calls.push(ComputeCall::Detach(volume_id.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Mutating calls received by [`FakeDatabase`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DbCall {
    Start(String),
    Stop(String),
}

struct DatabaseState {
    clusters: Vec<DbCluster>,
    mutations: Vec<DbCall>,
    list_calls: usize,
    converge_after: Option<usize>,
}

/// In-memory RDS. Transitional clusters settle once enough listings have happened.
pub(crate) struct FakeDatabase {
    state: Mutex<DatabaseState>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DatabaseState {
                clusters: vec![],
                mutations: vec![],
                list_calls: 0,
                converge_after: Some(0),
            }),
        }
    }

    pub fn add_cluster(&self, identifier: &str, status: &str) {
        self.state.lock().unwrap().clusters.push(DbCluster {
            identifier: identifier.to_string(),
            status: status.to_string(),
        });
    }

    /// Transitional clusters settle on the listing after the `polls`-th
    pub fn converge_after_polls(&self, polls: usize) {
        self.state.lock().unwrap().converge_after = Some(polls);
    }

    pub fn never_converge(&self) {
        self.state.lock().unwrap().converge_after = None;
    }

    pub fn mutations(&self) -> Vec<DbCall> {
        self.state.lock().unwrap().mutations.clone()
    }

    pub fn status(&self, identifier: &str) -> String {
        let state = self.state.lock().unwrap();
        state
            .clusters
            .iter()
            .find(|c| c.identifier == identifier)
            .map(|c| c.status.clone())
            .unwrap_or_else(|| panic!("no cluster {}", identifier))
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    fn set_status(&self, identifier: &str, status: &str, call: DbCall) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let cluster = state
            .clusters
            .iter_mut()
            .find(|c| c.identifier == identifier)
            .ok_or_else(|| {
                PauseError::AwsService(format!("DBClusterNotFoundFault: {}", identifier))
            })?;
        cluster.status = status.to_string();
        state.mutations.push(call);
        Ok(())
    }
}

#[async_trait]
impl DatabaseApi for FakeDatabase {
    async fn list_clusters(&self) -> Result<Vec<DbCluster>> {
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;

        let calls = state.list_calls;
        if state.converge_after.is_some_and(|after| calls > after) {
            for cluster in &mut state.clusters {
                match cluster.status.as_str() {
                    "starting" => cluster.status = STATUS_AVAILABLE.to_string(),
                    "stopping" => cluster.status = STATUS_STOPPED.to_string(),
                    _ => {}
                }
            }
        }

        Ok(state.clusters.clone())
    }

    async fn start_cluster(&self, identifier: &str) -> Result<()> {
        self.set_status(identifier, "starting", DbCall::Start(identifier.to_string()))
    }

    async fn stop_cluster(&self, identifier: &str) -> Result<()> {
        self.set_status(identifier, "stopping", DbCall::Stop(identifier.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Autoscaling
// ---------------------------------------------------------------------------

#[derive(Default)]
struct AutoscalingState {
    groups: Vec<(String, String)>,
    active: HashMap<String, HashSet<ScalingProcess>>,
    resume_requests: Vec<Vec<ScalingProcess>>,
    mutations: usize,
    throttled: usize,
}

/// In-memory Auto Scaling; new groups start with every process active
#[derive(Default)]
pub(crate) struct FakeAutoscaling {
    state: Mutex<AutoscalingState>,
    journal: Journal,
}

impl FakeAutoscaling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record resumes into a journal shared with other fakes
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            state: Mutex::default(),
            journal,
        }
    }

    pub fn add_group(&self, name: &str, namespace: &str) {
        let mut state = self.state.lock().unwrap();
        state.groups.push((name.to_string(), namespace.to_string()));
        state
            .active
            .insert(name.to_string(), ScalingProcess::ALL.into_iter().collect());
    }

    pub fn active(&self, group: &str) -> HashSet<ScalingProcess> {
        self.state.lock().unwrap().active.get(group).cloned().unwrap_or_default()
    }

    pub fn resume_requests(&self) -> Vec<Vec<ScalingProcess>> {
        self.state.lock().unwrap().resume_requests.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.state.lock().unwrap().mutations
    }

    /// Throttle the next `calls` API calls
    pub fn throttle_next(&self, calls: usize) {
        self.state.lock().unwrap().throttled = calls;
    }

    fn throttle(state: &mut AutoscalingState) -> Result<()> {
        if state.throttled > 0 {
            state.throttled -= 1;
            return Err(PauseError::Throttled("Rate exceeded".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AutoscalingApi for FakeAutoscaling {
    async fn find_groups(&self, namespace: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        Self::throttle(&mut state)?;
        Ok(state
            .groups
            .iter()
            .filter(|(_, ns)| ns == namespace)
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn suspend_all(&self, group: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::throttle(&mut state)?;
        state.active.entry(group.to_string()).or_default().clear();
        state.mutations += 1;
        Ok(())
    }

    async fn resume(&self, group: &str, processes: &[ScalingProcess]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::throttle(&mut state)?;
        state
            .active
            .entry(group.to_string())
            .or_default()
            .extend(processes.iter().copied());
        state.resume_requests.push(processes.to_vec());
        self.journal.record(format!("resume {}", group));
        state.mutations += 1;
        Ok(())
    }
}
