use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use kube_ebpf_exporter_common::PidInfo;
use thiserror::Error;

use super::container::{
    ContainerIdPolicy, ContainerRuntime, LookupError, CONTAINER_ID_LEN, CONTAINER_NAME_LABEL,
    POD_NAMESPACE_LABEL, POD_NAME_LABEL, SANDBOX_ID_LABEL,
};
use super::procfs::{host_command, ProcFs};

/// Placeholder for identity fields that could not be resolved.
pub const DEFAULT_KUBE_CONTEXT_VALUE: &str = "unknown";
/// Namespace reported for processes identified by their comm.
pub const HOST_COMMAND_NAMESPACE: &str = "__host_command";

pub const PID_CACHE_TTL: Duration = Duration::from_secs(90);
pub const PID_CACHE_CAPACITY: usize = 5000;
pub const CONTAINER_CACHE_CAPACITY: usize = 1000;

/// Kubernetes identity of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeInfo {
    pub pod_namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub sandbox_id: String,
    /// All three identity labels came from the runtime.
    pub full_info: bool,
    pub created_at: Instant,
}

impl KubeInfo {
    pub fn placeholder(now: Instant) -> Self {
        Self {
            pod_namespace: DEFAULT_KUBE_CONTEXT_VALUE.to_string(),
            pod_name: DEFAULT_KUBE_CONTEXT_VALUE.to_string(),
            container_name: DEFAULT_KUBE_CONTEXT_VALUE.to_string(),
            sandbox_id: String::new(),
            full_info: false,
            created_at: now,
        }
    }

    fn host_command(command: String, now: Instant) -> Self {
        Self {
            pod_namespace: HOST_COMMAND_NAMESPACE.to_string(),
            pod_name: command.clone(),
            container_name: command,
            sandbox_id: String::new(),
            full_info: false,
            created_at: now,
        }
    }

    fn from_labels(labels: &HashMap<String, String>, now: Instant) -> Self {
        let mut full_info = true;
        let mut label = |key: &str| match labels.get(key).filter(|v| !v.is_empty()) {
            Some(value) => value.clone(),
            None => {
                full_info = false;
                DEFAULT_KUBE_CONTEXT_VALUE.to_string()
            }
        };
        let pod_namespace = label(POD_NAMESPACE_LABEL);
        let pod_name = label(POD_NAME_LABEL);
        let container_name = label(CONTAINER_NAME_LABEL);
        Self {
            pod_namespace,
            pod_name,
            container_name,
            sandbox_id: labels.get(SANDBOX_ID_LABEL).cloned().unwrap_or_default(),
            full_info,
            created_at: now,
        }
    }

    /// The container name was resolved to something other than the placeholder.
    pub fn has_container_name(&self) -> bool {
        self.container_name != DEFAULT_KUBE_CONTEXT_VALUE
    }

    fn stamped(mut self, now: Instant) -> Self {
        self.created_at = now;
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no readable cgroup for pid {pid} or parent {ppid}")]
    NoCgroup { pid: u32, ppid: u32 },
    #[error("no container found for pid {pid} or parent {ppid}")]
    NoContainer { pid: u32, ppid: u32 },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves kernel pid/ppid pairs to Kubernetes pod/namespace/container.
///
/// Two cache levels sit in front of `/proc` and the container runtime:
///
/// * pid cache: pid or ppid -> identity, entries live [`PID_CACHE_TTL`].
///   Negative and fallback results are cached too, to bound `/proc` reads
///   and runtime lookups.
/// * container cache: container or sandbox ID -> identity, no TTL, only
///   ever holds identities with all three labels present.
///
/// Both levels are cleared wholesale when they outgrow their capacity.
/// Each level is guarded by its own mutex, held across its whole
/// lookup-then-insert sequence; the pid lock is always taken first.
pub struct IdentityCache {
    procfs: ProcFs,
    runtime: Arc<dyn ContainerRuntime>,
    policy: ContainerIdPolicy,
    comm_fallback: bool,
    pid_capacity: usize,
    container_capacity: usize,
    pids: Mutex<HashMap<u32, KubeInfo>>,
    containers: Mutex<HashMap<String, KubeInfo>>,
}

impl IdentityCache {
    pub fn new(
        procfs: ProcFs,
        runtime: Arc<dyn ContainerRuntime>,
        policy: ContainerIdPolicy,
        comm_fallback: bool,
    ) -> Self {
        Self {
            procfs,
            runtime,
            policy,
            comm_fallback,
            pid_capacity: PID_CACHE_CAPACITY,
            container_capacity: CONTAINER_CACHE_CAPACITY,
            pids: Mutex::new(HashMap::new()),
            containers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_capacities(mut self, pids: usize, containers: usize) -> Self {
        self.pid_capacity = pids;
        self.container_capacity = containers;
        self
    }

    pub fn resolve(&self, pid_info: PidInfo) -> Result<KubeInfo, ResolveError> {
        self.resolve_at(pid_info, Instant::now())
    }

    /// Resolve with an explicit clock, pid preferred over ppid at every step.
    pub fn resolve_at(&self, pid_info: PidInfo, now: Instant) -> Result<KubeInfo, ResolveError> {
        let PidInfo { pid, ppid } = pid_info;
        let mut pids = lock(&self.pids);

        if let Some(info) = cached(&mut pids, pid, now).or_else(|| cached(&mut pids, ppid, now)) {
            return Ok(info);
        }

        if pid_info.is_reserved() {
            return Ok(KubeInfo::placeholder(now));
        }

        let paths = [pid, ppid]
            .into_iter()
            .filter(|&candidate| candidate > 1)
            .find_map(|candidate| self.procfs.cgroup_paths(candidate).ok())
            .ok_or(ResolveError::NoCgroup { pid, ppid })?;

        let container_id = paths
            .iter()
            .find_map(|path| self.policy.container_id(path))
            .map(str::to_owned);

        let Some(container_id) = container_id else {
            if let Some((comm_pid, info)) = self.comm_identity(pid_info, now) {
                self.insert(&mut pids, comm_pid, info.clone());
                return Ok(info);
            }
            self.remember(&mut pids, pid_info, KubeInfo::placeholder(now), now);
            return Err(ResolveError::NoContainer { pid, ppid });
        };

        let info = match self.inspect_identity(&container_id) {
            Ok(info) => info.stamped(now),
            Err(err) => {
                log::debug!("runtime lookup for container {container_id} of pid {pid}: {err}");
                self.comm_identity(pid_info, now)
                    .map(|(_, info)| info)
                    .unwrap_or_else(|| KubeInfo::placeholder(now))
            }
        };
        self.remember(&mut pids, pid_info, info.clone(), now);
        Ok(info)
    }

    /// Look a container up, cache first, then the runtime.
    ///
    /// Only identities carrying all three Kubernetes labels are cached,
    /// under the container ID and, when it looks like one, the sandbox ID.
    pub fn inspect_identity(&self, container_id: &str) -> Result<KubeInfo, LookupError> {
        let mut containers = lock(&self.containers);
        if containers.len() > self.container_capacity {
            containers.clear();
        }
        if let Some(info) = containers.get(container_id) {
            return Ok(info.clone());
        }

        // A cold cache lists everything once to warm up on all running containers.
        let filter = (!containers.is_empty()).then_some(container_id);
        let now = Instant::now();
        for container in self.runtime.list_containers(filter)? {
            let info = KubeInfo::from_labels(&container.labels, now);
            if !info.full_info {
                continue;
            }
            if info.sandbox_id.len() == CONTAINER_ID_LEN {
                containers.insert(info.sandbox_id.clone(), info.clone());
            }
            containers.insert(container.id, info);
        }

        containers
            .get(container_id)
            .cloned()
            .ok_or_else(|| LookupError::NotFound(container_id.to_string()))
    }

    pub fn cached_container(&self, id: &str) -> Option<KubeInfo> {
        lock(&self.containers).get(id).cloned()
    }

    pub fn cached_pids(&self) -> usize {
        lock(&self.pids).len()
    }

    /// Identity from `/proc/<pid>/comm`, trying pid then ppid. Returns the
    /// pid the comm was read from alongside.
    fn comm_identity(&self, pid_info: PidInfo, now: Instant) -> Option<(u32, KubeInfo)> {
        if !self.comm_fallback {
            return None;
        }
        [pid_info.pid, pid_info.ppid].into_iter().find_map(|pid| {
            let comm = self.procfs.comm(pid).ok()?;
            Some((pid, KubeInfo::host_command(host_command(&comm), now)))
        })
    }

    /// Cache under pid, and under ppid unless it already holds a live entry.
    fn remember(
        &self,
        pids: &mut HashMap<u32, KubeInfo>,
        pid_info: PidInfo,
        info: KubeInfo,
        now: Instant,
    ) {
        if pid_info.pid > 1 {
            self.insert(pids, pid_info.pid, info.clone());
        }
        if pid_info.ppid > 1 && cached(pids, pid_info.ppid, now).is_none() {
            self.insert(pids, pid_info.ppid, info);
        }
    }

    fn insert(&self, pids: &mut HashMap<u32, KubeInfo>, pid: u32, info: KubeInfo) {
        if pids.len() >= self.pid_capacity && !pids.contains_key(&pid) {
            pids.clear();
        }
        pids.insert(pid, info);
    }
}

/// Live entry for `pid`; an expired one is evicted and reported as a miss.
fn cached(pids: &mut HashMap<u32, KubeInfo>, pid: u32, now: Instant) -> Option<KubeInfo> {
    let info = pids.get(&pid)?;
    if now.saturating_duration_since(info.created_at) < PID_CACHE_TTL {
        return Some(info.clone());
    }
    pids.remove(&pid);
    None
}
