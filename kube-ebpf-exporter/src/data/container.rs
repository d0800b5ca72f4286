use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use bollard::container::ListContainersOptions;
use bollard::Docker;
use serde::Deserialize;
use thiserror::Error;
use tokio::runtime::Handle;

/// Length of a full container ID as written by docker/containerd.
pub const CONTAINER_ID_LEN: usize = 64;

pub const POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";
pub const POD_NAME_LABEL: &str = "io.kubernetes.pod.name";
pub const CONTAINER_NAME_LABEL: &str = "io.kubernetes.container.name";
pub const SANDBOX_ID_LABEL: &str = "io.kubernetes.sandbox.id";

/// Scope prefixes runtimes put in front of the container ID under systemd.
const SCOPE_PREFIXES: &[&str] = &[
    "docker-",
    "cri-containerd-",
    "containerd-",
    "crio-",
    "libpod-",
];

/// How the last segment of a cgroup path is recognised as a container ID.
///
/// cgroupfs drivers (`/kubepods/burstable/pod<uid>/<id>`) leave the bare ID,
/// systemd drivers wrap it (`/system.slice/docker-<id>.scope`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerIdPolicy {
    /// The segment itself must be exactly 64 characters.
    #[default]
    Plain,
    /// Strip a runtime scope prefix and `.scope` suffix first.
    Scoped,
}

impl ContainerIdPolicy {
    /// Extract the container ID from a cgroup path, if the path has one.
    pub fn container_id(self, cgroup_path: &str) -> Option<&str> {
        let segment = cgroup_path.rsplit('/').next()?;
        let candidate = match self {
            ContainerIdPolicy::Plain => segment,
            ContainerIdPolicy::Scoped => strip_scope(segment),
        };
        (candidate.len() == CONTAINER_ID_LEN).then_some(candidate)
    }
}

fn strip_scope(segment: &str) -> &str {
    for prefix in SCOPE_PREFIXES {
        if let Some(rest) = segment.strip_prefix(prefix) {
            return rest.trim_end_matches(".scope");
        }
    }
    segment
}

/// A container as reported by the runtime: its ID and label set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeContainer {
    pub id: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("container {0} not found")]
    NotFound(String),
    #[error("container runtime did not answer within {0:?}")]
    Timeout(Duration),
    #[error("container runtime unavailable")]
    Unavailable,
    #[error("container runtime error: {0}")]
    Runtime(String),
}

/// Lists containers known to the local runtime.
///
/// Implementations are synchronous and must not block past their own timeout.
pub trait ContainerRuntime: Send + Sync {
    /// List running containers, restricted to `id` when given.
    fn list_containers(&self, id: Option<&str>) -> Result<Vec<RuntimeContainer>, LookupError>;
}

/// Docker engine API client.
///
/// Lookups run on the tokio runtime behind `handle`, so callers must be on a
/// blocking thread (e.g. inside `spawn_blocking`), never on an async task.
pub struct DockerRuntime {
    docker: Docker,
    handle: Handle,
    timeout: Duration,
}

impl DockerRuntime {
    pub fn connect(handle: Handle, timeout: Duration) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("connecting to docker daemon")?;
        Ok(Self {
            docker,
            handle,
            timeout,
        })
    }
}

impl ContainerRuntime for DockerRuntime {
    fn list_containers(&self, id: Option<&str>) -> Result<Vec<RuntimeContainer>, LookupError> {
        let mut filters = HashMap::new();
        if let Some(id) = id {
            filters.insert("id".to_string(), vec![id.to_string()]);
        }
        let options = ListContainersOptions::<String> {
            filters,
            ..Default::default()
        };

        let listed = self
            .handle
            .block_on(tokio::time::timeout(
                self.timeout,
                self.docker.list_containers(Some(options)),
            ))
            .map_err(|_| LookupError::Timeout(self.timeout))?
            .map_err(|e| LookupError::Runtime(e.to_string()))?;

        Ok(listed
            .into_iter()
            .filter_map(|summary| {
                Some(RuntimeContainer {
                    id: summary.id?,
                    labels: summary.labels.unwrap_or_default(),
                })
            })
            .collect())
    }
}

/// Stand-in used when no runtime socket is reachable at start-up.
pub struct UnavailableRuntime;

impl ContainerRuntime for UnavailableRuntime {
    fn list_containers(&self, _id: Option<&str>) -> Result<Vec<RuntimeContainer>, LookupError> {
        Err(LookupError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn plain_policy_takes_bare_64_char_segment() {
        let path = format!("/kubepods/burstable/pod1234/{ID}");
        assert_eq!(ContainerIdPolicy::Plain.container_id(&path), Some(ID));
        assert_eq!(
            ContainerIdPolicy::Plain.container_id("/kubepods/burstable/pod1234"),
            None
        );
        let scoped = format!("/system.slice/docker-{ID}.scope");
        assert_eq!(ContainerIdPolicy::Plain.container_id(&scoped), None);
    }

    #[test]
    fn scoped_policy_strips_runtime_prefix() {
        for prefix in ["docker-", "cri-containerd-", "crio-", "libpod-"] {
            let path = format!("/kubepods.slice/kubepods-pod1.slice/{prefix}{ID}.scope");
            assert_eq!(ContainerIdPolicy::Scoped.container_id(&path), Some(ID));
        }
        let bare = format!("/kubepods/pod1/{ID}");
        assert_eq!(ContainerIdPolicy::Scoped.container_id(&bare), Some(ID));
        assert_eq!(
            ContainerIdPolicy::Scoped.container_id("/system.slice/sshd.service"),
            None
        );
    }

    #[test]
    fn unavailable_runtime_always_fails() {
        assert_eq!(
            UnavailableRuntime.list_containers(Some(ID)),
            Err(LookupError::Unavailable)
        );
    }
}
