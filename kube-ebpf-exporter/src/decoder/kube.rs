use std::sync::Arc;

use anyhow::{Context, Result};
use kube_ebpf_exporter_common::{PidInfo, PID_INFO_SIZE};

use crate::data::kube_context::{IdentityCache, KubeInfo};

/// Which identity field a kube decoder emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KubeField {
    PodNamespace,
    PodName,
    ContainerName,
    /// Container name, or `pid-<pid>` when it could not be resolved.
    ContainerNameOrPid,
}

impl KubeField {
    fn project(self, info: KubeInfo, pid_info: PidInfo) -> String {
        match self {
            KubeField::PodNamespace => info.pod_namespace,
            KubeField::PodName => info.pod_name,
            KubeField::ContainerName => info.container_name,
            KubeField::ContainerNameOrPid if info.has_container_name() => info.container_name,
            KubeField::ContainerNameOrPid => format!("pid-{}", pid_info.pid),
        }
    }
}

/// Decodes a packed pid/ppid into one field of the process identity.
pub struct KubeDecoder {
    field: KubeField,
    identity: Arc<IdentityCache>,
}

impl KubeDecoder {
    pub fn new(field: KubeField, identity: Arc<IdentityCache>) -> Self {
        Self { field, identity }
    }

    /// The identity field, or None when the process could not be resolved.
    pub fn decode(&self, input: &[u8]) -> Result<Option<String>> {
        let pid_info = PidInfo::from_ne_bytes(input).with_context(|| {
            format!(
                "pid info must be {PID_INFO_SIZE} bytes, got {}",
                input.len()
            )
        })?;
        match self.identity.resolve(pid_info) {
            Ok(info) => Ok(Some(self.field.project(info, pid_info))),
            Err(e) => {
                log::debug!("skipping {pid_info:?}: {e}");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::container::ContainerIdPolicy;
    use crate::data::kube_context::tests::{
        container, write_process, FakeRuntime, APP_ID, SANDBOX_ID,
    };
    use crate::data::procfs::ProcFs;

    fn identity(root: &std::path::Path) -> Arc<IdentityCache> {
        let runtime = Arc::new(FakeRuntime::with(vec![container(
            APP_ID, "shop", "cart-7d9f", "cart", SANDBOX_ID,
        )]));
        Arc::new(IdentityCache::new(
            ProcFs::new(root),
            runtime,
            ContainerIdPolicy::Plain,
            true,
        ))
    }

    fn key(pid: u32, ppid: u32) -> [u8; 8] {
        PidInfo::new(pid, ppid).packed().to_ne_bytes()
    }

    #[test]
    fn projects_each_identity_field() {
        let dir = tempfile::tempdir().unwrap();
        write_process(dir.path(), 300, Some(&format!("/kubepods/pod1/{APP_ID}")), None);
        let identity = identity(dir.path());

        let decode = |field| {
            KubeDecoder::new(field, identity.clone())
                .decode(&key(300, 1))
                .unwrap()
        };
        assert_eq!(decode(KubeField::PodNamespace).as_deref(), Some("shop"));
        assert_eq!(decode(KubeField::PodName).as_deref(), Some("cart-7d9f"));
        assert_eq!(decode(KubeField::ContainerName).as_deref(), Some("cart"));
        assert_eq!(decode(KubeField::ContainerNameOrPid).as_deref(), Some("cart"));
    }

    #[test]
    fn container_name_or_pid_falls_back_to_pid() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = KubeDecoder::new(KubeField::ContainerNameOrPid, identity(dir.path()));
        // Reserved pids resolve to the placeholder without touching /proc.
        assert_eq!(decoder.decode(&key(1, 0)).unwrap().as_deref(), Some("pid-1"));
    }

    #[test]
    fn unresolvable_process_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = KubeDecoder::new(KubeField::PodName, identity(dir.path()));
        assert_eq!(decoder.decode(&key(4242, 4241)).unwrap(), None);
    }

    #[test]
    fn wrong_width_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = KubeDecoder::new(KubeField::PodName, identity(dir.path()));
        assert!(decoder.decode(&[0; 4]).is_err());
    }
}
