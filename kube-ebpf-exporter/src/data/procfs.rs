use std::fs;
use std::io;
use std::path::PathBuf;

/// Longest host command kept for the comm-based identity.
pub const HOST_COMMAND_MAX_LEN: usize = 10;

const PERMS_HINT: &str =
    "insufficient permissions to read /proc: run as root or add cap_sys_ptrace";

/// Wrap an io::Result, replacing PermissionDenied with a helpful message.
fn check_perms<T>(result: io::Result<T>) -> io::Result<T> {
    result.map_err(|e| {
        if e.kind() == io::ErrorKind::PermissionDenied {
            io::Error::new(io::ErrorKind::PermissionDenied, PERMS_HINT)
        } else {
            e
        }
    })
}

/// Reader for the per-process files identity resolution needs.
///
/// The root is configurable so tests can point it at a scratch directory.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cgroup paths from `/proc/<pid>/cgroup`, one per
    /// `hierarchy-ID:subsystem-list:cgroup-path` line, in file order.
    pub fn cgroup_paths(&self, pid: u32) -> io::Result<Vec<String>> {
        let path = self.root.join(pid.to_string()).join("cgroup");
        let content = check_perms(fs::read_to_string(path))?;
        Ok(content
            .lines()
            .filter_map(|line| {
                let parts: Vec<&str> = line.splitn(3, ':').collect();
                if parts.len() == 3 {
                    Some(parts[2].to_string())
                } else {
                    None
                }
            })
            .collect())
    }

    /// First line of `/proc/<pid>/comm`.
    pub fn comm(&self, pid: u32) -> io::Result<String> {
        let path = self.root.join(pid.to_string()).join("comm");
        let content = check_perms(fs::read_to_string(path))?;
        Ok(content.lines().next().unwrap_or_default().to_string())
    }
}

/// Shorten a comm into the label used for host processes: cut at the first
/// `/` or `:` (kernel threads like `kworker/0:1`) and keep at most
/// [`HOST_COMMAND_MAX_LEN`] characters.
pub fn host_command(comm: &str) -> String {
    let command = comm.split(['/', ':']).next().unwrap_or_default();
    command.chars().take(HOST_COMMAND_MAX_LEN).collect()
}
