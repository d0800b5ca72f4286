#![cfg_attr(not(feature = "userspace"), no_std)]

/// Process identity written by eBPF programs into map keys.
///
/// Kernel programs store `bpf_get_current_pid_tgid()`-style pairs as a single
/// host-order u64: the pid in the low 32 bits, the parent pid in the high
/// 32 bits. Userspace decoders unpack it with [`PidInfo::from_packed`].
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "userspace", derive(Debug, Hash))]
pub struct PidInfo {
    /// Process ID (tgid in kernel terms)
    pub pid: u32,
    /// Parent process ID
    pub ppid: u32,
}

/// Size in bytes of a packed [`PidInfo`] inside a map key.
pub const PID_INFO_SIZE: usize = 8;

impl PidInfo {
    pub const fn new(pid: u32, ppid: u32) -> Self {
        Self { pid, ppid }
    }

    pub const fn from_packed(value: u64) -> Self {
        Self {
            pid: value as u32,
            ppid: (value >> 32) as u32,
        }
    }

    pub const fn packed(&self) -> u64 {
        ((self.ppid as u64) << 32) | self.pid as u64
    }

    /// Decode a key segment in host byte order. Returns None unless the
    /// segment is exactly [`PID_INFO_SIZE`] bytes long.
    pub fn from_ne_bytes(raw: &[u8]) -> Option<Self> {
        let bytes: [u8; PID_INFO_SIZE] = raw.try_into().ok()?;
        Some(Self::from_packed(u64::from_ne_bytes(bytes)))
    }

    /// Both ids are reserved (idle task or init), nothing to resolve.
    pub const fn is_reserved(&self) -> bool {
        self.pid <= 1 && self.ppid <= 1
    }
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for PidInfo {}
