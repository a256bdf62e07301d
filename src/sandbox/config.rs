//! Sandbox and pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Guest network policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    /// No network device at all.
    None,
    /// Outbound only, no inbound connectivity.
    Restricted,
    /// Unrestricted.
    Full,
}

/// Resource profile requested when starting a sandbox instance.
///
/// Two configs with the same `profile_key` are interchangeable for
/// warm-pool reuse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Image (container backends) or rootfs reference (microVM backend).
    pub image: String,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disk_mib: u64,
    pub network: NetworkPolicy,
    /// Whether a finished instance may be retained in the warm pool.
    pub reusable: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "alpine:latest".to_string(),
            vcpus: 1,
            memory_mib: 256,
            disk_mib: 512,
            network: NetworkPolicy::None,
            reusable: true,
        }
    }
}

impl SandboxConfig {
    /// Warm-pool bucketing key. Instances are only reused for requests with
    /// an identical resource profile.
    pub fn profile_key(&self) -> String {
        format!(
            "{}:{}c:{}m:{}d:{:?}",
            self.image, self.vcpus, self.memory_mib, self.disk_mib, self.network
        )
    }
}

/// What `start` does when the pool is at capacity. This is the system's
/// admission-control point.
#[derive(Debug, Clone, Copy)]
pub enum AdmissionPolicy {
    /// Wait up to the given duration for capacity, then fail.
    Block { wait: Duration },
    /// Fail immediately with a provisioning error.
    FailFast,
}

/// What `execute` does when the target instance is already running a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyPolicy {
    /// Queue behind the in-flight command.
    Wait,
    /// Reject with `SandboxError::Busy`.
    Reject,
}

/// Pool-level tuning for the sandbox manager.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum instances alive at once (warm + active).
    pub max_instances: usize,
    /// Warm instances retained per resource profile.
    pub max_warm_per_profile: usize,
    /// Warm instances idle longer than this are evicted by the sweep.
    pub idle_ttl: Duration,
    /// Interval between idle-eviction sweeps.
    pub sweep_interval: Duration,
    pub admission: AdmissionPolicy,
    pub busy: BusyPolicy,
    /// Execute timeout applied when the caller does not supply one.
    pub default_exec_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: 8,
            max_warm_per_profile: 2,
            idle_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            admission: AdmissionPolicy::Block {
                wait: Duration::from_secs(30),
            },
            busy: BusyPolicy::Wait,
            default_exec_timeout: Duration::from_secs(30),
        }
    }
}
