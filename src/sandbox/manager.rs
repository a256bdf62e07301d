//! Sandbox manager - the single entry point for provisioning, execution and
//! file transfer.
//!
//! The manager owns every provider handle and a bounded pool of instances.
//! Operations on distinct instances run concurrently; operations on one
//! instance are serialized through a per-instance lock. The pool lock guards
//! only map bookkeeping and is never held across provider calls or guest
//! I/O: admission is decoupled from use via a semaphore, so a slow boot or a
//! long-running command cannot block unrelated callers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::channel::{ExecResult, ExecutionChannel};
use super::config::{AdmissionPolicy, BusyPolicy, PoolConfig, SandboxConfig};
use super::instance::{SandboxInstance, SandboxState};
use super::provider::{ProviderHandle, SandboxProvider};
use crate::error::{SandboxError, TransferError};
use crate::metrics::{
    SANDBOX_ACTIVE, SANDBOX_BOOT_DURATION, SANDBOX_EVICTIONS, SANDBOX_EXEC_DURATION,
    SANDBOX_STARTS, SANDBOX_WARM,
};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Instances in any live state (Ready or Busy).
    pub live_count: usize,
    /// Instances parked in the warm pool.
    pub warm_count: usize,
    /// Instances currently executing a command.
    pub busy_count: usize,
    pub max_instances: usize,
}

struct Entry {
    instance: SandboxInstance,
    handle: Option<ProviderHandle>,
    channel: Option<Arc<dyn ExecutionChannel>>,
    /// Serializes execute calls; two commands never interleave on one guest.
    exec_lock: Arc<Mutex<()>>,
    permit: Option<OwnedSemaphorePermit>,
}

/// Idempotency slot for a start token. `Pending` is held from reservation
/// until the attempt binds an instance or fails, so a concurrent retry
/// waits instead of provisioning a duplicate.
#[derive(Clone)]
enum TokenSlot {
    Pending,
    Bound(String),
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<String, Entry>,
    /// profile key -> ready instance ids available for warm reuse.
    warm: HashMap<String, Vec<String>>,
    /// request token -> slot, for idempotent retries of `start`.
    tokens: HashMap<String, TokenSlot>,
}

fn refresh_gauges(st: &PoolState) {
    let warm: usize = st.warm.values().map(Vec::len).sum();
    let busy = st
        .entries
        .values()
        .filter(|e| e.instance.state == SandboxState::Busy)
        .count();
    SANDBOX_WARM.set(warm as f64);
    SANDBOX_ACTIVE.set(busy as f64);
}

pub struct SandboxManager {
    provider: Arc<dyn SandboxProvider>,
    config: PoolConfig,
    /// Admission control: one permit per live instance.
    capacity: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

impl SandboxManager {
    pub fn new(provider: Arc<dyn SandboxProvider>, config: PoolConfig) -> Self {
        let capacity = Arc::new(Semaphore::new(config.max_instances));
        Self {
            provider,
            config,
            capacity,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Request a new or pooled-warm instance matching `config`.
    ///
    /// A caller-supplied `token` makes retries idempotent: at most one live
    /// instance exists per token. When the pool is at capacity the call
    /// blocks for a bounded wait or fails fast, per the admission policy.
    pub async fn start(
        &self,
        config: SandboxConfig,
        token: Option<&str>,
    ) -> Result<String, SandboxError> {
        // Token reservation. The first caller with a token claims it under
        // the pool lock; a concurrent or retried call either gets the bound
        // instance back or waits for the in-flight attempt to settle.
        if let Some(t) = token {
            loop {
                let claimed = {
                    let mut st = self.state.lock().await;
                    match st.tokens.get(t).cloned() {
                        Some(TokenSlot::Bound(id)) => {
                            match st.entries.get(&id).map(|e| e.instance.state) {
                                Some(SandboxState::Provisioning) => false,
                                Some(s) if s.is_live() => return Ok(id),
                                // Bound to a dead instance; reclaim the token.
                                _ => {
                                    st.tokens.insert(t.to_string(), TokenSlot::Pending);
                                    true
                                }
                            }
                        }
                        Some(TokenSlot::Pending) => false,
                        None => {
                            st.tokens.insert(t.to_string(), TokenSlot::Pending);
                            true
                        }
                    }
                };
                if claimed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }

        // Warm reuse, keyed by resource profile.
        if config.reusable {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            let key = config.profile_key();
            let reused = st.warm.get_mut(&key).and_then(Vec::pop);
            if st.warm.get(&key).map(Vec::is_empty).unwrap_or(false) {
                st.warm.remove(&key);
            }
            if let Some(id) = reused {
                if let Some(entry) = st.entries.get_mut(&id) {
                    entry.instance.touch();
                    if let Some(t) = token {
                        st.tokens.insert(t.to_string(), TokenSlot::Bound(id.clone()));
                    }
                    refresh_gauges(st);
                    SANDBOX_STARTS.with_label_values(&["warm_hit"]).inc();
                    debug!(instance = %id, "warm instance reused");
                    return Ok(id);
                }
            }
        }

        // Admission control. Acquisition of capacity is decoupled from the
        // (slow) provisioning that follows; no lock is held while waiting.
        let permit = match self.config.admission {
            AdmissionPolicy::FailFast => match self.capacity.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.unreserve_token(token).await;
                    SANDBOX_STARTS.with_label_values(&["rejected"]).inc();
                    return Err(SandboxError::Provision("pool at capacity".to_string()));
                }
            },
            AdmissionPolicy::Block { wait } => {
                match tokio::time::timeout(wait, self.capacity.clone().acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => {
                        self.unreserve_token(token).await;
                        return Err(SandboxError::Provision("pool is shut down".to_string()));
                    }
                    Err(_) => {
                        self.unreserve_token(token).await;
                        SANDBOX_STARTS.with_label_values(&["rejected"]).inc();
                        return Err(SandboxError::Provision(format!(
                            "no pool capacity within {wait:?}"
                        )));
                    }
                }
            }
        };

        let id = format!("sb-{}", Uuid::now_v7());
        let boot_start = Instant::now();

        {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            st.entries.insert(
                id.clone(),
                Entry {
                    instance: SandboxInstance::new(id.clone(), config.clone()),
                    handle: None,
                    channel: None,
                    exec_lock: Arc::new(Mutex::new(())),
                    permit: Some(permit),
                },
            );
            if let Some(t) = token {
                st.tokens.insert(t.to_string(), TokenSlot::Bound(id.clone()));
            }
        }

        info!(instance = %id, profile = %config.profile_key(), "provisioning sandbox");

        let handle = match self.provider.create(&id, &config).await {
            Ok(handle) => handle,
            Err(e) => {
                self.fail_instance(&id, None).await;
                SANDBOX_STARTS.with_label_values(&["failed"]).inc();
                return Err(provision_error(e));
            }
        };

        let channel = match self.provider.open_channel(&handle).await {
            Ok(channel) => channel,
            Err(e) => {
                self.fail_instance(&id, Some(handle)).await;
                SANDBOX_STARTS.with_label_values(&["failed"]).inc();
                return Err(provision_error(e));
            }
        };

        {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            if let Some(entry) = st.entries.get_mut(&id) {
                entry.handle = Some(handle);
                entry.channel = Some(channel);
                entry.instance.mark_ready();
            }
            refresh_gauges(st);
        }

        SANDBOX_BOOT_DURATION.observe(boot_start.elapsed().as_secs_f64());
        SANDBOX_STARTS.with_label_values(&["created"]).inc();
        info!(instance = %id, boot_secs = boot_start.elapsed().as_secs_f64(), "sandbox ready");
        Ok(id)
    }

    /// Run a command inside the instance.
    ///
    /// Calls on the same instance are serialized: a concurrent call either
    /// queues or is rejected with `Busy`, per the pool's busy policy. A
    /// guest-enforced timeout is reported in the result, not as an error.
    pub async fn execute(
        &self,
        instance_id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecResult, SandboxError> {
        let (channel, exec_lock) = self.live_channel(instance_id).await?;

        let _guard = match self.config.busy {
            BusyPolicy::Wait => exec_lock.lock_owned().await,
            BusyPolicy::Reject => exec_lock
                .try_lock_owned()
                .map_err(|_| SandboxError::Busy(instance_id.to_string()))?,
        };

        {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            match st.entries.get_mut(instance_id) {
                Some(entry) if entry.instance.is_live() => entry.instance.mark_busy(),
                _ => return Err(SandboxError::Terminated(instance_id.to_string())),
            }
            refresh_gauges(st);
        }

        let timeout = timeout.unwrap_or(self.config.default_exec_timeout);
        let result = channel.run(command, timeout).await;

        {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            if let Some(entry) = st.entries.get_mut(instance_id) {
                if entry.instance.state == SandboxState::Busy {
                    entry.instance.mark_ready();
                    entry.instance.touch();
                }
            }
            refresh_gauges(st);
        }

        if let Ok(ref exec) = result {
            SANDBOX_EXEC_DURATION.observe(exec.duration_ms / 1000.0);
            debug!(
                instance = instance_id,
                exit_code = exec.exit_code,
                timed_out = exec.timed_out,
                "command finished"
            );
        }
        result
    }

    /// Byte-exact copy of a host file into the guest.
    pub async fn upload_file(
        &self,
        instance_id: &str,
        local_path: impl AsRef<Path>,
        remote_path: &str,
    ) -> Result<(), SandboxError> {
        let (channel, _lock) = self.live_channel(instance_id).await?;
        let local_path = local_path.as_ref();
        let bytes = tokio::fs::read(local_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TransferError::NotFound(local_path.display().to_string())
            } else {
                TransferError::Io(e.to_string())
            }
        })?;
        channel.put(&bytes, remote_path).await?;
        self.touch(instance_id).await;
        Ok(())
    }

    /// Byte-exact copy of a guest file onto the host.
    pub async fn download_file(
        &self,
        instance_id: &str,
        remote_path: &str,
        local_path: impl AsRef<Path>,
    ) -> Result<(), SandboxError> {
        let (channel, _lock) = self.live_channel(instance_id).await?;
        let bytes = channel.get(remote_path).await?;
        tokio::fs::write(local_path.as_ref(), bytes)
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;
        self.touch(instance_id).await;
        Ok(())
    }

    /// Return a finished instance to the pool.
    ///
    /// Reusable instances are parked in the warm pool while the per-profile
    /// threshold allows; everything else is destroyed.
    pub async fn release(&self, instance_id: &str) -> Result<(), SandboxError> {
        let park = {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            let Some(entry) = st.entries.get_mut(instance_id) else {
                return Ok(());
            };
            if !entry.instance.is_live() {
                return Ok(());
            }
            let key = entry.instance.config.profile_key();
            let warm_for_profile = st.warm.get(&key).map(Vec::len).unwrap_or(0);
            // A Busy instance still has a command running; it is never
            // parked warm, only torn down.
            if entry.instance.state == SandboxState::Ready
                && entry.instance.config.reusable
                && warm_for_profile < self.config.max_warm_per_profile
            {
                entry.instance.touch();
                st.warm.entry(key).or_default().push(instance_id.to_string());
                refresh_gauges(st);
                debug!(instance = instance_id, "instance parked warm");
                true
            } else {
                false
            }
        };

        if park {
            Ok(())
        } else {
            self.stop(instance_id).await
        }
    }

    /// Tear an instance down. Idempotent: stopping an already-terminated or
    /// unknown instance is a no-op. Teardown faults are logged, never
    /// surfaced, so a stuck guest cannot block the caller.
    pub async fn stop(&self, instance_id: &str) -> Result<(), SandboxError> {
        let (handle, permit) = {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            let Some(entry) = st.entries.get_mut(instance_id) else {
                return Ok(());
            };
            if matches!(
                entry.instance.state,
                SandboxState::Terminated | SandboxState::Stopping
            ) {
                return Ok(());
            }
            entry.instance.mark_stopping();
            entry.channel = None;
            let taken = (entry.handle.take(), entry.permit.take());
            for list in st.warm.values_mut() {
                list.retain(|id| id != instance_id);
            }
            st.warm.retain(|_, list| !list.is_empty());
            st.tokens
                .retain(|_, slot| !matches!(slot, TokenSlot::Bound(id) if id.as_str() == instance_id));
            refresh_gauges(st);
            taken
        };

        if let Some(handle) = handle {
            if let Err(e) = self.provider.destroy(handle).await {
                warn!(instance = instance_id, error = %e, "teardown did not complete cleanly");
            }
        }

        {
            let mut guard = self.state.lock().await;
            if let Some(entry) = guard.entries.get_mut(instance_id) {
                entry.instance.mark_terminated();
            }
        }
        drop(permit);
        info!(instance = instance_id, "sandbox terminated");
        Ok(())
    }

    /// Evict warm instances idle past the TTL. Returns how many were
    /// terminated.
    pub async fn sweep_idle(&self) -> usize {
        let expired: Vec<String> = {
            let st = self.state.lock().await;
            st.warm
                .values()
                .flatten()
                .filter(|id| {
                    st.entries
                        .get(*id)
                        .map(|e| e.instance.idle_for() > self.config.idle_ttl)
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };

        for id in &expired {
            debug!(instance = %id, "evicting idle instance");
            let _ = self.stop(id).await;
            SANDBOX_EVICTIONS.inc();
        }

        // Terminated/Failed entries linger so instance_state stays
        // answerable after a stop, but not forever: prune them once they
        // outlive the TTL, or the map grows by one per instance ever made.
        {
            let mut st = self.state.lock().await;
            let before = st.entries.len();
            st.entries.retain(|_, e| {
                !matches!(
                    e.instance.state,
                    SandboxState::Terminated | SandboxState::Failed
                ) || e.instance.idle_for() <= self.config.idle_ttl
            });
            let pruned = before - st.entries.len();
            if pruned > 0 {
                debug!(pruned, "pruned stopped-instance records");
            }
        }

        expired.len()
    }

    /// Background idle-eviction sweep.
    pub fn start_idle_sweeper(manager: Arc<SandboxManager>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.sweep_interval);
            loop {
                interval.tick().await;
                let evicted = manager.sweep_idle().await;
                if evicted > 0 {
                    info!(evicted, "idle sweep finished");
                }
            }
        })
    }

    /// Destroy every instance. Used on process shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = {
            let st = self.state.lock().await;
            st.entries
                .iter()
                .filter(|(_, e)| e.instance.is_live())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            let _ = self.stop(&id).await;
        }
        info!("sandbox pool shut down");
    }

    pub async fn stats(&self) -> PoolStats {
        let st = self.state.lock().await;
        PoolStats {
            live_count: st.entries.values().filter(|e| e.instance.is_live()).count(),
            warm_count: st.warm.values().map(Vec::len).sum(),
            busy_count: st
                .entries
                .values()
                .filter(|e| e.instance.state == SandboxState::Busy)
                .count(),
            max_instances: self.config.max_instances,
        }
    }

    pub async fn instance_state(&self, instance_id: &str) -> Option<SandboxState> {
        let st = self.state.lock().await;
        st.entries.get(instance_id).map(|e| e.instance.state)
    }

    /// Fetch the channel and exec lock of a live instance without holding
    /// the pool lock afterwards.
    async fn live_channel(
        &self,
        instance_id: &str,
    ) -> Result<(Arc<dyn ExecutionChannel>, Arc<Mutex<()>>), SandboxError> {
        let st = self.state.lock().await;
        let entry = st
            .entries
            .get(instance_id)
            .ok_or_else(|| SandboxError::UnknownInstance(instance_id.to_string()))?;
        match entry.instance.state {
            SandboxState::Ready | SandboxState::Busy => {}
            SandboxState::Terminated | SandboxState::Stopping => {
                return Err(SandboxError::Terminated(instance_id.to_string()))
            }
            SandboxState::Failed => {
                return Err(SandboxError::Execution(format!(
                    "instance {instance_id} failed"
                )))
            }
            SandboxState::Provisioning => {
                return Err(SandboxError::Execution(format!(
                    "instance {instance_id} is still provisioning"
                )))
            }
        }
        let channel = entry
            .channel
            .clone()
            .ok_or_else(|| SandboxError::Execution(format!("instance {instance_id} has no channel")))?;
        Ok((channel, entry.exec_lock.clone()))
    }

    /// Drop a still-pending token reservation after a failed attempt so a
    /// retry can claim it.
    async fn unreserve_token(&self, token: Option<&str>) {
        let Some(t) = token else { return };
        let mut st = self.state.lock().await;
        if matches!(st.tokens.get(t), Some(TokenSlot::Pending)) {
            st.tokens.remove(t);
        }
    }

    async fn touch(&self, instance_id: &str) {
        let mut st = self.state.lock().await;
        if let Some(entry) = st.entries.get_mut(instance_id) {
            entry.instance.touch();
        }
    }

    /// Guaranteed cleanup on a provider fault: the instance is recorded as
    /// Failed, its resources destroyed best-effort and its capacity permit
    /// released. Provider faults never propagate as panics.
    async fn fail_instance(&self, instance_id: &str, handle: Option<ProviderHandle>) {
        let permit = {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            st.tokens
                .retain(|_, slot| !matches!(slot, TokenSlot::Bound(id) if id.as_str() == instance_id));
            match st.entries.get_mut(instance_id) {
                Some(entry) => {
                    entry.instance.mark_failed();
                    entry.channel = None;
                    entry.permit.take()
                }
                None => None,
            }
        };
        if let Some(handle) = handle {
            if let Err(e) = self.provider.destroy(handle).await {
                warn!(instance = instance_id, error = %e, "cleanup of failed instance incomplete");
            }
        }
        drop(permit);
    }
}

fn provision_error(e: SandboxError) -> SandboxError {
    match e {
        SandboxError::Provision(_) => e,
        other => SandboxError::Provision(other.to_string()),
    }
}
