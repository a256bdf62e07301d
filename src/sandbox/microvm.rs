//! MicroVM provider backed by Firecracker.
//!
//! One Firecracker process per instance, configured over its API Unix
//! socket, with a virtio-vsock device for host-guest traffic. The guest
//! image is expected to run an agent that listens on the vsock port and
//! speaks a line-delimited JSON protocol:
//!
//! ```text
//! -> {"op":"exec","command":"...","timeout_secs":30}
//! <- {"exit_code":0,"stdout":"...","stderr":"...","timed_out":false}
//! -> {"op":"put","path":"/x","data":"<base64>"}
//! <- {"ok":true}
//! -> {"op":"get","path":"/x"}
//! <- {"ok":true,"data":"<base64>"}  or  {"error":"...","kind":"not_found"}
//! ```
//!
//! Host-initiated vsock connections go through Firecracker's handshake:
//! connect to the vsock UDS, send `CONNECT {port}\n`, expect `OK {port}\n`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::channel::{ExecResult, ExecutionChannel};
use super::config::SandboxConfig;
use super::provider::{BackendKind, HandleData, ProviderHandle, SandboxProvider};
use crate::error::{SandboxError, TransferError};

type HyperClient = Client<UnixConnector, Full<Bytes>>;

/// Host-side settings for the Firecracker backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroVmConfig {
    pub firecracker_bin: PathBuf,
    pub kernel_path: PathBuf,
    /// Root filesystem image. `SandboxConfig::image` is resolved against
    /// this directory when it is not an absolute path.
    pub rootfs_dir: PathBuf,
    pub boot_args: String,
    /// Guest vsock port the agent listens on.
    pub vsock_port: u32,
    pub boot_wait_secs: u64,
    pub connect_retries: u32,
    pub connect_retry_delay_ms: u64,
}

impl Default for MicroVmConfig {
    fn default() -> Self {
        Self {
            firecracker_bin: PathBuf::from("./firecracker"),
            kernel_path: PathBuf::from("./vmlinux"),
            rootfs_dir: PathBuf::from("."),
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off quiet loglevel=0 root=/dev/vda rw"
                .to_string(),
            vsock_port: 6000,
            boot_wait_secs: 10,
            connect_retries: 20,
            connect_retry_delay_ms: 250,
        }
    }
}

pub(crate) struct MicroVmHandle {
    pub cid: u32,
    pub process: Child,
    pub api_socket: PathBuf,
    pub vsock_path: PathBuf,
}

impl MicroVmHandle {
    fn cleanup_files(&self) {
        for path in [&self.api_socket, &self.vsock_path] {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "failed to remove socket file");
                }
            }
        }
    }
}

pub struct MicroVmProvider {
    config: MicroVmConfig,
    /// CIDs 0-2 are reserved by the vsock spec, so allocation starts at 3.
    next_cid: AtomicU32,
    client: HyperClient,
}

impl MicroVmProvider {
    pub fn new(config: MicroVmConfig) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);
        Self {
            config,
            next_cid: AtomicU32::new(3),
            client,
        }
    }

    fn allocate_cid(&self) -> u32 {
        self.next_cid.fetch_add(1, Ordering::SeqCst)
    }

    /// PUT a JSON body to the Firecracker API over its Unix socket.
    async fn api_put(
        &self,
        socket: &PathBuf,
        endpoint: &str,
        body: Value,
    ) -> Result<(), SandboxError> {
        let uri: hyper::Uri = hyperlocal::Uri::new(socket, endpoint).into();
        let req = hyper::Request::builder()
            .method(hyper::Method::PUT)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .map_err(|e| SandboxError::Provision(format!("bad API request: {e}")))?;

        let res = self
            .client
            .request(req)
            .await
            .map_err(|e| SandboxError::Provision(format!("API request to {endpoint} failed: {e}")))?;

        let status = res.status();
        if !status.is_success() {
            let body = res
                .into_body()
                .collect()
                .await
                .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
                .unwrap_or_default();
            return Err(SandboxError::Provision(format!(
                "API error on {endpoint}: {status} - {body}"
            )));
        }
        Ok(())
    }

    async fn wait_for_api_socket(&self, socket: &PathBuf) -> Result<(), SandboxError> {
        let deadline = Instant::now() + Duration::from_secs(self.config.boot_wait_secs);
        while !socket.exists() {
            if Instant::now() > deadline {
                return Err(SandboxError::Provision(format!(
                    "Firecracker API socket not ready after {}s",
                    self.config.boot_wait_secs
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    fn rootfs_for(&self, config: &SandboxConfig) -> PathBuf {
        let image = PathBuf::from(&config.image);
        if image.is_absolute() {
            image
        } else {
            self.config.rootfs_dir.join(image)
        }
    }
}

#[async_trait]
impl SandboxProvider for MicroVmProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::MicroVm
    }

    async fn create(
        &self,
        id: &str,
        config: &SandboxConfig,
    ) -> Result<ProviderHandle, SandboxError> {
        let cid = self.allocate_cid();
        let api_socket = std::env::temp_dir().join(format!("firecracker-{id}.socket"));
        let vsock_path = std::env::temp_dir().join(format!("cowork-{id}.vsock"));

        // Stale files from a previous run would make Firecracker refuse to bind.
        let _ = std::fs::remove_file(&api_socket);
        let _ = std::fs::remove_file(&vsock_path);

        let process = Command::new(&self.config.firecracker_bin)
            .arg("--api-sock")
            .arg(&api_socket)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Provision(format!("failed to spawn firecracker: {e}")))?;

        let handle = MicroVmHandle {
            cid,
            process,
            api_socket,
            vsock_path,
        };

        // Any fault from here on must tear the partially-booted VM down.
        let booted = self.boot(&handle, config).await;
        if let Err(e) = booted {
            let mut failed = handle;
            let _ = failed.process.start_kill();
            let _ = failed.process.wait().await;
            failed.cleanup_files();
            return Err(e);
        }

        debug!(instance = id, cid, "microVM booted");
        Ok(ProviderHandle {
            id: id.to_string(),
            data: HandleData::MicroVm(handle),
        })
    }

    async fn destroy(&self, handle: ProviderHandle) -> Result<(), SandboxError> {
        let HandleData::MicroVm(mut vm) = handle.data else {
            return Err(SandboxError::Execution(
                "handle does not belong to the microVM provider".to_string(),
            ));
        };
        // Firecracker has no halt API; killing the VMM is the shutdown path.
        if let Err(e) = vm.process.start_kill() {
            warn!(error = %e, "firecracker process already gone");
        }
        let _ = vm.process.wait().await;
        vm.cleanup_files();
        Ok(())
    }

    async fn open_channel(
        &self,
        handle: &ProviderHandle,
    ) -> Result<Arc<dyn ExecutionChannel>, SandboxError> {
        let HandleData::MicroVm(vm) = &handle.data else {
            return Err(SandboxError::Execution(
                "handle does not belong to the microVM provider".to_string(),
            ));
        };
        let channel = VsockChannel {
            vsock_path: vm.vsock_path.clone(),
            port: self.config.vsock_port,
            connect_retries: self.config.connect_retries,
            connect_retry_delay: Duration::from_millis(self.config.connect_retry_delay_ms),
        };
        // Probe once so a guest agent that never came up surfaces as a
        // provisioning failure instead of a later execution error.
        channel.connect_with_retry().await.map_err(|e| {
            SandboxError::Provision(format!("guest agent not reachable: {e}"))
        })?;
        Ok(Arc::new(channel))
    }
}

impl MicroVmProvider {
    async fn boot(&self, handle: &MicroVmHandle, config: &SandboxConfig) -> Result<(), SandboxError> {
        self.wait_for_api_socket(&handle.api_socket).await?;

        let kernel = self.config.kernel_path.to_string_lossy().into_owned();
        let rootfs = self.rootfs_for(config).to_string_lossy().into_owned();
        let vsock_uds = handle.vsock_path.to_string_lossy().into_owned();

        self.api_put(
            &handle.api_socket,
            "/boot-source",
            json!({ "kernel_image_path": kernel, "boot_args": self.config.boot_args }),
        )
        .await?;

        self.api_put(
            &handle.api_socket,
            "/drives/rootfs",
            json!({
                "drive_id": "rootfs",
                "path_on_host": rootfs,
                "is_root_device": true,
                "is_read_only": false,
            }),
        )
        .await?;

        self.api_put(
            &handle.api_socket,
            "/machine-config",
            json!({ "vcpu_count": config.vcpus, "mem_size_mib": config.memory_mib }),
        )
        .await?;

        self.api_put(
            &handle.api_socket,
            "/vsock",
            json!({ "guest_cid": handle.cid, "uds_path": vsock_uds }),
        )
        .await?;

        self.api_put(
            &handle.api_socket,
            "/actions",
            json!({ "action_type": "InstanceStart" }),
        )
        .await
    }
}

/// Transport to the in-guest agent over the Firecracker vsock UDS.
struct VsockChannel {
    vsock_path: PathBuf,
    port: u32,
    connect_retries: u32,
    connect_retry_delay: Duration,
}

impl VsockChannel {
    /// Firecracker vsock handshake for host-initiated connections.
    async fn connect(&self) -> Result<BufReader<UnixStream>, SandboxError> {
        let stream = UnixStream::connect(&self.vsock_path).await.map_err(|e| {
            TransferError::Unreachable(format!(
                "cannot connect to {}: {e}",
                self.vsock_path.display()
            ))
        })?;

        let mut reader = BufReader::new(stream);
        reader
            .get_mut()
            .write_all(format!("CONNECT {}\n", self.port).as_bytes())
            .await
            .map_err(|e| SandboxError::Execution(format!("vsock handshake write failed: {e}")))?;

        let mut response = String::new();
        tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut response))
            .await
            .map_err(|_| SandboxError::TimedOut(Duration::from_secs(5)))?
            .map_err(|e| SandboxError::Execution(format!("vsock handshake read failed: {e}")))?;

        if !response.starts_with("OK ") {
            return Err(SandboxError::Execution(format!(
                "unexpected vsock handshake response: '{}'",
                response.trim()
            )));
        }
        Ok(reader)
    }

    /// Connect with retries; the guest agent may still be coming up.
    async fn connect_with_retry(&self) -> Result<BufReader<UnixStream>, SandboxError> {
        let mut last = None;
        for attempt in 0..self.connect_retries {
            match self.connect().await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    last = Some(e);
                    if attempt + 1 < self.connect_retries {
                        tokio::time::sleep(self.connect_retry_delay).await;
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| {
            SandboxError::Execution("vsock connect retries exhausted".to_string())
        }))
    }

    /// One request/response round trip on a fresh vsock connection.
    async fn request(&self, payload: Value, read_timeout: Duration) -> Result<Value, SandboxError> {
        let mut reader = self.connect_with_retry().await?;

        let mut line = payload.to_string();
        line.push('\n');
        reader
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SandboxError::Execution(format!("vsock write failed: {e}")))?;

        let mut response = String::new();
        tokio::time::timeout(read_timeout, reader.read_line(&mut response))
            .await
            .map_err(|_| SandboxError::TimedOut(read_timeout))?
            .map_err(|e| SandboxError::Execution(format!("vsock read failed: {e}")))?;

        serde_json::from_str(&response)
            .map_err(|e| SandboxError::Execution(format!("malformed guest response: {e}")))
    }
}

fn guest_error(value: &Value, remote_path: &str) -> SandboxError {
    let message = value["error"].as_str().unwrap_or("guest error").to_string();
    match value["kind"].as_str() {
        Some("not_found") => TransferError::NotFound(remote_path.to_string()).into(),
        Some("unreachable") => TransferError::Unreachable(message).into(),
        _ => TransferError::Io(message).into(),
    }
}

#[async_trait]
impl ExecutionChannel for VsockChannel {
    async fn run(&self, command: &str, timeout: Duration) -> Result<ExecResult, SandboxError> {
        let start = Instant::now();
        // The guest enforces the timeout and kills its child; the host read
        // deadline only guards against an unresponsive agent.
        let response = self
            .request(
                json!({
                    "op": "exec",
                    "command": command,
                    "timeout_secs": timeout.as_secs(),
                }),
                timeout + Duration::from_secs(10),
            )
            .await?;

        if response.get("error").is_some() {
            return Err(SandboxError::Execution(
                response["error"].as_str().unwrap_or("guest error").to_string(),
            ));
        }

        Ok(ExecResult {
            stdout: response["stdout"].as_str().unwrap_or("").to_string(),
            stderr: response["stderr"].as_str().unwrap_or("").to_string(),
            exit_code: response["exit_code"].as_i64().unwrap_or(-1) as i32,
            timed_out: response["timed_out"].as_bool().unwrap_or(false),
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }

    async fn put(&self, bytes: &[u8], remote_path: &str) -> Result<(), SandboxError> {
        let response = self
            .request(
                json!({
                    "op": "put",
                    "path": remote_path,
                    "data": BASE64.encode(bytes),
                }),
                Duration::from_secs(30),
            )
            .await?;

        if response["ok"].as_bool() == Some(true) {
            Ok(())
        } else {
            Err(guest_error(&response, remote_path))
        }
    }

    async fn get(&self, remote_path: &str) -> Result<Vec<u8>, SandboxError> {
        let response = self
            .request(
                json!({ "op": "get", "path": remote_path }),
                Duration::from_secs(30),
            )
            .await?;

        if response["ok"].as_bool() == Some(true) {
            let encoded = response["data"].as_str().unwrap_or("");
            BASE64
                .decode(encoded)
                .map_err(|e| TransferError::Io(format!("bad base64 from guest: {e}")).into())
        } else {
            Err(guest_error(&response, remote_path))
        }
    }
}
