//! VM process lifecycle: the abstract spawn contract and exit bookkeeping.
//!
//! The hypervisor itself is out of scope; [`Launcher`] is the seam the
//! daemon talks through. The production implementation execs a configured
//! unikernel monitor binary with the run parameters projected from the VM
//! certificate; tests plug in [`MockLauncher`].

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use crate::id::VmId;
use crate::{Error, Result};

/// Why a VM process stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Exited(i32),
    Signalled(i32),
    Stopped(i32),
}

impl ExitReason {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        if let Some(code) = status.code() {
            ExitReason::Exited(code)
        } else if let Some(sig) = status.signal() {
            ExitReason::Signalled(sig)
        } else if let Some(sig) = status.stopped_signal() {
            ExitReason::Stopped(sig)
        } else {
            ExitReason::Exited(-1)
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Exited(code) => write!(f, "exited {}", code),
            ExitReason::Signalled(sig) => write!(f, "signalled {}", sig),
            ExitReason::Stopped(sig) => write!(f, "stopped {}", sig),
        }
    }
}

/// Everything the monitor needs to boot one VM. The image has already
/// been written (and decompressed) to `image_path` by the caller.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub id: VmId,
    pub image_path: PathBuf,
    /// File the VM's console output is directed to; the console helper
    /// tails it once the engine attaches the id.
    pub console_path: PathBuf,
    pub cpuid: u16,
    pub memory_mb: u32,
    pub block_device: Option<(String, u32)>,
    pub networks: Vec<String>,
    pub argv: Option<Vec<String>>,
}

/// A booted VM process: its pid plus a future resolving when it stops.
pub struct Spawned {
    pub pid: u32,
    pub wait: Pin<Box<dyn Future<Output = ExitReason> + Send>>,
}

/// The abstract spawn contract.
pub trait Launcher: Send + Sync {
    fn spawn(&self, spec: &LaunchSpec) -> Result<Spawned>;
}

// ---------------------------------------------------------------------------
// Monitor launcher
// ---------------------------------------------------------------------------

/// Execs a unikernel monitor binary, one guest per process.
pub struct MonitorLauncher {
    monitor: PathBuf,
}

impl MonitorLauncher {
    pub fn new(monitor: impl Into<PathBuf>) -> Self {
        Self {
            monitor: monitor.into(),
        }
    }
}

impl Launcher for MonitorLauncher {
    fn spawn(&self, spec: &LaunchSpec) -> Result<Spawned> {
        let console = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.console_path)
            .map_err(|e| Error::Spawn(format!("console sink {:?}: {}", spec.console_path, e)))?;

        let mut cmd = tokio::process::Command::new(&self.monitor);
        cmd.arg("--mem")
            .arg(spec.memory_mb.to_string())
            .arg("--cpu")
            .arg(spec.cpuid.to_string());
        for net in &spec.networks {
            cmd.arg("--net").arg(net);
        }
        if let Some((name, _size)) = &spec.block_device {
            cmd.arg("--block").arg(name);
        }
        cmd.arg(&spec.image_path);
        if let Some(argv) = &spec.argv {
            cmd.args(argv);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(
                console
                    .try_clone()
                    .map_err(|e| Error::Spawn(e.to_string()))?,
            ))
            .stderr(Stdio::from(console));

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Spawn(format!("monitor {:?}: {}", self.monitor, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Spawn("monitor exited before registration".to_string()))?;

        let wait = Box::pin(async move {
            match child.wait().await {
                Ok(status) => ExitReason::from_status(status),
                Err(_) => ExitReason::Exited(-1),
            }
        });
        Ok(Spawned { pid, wait })
    }
}

// ---------------------------------------------------------------------------
// Mock launcher (tests)
// ---------------------------------------------------------------------------

/// Test double: hands out pids without booting anything and lets the test
/// decide when and how each "process" exits.
pub struct MockLauncher {
    next_pid: std::sync::atomic::AtomicU32,
    exits: std::sync::Mutex<
        std::collections::HashMap<u32, tokio::sync::oneshot::Sender<ExitReason>>,
    >,
    pub specs: std::sync::Mutex<Vec<LaunchSpec>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: std::sync::atomic::AtomicU32::new(4711),
            exits: std::sync::Mutex::new(std::collections::HashMap::new()),
            specs: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Make the given pid's wait resolve.
    pub fn exit(&self, pid: u32, reason: ExitReason) {
        if let Some(tx) = self.exits.lock().unwrap().remove(&pid) {
            let _ = tx.send(reason);
        }
    }
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl Launcher for MockLauncher {
    fn spawn(&self, spec: &LaunchSpec) -> Result<Spawned> {
        let pid = self
            .next_pid
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.exits.lock().unwrap().insert(pid, tx);
        self.specs.lock().unwrap().push(spec.clone());
        let wait = Box::pin(async move { rx.await.unwrap_or(ExitReason::Exited(0)) });
        Ok(Spawned { pid, wait })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_reason_formats() {
        assert_eq!(ExitReason::Exited(0).to_string(), "exited 0");
        assert_eq!(ExitReason::Signalled(15).to_string(), "signalled 15");
        assert_eq!(ExitReason::Stopped(19).to_string(), "stopped 19");
    }

    #[tokio::test]
    async fn monitor_launcher_boots_and_reaps_a_process() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = MonitorLauncher::new("/bin/true");
        let spec = LaunchSpec {
            id: crate::id::VmId::new(vec!["t".into(), "v".into()]),
            image_path: dir.path().join("t.v.img"),
            console_path: dir.path().join("t.v.console"),
            cpuid: 0,
            memory_mb: 32,
            block_device: None,
            networks: vec![],
            argv: None,
        };
        let spawned = launcher.spawn(&spec).unwrap();
        assert!(spawned.pid > 0);
        assert_eq!(spawned.wait.await, ExitReason::Exited(0));
        assert!(spec.console_path.exists());
    }

    #[tokio::test]
    async fn monitor_launcher_reports_missing_binaries() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = MonitorLauncher::new(dir.path().join("no-such-monitor"));
        let spec = LaunchSpec {
            id: crate::id::VmId::new(vec!["t".into()]),
            image_path: dir.path().join("t.img"),
            console_path: dir.path().join("t.console"),
            cpuid: 0,
            memory_mb: 32,
            block_device: None,
            networks: vec![],
            argv: None,
        };
        assert!(launcher.spawn(&spec).is_err());
    }

    #[tokio::test]
    async fn mock_launcher_hands_out_pids_and_exits() {
        let launcher = MockLauncher::new();
        let spec = LaunchSpec {
            id: crate::id::VmId::new(vec!["t".into(), "v".into()]),
            image_path: "/tmp/t.v.img".into(),
            console_path: "/tmp/t.v.console".into(),
            cpuid: 0,
            memory_mb: 128,
            block_device: None,
            networks: vec![],
            argv: None,
        };
        let first = launcher.spawn(&spec).unwrap();
        let second = launcher.spawn(&spec).unwrap();
        assert_ne!(first.pid, second.pid);

        launcher.exit(first.pid, ExitReason::Signalled(15));
        assert_eq!(first.wait.await, ExitReason::Signalled(15));
        assert_eq!(launcher.specs.lock().unwrap().len(), 2);
    }
}
