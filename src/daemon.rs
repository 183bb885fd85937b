//! Daemon loop: the TLS listener, the three helper links, per-session
//! tasks, and the application of engine effects.
//!
//! The engine lives behind a mutex; every handler call happens inside a
//! short critical section that performs no I/O, and the returned effects
//! are applied after the lock is dropped. Each accepted session runs as
//! its own task; each helper feeder runs forever; each VM has a dedicated
//! wait task that reaps its process.

use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpSocket, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use skua_wire::{Frame, WireError, WIRE_VERSION};

use crate::engine::{Effect, Engine, InitialAction, SpawnRequest};
use crate::policy::chain::verify_chain;
use crate::policy::VmImage;
use crate::transport::{self, FrameTx};
use crate::vm::{LaunchSpec, Launcher};
use crate::{tls, Error, Result};

/// TCP port the TLS listener binds.
pub const LISTEN_PORT: u16 = 1025;

/// Console helper socket name in the working directory.
pub const CONSOLE_SOCKET: &str = "cons.sock";
/// Log helper socket name in the working directory.
pub const LOG_SOCKET: &str = "log.sock";
/// Stats helper socket name in the working directory.
pub const STAT_SOCKET: &str = "stat.sock";

/// Startup parameters of the daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Holds the helper sockets and per-VM image files.
    pub workdir: PathBuf,
    /// Trust anchor for client chains (PEM, exactly one certificate).
    pub cacert: PathBuf,
    /// Server certificate (PEM).
    pub cert: PathBuf,
    /// Server private key (PEM).
    pub key: PathBuf,
    /// TCP port to listen on.
    pub port: u16,
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Shared handles of a running daemon. Cheap to clone into tasks.
#[derive(Clone)]
pub struct Daemon {
    engine: Arc<Mutex<Engine>>,
    /// Writer channel per connected session, keyed by peer address.
    peers: Arc<Mutex<HashMap<SocketAddr, FrameTx>>>,
    cons_tx: FrameTx,
    stats_tx: Arc<Mutex<Option<FrameTx>>>,
    launcher: Arc<dyn Launcher>,
    workdir: PathBuf,
    ca_der: Vec<u8>,
}

/// Run the daemon until the process exits. Startup errors (missing
/// helper sockets, unusable certificates, busy port) are returned; the
/// accept loop itself never returns.
pub async fn run(config: DaemonConfig, launcher: Arc<dyn Launcher>) -> Result<()> {
    // Writes to dead peers must surface as errors, not signals.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let cons = UnixStream::connect(config.workdir.join(CONSOLE_SOCKET))
        .await
        .map_err(|e| Error::Helper(format!("console helper: {}", e)))?;
    let log = UnixStream::connect(config.workdir.join(LOG_SOCKET))
        .await
        .map_err(|e| Error::Helper(format!("log helper: {}", e)))?;
    let stats = match UnixStream::connect(config.workdir.join(STAT_SOCKET)).await {
        Ok(stream) => Some(stream),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("stats helper socket absent, statistics disabled");
            None
        }
        Err(e) => {
            warn!(error = %e, "stats helper unreachable, statistics disabled");
            None
        }
    };

    let ca = tls::load_ca(&config.cacert)?;
    let certs = tls::load_certs(&config.cert)?;
    let key = tls::load_key(&config.key)?;
    let tls_config = tls::server_config(&ca, certs, key)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(([0, 0, 0, 0], config.port).into())?;
    let listener = socket.listen(64)?;
    info!(port = config.port, "listening");

    let mut engine = Engine::new(config.workdir.clone());
    engine.set_stats_available(stats.is_some());

    let (cons_read, cons_write) = cons.into_split();
    let (cons_tx, cons_rx) = transport::channel();
    tokio::spawn(async move {
        if let Err(e) = transport::pump(cons_rx, cons_write).await {
            error!(error = %e, "console helper write failed");
            std::process::exit(1);
        }
    });

    let stats_tx = Arc::new(Mutex::new(None));
    let daemon = Daemon {
        engine: Arc::new(Mutex::new(engine)),
        peers: Arc::new(Mutex::new(HashMap::new())),
        cons_tx,
        stats_tx,
        launcher,
        workdir: config.workdir.clone(),
        ca_der: ca.as_ref().to_vec(),
    };

    if let Some(stats) = stats {
        let (stats_read, stats_write) = stats.into_split();
        let (tx, rx) = transport::channel();
        *daemon.stats_tx.lock().await = Some(tx);
        let d = daemon.clone();
        tokio::spawn(async move {
            if let Err(e) = transport::pump(rx, stats_write).await {
                warn!(error = %e, "stats helper write failed");
                d.stats_gone().await;
            }
        });
        let d = daemon.clone();
        tokio::spawn(async move { d.read_stats(stats_read).await });
    }

    let d = daemon.clone();
    tokio::spawn(async move { d.read_cons(cons_read).await });
    let d = daemon.clone();
    let (log_read, _log_write) = log.into_split();
    tokio::spawn(async move { d.read_log(log_read).await });

    loop {
        match listener.accept().await {
            Ok((tcp, peer)) => {
                let daemon = daemon.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Err(e) = daemon.serve_session(acceptor, tcp, peer).await {
                        debug!(peer = %peer, error = %e, "session ended with error");
                    }
                    daemon.peers.lock().await.remove(&peer);
                    let effects = daemon.engine.lock().await.handle_disconnect(peer);
                    daemon.apply(effects).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

impl Daemon {
    /// Apply engine effects in order, after the engine lock is dropped.
    async fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { to, frame } => {
                    if let Some(tx) = self.peers.lock().await.get(&to) {
                        let _ = tx.send(frame);
                    } else {
                        debug!(peer = %to, "dropping frame for departed session");
                    }
                }
                Effect::Close { to } => {
                    // Dropping the sender ends the writer pump, which
                    // flushes queued frames and sends close-notify.
                    self.peers.lock().await.remove(&to);
                }
                Effect::Console(frame) => {
                    let _ = self.cons_tx.send(frame);
                }
                Effect::Stats(frame) => {
                    if let Some(tx) = &*self.stats_tx.lock().await {
                        let _ = tx.send(frame);
                    }
                }
                Effect::Kill { pid } => {
                    let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                    if rc != 0 {
                        warn!(pid, "kill failed");
                    }
                }
                Effect::Spawn(req) => {
                    self.spawn_vm(*req);
                }
            }
        }
    }

    async fn stats_gone(&self) {
        *self.stats_tx.lock().await = None;
        self.engine.lock().await.set_stats_available(false);
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    async fn serve_session(
        &self,
        acceptor: TlsAcceptor,
        tcp: tokio::net::TcpStream,
        peer: SocketAddr,
    ) -> Result<()> {
        let stream = acceptor.accept(tcp).await.map_err(Error::Io)?;
        let chain: Vec<Vec<u8>> = stream
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.iter().map(|der| der.as_ref().to_vec()).collect())
            .unwrap_or_default();

        let now = (now_ms() / 1000) as i64;
        let policy = {
            let engine = self.engine.lock().await;
            verify_chain(&chain, &self.ca_der, engine.crls(), now)
        };
        let policy = match policy {
            Ok(policy) => policy,
            Err(e) => {
                // Cryptographic and policy failures during session entry
                // close the transport after logging; nothing is written.
                info!(peer = %peer, error = %e, "rejecting session");
                return Ok(());
            }
        };

        let (mut read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = transport::channel();
        self.peers.lock().await.insert(peer, tx);
        tokio::spawn(async move {
            let _ = transport::pump(rx, write_half).await;
        });

        let (action, effects) = self.engine.lock().await.handle_initial(peer, policy);
        self.apply(effects).await;

        match action {
            InitialAction::Close => Ok(()),
            InitialAction::Create => {
                // Exactly one frame commits the create; then hold the
                // transport open until the spawn continuation has
                // acknowledged and closed it.
                let frame = Frame::read_from(&mut read_half).await?;
                let effects = self.engine.lock().await.handle_command(peer, frame);
                self.apply(effects).await;
                self.drain(read_half).await;
                Ok(())
            }
            InitialAction::Loop => self.command_loop(peer, read_half).await,
        }
    }

    async fn command_loop<R>(&self, peer: SocketAddr, mut read_half: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = match Frame::read_from(&mut read_half).await {
                Ok(frame) => frame,
                Err(WireError::Eof) => return Ok(()),
                Err(e) => {
                    // Framing errors are reported while the session is
                    // still writable, then the session closes.
                    if let Some(tx) = self.peers.lock().await.get(&peer) {
                        let _ = tx.send(Frame::failure(
                            format!("framing error: {}", e),
                            WIRE_VERSION,
                        ));
                    }
                    return Err(e.into());
                }
            };
            let effects = self.engine.lock().await.handle_command(peer, frame);
            let closed = effects
                .iter()
                .any(|e| matches!(e, Effect::Close { to } if *to == peer));
            self.apply(effects).await;
            if closed {
                return Ok(());
            }
        }
    }

    /// Read and discard until the peer hangs up.
    async fn drain<R: AsyncRead + Unpin>(&self, mut read_half: R) {
        let mut sink = [0u8; 1024];
        loop {
            match read_half.read(&mut sink).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Spawn continuation
    // -----------------------------------------------------------------------

    /// Execute an admitted create off the engine lock: write the image,
    /// boot the monitor, register the VM, then wait for the process.
    fn spawn_vm(&self, req: SpawnRequest) {
        let daemon = self.clone();
        tokio::spawn(async move {
            let requester = req.requester;
            let id = req.id.clone();
            match daemon.boot(&req).await {
                Ok(spawned) => {
                    let pid = spawned.pid;
                    let effects = daemon
                        .engine
                        .lock()
                        .await
                        .vm_started(req, pid, now_ms());
                    daemon.apply(effects).await;

                    let reason = spawned.wait.await;
                    let effects = daemon
                        .engine
                        .lock()
                        .await
                        .handle_shutdown(pid, reason, now_ms());
                    daemon.apply(effects).await;
                }
                Err(e) => {
                    let effects = daemon.engine.lock().await.vm_spawn_failed(
                        requester,
                        &id,
                        e.to_string(),
                    );
                    daemon.apply(effects).await;
                }
            }
        });
    }

    async fn boot(&self, req: &SpawnRequest) -> Result<crate::vm::Spawned> {
        let stem = req.id.file_stem();
        let image_path = self.workdir.join(format!("{}.img", stem));
        let image = unpack_image(&req.config.image)?;
        tokio::fs::write(&image_path, &image)
            .await
            .map_err(|e| Error::Spawn(format!("image {}: {}", image_path.display(), e)))?;

        let spec = LaunchSpec {
            id: req.id.clone(),
            image_path,
            console_path: self.workdir.join(format!("{}.console", stem)),
            cpuid: req.config.cpuid,
            memory_mb: req.config.requested_memory_mb,
            block_device: req.config.block_device.clone(),
            networks: req.config.networks.clone(),
            argv: req.config.argv.clone(),
        };
        self.launcher.spawn(&spec)
    }

    // -----------------------------------------------------------------------
    // Helper feeders
    // -----------------------------------------------------------------------

    /// Feed console helper events into the engine, forever. Losing the
    /// console helper is fatal: the engine cannot satisfy its contract
    /// without it.
    async fn read_cons<R: AsyncRead + Unpin>(&self, mut reader: R) {
        loop {
            match Frame::read_from(&mut reader).await {
                Ok(frame) => {
                    let effects = self.engine.lock().await.handle_cons(frame);
                    self.apply(effects).await;
                }
                Err(e @ (WireError::Eof | WireError::Io(_))) => {
                    error!(error = %e, "console helper lost");
                    std::process::exit(1);
                }
                Err(e) => {
                    warn!(error = %e, "ignoring malformed console event");
                }
            }
        }
    }

    /// Feed log helper events into the engine, forever. Losing the log
    /// helper is fatal.
    async fn read_log<R: AsyncRead + Unpin>(&self, mut reader: R) {
        loop {
            match Frame::read_from(&mut reader).await {
                Ok(frame) => {
                    let effects = self.engine.lock().await.handle_log(frame);
                    self.apply(effects).await;
                }
                Err(e @ (WireError::Eof | WireError::Io(_))) => {
                    error!(error = %e, "log helper lost");
                    std::process::exit(1);
                }
                Err(e) => {
                    warn!(error = %e, "ignoring malformed log event");
                }
            }
        }
    }

    /// Feed stats helper events into the engine until the helper goes
    /// away; statistics degrade to unavailable, the daemon stays up.
    async fn read_stats<R: AsyncRead + Unpin>(&self, mut reader: R) {
        loop {
            match Frame::read_from(&mut reader).await {
                Ok(frame) => {
                    let effects = self.engine.lock().await.handle_stat(frame);
                    self.apply(effects).await;
                }
                Err(e @ (WireError::Eof | WireError::Io(_))) => {
                    warn!(error = %e, "stats helper lost, statistics disabled");
                    self.stats_gone().await;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "ignoring malformed stat event");
                }
            }
        }
    }
}

/// Materialize the raw unikernel binary, inflating the compressed
/// variant.
fn unpack_image(image: &VmImage) -> Result<Vec<u8>> {
    match image {
        VmImage::Amd64(bytes) | VmImage::Arm64(bytes) => Ok(bytes.clone()),
        VmImage::Amd64Compressed(bytes) => {
            let mut out = Vec::new();
            flate2::read::DeflateDecoder::new(&bytes[..])
                .read_to_end(&mut out)
                .map_err(|e| Error::Spawn(format!("image decompression: {}", e)))?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn unpack_inflates_compressed_images() {
        let payload = b"unikernel image bytes".to_vec();
        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&payload).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(
            unpack_image(&VmImage::Amd64Compressed(compressed)).unwrap(),
            payload
        );
        assert_eq!(unpack_image(&VmImage::Amd64(payload.clone())).unwrap(), payload);
    }

    #[test]
    fn unpack_rejects_garbage() {
        assert!(unpack_image(&VmImage::Amd64Compressed(vec![0xFF, 0x00])).is_err());
    }
}
