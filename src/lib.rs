//! skua: certificate-driven orchestration of unikernel micro-VMs
//!
//! A single-host daemon that boots and supervises lightweight unikernel
//! VMs. Clients connect over mutually-authenticated TLS; the client
//! certificate chain *is* the policy: intermediates delegate resources
//! (VM slots, memory, CPUs, bridges, block storage) to tenant subtrees,
//! and leaves either define a VM to boot, announce a certificate
//! revocation list, or authorize an administrative session.
//!
//! # Architecture
//!
//! - [`engine`] owns all state and is purely synchronous: handlers take
//!   the current state and return outbound [`engine::Effect`]s.
//! - [`daemon`] is the event loop: it accepts TLS sessions, talks to the
//!   console/log/stats helper processes over framed Unix sockets, and
//!   applies effects.
//! - [`policy`] projects delegations, permissions, and VM configurations
//!   out of certificate chains and tracks revocation lists.
//! - The wire protocol lives in the `skua-wire` crate, shared with the
//!   helper binaries and clients.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use skua::daemon::{self, DaemonConfig};
//! use skua::vm::MonitorLauncher;
//!
//! #[tokio::main]
//! async fn main() -> skua::Result<()> {
//!     let config = DaemonConfig {
//!         workdir: "/run/skua".into(),
//!         cacert: "/etc/skua/cacert.pem".into(),
//!         cert: "/etc/skua/server.pem".into(),
//!         key: "/etc/skua/server.key".into(),
//!         port: daemon::LISTEN_PORT,
//!     };
//!     daemon::run(config, Arc::new(MonitorLauncher::new("ukvm-bin"))).await
//! }
//! ```

// Core modules
pub mod daemon;
pub mod engine;
pub mod error;
pub mod id;
pub mod policy;
pub mod ring;
pub mod tls;
pub mod transport;
pub mod vm;

pub use error::{Error, Result};

/// Commonly used types, one `use` away.
pub mod prelude {
    pub use crate::engine::{Effect, Engine, InitialAction};
    pub use crate::id::VmId;
    pub use crate::policy::{
        ChainPolicy, CrlStore, Delegation, Permission, PermissionSet, VmConfig, VmImage,
    };
    pub use crate::vm::{ExitReason, Launcher, MonitorLauncher};
    pub use crate::{Error, Result};
}
