//! The engine: session handling, authorization, resource accounting, VM
//! lifecycle, and stream fan-out.
//!
//! Handlers are synchronous: each takes `&mut Engine`, mutates state, and
//! returns the list of [`Effect`]s to apply. The daemon holds the engine
//! behind a mutex and performs all I/O only after the lock is dropped, so
//! no task ever observes a half-applied transition. Handlers never block
//! and never touch a socket.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info, warn};

use skua_wire::{
    ConsoleLineBody, CrlFetchBody, CrlReplyBody, Frame, InfoReplyBody, LogLineBody,
    LogSubscribeBody, PathBody, StatAddBody, StatRemoveBody, StatSampleBody, Tag, VmSummary,
    WIRE_VERSION,
};

use crate::id::VmId;
use crate::policy::{ChainPolicy, CrlStore, Permission, RevocationLink, VmConfig};
use crate::ring::Ring;
use crate::vm::ExitReason;

pub mod resources;

// ---------------------------------------------------------------------------
// Outbound effects
// ---------------------------------------------------------------------------

/// One unit of I/O a handler asks the daemon to perform. Effects are
/// applied in order; per-session delivery is FIFO.
#[derive(Debug)]
pub enum Effect {
    /// Write a frame to a client session.
    Send { to: SocketAddr, frame: Frame },
    /// Close a client session.
    Close { to: SocketAddr },
    /// Write a frame to the console helper.
    Console(Frame),
    /// Write a frame to the stats helper.
    Stats(Frame),
    /// Deliver SIGTERM to a VM process.
    Kill { pid: u32 },
    /// Run the spawn continuation for an admitted create.
    Spawn(Box<SpawnRequest>),
}

/// The admitted create a spawn continuation executes: write the image,
/// boot the monitor, then report back via [`Engine::vm_started`] or
/// [`Engine::vm_spawn_failed`].
#[derive(Debug)]
pub struct SpawnRequest {
    pub requester: SocketAddr,
    pub id: VmId,
    pub config: VmConfig,
    pub links: Vec<RevocationLink>,
}

/// What the daemon does with a session after [`Engine::handle_initial`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialAction {
    /// VM certificate: read exactly one Create/ForceCreate frame.
    Create,
    /// Administrative or subscriber session: run the command loop.
    Loop,
    /// Acknowledged already (revocation install); close the transport.
    Close,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Which event stream a subscription covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Console,
    Log,
    Stat,
}

/// A connected TLS client.
#[derive(Debug)]
pub struct Session {
    pub addr: SocketAddr,
    pub prefix: VmId,
    pub permissions: crate::policy::PermissionSet,
    /// Streams this session receives, for disconnect cleanup.
    subs: HashSet<(Channel, VmId)>,
    /// Set while a VM certificate waits for its create frame.
    pending_vm: Option<ChainPolicy>,
}

/// A live VM and its subscriber sets.
#[derive(Debug)]
pub struct RunningVm {
    pub id: VmId,
    pub cpuid: u16,
    pub requested_memory_mb: u32,
    pub block: Option<(String, u32)>,
    pub networks: Vec<String>,
    pub argv: Option<Vec<String>>,
    pub pid: u32,
    pub started_ms: u64,
    /// Revocation coordinates of the chain that created the VM.
    pub links: Vec<RevocationLink>,
    console_subs: HashSet<SocketAddr>,
    log_subs: HashSet<SocketAddr>,
    stat_subs: HashSet<SocketAddr>,
}

impl RunningVm {
    fn subs(&self, channel: Channel) -> &HashSet<SocketAddr> {
        match channel {
            Channel::Console => &self.console_subs,
            Channel::Log => &self.log_subs,
            Channel::Stat => &self.stat_subs,
        }
    }

    fn subs_mut(&mut self, channel: Channel) -> &mut HashSet<SocketAddr> {
        match channel {
            Channel::Console => &mut self.console_subs,
            Channel::Log => &mut self.log_subs,
            Channel::Stat => &mut self.stat_subs,
        }
    }

    fn all_subscribers(&self) -> HashSet<SocketAddr> {
        let mut all = self.console_subs.clone();
        all.extend(&self.log_subs);
        all.extend(&self.stat_subs);
        all
    }

    fn summary(&self) -> VmSummary {
        VmSummary {
            id: self.id.clone().into(),
            cpuid: self.cpuid,
            memory_mb: self.requested_memory_mb,
            block_device: self.block.as_ref().map(|(name, _)| name.clone()),
            networks: self.networks.clone(),
            started_ms: self.started_ms,
        }
    }
}

/// One retained log line.
#[derive(Debug, Clone, Default)]
pub struct LogEntry {
    pub id: VmId,
    pub line: String,
}

/// The engine state. One instance per daemon, owned by the event loop.
pub struct Engine {
    workdir: PathBuf,
    version: u16,
    vms: HashMap<VmId, RunningVm>,
    /// Pre-empted or revoked VMs kept only until their process is reaped,
    /// so their subscribers still receive the terminal event. Never
    /// counted against any budget.
    dying: HashMap<u32, RunningVm>,
    /// Ids admitted but not yet booted; blocks duplicate creates while a
    /// spawn continuation is in flight.
    reserving: HashSet<VmId>,
    sessions: HashMap<SocketAddr, Session>,
    crls: CrlStore,
    ring: Ring<LogEntry>,
    stats_available: bool,
}

fn frame<B: Serialize>(version: u16, tag: Tag, body: &B) -> Frame {
    Frame {
        version,
        tag,
        body: serde_json::to_vec(body).unwrap_or_default(),
    }
}

impl Engine {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            version: WIRE_VERSION,
            vms: HashMap::new(),
            dying: HashMap::new(),
            reserving: HashSet::new(),
            sessions: HashMap::new(),
            crls: CrlStore::new(),
            ring: Ring::new(),
            stats_available: false,
        }
    }

    pub fn workdir(&self) -> &std::path::Path {
        &self.workdir
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn crls(&self) -> &CrlStore {
        &self.crls
    }

    pub fn set_stats_available(&mut self, available: bool) {
        self.stats_available = available;
    }

    pub fn vm(&self, id: &VmId) -> Option<&RunningVm> {
        self.vms.get(id)
    }

    pub fn vm_count(&self) -> usize {
        self.vms.len()
    }

    fn fail(&self, message: impl Into<String>) -> Frame {
        Frame::failure(message, self.version)
    }

    // -----------------------------------------------------------------------
    // Session entry
    // -----------------------------------------------------------------------

    /// Classify a freshly authenticated session. The chain behind
    /// `policy` has already been verified against the trust root and the
    /// current revocation snapshot.
    pub fn handle_initial(
        &mut self,
        addr: SocketAddr,
        policy: ChainPolicy,
    ) -> (InitialAction, Vec<Effect>) {
        let prefix = policy.prefix.clone();
        let permissions = policy.permissions.clone();
        info!(peer = %addr, prefix = %prefix, leaf = %policy.name, "session authenticated");

        let is_crl = policy.crl.is_some();
        let is_vm = policy.vm.is_some();
        self.sessions.insert(
            addr,
            Session {
                addr,
                prefix,
                permissions: permissions.clone(),
                subs: HashSet::new(),
                pending_vm: if is_vm { Some(policy.clone()) } else { None },
            },
        );

        if is_crl {
            let mut effects = Vec::new();
            if !permissions.allows(Permission::Crl) {
                effects.push(Effect::Send {
                    to: addr,
                    frame: self.fail("permission denied: crl"),
                });
                effects.push(Effect::Close { to: addr });
                return (InitialAction::Close, effects);
            }
            let der = policy.crl.as_deref().unwrap_or_default();
            match self.crls.install(der) {
                Ok(issuer) => {
                    info!(issuer = %issuer, "revocation list installed");
                    effects.extend(self.revoke_swept_vms());
                    effects.push(Effect::Send {
                        to: addr,
                        frame: Frame::success(self.version),
                    });
                }
                Err(e) => {
                    warn!(error = %e, "revocation list rejected");
                    effects.push(Effect::Send {
                        to: addr,
                        frame: self.fail(e.to_string()),
                    });
                }
            }
            effects.push(Effect::Close { to: addr });
            return (InitialAction::Close, effects);
        }

        if is_vm {
            if !permissions.allows(Permission::Create)
                && !permissions.allows(Permission::ForceCreate)
            {
                let effects = vec![
                    Effect::Send {
                        to: addr,
                        frame: self.fail("permission denied: create"),
                    },
                    Effect::Close { to: addr },
                ];
                return (InitialAction::Close, effects);
            }
            return (InitialAction::Create, Vec::new());
        }

        (InitialAction::Loop, Vec::new())
    }

    /// Kill every live VM whose chain the updated revocation store now
    /// rejects. The victims move to `dying` so their subscribers still
    /// see the terminal event when the process is reaped.
    fn revoke_swept_vms(&mut self) -> Vec<Effect> {
        let doomed: Vec<VmId> = self
            .vms
            .values()
            .filter(|vm| self.crls.revokes(&vm.links))
            .map(|vm| vm.id.clone())
            .collect();
        let mut effects = Vec::new();
        for id in doomed {
            if let Some(vm) = self.vms.remove(&id) {
                info!(vm = %id, pid = vm.pid, "destroying revoked vm");
                effects.push(Effect::Kill { pid: vm.pid });
                self.dying.insert(vm.pid, vm);
            }
        }
        effects
    }

    // -----------------------------------------------------------------------
    // Command loop
    // -----------------------------------------------------------------------

    /// Dispatch one client frame.
    pub fn handle_command(&mut self, addr: SocketAddr, frame_in: Frame) -> Vec<Effect> {
        let Some(session) = self.sessions.get_mut(&addr) else {
            warn!(peer = %addr, "frame from unknown session");
            return vec![Effect::Close { to: addr }];
        };

        if frame_in.version != self.version {
            return vec![
                Effect::Send {
                    to: addr,
                    frame: Frame::failure(
                        format!(
                            "version mismatch: {} spoken here, {} received",
                            self.version, frame_in.version
                        ),
                        self.version,
                    ),
                },
                Effect::Close { to: addr },
            ];
        }

        // A VM-certificate session gets exactly one frame: its create.
        if session.pending_vm.is_some() {
            return self.handle_create(addr, frame_in);
        }

        match frame_in.tag {
            Tag::Info => self.cmd_info(addr, &frame_in),
            Tag::Destroy => self.cmd_destroy(addr, &frame_in),
            Tag::Console => self.cmd_subscribe(addr, &frame_in, Channel::Console),
            Tag::Log => self.cmd_log(addr, &frame_in),
            Tag::Statistics => self.cmd_statistics(addr, &frame_in),
            Tag::CrlFetch => self.cmd_crl_fetch(addr, &frame_in),
            Tag::Create | Tag::ForceCreate => vec![Effect::Send {
                to: addr,
                frame: self.fail("not a vm session"),
            }],
            tag => vec![Effect::Send {
                to: addr,
                frame: self.fail(format!("unknown command {:?}", tag)),
            }],
        }
    }

    fn handle_create(&mut self, addr: SocketAddr, frame_in: Frame) -> Vec<Effect> {
        let Some(session) = self.sessions.get_mut(&addr) else {
            return vec![Effect::Close { to: addr }];
        };
        let force = match frame_in.tag {
            Tag::Create => false,
            Tag::ForceCreate => true,
            _ => {
                return vec![
                    Effect::Send {
                        to: addr,
                        frame: self.fail("expected a create command"),
                    },
                    Effect::Close { to: addr },
                ];
            }
        };
        let Some(policy) = session.pending_vm.take() else {
            return vec![Effect::Close { to: addr }];
        };
        if force && !session.permissions.allows(Permission::ForceCreate) {
            return vec![
                Effect::Send {
                    to: addr,
                    frame: self.fail("permission denied: force-create"),
                },
                Effect::Close { to: addr },
            ];
        }
        if !force && !session.permissions.allows(Permission::Create) {
            return vec![
                Effect::Send {
                    to: addr,
                    frame: self.fail("permission denied: create"),
                },
                Effect::Close { to: addr },
            ];
        }

        let id = policy.full_id();
        let Some(config) = policy.vm.clone() else {
            return vec![Effect::Close { to: addr }];
        };

        let exists = self.vms.contains_key(&id);
        if self.reserving.contains(&id) || (exists && !force) {
            return vec![
                Effect::Send {
                    to: addr,
                    frame: self.fail("already exists"),
                },
                Effect::Close { to: addr },
            ];
        }

        // Budget check first, with the incumbent excluded when it is
        // about to be replaced. Nothing is killed for a create that
        // cannot be admitted.
        let exclude = if exists { Some(&id) } else { None };
        if let Err(msg) = resources::check_create(&policy.delegations, &self.vms, exclude, &config)
        {
            debug!(vm = %id, reason = %msg, "create rejected");
            return vec![
                Effect::Send {
                    to: addr,
                    frame: self.fail(msg),
                },
                Effect::Close { to: addr },
            ];
        }

        let mut effects = Vec::new();
        if exists {
            if let Some(incumbent) = self.vms.remove(&id) {
                info!(vm = %id, pid = incumbent.pid, "pre-empting for force-create");
                effects.push(Effect::Kill {
                    pid: incumbent.pid,
                });
                self.dying.insert(incumbent.pid, incumbent);
            }
        }

        self.reserving.insert(id.clone());
        effects.push(Effect::Spawn(Box::new(SpawnRequest {
            requester: addr,
            id,
            config,
            links: policy.links,
        })));
        effects
    }

    fn cmd_info(&mut self, addr: SocketAddr, frame_in: &Frame) -> Vec<Effect> {
        let Some(session) = self.sessions.get(&addr) else {
            return vec![Effect::Close { to: addr }];
        };
        if !session.permissions.allows(Permission::Info) {
            return vec![Effect::Send {
                to: addr,
                frame: self.fail("permission denied: info"),
            }];
        }
        let body: PathBody = match frame_in.parse() {
            Ok(b) => b,
            Err(_) => {
                return vec![Effect::Send {
                    to: addr,
                    frame: self.fail("malformed command body"),
                }]
            }
        };
        let target = session.prefix.join(&body.path);
        let mut vms: Vec<VmSummary> = self
            .vms
            .values()
            .filter(|vm| vm.id.starts_with(&target))
            .map(RunningVm::summary)
            .collect();
        vms.sort_by(|a, b| a.id.cmp(&b.id));
        vec![Effect::Send {
            to: addr,
            frame: frame(self.version, Tag::Success, &InfoReplyBody { vms }),
        }]
    }

    fn cmd_destroy(&mut self, addr: SocketAddr, frame_in: &Frame) -> Vec<Effect> {
        let Some(session) = self.sessions.get(&addr) else {
            return vec![Effect::Close { to: addr }];
        };
        let body: PathBody = match frame_in.parse() {
            Ok(b) => b,
            Err(_) => {
                return vec![Effect::Send {
                    to: addr,
                    frame: self.fail("malformed command body"),
                }]
            }
        };
        let id = session.prefix.join(&body.path);
        // ForceCreate alone only reaches the session's own identity; it
        // must not extend to siblings under the delegated prefix.
        let permitted = session.permissions.allows(Permission::Create)
            || (session.permissions.allows(Permission::ForceCreate) && id == session.prefix);
        if !permitted {
            return vec![Effect::Send {
                to: addr,
                frame: self.fail("permission denied: destroy"),
            }];
        }
        let Some(vm) = self.vms.get(&id) else {
            return vec![Effect::Send {
                to: addr,
                frame: self.fail("no such vm"),
            }];
        };
        info!(vm = %id, pid = vm.pid, "destroy requested");
        // The exit callback performs the cleanup once the process is gone.
        vec![
            Effect::Kill { pid: vm.pid },
            Effect::Send {
                to: addr,
                frame: Frame::success(self.version),
            },
        ]
    }

    fn cmd_subscribe(&mut self, addr: SocketAddr, frame_in: &Frame, channel: Channel) -> Vec<Effect> {
        let permission = match channel {
            Channel::Console => Permission::Console,
            Channel::Log => Permission::Log,
            Channel::Stat => Permission::Statistics,
        };
        let Some(session) = self.sessions.get_mut(&addr) else {
            return vec![Effect::Close { to: addr }];
        };
        if !session.permissions.allows(permission) {
            return vec![Effect::Send {
                to: addr,
                frame: Frame::failure(
                    format!("permission denied: {}", permission.name()),
                    self.version,
                ),
            }];
        }
        let body: PathBody = match frame_in.parse() {
            Ok(b) => b,
            Err(_) => {
                return vec![Effect::Send {
                    to: addr,
                    frame: Frame::failure("malformed command body", self.version),
                }]
            }
        };
        let id = session.prefix.join(&body.path);
        let Some(vm) = self.vms.get_mut(&id) else {
            return vec![Effect::Send {
                to: addr,
                frame: Frame::failure("no such vm", self.version),
            }];
        };
        vm.subs_mut(channel).insert(addr);
        session.subs.insert((channel, id));
        vec![Effect::Send {
            to: addr,
            frame: Frame::success(self.version),
        }]
    }

    fn cmd_log(&mut self, addr: SocketAddr, frame_in: &Frame) -> Vec<Effect> {
        let Some(session) = self.sessions.get_mut(&addr) else {
            return vec![Effect::Close { to: addr }];
        };
        if !session.permissions.allows(Permission::Log) {
            return vec![Effect::Send {
                to: addr,
                frame: Frame::failure("permission denied: log", self.version),
            }];
        }
        let body: LogSubscribeBody = match frame_in.parse() {
            Ok(b) => b,
            Err(_) => {
                return vec![Effect::Send {
                    to: addr,
                    frame: Frame::failure("malformed command body", self.version),
                }]
            }
        };
        let id = session.prefix.join(&body.path);
        let Some(vm) = self.vms.get_mut(&id) else {
            return vec![Effect::Send {
                to: addr,
                frame: Frame::failure("no such vm", self.version),
            }];
        };
        vm.subs_mut(Channel::Log).insert(addr);
        session.subs.insert((Channel::Log, id.clone()));

        let mut effects = vec![Effect::Send {
            to: addr,
            frame: Frame::success(self.version),
        }];
        if let Some(since) = body.since_ms {
            for (ts, entry) in self.ring.read_since(since) {
                if entry.id != id {
                    continue;
                }
                effects.push(Effect::Send {
                    to: addr,
                    frame: frame(
                        self.version,
                        Tag::LogLine,
                        &LogLineBody {
                            id: entry.id.clone().into(),
                            ts_ms: ts,
                            line: entry.line,
                        },
                    ),
                });
            }
        }
        effects
    }

    fn cmd_statistics(&mut self, addr: SocketAddr, frame_in: &Frame) -> Vec<Effect> {
        let permitted = self
            .sessions
            .get(&addr)
            .map(|s| s.permissions.allows(Permission::Statistics))
            .unwrap_or(false);
        if !permitted {
            return vec![Effect::Send {
                to: addr,
                frame: self.fail("permission denied: statistics"),
            }];
        }
        if !self.stats_available {
            return vec![Effect::Send {
                to: addr,
                frame: self.fail("statistics unavailable"),
            }];
        }
        let mut effects = self.cmd_subscribe(addr, frame_in, Channel::Stat);
        // The helper's sample is the reply: drop the subscribe ack and
        // forward a one-shot request instead.
        let subscribed = matches!(
            effects.last(),
            Some(Effect::Send { frame, .. }) if frame.tag == Tag::Success
        );
        if subscribed {
            effects.pop();
            if let Ok(body) = frame_in.parse::<PathBody>() {
                if let Some(session) = self.sessions.get(&addr) {
                    let id = session.prefix.join(&body.path);
                    effects.push(Effect::Stats(frame(
                        self.version,
                        Tag::StatRequest,
                        &PathBody::new(id.into()),
                    )));
                }
            }
        }
        effects
    }

    fn cmd_crl_fetch(&mut self, addr: SocketAddr, frame_in: &Frame) -> Vec<Effect> {
        let Some(session) = self.sessions.get(&addr) else {
            return vec![Effect::Close { to: addr }];
        };
        if !session.permissions.allows(Permission::Crl) {
            return vec![Effect::Send {
                to: addr,
                frame: self.fail("permission denied: crl"),
            }];
        }
        let body: CrlFetchBody = match frame_in.parse() {
            Ok(b) => b,
            Err(_) => {
                return vec![Effect::Send {
                    to: addr,
                    frame: self.fail("malformed command body"),
                }]
            }
        };
        match self.crls.stored(&body.issuer) {
            Some(der) => vec![Effect::Send {
                to: addr,
                frame: frame(
                    self.version,
                    Tag::Success,
                    &CrlReplyBody {
                        issuer: body.issuer,
                        der: der.to_vec(),
                    },
                ),
            }],
            None => vec![Effect::Send {
                to: addr,
                frame: self.fail(format!("no revocation list for {}", body.issuer)),
            }],
        }
    }

    // -----------------------------------------------------------------------
    // Spawn continuation callbacks
    // -----------------------------------------------------------------------

    /// Register a booted VM and acknowledge its creator.
    pub fn vm_started(&mut self, req: SpawnRequest, pid: u32, now_ms: u64) -> Vec<Effect> {
        self.reserving.remove(&req.id);
        let SpawnRequest {
            requester,
            id,
            config,
            links,
        } = req;
        info!(vm = %id, pid, "vm running");
        self.ring.append(
            now_ms,
            LogEntry {
                id: id.clone(),
                line: "created".to_string(),
            },
        );
        let vm = RunningVm {
            id: id.clone(),
            cpuid: config.cpuid,
            requested_memory_mb: config.requested_memory_mb,
            block: config.block_device,
            networks: config.networks,
            argv: config.argv,
            pid,
            started_ms: now_ms,
            links,
            console_subs: HashSet::new(),
            log_subs: HashSet::new(),
            stat_subs: HashSet::new(),
        };
        self.vms.insert(id.clone(), vm);

        let mut effects = vec![Effect::Console(frame(
            self.version,
            Tag::ConsoleAttach,
            &PathBody::new(id.clone().into()),
        ))];
        if self.stats_available {
            effects.push(Effect::Stats(frame(
                self.version,
                Tag::StatAdd,
                &StatAddBody {
                    id: id.into(),
                    pid,
                },
            )));
        }
        effects.push(Effect::Send {
            to: requester,
            frame: Frame::success(self.version),
        });
        effects.push(Effect::Close { to: requester });
        effects
    }

    /// Roll back an admitted create whose continuation failed.
    pub fn vm_spawn_failed(
        &mut self,
        requester: SocketAddr,
        id: &VmId,
        message: impl Into<String>,
    ) -> Vec<Effect> {
        self.reserving.remove(id);
        let message = message.into();
        warn!(vm = %id, reason = %message, "spawn failed");
        vec![
            Effect::Send {
                to: requester,
                frame: self.fail(message),
            },
            Effect::Close { to: requester },
        ]
    }

    // -----------------------------------------------------------------------
    // VM exit
    // -----------------------------------------------------------------------

    /// The dedicated wait task reaped `pid`. Remove the VM, notify every
    /// subscriber with the terminal event, then drop the subscriptions.
    pub fn handle_shutdown(&mut self, pid: u32, reason: ExitReason, now_ms: u64) -> Vec<Effect> {
        let live_id = self
            .vms
            .values()
            .find(|vm| vm.pid == pid)
            .map(|vm| vm.id.clone());
        let vm = match live_id {
            Some(id) => self.vms.remove(&id),
            None => self.dying.remove(&pid),
        };
        let Some(vm) = vm else {
            debug!(pid, "exit of unknown pid");
            return Vec::new();
        };

        info!(vm = %vm.id, pid, %reason, "vm stopped");
        let line = reason.to_string();
        self.ring.append(
            now_ms,
            LogEntry {
                id: vm.id.clone(),
                line: line.clone(),
            },
        );

        // A replacement VM may already occupy the id (force-create);
        // its console attachment and subscriptions must survive the old
        // process being reaped.
        let id_replaced = self.vms.contains_key(&vm.id);

        let mut effects = Vec::new();
        if !id_replaced {
            effects.push(Effect::Console(frame(
                self.version,
                Tag::ConsoleDetach,
                &PathBody::new(vm.id.clone().into()),
            )));
        }
        if self.stats_available {
            effects.push(Effect::Stats(frame(
                self.version,
                Tag::StatRemove,
                &StatRemoveBody { pid },
            )));
        }
        let terminal = frame(
            self.version,
            Tag::LogLine,
            &LogLineBody {
                id: vm.id.clone().into(),
                ts_ms: now_ms,
                line,
            },
        );
        for sub in vm.all_subscribers() {
            effects.push(Effect::Send {
                to: sub,
                frame: terminal.clone(),
            });
        }
        if !id_replaced {
            // Drop the dead id from every session's subscription set.
            for session in self.sessions.values_mut() {
                session.subs.retain(|(_, sid)| *sid != vm.id);
            }
        }
        effects
    }

    // -----------------------------------------------------------------------
    // Helper feeds
    // -----------------------------------------------------------------------

    /// An event from the console helper: fan the line out to subscribers.
    pub fn handle_cons(&mut self, frame_in: Frame) -> Vec<Effect> {
        if frame_in.tag != Tag::ConsoleLine {
            debug!(tag = ?frame_in.tag, "unexpected frame from console helper");
            return Vec::new();
        }
        let Ok(body) = frame_in.parse::<ConsoleLineBody>() else {
            debug!("malformed console event");
            return Vec::new();
        };
        let id = VmId::new(body.id.clone());
        let Some(vm) = self.vms.get(&id) else {
            debug!(vm = %id, "console line for unknown vm");
            return Vec::new();
        };
        let out = frame(self.version, Tag::ConsoleLine, &body);
        vm.subs(Channel::Console)
            .iter()
            .map(|sub| Effect::Send {
                to: *sub,
                frame: out.clone(),
            })
            .collect()
    }

    /// An event from the log helper: retain the line and fan it out.
    pub fn handle_log(&mut self, frame_in: Frame) -> Vec<Effect> {
        if frame_in.tag != Tag::LogLine {
            debug!(tag = ?frame_in.tag, "unexpected frame from log helper");
            return Vec::new();
        }
        let Ok(body) = frame_in.parse::<LogLineBody>() else {
            debug!("malformed log event");
            return Vec::new();
        };
        let id = VmId::new(body.id.clone());
        let Some(vm) = self.vms.get(&id) else {
            debug!(vm = %id, "log line for unknown vm");
            return Vec::new();
        };
        self.ring.append(
            body.ts_ms,
            LogEntry {
                id: id.clone(),
                line: body.line.clone(),
            },
        );
        let out = frame(self.version, Tag::LogLine, &body);
        vm.subs(Channel::Log)
            .iter()
            .map(|sub| Effect::Send {
                to: *sub,
                frame: out.clone(),
            })
            .collect()
    }

    /// An event from the stats helper: fan the sample out to subscribers.
    pub fn handle_stat(&mut self, frame_in: Frame) -> Vec<Effect> {
        if frame_in.tag != Tag::StatSample {
            debug!(tag = ?frame_in.tag, "unexpected frame from stats helper");
            return Vec::new();
        }
        let Ok(body) = frame_in.parse::<StatSampleBody>() else {
            debug!("malformed stat event");
            return Vec::new();
        };
        let id = VmId::new(body.id.clone());
        let Some(vm) = self.vms.get(&id) else {
            debug!(vm = %id, "stat sample for unknown vm");
            return Vec::new();
        };
        let out = frame(self.version, Tag::StatSample, &body);
        vm.subs(Channel::Stat)
            .iter()
            .map(|sub| Effect::Send {
                to: *sub,
                frame: out.clone(),
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Disconnect
    // -----------------------------------------------------------------------

    /// A session's transport is gone: release every subscription it held
    /// and forget it.
    pub fn handle_disconnect(&mut self, addr: SocketAddr) -> Vec<Effect> {
        let Some(session) = self.sessions.remove(&addr) else {
            return Vec::new();
        };
        debug!(peer = %addr, "session disconnected");
        for (channel, id) in &session.subs {
            if let Some(vm) = self.vms.get_mut(id) {
                vm.subs_mut(*channel).remove(&addr);
            }
            for vm in self.dying.values_mut() {
                if vm.id == *id {
                    vm.subs_mut(*channel).remove(&addr);
                }
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Delegation, PermissionSet, VmImage};
    use std::collections::BTreeSet;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn vm_id(parts: &[&str]) -> VmId {
        VmId::new(parts.iter().map(|s| s.to_string()).collect())
    }

    fn perms(list: &[Permission]) -> PermissionSet {
        list.iter().copied().collect()
    }

    fn tenant_delegation(memory_mb: u32, vms: u32) -> Delegation {
        Delegation {
            vms,
            cpuids: BTreeSet::from([0]),
            memory_mb,
            block_mb: None,
            bridges: Default::default(),
        }
    }

    fn vm_policy(prefix: &[&str], name: &str, memory_mb: u32) -> ChainPolicy {
        ChainPolicy {
            prefix: vm_id(prefix),
            name: name.to_string(),
            permissions: perms(&[Permission::Create, Permission::ForceCreate]),
            delegations: vec![(vm_id(prefix), tenant_delegation(256, 2))],
            vm: Some(VmConfig {
                cpuid: 0,
                requested_memory_mb: memory_mb,
                block_device: None,
                networks: vec![],
                image: VmImage::Amd64(vec![0x7F]),
                argv: None,
            }),
            crl: None,
            links: vec![],
        }
    }

    fn admin_policy(prefix: &[&str], permissions: &[Permission]) -> ChainPolicy {
        ChainPolicy {
            prefix: vm_id(prefix),
            name: "admin".to_string(),
            permissions: perms(permissions),
            delegations: vec![],
            vm: None,
            crl: None,
            links: vec![],
        }
    }

    /// Drive a whole create transaction: classification, create frame,
    /// spawn continuation.
    fn boot_vm(engine: &mut Engine, port: u16, policy: ChainPolicy, pid: u32) -> VmId {
        let creator = addr(port);
        let (action, effects) = engine.handle_initial(creator, policy);
        assert_eq!(action, InitialAction::Create);
        assert!(effects.is_empty());
        let effects = engine.handle_command(creator, Frame::bare(Tag::Create));
        let req = effects
            .into_iter()
            .find_map(|e| match e {
                Effect::Spawn(req) => Some(req),
                _ => None,
            })
            .expect("create admitted");
        let id = req.id.clone();
        engine.vm_started(*req, pid, 1_000);
        id
    }

    #[test]
    fn loop_classification_for_admin_certs() {
        let mut engine = Engine::new("/tmp/skua-test");
        let (action, effects) =
            engine.handle_initial(addr(1), admin_policy(&[], &[Permission::Info]));
        assert_eq!(action, InitialAction::Loop);
        assert!(effects.is_empty());
    }

    #[test]
    fn create_without_permission_is_refused() {
        let mut engine = Engine::new("/tmp/skua-test");
        let mut policy = vm_policy(&["tenant"], "vm1", 128);
        policy.permissions = perms(&[Permission::Info]);
        let (action, effects) = engine.handle_initial(addr(1), policy);
        assert_eq!(action, InitialAction::Close);
        assert!(matches!(effects[0], Effect::Send { .. }));
    }

    #[test]
    fn info_is_prefix_scoped() {
        let mut engine = Engine::new("/tmp/skua-test");
        boot_vm(&mut engine, 1, vm_policy(&["tenant"], "vm1", 64), 100);
        boot_vm(&mut engine, 2, vm_policy(&["other"], "vm2", 64), 101);

        let viewer = addr(3);
        engine.handle_initial(viewer, admin_policy(&["tenant"], &[Permission::Info]));
        let effects = engine.handle_command(
            viewer,
            Frame::new(Tag::Info, &PathBody::default()).unwrap(),
        );
        let Effect::Send { frame, .. } = &effects[0] else {
            panic!("expected a reply");
        };
        let reply: InfoReplyBody = frame.parse().unwrap();
        assert_eq!(reply.vms.len(), 1);
        assert_eq!(reply.vms[0].id, vec!["tenant".to_string(), "vm1".to_string()]);
    }

    #[test]
    fn duplicate_create_while_spawn_in_flight_is_refused() {
        let mut engine = Engine::new("/tmp/skua-test");
        let creator = addr(1);
        engine.handle_initial(creator, vm_policy(&["tenant"], "vm1", 64));
        let effects = engine.handle_command(creator, Frame::bare(Tag::Create));
        assert!(matches!(effects[0], Effect::Spawn(_)));

        // Same id again before vm_started lands.
        let rival = addr(2);
        engine.handle_initial(rival, vm_policy(&["tenant"], "vm1", 64));
        let effects = engine.handle_command(rival, Frame::bare(Tag::Create));
        let Effect::Send { frame, .. } = &effects[0] else {
            panic!("expected a refusal");
        };
        let body: skua_wire::FailureBody = frame.parse().unwrap();
        assert_eq!(body.message, "already exists");
    }

    #[test]
    fn console_events_for_unknown_ids_are_dropped() {
        let mut engine = Engine::new("/tmp/skua-test");
        let event = frame(
            WIRE_VERSION,
            Tag::ConsoleLine,
            &ConsoleLineBody {
                id: vec!["ghost".into()],
                ts_ms: 1,
                line: b"boo".to_vec(),
            },
        );
        assert!(engine.handle_cons(event).is_empty());
    }

    #[test]
    fn disconnect_releases_subscriptions() {
        let mut engine = Engine::new("/tmp/skua-test");
        let id = boot_vm(&mut engine, 1, vm_policy(&["tenant"], "vm1", 64), 100);

        let watcher = addr(2);
        engine.handle_initial(watcher, admin_policy(&["tenant"], &[Permission::Console]));
        engine.handle_command(
            watcher,
            Frame::new(Tag::Console, &PathBody::new(vec!["vm1".into()])).unwrap(),
        );
        assert_eq!(engine.vm(&id).unwrap().subs(Channel::Console).len(), 1);

        engine.handle_disconnect(watcher);
        assert!(engine.vm(&id).unwrap().subs(Channel::Console).is_empty());
    }

    #[test]
    fn version_mismatch_closes_the_session() {
        let mut engine = Engine::new("/tmp/skua-test");
        let peer = addr(1);
        engine.handle_initial(peer, admin_policy(&[], &[Permission::Info]));
        let mut bad = Frame::new(Tag::Info, &PathBody::default()).unwrap();
        bad.version = 7;
        let effects = engine.handle_command(peer, bad);
        assert!(matches!(effects.last(), Some(Effect::Close { .. })));
    }
}
