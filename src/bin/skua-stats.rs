//! skua-stats - statistics helper for the skua daemon
//!
//! Listens on a Unix socket; the daemon connects and registers the pids
//! of running VMs. Every interval tick (and immediately on request) each
//! tracked pid is sampled from procfs and a sample event is pushed back.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use clap::Parser;
use tokio::net::{unix::OwnedWriteHalf, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use skua_wire::{Frame, PathBody, StatAddBody, StatRemoveBody, StatSample, StatSampleBody, Tag};

#[derive(Parser, Debug)]
#[clap(version, about = "Statistics helper for the skua daemon")]
struct Args {
    /// Unix socket to listen on
    #[clap(long, default_value_os_t = std::env::temp_dir().join("stat.sock"))]
    socket: PathBuf,
    /// Seconds between samples
    #[clap(long, default_value_t = 10)]
    interval: u64,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One sample from `/proc/<pid>/stat`: rss and cumulative cpu ticks.
fn sample_pid(pid: u32) -> Option<StatSample> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // Fields after the parenthesized comm, which may itself contain
    // spaces: state is field 3, utime 14, stime 15, rss 24 (pages).
    let rest = &stat[stat.rfind(')')? + 2..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let rss_pages: u64 = fields.get(21)?.parse().ok()?;
    Some(StatSample {
        rss_bytes: rss_pages * 4096,
        cpu_ticks: utime + stime,
    })
}

async fn push_sample(writer: &mut OwnedWriteHalf, id: Vec<String>, sample: StatSample) -> bool {
    let body = StatSampleBody {
        id,
        ts_ms: now_ms(),
        sample,
    };
    match Frame::new(Tag::StatSample, &body) {
        Ok(frame) => frame.write_to(writer).await.is_ok(),
        Err(_) => true,
    }
}

/// Serve one daemon connection until it goes away.
async fn serve(stream: UnixStream, interval: Duration) {
    let (mut reader, mut writer) = stream.into_split();
    // Frame reads are not cancellation-safe mid-header; a dedicated
    // reader task keeps the select loop clean.
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            match Frame::read_from(&mut reader).await {
                Ok(frame) => {
                    if tx.send(frame).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "daemon link closed");
                    return;
                }
            }
        }
    });

    let mut tracked: HashMap<u32, Vec<String>> = HashMap::new();
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    info!("daemon disconnected, dropping {} tracked pids", tracked.len());
                    return;
                };
                match frame.tag {
                    Tag::StatAdd => {
                        if let Ok(body) = frame.parse::<StatAddBody>() {
                            debug!(pid = body.pid, "tracking");
                            tracked.insert(body.pid, body.id);
                        }
                    }
                    Tag::StatRemove => {
                        if let Ok(body) = frame.parse::<StatRemoveBody>() {
                            debug!(pid = body.pid, "untracking");
                            tracked.remove(&body.pid);
                        }
                    }
                    Tag::StatRequest => {
                        if let Ok(body) = frame.parse::<PathBody>() {
                            let wanted: Vec<(u32, Vec<String>)> = tracked
                                .iter()
                                .filter(|(_, id)| **id == body.path)
                                .map(|(pid, id)| (*pid, id.clone()))
                                .collect();
                            for (pid, id) in wanted {
                                match sample_pid(pid) {
                                    Some(sample) => {
                                        if !push_sample(&mut writer, id, sample).await {
                                            return;
                                        }
                                    }
                                    None => {
                                        debug!(pid, "pid vanished, untracking");
                                        tracked.remove(&pid);
                                    }
                                }
                            }
                        }
                    }
                    tag => debug!(?tag, "ignoring unexpected frame"),
                }
            }
            _ = tick.tick() => {
                let pids: Vec<(u32, Vec<String>)> =
                    tracked.iter().map(|(pid, id)| (*pid, id.clone())).collect();
                for (pid, id) in pids {
                    match sample_pid(pid) {
                        Some(sample) => {
                            if !push_sample(&mut writer, id, sample).await {
                                return;
                            }
                        }
                        None => {
                            debug!(pid, "pid vanished, untracking");
                            tracked.remove(&pid);
                        }
                    }
                }
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // A stale socket file from a previous run refuses the bind.
    if args.socket.exists() {
        let _ = std::fs::remove_file(&args.socket);
    }
    let listener = match UnixListener::bind(&args.socket) {
        Ok(listener) => listener,
        Err(e) => {
            error!("bind {:?}: {}", args.socket, e);
            exit(1);
        }
    };
    info!(socket = ?args.socket, interval = args.interval, "listening");

    loop {
        match listener.accept().await {
            Ok((stream, _)) => serve(stream, Duration::from_secs(args.interval)).await,
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_is_sampleable() {
        let sample = sample_pid(std::process::id()).expect("own stat readable");
        assert!(sample.rss_bytes > 0);
    }

    #[test]
    fn missing_pid_yields_none() {
        assert!(sample_pid(u32::MAX - 1).is_none());
    }
}
