//! Loads the TLS instrumentation object and pumps its buffers into channels.

use anyhow::{Context, Result, anyhow};
use crossbeam::channel::{self, Sender};
use libbpf_rs::{Map, MapCore, Object, ObjectBuilder, PerfBufferBuilder, RingBufferBuilder};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::poller::ChunkEvent;

/// Perf event array carrying OpenSSL chunks
pub const CHUNKS_MAP: &str = "chunks_buffer";
/// Ring buffer carrying Go `crypto/tls` reads and writes
pub const GOLANG_MAP: &str = "golang_read_writes";

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

// Capability bit positions
const CAP_SYS_ADMIN: u64 = 21;
const CAP_PERFMON: u64 = 38;
const CAP_BPF: u64 = 39;

/// Start the hook thread; returns once the hooks are attached or failed to.
pub fn spawn_hooks(
    object_path: PathBuf,
    perf_pages: usize,
    chunks: Sender<ChunkEvent>,
    golang: Sender<Vec<u8>>,
    should_stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    if !check_capabilities() {
        return Err(anyhow!(
            "eBPF: insufficient privileges for TLS hooks, need root or CAP_BPF+CAP_PERFMON (or CAP_SYS_ADMIN)"
        ));
    }

    let (ready_tx, ready_rx) = channel::bounded::<Result<()>>(1);
    let handle = thread::Builder::new()
        .name("tls-hooks".to_string())
        .spawn(move || {
            if let Err(e) = run(&object_path, perf_pages, chunks, golang, &should_stop, &ready_tx) {
                // After the ready signal nobody waits for the result
                if let Err(err) = ready_tx.try_send(Err(e))
                    && let Err(e) = err.into_inner()
                {
                    error!("eBPF: TLS hooks stopped: {:#}", e);
                }
            }
            debug!("eBPF: TLS hook thread exiting");
        })
        .expect("Failed to spawn TLS hook thread");

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => Err(anyhow!("eBPF: TLS hook thread exited before attaching")),
    }
}

fn run(
    object_path: &Path,
    perf_pages: usize,
    chunks: Sender<ChunkEvent>,
    golang: Sender<Vec<u8>>,
    should_stop: &AtomicBool,
    ready: &Sender<Result<()>>,
) -> Result<()> {
    let mut object = ObjectBuilder::default()
        .open_file(object_path)
        .with_context(|| format!("eBPF: failed to open {}", object_path.display()))?
        .load()
        .context("eBPF: failed to load TLS object")?;

    let mut links = Vec::new();
    for prog in object.progs_mut() {
        let name = prog.name().to_string_lossy().into_owned();
        let link = prog
            .attach()
            .with_context(|| format!("eBPF: failed to attach program {}", name))?;
        debug!("eBPF: attached {}", name);
        links.push(link);
    }

    let chunks_map = find_map(&object, CHUNKS_MAP)?;
    let golang_map = find_map(&object, GOLANG_MAP)?;

    let sample_tx = chunks.clone();
    let perf = PerfBufferBuilder::new(&chunks_map)
        .pages(perf_pages)
        .sample_cb(move |_cpu: i32, data: &[u8]| {
            let _ = sample_tx.send(ChunkEvent::Sample(data.to_vec()));
        })
        .lost_cb(move |cpu: i32, count: u64| {
            warn!("eBPF: CPU {} lost {} TLS chunks", cpu, count);
            let _ = chunks.send(ChunkEvent::Lost(count));
        })
        .build()
        .context("eBPF: failed to open chunk perf buffer")?;

    let mut ring_builder = RingBufferBuilder::new();
    ring_builder
        .add(&golang_map, move |data: &[u8]| {
            let _ = golang.send(data.to_vec());
            0
        })
        .context("eBPF: failed to open Go ring buffer")?;
    let ring = ring_builder.build()?;

    let _ = ready.send(Ok(()));
    info!("eBPF: TLS hooks attached ({} programs)", links.len());

    while !should_stop.load(Ordering::Relaxed) {
        perf.poll(POLL_TIMEOUT)
            .context("eBPF: chunk perf buffer closed")?;
        ring.poll(Duration::ZERO)
            .context("eBPF: Go ring buffer closed")?;
    }

    drop(links);
    Ok(())
}

/// Fails when the object lacks a map the pollers rely on.
fn find_map<'obj>(object: &'obj Object, name: &str) -> Result<Map<'obj>> {
    object
        .maps()
        .find(|map| map.name() == name)
        .ok_or_else(|| anyhow!("eBPF: map {} missing from TLS object", name))
}

fn check_capabilities() -> bool {
    if unsafe { libc::geteuid() } == 0 {
        debug!("eBPF: Running as root - all capabilities available");
        return true;
    }

    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        debug!("eBPF: Could not read /proc/self/status");
        return false;
    };
    match effective_capabilities(&status) {
        Some(caps) => {
            debug!("eBPF: Current effective capabilities: 0x{:x}", caps);
            has_hook_capabilities(caps)
        }
        None => false,
    }
}

fn effective_capabilities(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("CapEff:"))?;
    let hex = line.split_whitespace().nth(1)?;
    u64::from_str_radix(hex, 16).ok()
}

fn has_hook_capabilities(caps: u64) -> bool {
    let has = |bit: u64| caps & (1u64 << bit) != 0;

    if has(CAP_BPF) && has(CAP_PERFMON) {
        info!("eBPF: Using modern capabilities (CAP_BPF + CAP_PERFMON)");
        true
    } else if has(CAP_SYS_ADMIN) {
        info!("eBPF: Using legacy capability (CAP_SYS_ADMIN)");
        true
    } else {
        debug!("eBPF: Need CAP_BPF+CAP_PERFMON or CAP_SYS_ADMIN for TLS hooks");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_capabilities() {
        let status = "Name:\tflowtap\nCapInh:\t0000000000000000\nCapEff:\t000000c000000000\n";
        let caps = effective_capabilities(status).unwrap();
        assert!(has_hook_capabilities(caps));
        assert!(!has_hook_capabilities(1 << CAP_BPF));
        assert!(has_hook_capabilities(1 << CAP_SYS_ADMIN));
        assert_eq!(effective_capabilities("Name:\tx\n"), None);
    }
}
