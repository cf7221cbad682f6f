use anyhow::{Context, Result, anyhow};
use crossbeam::channel::Receiver;
use log::{LevelFilter, error, info, warn};
use serde_json::json;
use simplelog::{Config as LogConfig, WriteLogger};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use flowtap::api::OutputChannelItem;
use flowtap::config::{TapConfig, parse_ports};
use flowtap::extensions::DissectorRegistry;
use flowtap::tap::outbound_link::OutboundLink;
use flowtap::tap::start_passive_tapper;

mod cli;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn main() -> Result<()> {
    let matches = cli::build_cli().get_matches();

    let log_level = matches
        .get_one::<String>("log-level")
        .map(|level| level.parse::<LevelFilter>())
        .transpose()
        .map_err(|e| anyhow!("Invalid log level: {}", e))?
        .unwrap_or(LevelFilter::Info);
    if let Some(log_dir) = matches.get_one::<String>("log-dir") {
        setup_logging(log_level, Path::new(log_dir))?;
    }

    info!("Starting flowtap");

    let mut config = TapConfig::load(matches.get_one::<String>("config").map(|s| s.as_str()))?;
    if let Some(path) = &config.config_path {
        info!("Loaded configuration from {}", path.display());
    }

    if let Some(interface) = matches.get_one::<String>("interface") {
        config.interface = Some(interface.to_string());
    }
    if let Some(file) = matches.get_one::<String>("read-file") {
        config.pcap_file = Some(PathBuf::from(file));
    }
    if let Some(filter) = matches.get_one::<String>("bpf-filter") {
        config.bpf_filter = Some(filter.to_string());
    }
    if let Some(ports) = matches.get_one::<String>("ports") {
        config.ports = parse_ports(ports)?;
    }
    if let Some(authorities) = matches.get_one::<String>("authorities") {
        config.authorities = authorities
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    if matches.get_flag("any-direction") {
        config.any_direction = true;
    }
    if matches.get_flag("tls") {
        config.tls = true;
    }
    if let Some(object) = matches.get_one::<String>("tls-bpf-object") {
        config.tls_bpf_object = Some(PathBuf::from(object));
    }
    if let Some(procfs) = matches.get_one::<String>("procfs") {
        config.procfs = PathBuf::from(procfs);
    }
    let tls_pids = matches
        .get_many::<String>("tls-pid")
        .map(|values| values.map(|v| parse_tls_pid(v)).collect::<Result<Vec<_>>>())
        .transpose()?
        .unwrap_or_default();
    let summaries = matches.get_flag("summaries");

    install_signal_handlers();

    let registry = Arc::new(DissectorRegistry::default());
    let (mut tap, items, links) = start_passive_tapper(&config, Arc::clone(&registry))?;
    for (pid, namespace) in tls_pids {
        tap.add_tls_pid(pid, namespace);
    }

    let printer = {
        let registry = Arc::clone(&registry);
        thread::Builder::new()
            .name("entry-printer".to_string())
            .spawn(move || print_entries(items, &registry, summaries))
            .expect("Failed to spawn entry printer thread")
    };
    let link_logger = thread::Builder::new()
        .name("outbound-links".to_string())
        .spawn(move || log_outbound_links(links))
        .expect("Failed to spawn outbound link thread");

    while !SHUTDOWN.load(Ordering::SeqCst) && !tap.is_capture_done() {
        thread::sleep(Duration::from_millis(200));
    }

    if tap.is_capture_done() {
        info!("Capture finished, waiting for dissectors");
        tap.wait();
    }
    tap.stop();

    let cleaner_stats = tap.dump_cleaner_stats();
    let stats = tap.stats();
    info!(
        "Final statistics: {} (cleaner: {})",
        serde_json::to_string(&stats).unwrap_or_default(),
        serde_json::to_string(&cleaner_stats).unwrap_or_default()
    );

    // Closes the output channels
    drop(tap);
    let _ = printer.join();
    let _ = link_logger.join();

    info!("flowtap shutting down");
    Ok(())
}

fn setup_logging(level: LevelFilter, log_dir: &Path) -> Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create {}", log_dir.display()))?;
    }

    let timestamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
    let log_file_path = log_dir.join(format!("flowtap_{}.log", timestamp));

    WriteLogger::init(level, LogConfig::default(), File::create(log_file_path)?)?;
    Ok(())
}

fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

/// `PID` or `PID:NAMESPACE`
fn parse_tls_pid(value: &str) -> Result<(u32, String)> {
    let (pid, namespace) = match value.split_once(':') {
        Some((pid, namespace)) => (pid, namespace.to_string()),
        None => (value, flowtap::tlstapper::UNKNOWN_NAMESPACE.to_string()),
    };
    let pid = pid
        .trim()
        .parse::<u32>()
        .map_err(|e| anyhow!("Invalid pid '{}': {}", pid, e))?;
    Ok((pid, namespace))
}

fn print_entries(items: Receiver<OutputChannelItem>, registry: &DissectorRegistry, summaries: bool) {
    let stdout = io::stdout();
    let mut next_id = 1u64;

    for item in items {
        let mut entry = match registry.analyze(&item, "", "") {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Failed to analyze {} item: {}", item.protocol.abbreviation, e);
                continue;
            }
        };
        entry.id = next_id;
        next_id += 1;

        let line = if summaries {
            match registry.summarize(&entry) {
                Ok(summary) => json!({ "entry": entry, "summary": summary }),
                Err(e) => {
                    warn!("Failed to summarize entry {}: {}", entry.id, e);
                    json!({ "entry": entry })
                }
            }
        } else {
            json!(entry)
        };

        let mut out = stdout.lock();
        if let Err(e) = writeln!(out, "{}", line) {
            error!("Failed to write entry: {}", e);
            break;
        }
    }
}

fn log_outbound_links(links: Receiver<OutboundLink>) {
    for link in links {
        info!(
            "Outbound link {} -> {}:{} ({})",
            link.src_ip,
            link.dst_ip,
            link.dst_port,
            link.suggested_resolved_name.as_deref().unwrap_or("unnamed")
        );
    }
}
