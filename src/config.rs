use anyhow::{Context, Result, anyhow};
use log::{debug, warn};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::api::TrafficFilteringOptions;

/// Tap configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapConfig {
    /// Network interface to capture on
    pub interface: Option<String>,
    /// Capture file to replay instead of a live interface
    pub pcap_file: Option<PathBuf>,
    /// BPF filter applied to the capture handle
    pub bpf_filter: Option<String>,
    /// Server ports to tap (empty: every registered protocol port)
    pub ports: Vec<u16>,
    /// `ip` or `ip:port` targets; non-empty switches to host mode
    pub authorities: Vec<String>,
    /// Also tap connections initiated by the targets
    pub any_direction: bool,
    /// Age after which a still unidentified stream is dropped
    pub tcp_stream_channel_timeout_ms: u64,
    /// Interval of the unidentified stream sweep
    pub close_timed_out_channels_interval_ms: u64,
    /// Cleaner period
    pub clean_period_ms: u64,
    /// Idle time after which connections and pending matches are evicted
    pub connection_timeout_ms: u64,
    /// Chunks queued per directional reader
    pub reader_channel_capacity: usize,
    /// Matched pairs queued for the consumer
    pub emitter_channel_capacity: usize,
    /// How long a dissector waits for a full output queue
    pub emit_timeout_ms: u64,
    pub ignored_user_agents: Vec<String>,
    pub disable_redaction: bool,
    /// Enable the TLS tapper
    pub tls: bool,
    /// Compiled instrumentation object for the TLS tapper
    pub tls_bpf_object: Option<PathBuf>,
    pub tls_perf_buffer_pages: usize,
    /// procfs mount used for socket lookups
    pub procfs: PathBuf,
    pub tls_reader_idle_timeout_ms: u64,
    /// Go TLS connections tracked at once
    pub golang_map_limit: usize,
    pub fd_cache_capacity: usize,
    /// Custom configuration file path
    pub config_path: Option<PathBuf>,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            interface: None,
            pcap_file: None,
            bpf_filter: None,
            ports: Vec::new(),
            authorities: Vec::new(),
            any_direction: false,
            tcp_stream_channel_timeout_ms: 10_000,
            close_timed_out_channels_interval_ms: 1_000,
            clean_period_ms: 10_000,
            connection_timeout_ms: 10_000,
            reader_channel_capacity: 256,
            emitter_channel_capacity: 1024,
            emit_timeout_ms: 1_000,
            ignored_user_agents: Vec::new(),
            disable_redaction: false,
            tls: false,
            tls_bpf_object: None,
            tls_perf_buffer_pages: 4096,
            procfs: PathBuf::from("/proc"),
            tls_reader_idle_timeout_ms: 10_000,
            golang_map_limit: 1024,
            fd_cache_capacity: 12_500,
            config_path: None,
        }
    }
}

impl TapConfig {
    /// Load configuration from file, then apply environment overrides
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => Self::find_config_file()?,
        };

        let mut config = TapConfig::default();

        if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            config.apply_file(&content)?;
            config.config_path = Some(config_path);
        } else if path.is_some() {
            return Err(anyhow!(
                "Configuration file {} not found",
                config_path.display()
            ));
        }

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `key: value` lines; blank lines and `#` comments are skipped.
    pub fn apply_file(&mut self, content: &str) -> Result<()> {
        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some(pos) = line.find(':') else {
                warn!("Ignoring config line {}: missing ':'", number + 1);
                continue;
            };
            let key = line[..pos].trim();
            let value = line[pos + 1..].trim();
            self.set(key, value)
                .with_context(|| format!("Invalid config line {}", number + 1))?;
        }
        Ok(())
    }

    /// Environment overrides for the stream timeouts.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup("TCP_STREAM_CHANNEL_TIMEOUT_MS") {
            self.set("tcp_stream_channel_timeout_ms", &value)?;
        }
        if let Some(value) = lookup("CLOSE_TIMEDOUT_TCP_STREAM_CHANNELS_INTERVAL_MS") {
            self.set("close_timed_out_channels_interval_ms", &value)?;
        }
        Ok(())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "interface" => self.interface = Some(value.to_string()),
            "pcap_file" => self.pcap_file = Some(PathBuf::from(value)),
            "bpf_filter" => self.bpf_filter = Some(value.to_string()),
            "ports" => self.ports = parse_ports(value)?,
            "authorities" => self.authorities = parse_list(value),
            "any_direction" => self.any_direction = parse_bool(key, value)?,
            "tcp_stream_channel_timeout_ms" => {
                self.tcp_stream_channel_timeout_ms = parse_number(key, value)?
            }
            "close_timed_out_channels_interval_ms" => {
                self.close_timed_out_channels_interval_ms = parse_number(key, value)?
            }
            "clean_period_ms" => self.clean_period_ms = parse_number(key, value)?,
            "connection_timeout_ms" => self.connection_timeout_ms = parse_number(key, value)?,
            "reader_channel_capacity" => {
                self.reader_channel_capacity = parse_number(key, value)?
            }
            "emitter_channel_capacity" => {
                self.emitter_channel_capacity = parse_number(key, value)?
            }
            "emit_timeout_ms" => self.emit_timeout_ms = parse_number(key, value)?,
            "ignored_user_agents" => self.ignored_user_agents = parse_list(value),
            "disable_redaction" => self.disable_redaction = parse_bool(key, value)?,
            "tls" => self.tls = parse_bool(key, value)?,
            "tls_bpf_object" => self.tls_bpf_object = Some(PathBuf::from(value)),
            "tls_perf_buffer_pages" => self.tls_perf_buffer_pages = parse_number(key, value)?,
            "procfs" => self.procfs = PathBuf::from(value),
            "tls_reader_idle_timeout_ms" => {
                self.tls_reader_idle_timeout_ms = parse_number(key, value)?
            }
            "golang_map_limit" => self.golang_map_limit = parse_number(key, value)?,
            "fd_cache_capacity" => self.fd_cache_capacity = parse_number(key, value)?,
            _ => debug!("Ignoring unknown config key '{}'", key),
        }
        Ok(())
    }

    pub fn filtering_options(&self) -> TrafficFilteringOptions {
        TrafficFilteringOptions {
            ignored_user_agents: self.ignored_user_agents.clone(),
            disable_redaction: self.disable_redaction,
        }
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_stream_channel_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.close_timed_out_channels_interval_ms.max(1))
    }

    pub fn clean_period(&self) -> Duration {
        Duration::from_millis(self.clean_period_ms.max(1))
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Find configuration file
    fn find_config_file() -> Result<PathBuf> {
        // Try XDG config directory first
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            let xdg_path = PathBuf::from(xdg_config).join("flowtap/config");
            if xdg_path.exists() {
                return Ok(xdg_path);
            }
        }

        let home = Self::get_home_dir()?;
        let home_config = home.join(".config/flowtap/config");
        if home_config.exists() {
            return Ok(home_config);
        }

        // Default to home config path
        Ok(home_config)
    }

    /// Get home directory
    fn get_home_dir() -> Result<PathBuf> {
        if let Ok(home) = std::env::var("HOME") {
            return Ok(PathBuf::from(home));
        }

        Err(anyhow!("Could not determine home directory"))
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_ports(value: &str) -> Result<Vec<u16>> {
    parse_list(value)
        .iter()
        .map(|p| {
            p.parse::<u16>()
                .map_err(|e| anyhow!("Invalid port '{}': {}", p, e))
        })
        .collect()
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(anyhow!("Invalid boolean for {}: '{}'", key, value)),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| anyhow!("Invalid value for {}: '{}' ({})", key, value, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_file() {
        let mut config = TapConfig::default();
        config
            .apply_file(
                "# tap settings\n\
                 ports: 80, 5672\n\
                 authorities: 10.0.0.5:8080,10.0.0.6\n\
                 any_direction: true\n\
                 \n\
                 clean_period_ms: 500\n\
                 unknown_key: whatever\n",
            )
            .unwrap();

        assert_eq!(config.ports, vec![80, 5672]);
        assert_eq!(config.authorities, vec!["10.0.0.5:8080", "10.0.0.6"]);
        assert!(config.any_direction);
        assert_eq!(config.clean_period(), Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let mut config = TapConfig::default();
        assert!(config.apply_file("ports: 80,http").is_err());
        assert!(config.apply_file("tls: maybe").is_err());
        assert!(config.apply_file("reader_channel_capacity: -1").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = TapConfig::default();
        config
            .apply_env(|key| match key {
                "TCP_STREAM_CHANNEL_TIMEOUT_MS" => Some("2500".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.stream_timeout(), Duration::from_millis(2500));
        assert_eq!(config.sweep_interval(), Duration::from_millis(1000));
    }

    #[test]
    fn test_missing_explicit_file() {
        assert!(TapConfig::load(Some("/nonexistent/flowtap.conf")).is_err());
    }
}
