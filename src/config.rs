use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Result, WrapErr};
use serde::Deserialize;
use tracing::info;

use wifi_connect::orchestrator::{ForgetPolicy, OrchestratorConfig};

// ─── Embedded Default ────────────────────────────────────────────────────
/// Baked into the binary at compile time; written out on first run.
const DEFAULT_CONFIG_TOML: &str = include_str!("../default_config.toml");

// ─── CLI Arguments (override layer) ─────────────────────────────────────
/// wifi-connect: join WiFi networks one request at a time
#[derive(Parser, Debug, Clone)]
#[command(name = "wifi-connect", version, about, long_about = None)]
pub struct CliArgs {
    /// Log level filter (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Log file path (overrides config file)
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Path to a custom config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Backend to join through (overrides config file)
    #[arg(short, long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Join timeout in seconds (overrides config file)
    #[arg(short, long)]
    pub timeout_secs: Option<u64>,

    /// Make `disconnect` forget every saved WiFi network
    #[arg(long)]
    pub forget_all: bool,

    /// Print the default config to stdout and exit
    #[arg(long)]
    pub print_default_config: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Join an open network by exact SSID
    Connect {
        ssid: String,
        /// Keep the network saved after joining
        #[arg(short, long)]
        save: bool,
    },
    /// Join an open network whose SSID starts with PREFIX
    PrefixConnect {
        prefix: String,
        #[arg(short, long)]
        save: bool,
    },
    /// Join a WPA/WPA2 (or legacy WEP) network by exact SSID
    SecureConnect {
        ssid: String,
        #[arg(short, long)]
        password: String,
        /// Treat the password as a WEP key
        #[arg(long)]
        wep: bool,
        #[arg(short, long)]
        save: bool,
    },
    /// Join a secured network whose SSID starts with PREFIX
    SecurePrefixConnect {
        prefix: String,
        #[arg(short, long)]
        password: String,
        #[arg(long)]
        wep: bool,
        #[arg(short, long)]
        save: bool,
    },
    /// Forget saved networks (see orchestrator.forget_policy)
    Disconnect,
    /// Print the SSID currently in use
    Ssid,
    /// Serve newline-delimited JSON method calls on stdin/stdout
    Bridge,
}

// ─── TOML Structs ───────────────────────────────────────────────────────

/// Root configuration: parsed from TOML, then overridden by CLI flags.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,

    /// Log file (empty string = stderr)
    pub log_file: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub timeout_secs: u64,
    pub forget_policy: ForgetPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[value(name = "networkmanager")]
    NetworkManager,
    Fake,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub query_timeout_ms: u64,
    /// 0 = the backend declares no timeout of its own
    pub join_timeout_secs: u64,
}

// ─── Defaults ───────────────────────────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_file: String::new(),
        }
    }
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            forget_policy: ForgetPolicy::ForgetOwnOnly,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::NetworkManager,
            query_timeout_ms: 2000,
            join_timeout_secs: 0,
        }
    }
}

// ─── Path Resolution ────────────────────────────────────────────────────

impl Config {
    /// Standard config file path: ~/.config/wifi-connect/config.toml
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("wifi-connect")
            .join("config.toml")
    }

    /// Convenience: log file as Option (empty = None)
    pub fn log_file(&self) -> Option<PathBuf> {
        let path = self.general.log_file.trim();
        if path.is_empty() {
            None
        } else {
            Some(PathBuf::from(path))
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.query_timeout_ms)
    }

    pub fn join_timeout(&self) -> Option<Duration> {
        match self.backend.join_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Orchestrator settings; a zero timeout is raised to one second.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            timeout: Duration::from_secs(self.orchestrator.timeout_secs.max(1)),
            forget_policy: self.orchestrator.forget_policy,
        }
    }

    /// Apply CLI flags on top of the file layer
    fn apply_overrides(&mut self, cli: &CliArgs) {
        if let Some(ref level) = cli.log_level {
            self.general.log_level = level.clone();
        }
        if let Some(ref path) = cli.log_file {
            self.general.log_file = path.display().to_string();
        }
        if let Some(kind) = cli.backend {
            self.backend.kind = kind;
        }
        if let Some(secs) = cli.timeout_secs {
            self.orchestrator.timeout_secs = secs;
        }
        if cli.forget_all {
            self.orchestrator.forget_policy = ForgetPolicy::ForgetAll;
        }
    }
}

// ─── Bootloader ─────────────────────────────────────────────────────────

/// Called once at startup.
///
/// 1. Resolve config file path (CLI override or default)
/// 2. If the file doesn't exist, create directory tree + write defaults
/// 3. Parse TOML from disk into Config
/// 4. Apply CLI overrides on top
pub fn load(cli: &CliArgs) -> Result<Config> {
    let config_path = cli.config.clone().unwrap_or_else(Config::config_path);

    if !config_path.exists() {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).wrap_err_with(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        std::fs::write(&config_path, DEFAULT_CONFIG_TOML).wrap_err_with(|| {
            format!(
                "Failed to write default config to {}",
                config_path.display()
            )
        })?;
        info!("Created default config at {}", config_path.display());
    }

    let toml_str = std::fs::read_to_string(&config_path)
        .wrap_err_with(|| format!("Failed to read config from {}", config_path.display()))?;

    let mut config: Config = toml::from_str(&toml_str).wrap_err_with(|| {
        format!(
            "Failed to parse config at {}.\n\
             Delete the file to regenerate defaults, or run:\n  \
             wifi-connect --print-default-config > {:?}",
            config_path.display(),
            config_path
        )
    })?;

    config.apply_overrides(cli);
    Ok(config)
}

/// Returns the embedded default config TOML string.
pub fn default_config_toml() -> &'static str {
    DEFAULT_CONFIG_TOML
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("wifi-connect").chain(args.iter().copied()))
    }

    #[test]
    fn test_embedded_default_matches_struct_defaults() {
        let parsed: Config = toml::from_str(DEFAULT_CONFIG_TOML).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            "[orchestrator]\nforget_policy = \"forget_all\"\n[backend]\nkind = \"fake\"\n",
        )
        .unwrap();
        assert_eq!(config.orchestrator.forget_policy, ForgetPolicy::ForgetAll);
        assert_eq!(config.orchestrator.timeout_secs, 30);
        assert_eq!(config.backend.kind, BackendKind::Fake);
        assert_eq!(config.general.log_level, "info");
    }

    #[test]
    fn test_unknown_policy_is_rejected() {
        let parsed = toml::from_str::<Config>("[orchestrator]\nforget_policy = \"sometimes\"\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut config = Config::default();
        config.apply_overrides(&cli(&[
            "--backend",
            "fake",
            "--timeout-secs",
            "5",
            "--forget-all",
            "--log-file",
            "/tmp/wifi.log",
            "ssid",
        ]));

        assert_eq!(config.backend.kind, BackendKind::Fake);
        assert_eq!(config.orchestrator.forget_policy, ForgetPolicy::ForgetAll);
        assert_eq!(config.log_file(), Some(PathBuf::from("/tmp/wifi.log")));
        assert_eq!(config.orchestrator_config().timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_timeouts() {
        let mut config = Config::default();
        assert_eq!(config.join_timeout(), None);
        assert_eq!(config.query_timeout(), Duration::from_secs(2));

        config.backend.join_timeout_secs = 12;
        config.orchestrator.timeout_secs = 0;
        assert_eq!(config.join_timeout(), Some(Duration::from_secs(12)));
        assert_eq!(config.orchestrator_config().timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_subcommand_parsing() {
        let args = cli(&["secure-connect", "Home", "--password", "hunter22", "--save"]);
        assert_eq!(
            args.command,
            Some(Command::SecureConnect {
                ssid: "Home".into(),
                password: "hunter22".into(),
                wep: false,
                save: true,
            })
        );
    }
}
