mod config;

use std::io;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::{bail, eyre, Result, WrapErr};
use serde_json::json;
use tokio::io::BufReader;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use wifi_connect::backend::{FakeBackend, NetworkManagerBackend, WifiBackend};
use wifi_connect::bridge::{self, MethodCall, MethodResponse};
use wifi_connect::Orchestrator;

use crate::config::{BackendKind, CliArgs, Command, Config};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = CliArgs::parse();

    if cli.print_default_config {
        print!("{}", config::default_config_toml());
        return Ok(ExitCode::SUCCESS);
    }

    let Some(command) = cli.command.clone() else {
        bail!("No command given. Run `wifi-connect --help` for usage.");
    };

    let config = config::load(&cli)?;
    // Held until exit so buffered log lines are flushed.
    let _log_guard = init_logging(&config)?;

    info!("wifi-connect starting with {:?} backend", config.backend.kind);

    match config.backend.kind {
        BackendKind::NetworkManager => {
            let backend = NetworkManagerBackend::new(config.query_timeout(), config.join_timeout())
                .await
                .wrap_err(
                    "Failed to connect to NetworkManager D-Bus. \
                     Is NetworkManager running? Try: systemctl status NetworkManager",
                )?;
            run(backend, &config, command).await
        }
        BackendKind::Fake => run(FakeBackend::new(), &config, command).await,
    }
}

async fn run<B: WifiBackend>(backend: B, config: &Config, command: Command) -> Result<ExitCode> {
    let orchestrator = Orchestrator::new(backend, config.orchestrator_config());

    let Some(call) = method_call(&command) else {
        info!("Serving JSON method calls on stdin");
        let stdin = BufReader::new(tokio::io::stdin());
        tokio::select! {
            result = bridge::serve_json_lines(&orchestrator, stdin, tokio::io::stdout()) => {
                result.wrap_err("Method-call bridge failed")?;
            }
            _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping bridge"),
        }
        return Ok(ExitCode::SUCCESS);
    };

    let response = bridge::handle(&orchestrator, &call).await;
    println!("{}", serde_json::to_string(&response)?);

    Ok(match response {
        MethodResponse::Success { .. } => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

/// The bridge call a one-shot subcommand stands for; `None` for `bridge`
fn method_call(command: &Command) -> Option<MethodCall> {
    let (method, arguments) = match command {
        Command::Connect { ssid, save } => {
            ("connect", Some(json!({ "ssid": ssid, "saveNetwork": save })))
        }
        Command::PrefixConnect { prefix, save } => (
            "prefixConnect",
            Some(json!({ "ssid": prefix, "saveNetwork": save })),
        ),
        Command::SecureConnect {
            ssid,
            password,
            wep,
            save,
        } => (
            "secureConnect",
            Some(json!({ "ssid": ssid, "password": password, "isWep": wep, "saveNetwork": save })),
        ),
        Command::SecurePrefixConnect {
            prefix,
            password,
            wep,
            save,
        } => (
            "securePrefixConnect",
            Some(json!({ "ssid": prefix, "password": password, "isWep": wep, "saveNetwork": save })),
        ),
        Command::Disconnect => ("disconnect", None),
        Command::Ssid => ("getSSID", None),
        Command::Bridge => return None,
    };
    Some(MethodCall::new(method, arguments))
}

/// Initialize tracing to stderr, or to the configured log file.
///
/// stdout is reserved for method responses.
fn init_logging(config: &Config) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.general.log_level))
        .wrap_err_with(|| format!("Invalid log level: {}", config.general.log_level))?;

    let Some(path) = config.log_file() else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Log file has no file name: {}", path.display()))?;
    std::fs::create_dir_all(dir)
        .wrap_err_with(|| format!("Failed to create log directory: {}", dir.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}
