//! minisshd
//!
//! Minimal SSH server offering interactive shells and `exec` commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use minisshd::config::{default_config_path, Config};
use minisshd::network::{load_host_key, RusshTransport, StaticCredentials};
use minisshd::server::Server;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// minisshd - minimal SSH server.
#[derive(Parser, Debug)]
#[command(name = "minisshd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the SSH server
    Serve {
        /// Address to listen on (host:port)
        #[arg(long, short)]
        address: Option<String>,

        /// Username accepted for password authentication
        #[arg(long, short)]
        user: Option<String>,

        /// Password accepted for password authentication
        #[arg(long, short)]
        password: Option<String>,

        /// Path to the private host key
        #[arg(long, value_name = "FILE")]
        host_key: Option<PathBuf>,

        /// Passphrase for an encrypted host key
        #[arg(long)]
        key_passphrase: Option<String>,

        /// Shell for interactive sessions and commands
        #[arg(long)]
        shell: Option<String>,
    },

    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing configuration file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command {
        Commands::InitConfig { force } => init_config(&config_path, force),
        Commands::Serve {
            address,
            user,
            password,
            host_key,
            key_passphrase,
            shell,
        } => {
            let mut config = Config::load(&config_path)?;
            let overridden = config.apply_env_overrides();

            if let Some(address) = address {
                config.server.listen_address = address;
            }
            if let Some(user) = user {
                config.auth.username = user;
            }
            if let Some(password) = password {
                config.auth.password = password;
            }
            if let Some(path) = host_key {
                config.host_key.path = path;
            }
            if let Some(passphrase) = key_passphrase {
                config.host_key.passphrase = Some(passphrase);
            }
            if let Some(shell) = shell {
                config.session.shell = shell;
            }

            config.validate()?;

            let _guard = init_logging(&config, cli.verbose)?;
            tracing::info!(config = %config_path.display(), "minisshd starting");
            for variable in overridden {
                tracing::info!(variable = %variable, "Configuration overridden from environment");
            }

            run_server(config).await
        }
    }
}

/// Initialize tracing from the configured level and optional log file.
///
/// The returned guard flushes the file writer and must live until exit.
fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.server.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_new(&level)
        .with_context(|| format!("Invalid log level: {level}"))?;

    let Some(log_file) = &config.server.log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    };

    let directory = log_file
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = log_file
        .file_name()
        .with_context(|| format!("Log file has no file name: {}", log_file.display()))?;
    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory: {}", directory.display()))?;

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(Some(guard))
}

/// Write the default configuration, refusing to clobber an existing file.
fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }

    Config::default().save(path)?;
    println!("Wrote configuration to {}", path.display());
    Ok(())
}

/// Serve until SIGINT or SIGTERM.
async fn run_server(config: Config) -> anyhow::Result<()> {
    let host_key = load_host_key(&config.host_key.path, config.host_key.passphrase.as_deref())?;
    let credentials = StaticCredentials::new(
        config.auth.username.clone(),
        config.auth.password.clone().into_bytes(),
    );
    let transport = RusshTransport::new(host_key, Arc::new(credentials));
    let server = Arc::new(Server::new(transport, config.session_settings()));

    let signals = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            match wait_for_shutdown_signal().await {
                Ok(()) => server.close(),
                Err(e) => tracing::error!(error = %e, "Failed to register signal handlers"),
            }
        })
    };

    let result = server.listen_and_serve(&config.server.listen_address).await;
    signals.abort();
    result?;

    tracing::info!("minisshd stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_command_defaults() {
        let cli = Cli::try_parse_from(["minisshd", "serve"]).unwrap();
        match cli.command {
            Commands::Serve {
                address,
                user,
                password,
                host_key,
                key_passphrase,
                shell,
            } => {
                assert!(address.is_none());
                assert!(user.is_none());
                assert!(password.is_none());
                assert!(host_key.is_none());
                assert!(key_passphrase.is_none());
                assert!(shell.is_none());
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_with_overrides() {
        let cli = Cli::try_parse_from([
            "minisshd",
            "serve",
            "--address",
            "0.0.0.0:2222",
            "-u",
            "alice",
            "-p",
            "secret",
            "--host-key",
            "/etc/minisshd/key",
            "--key-passphrase",
            "pw",
            "--shell",
            "/bin/bash",
        ])
        .unwrap();
        match cli.command {
            Commands::Serve {
                address,
                user,
                password,
                host_key,
                key_passphrase,
                shell,
            } => {
                assert_eq!(address.as_deref(), Some("0.0.0.0:2222"));
                assert_eq!(user.as_deref(), Some("alice"));
                assert_eq!(password.as_deref(), Some("secret"));
                assert_eq!(host_key, Some(PathBuf::from("/etc/minisshd/key")));
                assert_eq!(key_passphrase.as_deref(), Some("pw"));
                assert_eq!(shell.as_deref(), Some("/bin/bash"));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_init_config_command() {
        let cli = Cli::try_parse_from(["minisshd", "init-config"]).unwrap();
        assert!(matches!(cli.command, Commands::InitConfig { force: false }));

        let cli = Cli::try_parse_from(["minisshd", "init-config", "--force"]).unwrap();
        assert!(matches!(cli.command, Commands::InitConfig { force: true }));
    }

    #[test]
    fn test_global_flags() {
        let cli =
            Cli::try_parse_from(["minisshd", "serve", "-v", "--config", "/tmp/c.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
    }

    #[test]
    fn test_missing_subcommand_is_error() {
        assert!(Cli::try_parse_from(["minisshd"]).is_err());
    }

    #[test]
    fn test_init_config_refuses_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        init_config(&path, false).unwrap();
        assert!(path.exists());

        let err = init_config(&path, false).unwrap_err();
        assert!(err.to_string().contains("already exists"));

        init_config(&path, true).unwrap();
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }
}
