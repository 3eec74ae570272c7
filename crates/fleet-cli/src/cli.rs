//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Command-line arguments for `fleet`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "fleet",
    version,
    about = "Provision a fleet of hosts over SSH in ordered stages.",
    long_about = None
)]
pub struct CliArgs {
    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `FLEET_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the deployment pipeline against a set of hosts.
    Deploy(DeployArgs),
}

#[derive(Debug, Clone, Args)]
pub struct DeployArgs {
    /// Path to the config file (TOML). Built-in defaults when omitted.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Comma-separated targets: `host`, `user@host` or `user@host:port`.
    #[arg(long, value_delimiter = ',', required = true, value_name = "HOSTS")]
    pub hosts: Vec<String>,

    /// Task name recorded with the deployment.
    #[arg(long, default_value = "fleet deploy")]
    pub name: String,

    /// Who requested the deployment.
    #[arg(long, env = "USER", default_value = "fleet-cli")]
    pub actor: String,

    /// Cluster the hosts belong to.
    #[arg(long)]
    pub cluster: Option<String>,

    /// Resolve config and pipeline, print them, but don't connect anywhere.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_splits_hosts() {
        let args = CliArgs::try_parse_from([
            "fleet",
            "deploy",
            "--hosts",
            "a,b,ops@c:2222",
            "--name",
            "prod rollout",
            "--actor",
            "alice",
            "--log-level",
            "debug",
        ])
        .unwrap();

        let Command::Deploy(deploy) = args.command;
        assert_eq!(deploy.hosts, vec!["a", "b", "ops@c:2222"]);
        assert_eq!(deploy.name, "prod rollout");
        assert_eq!(deploy.actor, "alice");
        assert!(!deploy.dry_run);
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
    }

    #[test]
    fn deploy_requires_hosts() {
        assert!(CliArgs::try_parse_from(["fleet", "deploy"]).is_err());
    }
}
