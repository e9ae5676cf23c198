//! CLI definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use plb_core::LbConfig;

/// patroni-lb - HAProxy in front of a Patroni cluster
#[derive(Parser, Debug)]
#[command(name = "patroni-lb")]
#[command(version)]
#[command(about = "Keeps HAProxy pointed at the current Patroni primary and replicas")]
#[command(
    long_about = "Watches a Patroni scope in ZooKeeper, renders an HAProxy configuration with a read-write pool for the primary and a read-only pool for the running replicas, and reloads HAProxy whenever that configuration changes."
)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "PATRONI_LB_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run the reconcile loop (default)
    Run,

    /// Print the configuration for the current cluster state and exit
    Render,
}

/// Settings that take precedence over the configuration file.
#[derive(Args, Debug, Default)]
pub struct Overrides {
    /// ZooKeeper host
    #[arg(long, env = "ZOOKEEPER_HOST", global = true)]
    pub zookeeper_host: Option<String>,

    /// ZooKeeper port
    #[arg(long, env = "ZOOKEEPER_PORT", global = true)]
    pub zookeeper_port: Option<u16>,

    /// Patroni scope to front
    #[arg(long, env = "PATRONI_SCOPE", global = true)]
    pub scope: Option<String>,

    /// Root path of Patroni scopes in ZooKeeper
    #[arg(long, global = true)]
    pub namespace: Option<String>,

    /// Where the HAProxy configuration is written
    #[arg(long, global = true)]
    pub haproxy_config: Option<PathBuf>,

    /// HAProxy executable
    #[arg(long, global = true)]
    pub haproxy_bin: Option<String>,

    /// Pid file passed to HAProxy with -p
    #[arg(long, global = true)]
    pub pid_file: Option<PathBuf>,

    /// Skip `haproxy -c` before reloads
    #[arg(long, global = true, default_value_t = false)]
    pub no_check: bool,
}

impl Overrides {
    /// Layer the values that were given over `config`.
    pub fn apply(self, config: &mut LbConfig) {
        if let Some(host) = self.zookeeper_host {
            config.zookeeper_host = host;
        }
        if let Some(port) = self.zookeeper_port {
            config.zookeeper_port = port;
        }
        if let Some(scope) = self.scope {
            config.scope = scope;
        }
        if let Some(namespace) = self.namespace {
            config.namespace = namespace;
        }
        if let Some(path) = self.haproxy_config {
            config.config_path = path;
        }
        if let Some(bin) = self.haproxy_bin {
            config.haproxy_bin = bin;
        }
        if let Some(pid_file) = self.pid_file {
            config.pid_file = Some(pid_file);
        }
        if self.no_check {
            config.check_config = false;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_subcommand_defaults_to_none() {
        let cli = Cli::try_parse_from(["patroni-lb", "--scope", "demo"]).unwrap();
        assert_eq!(cli.command, None);
        assert_eq!(cli.overrides.scope.as_deref(), Some("demo"));
    }

    #[test]
    fn test_overrides_win_over_file_values() {
        let cli = Cli::try_parse_from([
            "patroni-lb",
            "render",
            "--zookeeper-host",
            "zk1",
            "--zookeeper-port",
            "2182",
            "--haproxy-config",
            "/etc/haproxy/haproxy.cfg",
            "--no-check",
        ])
        .unwrap();
        assert_eq!(cli.command, Some(Commands::Render));

        let mut config = LbConfig {
            zookeeper_host: "from-file".to_string(),
            scope: "pg".to_string(),
            ..LbConfig::default()
        };
        cli.overrides.apply(&mut config);

        assert_eq!(config.zookeeper_host, "zk1");
        assert_eq!(config.zookeeper_port, 2182);
        assert_eq!(config.scope, "pg");
        assert_eq!(config.config_path, PathBuf::from("/etc/haproxy/haproxy.cfg"));
        assert!(!config.check_config);
    }
}
