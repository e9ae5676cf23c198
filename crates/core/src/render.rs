//! HAProxy configuration rendering.
//!
//! [`render`] is a pure function of the snapshot and the settings: equal
//! inputs always produce byte-identical text, which is what lets the
//! reconcile loop skip reloads when nothing changed.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::snapshot::{Backend, ClusterSnapshot};

/// How HAProxy health-checks the fronted members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum HealthCheck {
    /// `option pgsql-check user <user>` against the PostgreSQL port.
    PgsqlCheck {
        #[serde(default = "default_check_user")]
        user: String,
    },
    /// HTTP `OPTIONS /master` or `/replica` against the Patroni REST API port.
    PatroniApi,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::PgsqlCheck {
            user: default_check_user(),
        }
    }
}

/// Tunables of the fixed configuration template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// Global `maxconn`.
    pub max_connections: u32,
    /// Per-server `maxconn`.
    pub server_max_connections: u32,
    /// Bind address of the read-write frontend.
    pub primary_bind: String,
    /// Bind address of the read-only frontend.
    pub replica_bind: String,
    /// Bind address of the stats listener.
    pub stats_bind: String,
    pub health_check: HealthCheck,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            max_connections: 100,
            server_max_connections: 100,
            primary_bind: "*:5432".to_string(),
            replica_bind: "*:5433".to_string(),
            stats_bind: "0.0.0.0:9090".to_string(),
            health_check: HealthCheck::default(),
        }
    }
}

fn default_check_user() -> String {
    "admin".to_string()
}

/// Rendered configuration text, compared byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderedConfig(String);

impl RenderedConfig {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for RenderedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy)]
enum Pool {
    Master,
    Slaves,
}

impl Pool {
    const fn name(self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Slaves => "slaves",
        }
    }

    const fn patroni_endpoint(self) -> &'static str {
        match self {
            Self::Master => "/master",
            Self::Slaves => "/replica",
        }
    }
}

/// Render a snapshot into HAProxy configuration text.
pub fn render(snapshot: &ClusterSnapshot, settings: &RenderSettings) -> RenderedConfig {
    let mut lines: Vec<String> = Vec::new();

    lines.push("global".to_string());
    lines.push(format!("\tmaxconn {}", settings.max_connections));
    lines.push(String::new());

    lines.extend(
        [
            "defaults",
            "\tlog\tglobal",
            "\tmode\ttcp",
            "\tretries 2",
            "\ttimeout client 30m",
            "\ttimeout connect 4s",
            "\ttimeout server 30m",
            "\ttimeout check 5s",
            "",
        ]
        .map(str::to_string),
    );

    lines.extend(pool_section(
        Pool::Master,
        &settings.primary_bind,
        snapshot.primary.iter(),
        settings,
    ));
    lines.extend(pool_section(
        Pool::Slaves,
        &settings.replica_bind,
        snapshot.replicas.iter(),
        settings,
    ));

    lines.push("listen stats".to_string());
    lines.push(format!("\tbind {}", settings.stats_bind));
    lines.extend(
        [
            "\tbalance",
            "\tmode http",
            "\tstats enable",
            "\ttimeout client 5000",
            "\ttimeout connect 4000",
            "\ttimeout server 30000",
            "\tstats realm Haproxy\\ Statistics",
            "\tstats uri /",
        ]
        .map(str::to_string),
    );

    let mut text = lines.join("\n");
    text.push('\n');
    RenderedConfig(text)
}

fn pool_section<'a>(
    pool: Pool,
    bind: &str,
    servers: impl Iterator<Item = &'a Backend>,
    settings: &RenderSettings,
) -> Vec<String> {
    let name = pool.name();
    let mut lines = vec![
        format!("frontend ft_postgres_{name}"),
        format!("\tbind {bind}"),
        format!("\tdefault_backend bk_postgres_{name}"),
        String::new(),
        format!("backend bk_postgres_{name}"),
    ];

    match &settings.health_check {
        HealthCheck::PgsqlCheck { user } => {
            lines.push(format!("\toption pgsql-check user {user}"));
        }
        HealthCheck::PatroniApi => {
            lines.push(format!("\toption httpchk OPTIONS {}", pool.patroni_endpoint()));
            lines.push("\thttp-check expect status 200".to_string());
        }
    }

    lines.extend(servers.map(|backend| server_line(backend, settings)));
    lines.push(String::new());
    lines
}

fn server_line(backend: &Backend, settings: &RenderSettings) -> String {
    let base = format!(
        "\tserver {} {} maxconn {} check",
        backend.id, backend.host, settings.server_max_connections
    );
    match settings.health_check {
        HealthCheck::PgsqlCheck { .. } => base,
        HealthCheck::PatroniApi => format!("{base} port {}", backend.health_check_port),
    }
}
