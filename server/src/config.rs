//! Server configuration

use serde::Deserialize;

/// Prefix of the environment variables overriding configuration
const ENV_PREFIX: &str = "RDEV";

/// Server configuration
///
/// Loaded once at startup and passed explicitly to the services that need
/// it; nothing reads configuration from ambient global state.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server host
    #[serde(default = "default_http_host")]
    pub http_host: String,

    /// HTTP server port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Database URL (SQLite)
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Interval the agent should wait between partial reconciliations
    #[serde(default = "default_partial_interval")]
    pub partial_reconciliation_interval_seconds: u64,

    /// Interval the agent should wait between full reconciliations
    #[serde(default = "default_full_interval")]
    pub full_reconciliation_interval_seconds: u64,

    /// Root directory under which project checkouts are read for devfiles
    #[serde(default = "default_projects_dir")]
    pub projects_dir: String,

    /// Base URL of the forge, used for clone URLs and editor settings
    #[serde(default = "default_gitlab_url")]
    pub gitlab_url: String,

    /// Hard lifetime of a workspace unless the request asks for less
    #[serde(default = "default_max_hours_before_termination")]
    pub default_max_hours_before_termination: i64,

    /// Upper bound accepted for a requested lifetime
    #[serde(default = "default_max_hours_before_termination_limit")]
    pub max_hours_before_termination_limit: i64,

    /// Log output format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_database_url() -> String {
    "sqlite:data/workspaces.db?mode=rwc".to_string()
}

fn default_partial_interval() -> u64 {
    10
}

fn default_full_interval() -> u64 {
    3600 // 1 hour
}

fn default_projects_dir() -> String {
    "/var/lib/workspaces/projects".to_string()
}

fn default_gitlab_url() -> String {
    "http://gitlab.localdev.me".to_string()
}

fn default_max_hours_before_termination() -> i64 {
    120
}

fn default_max_hours_before_termination_limit() -> i64 {
    120
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from an optional file named by `RDEV_CONFIG_FILE`,
    /// then from `RDEV_*` environment variables
    pub fn load() -> anyhow::Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Ok(path) = std::env::var(format!("{}_CONFIG_FILE", ENV_PREFIX)) {
            builder = builder.add_source(::config::File::with_name(&path));
        }

        let config: Config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .ignore_empty(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.partial_reconciliation_interval_seconds == 0 {
            anyhow::bail!("partial_reconciliation_interval_seconds must be positive");
        }
        if self.full_reconciliation_interval_seconds < self.partial_reconciliation_interval_seconds
        {
            anyhow::bail!(
                "full_reconciliation_interval_seconds must not be shorter than the partial interval"
            );
        }
        if chrono::Duration::try_hours(self.max_hours_before_termination_limit).is_none() {
            anyhow::bail!("max_hours_before_termination_limit is out of range");
        }
        if self.default_max_hours_before_termination > self.max_hours_before_termination_limit {
            anyhow::bail!("default_max_hours_before_termination exceeds the configured limit");
        }
        Ok(())
    }

    /// URL used to clone a project into a workspace
    pub fn clone_url(&self, project_id: &str) -> String {
        format!("{}/{}.git", self.gitlab_url.trim_end_matches('/'), project_id)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_host: default_http_host(),
            http_port: default_http_port(),
            database_url: default_database_url(),
            partial_reconciliation_interval_seconds: default_partial_interval(),
            full_reconciliation_interval_seconds: default_full_interval(),
            projects_dir: default_projects_dir(),
            gitlab_url: default_gitlab_url(),
            default_max_hours_before_termination: default_max_hours_before_termination(),
            max_hours_before_termination_limit: default_max_hours_before_termination_limit(),
            log_format: default_log_format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.partial_reconciliation_interval_seconds, 10);
        assert_eq!(config.full_reconciliation_interval_seconds, 3600);
    }

    #[test]
    fn test_rejects_inverted_intervals() {
        let config = Config {
            partial_reconciliation_interval_seconds: 60,
            full_reconciliation_interval_seconds: 30,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unrepresentable_termination_limit() {
        let config = Config {
            max_hours_before_termination_limit: i64::MAX,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_clone_url() {
        let config = Config {
            gitlab_url: "https://gitlab.example.com/".to_string(),
            ..Config::default()
        };
        assert_eq!(
            config.clone_url("group/project"),
            "https://gitlab.example.com/group/project.git"
        );
    }
}
