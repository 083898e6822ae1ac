use std::path::PathBuf;

pub const LOG_ENV: &str = "RESULTSD_LOG";
pub const WORKSPACE_ENV: &str = "RESULTSD_WORKSPACE";
pub const DEFAULT_LOG_FILTER: &str = "resultsd=info,warn";

/// Process-level settings. Everything else is stored per workspace.
#[derive(Debug, Clone)]
pub struct Config {
    pub workspace: Option<PathBuf>,
    pub log_filter: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var(WORKSPACE_ENV).ok(),
            std::env::var(LOG_ENV).ok(),
        )
    }

    fn from_vars(workspace: Option<String>, log_filter: Option<String>) -> Self {
        Self {
            workspace: workspace
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            log_filter: log_filter
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
        }
    }
}
