//! Static configuration: config-root resolution, `config.yaml` and
//! `projects/<name>.yaml`, and the hardcoded default allow list.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::decisions::ProxyEntries;
use crate::domain::DomainSet;
use crate::error::ConfigError;

/// Default per-request approval deadline when `proxy.approval_timeout` is
/// absent from `config.yaml`. See DESIGN.md's Open Questions resolution.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Upstream TCP dial timeout (§5).
pub const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunnel idle timeout (§5).
pub const TUNNEL_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Domains the global tier allows out of the box, regardless of static
/// config or recorded decisions: AI provider APIs, package registries, and
/// OS package repositories (§3, §9 "default allow list").
pub const DEFAULT_ALLOWED_DOMAINS: &[&str] = &[
    "api.anthropic.com",
    "api.openai.com",
    "registry.npmjs.org",
    "pypi.org",
    "files.pythonhosted.org",
    "crates.io",
    "static.crates.io",
    "index.crates.io",
    "deb.debian.org",
    "archive.ubuntu.com",
    "security.ubuntu.com",
];

/// Resolve `<config_root>` from `XDG_CONFIG_HOME`, falling back to the
/// platform config directory, joined with `guardian`.
pub fn resolve_config_root(override_path: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = override_path {
        return Ok(path);
    }
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME")
        && !xdg.is_empty()
    {
        return Ok(PathBuf::from(xdg).join("guardian"));
    }
    dirs::config_dir()
        .map(|dir| dir.join("guardian"))
        .ok_or_else(|| ConfigError::RootUnresolved {
            reason: "neither XDG_CONFIG_HOME nor a platform config directory is available"
                .to_string(),
        })
}

/// The `proxy:` subtree shared by `config.yaml` and `projects/<name>.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StaticProxyConfig {
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default)]
    pub allow: Vec<crate::decisions::EntryDto>,
    #[serde(default)]
    pub deny: Vec<crate::decisions::EntryDto>,
    #[serde(default)]
    pub approval_timeout: Option<String>,
}

impl StaticProxyConfig {
    pub fn entries(&self) -> ProxyEntries {
        ProxyEntries {
            allow: self.allow.clone(),
            deny: self.deny.clone(),
        }
    }
}

/// Top-level shape of `config.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfigFile {
    #[serde(default)]
    pub proxy: StaticProxyConfig,
}

/// Top-level shape of `projects/<name>.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfigFile {
    #[serde(default)]
    pub proxy: StaticProxyConfig,
}

/// Parse a duration string in the config's small accepted vocabulary:
/// a bare integer (seconds), or an integer followed by `s`, `m`, or `h`.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    let (digits, suffix) = input.split_at(input.trim_end_matches(|c: char| c.is_ascii_alphabetic()).len());
    let value: u64 = digits.parse().ok()?;
    let multiplier = match suffix {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => return None,
    };
    Some(Duration::from_secs(value * multiplier))
}

/// Load `config.yaml` from a config root. A missing file yields defaults.
pub async fn load_global_config(config_root: &std::path::Path) -> Result<GlobalConfigFile, ConfigError> {
    let path = config_root.join("config.yaml");
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => serde_yml::from_str(&contents).map_err(|err| ConfigError::Parse {
            path: path.display().to_string(),
            reason: err.to_string(),
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(GlobalConfigFile::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Load `projects/<name>.yaml`. A missing file yields defaults.
pub async fn load_project_config(
    config_root: &std::path::Path,
    project: &str,
) -> Result<ProjectConfigFile, ConfigError> {
    let path = config_root.join("projects").join(format!("{project}.yaml"));
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => serde_yml::from_str(&contents).map_err(|err| ConfigError::Parse {
            path: path.display().to_string(),
            reason: err.to_string(),
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ProjectConfigFile::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Build the seeded default-allow `DomainSet` (§3/§9).
pub fn default_allow_set() -> DomainSet {
    let domains: Vec<String> = DEFAULT_ALLOWED_DOMAINS.iter().map(|d| d.to_string()).collect();
    DomainSet::new(&domains, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_accepts_suffixes() {
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("bogus"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn default_allow_set_covers_scenario_one() {
        let set = default_allow_set();
        assert!(set.contains("api.anthropic.com"));
        assert!(!set.contains("github.com"));
    }

    #[tokio::test]
    async fn missing_global_config_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_global_config(dir.path()).await.unwrap();
        assert_eq!(config, GlobalConfigFile::default());
    }
}
