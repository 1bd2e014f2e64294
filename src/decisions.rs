//! On-disk persistence for policy decisions.
//!
//! Only this module touches decision files. Writes go through a
//! write-to-temp-then-rename sequence so a reader never observes a
//! half-written file, and directory/file permissions are tightened to
//! owner-only after every write.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::Entry;
use crate::error::ConfigError;

/// One allow-or-deny entry as it appears on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EntryDto {
    /// Present for an exact-domain entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Present for a wildcard-pattern entry (e.g. `*.example.com`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl EntryDto {
    pub fn domain(d: impl Into<String>) -> Self {
        Self {
            domain: Some(d.into()),
            pattern: None,
        }
    }

    pub fn pattern(p: impl Into<String>) -> Self {
        Self {
            domain: None,
            pattern: Some(p.into()),
        }
    }

    pub fn to_entry(&self) -> Option<Entry> {
        if let Some(d) = &self.domain {
            Some(Entry::Domain(d.clone()))
        } else {
            self.pattern.as_ref().map(|p| Entry::Pattern(p.clone()))
        }
    }

    pub fn from_entry(entry: &Entry) -> Self {
        match entry {
            Entry::Domain(d) => Self::domain(d.clone()),
            Entry::Pattern(p) => Self::pattern(p.clone()),
        }
    }
}

/// The `proxy:` subtree of a decisions (or static config) YAML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProxyEntries {
    #[serde(default)]
    pub allow: Vec<EntryDto>,
    #[serde(default)]
    pub deny: Vec<EntryDto>,
}

/// The full shape of a decisions file: a single top-level `proxy:` key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Decisions {
    #[serde(default)]
    pub proxy: ProxyEntries,
}

impl Decisions {
    /// True if a `(domain_or_pattern, is_pattern)` entry is already present
    /// in the given list (`allow` or `deny`).
    fn contains(list: &[EntryDto], entry: &EntryDto) -> bool {
        list.contains(entry)
    }

    /// Append an allow/deny entry if not already present. Returns whether a
    /// mutation occurred.
    pub fn add_entry(&mut self, entry: EntryDto, allowed: bool) -> bool {
        let list = if allowed {
            &mut self.proxy.allow
        } else {
            &mut self.proxy.deny
        };
        if Self::contains(list, &entry) {
            false
        } else {
            list.push(entry);
            true
        }
    }
}

/// Pure on-disk layer for global/per-project decision files.
#[derive(Debug, Clone)]
pub struct DecisionStore {
    config_root: PathBuf,
}

impl DecisionStore {
    pub fn new(config_root: impl Into<PathBuf>) -> Self {
        Self {
            config_root: config_root.into(),
        }
    }

    pub fn config_root(&self) -> &Path {
        &self.config_root
    }

    fn decisions_dir(&self) -> PathBuf {
        self.config_root.join("decisions")
    }

    pub fn global_path(&self) -> PathBuf {
        self.decisions_dir().join("global.yaml")
    }

    pub fn project_path(&self, project: &str) -> PathBuf {
        self.decisions_dir().join("projects").join(format!("{project}.yaml"))
    }

    /// Rename a legacy `approvals/` directory to `decisions/` if the latter
    /// does not already exist. A no-op if both or neither exist.
    pub async fn migrate_legacy_dir(&self) -> Result<(), ConfigError> {
        let legacy = self.config_root.join("approvals");
        let current = self.decisions_dir();
        if current.exists() || !legacy.exists() {
            return Ok(());
        }
        tokio::fs::rename(&legacy, &current)
            .await
            .map_err(|source| ConfigError::Io {
                path: current.display().to_string(),
                source,
            })
    }

    /// Load a decisions file. A missing file yields an empty `Decisions`;
    /// a malformed one surfaces a parse error.
    pub async fn load(&self, path: &Path) -> Result<Decisions, ConfigError> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => serde_yml::from_str(&contents).map_err(|err| ConfigError::Parse {
                path: path.display().to_string(),
                reason: err.to_string(),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Decisions::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    pub async fn load_global(&self) -> Result<Decisions, ConfigError> {
        self.load(&self.global_path()).await
    }

    pub async fn load_project(&self, project: &str) -> Result<Decisions, ConfigError> {
        self.load(&self.project_path(project)).await
    }

    /// Write a decisions file atomically: serialize, write to a temp file in
    /// the same directory, fix permissions, then rename over the target.
    pub async fn write(&self, path: &Path, decisions: &Decisions) -> Result<(), ConfigError> {
        let dir = path.parent().ok_or_else(|| ConfigError::Io {
            path: path.display().to_string(),
            source: std::io::Error::other("decision path has no parent directory"),
        })?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| ConfigError::Io {
                path: dir.display().to_string(),
                source,
            })?;
        // `create_dir_all` does not tighten intermediate directories it
        // creates, so every ancestor from `decisions/` down to `dir` needs
        // its own permission fix-up, not just the leaf.
        for ancestor in decision_dir_ancestors(&self.decisions_dir(), dir) {
            ensure_dir_permissions(&ancestor).await?;
        }

        let yaml = serde_yml::to_string(decisions).map_err(|err| ConfigError::Parse {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;

        let tmp_path = dir.join(format!(
            ".{}.tmp-{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("decisions"),
            uuid::Uuid::new_v4()
        ));
        tokio::fs::write(&tmp_path, yaml.as_bytes())
            .await
            .map_err(|source| ConfigError::Io {
                path: tmp_path.display().to_string(),
                source,
            })?;
        ensure_file_permissions(&tmp_path).await?;

        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })
    }

    pub async fn write_global(&self, decisions: &Decisions) -> Result<(), ConfigError> {
        self.write(&self.global_path(), decisions).await
    }

    pub async fn write_project(&self, project: &str, decisions: &Decisions) -> Result<(), ConfigError> {
        self.write(&self.project_path(project), decisions).await
    }
}

/// All directories from `root` down to and including `leaf`, top-down, so
/// callers can tighten permissions on every level `create_dir_all` may have
/// just created. `leaf` must be `root` or a descendant of it.
fn decision_dir_ancestors(root: &Path, leaf: &Path) -> Vec<PathBuf> {
    if !leaf.starts_with(root) {
        return vec![leaf.to_path_buf()];
    }
    let mut chain = vec![leaf.to_path_buf()];
    let mut current = leaf;
    while current != root {
        match current.parent() {
            Some(parent) => {
                chain.push(parent.to_path_buf());
                current = parent;
            }
            None => break,
        }
    }
    chain.reverse();
    chain
}

#[cfg(unix)]
async fn ensure_dir_permissions(dir: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;

    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let metadata = std::fs::metadata(&dir)?;
        let mut perms = metadata.permissions();
        if perms.mode() & 0o777 != 0o700 {
            perms.set_mode(0o700);
            std::fs::set_permissions(&dir, perms)?;
        }
        Ok::<(), std::io::Error>(())
    })
    .await
    .expect("permission task panicked")
    .map_err(|source| ConfigError::Io {
        path: dir.to_string_lossy().into_owned(),
        source,
    })
}

#[cfg(not(unix))]
async fn ensure_dir_permissions(_dir: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
async fn ensure_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;

    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let metadata = std::fs::metadata(&path)?;
        let mut perms = metadata.permissions();
        if perms.mode() & 0o777 != 0o600 {
            perms.set_mode(0o600);
            std::fs::set_permissions(&path, perms)?;
        }
        Ok::<(), std::io::Error>(())
    })
    .await
    .expect("permission task panicked")
    .map_err(|source| ConfigError::Io {
        path: path.to_string_lossy().into_owned(),
        source,
    })
}

#[cfg(not(unix))]
async fn ensure_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn load_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = DecisionStore::new(dir.path());
        let decisions = store.load_global().await.unwrap();
        assert_eq!(decisions, Decisions::default());
    }

    #[tokio::test]
    async fn round_trips_through_write_and_load() {
        let dir = tempdir().unwrap();
        let store = DecisionStore::new(dir.path());
        let mut decisions = Decisions::default();
        decisions.add_entry(EntryDto::domain("example.com"), true);
        decisions.add_entry(EntryDto::pattern("*.evil.com"), false);

        store.write_global(&decisions).await.unwrap();
        let loaded = store.load_global().await.unwrap();
        assert_eq!(loaded, decisions);
    }

    #[tokio::test]
    async fn unknown_top_level_key_is_rejected() {
        let dir = tempdir().unwrap();
        let store = DecisionStore::new(dir.path());
        tokio::fs::create_dir_all(dir.path().join("decisions")).await.unwrap();
        tokio::fs::write(
            store.global_path(),
            b"proxy:\n  allow: []\n  deny: []\nunexpected_key: true\n",
        )
        .await
        .unwrap();

        let result = store.load_global().await;
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn write_sets_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = DecisionStore::new(dir.path());
        store.write_global(&Decisions::default()).await.unwrap();

        let file_mode = std::fs::metadata(store.global_path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(store.global_path().parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn write_project_tightens_every_ancestor_directory() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = DecisionStore::new(dir.path());
        store.write_project("demo", &Decisions::default()).await.unwrap();

        for ancestor in [store.decisions_dir(), store.decisions_dir().join("projects")] {
            let mode = std::fs::metadata(&ancestor).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o700, "{ancestor:?} should be 0700");
        }
    }

    #[tokio::test]
    async fn migrate_renames_legacy_dir_once() {
        let dir = tempdir().unwrap();
        let legacy = dir.path().join("approvals");
        tokio::fs::create_dir_all(&legacy).await.unwrap();
        tokio::fs::write(legacy.join("global.yaml"), b"proxy:\n  allow: []\n  deny: []\n")
            .await
            .unwrap();

        let store = DecisionStore::new(dir.path());
        store.migrate_legacy_dir().await.unwrap();
        assert!(store.decisions_dir().exists());
        assert!(!legacy.exists());

        // Second call is a no-op since `decisions/` now exists.
        store.migrate_legacy_dir().await.unwrap();
    }

    #[test]
    fn entry_dto_round_trips_entry() {
        let pattern = Entry::Pattern("*.evil.com".to_string());
        let dto = EntryDto::from_entry(&pattern);
        assert_eq!(dto.pattern.as_deref(), Some("*.evil.com"));
        assert_eq!(dto.to_entry(), Some(pattern));

        let domain = Entry::Domain("example.com".to_string());
        let dto = EntryDto::from_entry(&domain);
        assert_eq!(dto.to_entry(), Some(domain));
    }
}
