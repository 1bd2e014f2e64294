//! The layered allow/deny policy engine: global, per-project, and
//! per-token (session) tiers, with deny-always-wins evaluation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::decisions::{Decisions, EntryDto};
use crate::domain::{normalize_host, DomainSet, Entry};
use crate::error::PolicyError;

/// Result of `PolicyEngine::check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
    AskHuman,
}

/// Where a recorded decision should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Once,
    Session,
    Project,
    Global,
}

/// An allow/deny pair for one tier.
#[derive(Debug, Clone, Default)]
pub struct ProxyPolicy {
    pub allow: DomainSet,
    pub deny: DomainSet,
}

impl ProxyPolicy {
    pub fn from_decision_entries(entries: &crate::decisions::ProxyEntries) -> Self {
        let mut policy = Self::default();
        for entry in &entries.allow {
            if let Some(entry) = entry.to_entry() {
                policy.allow.add_entry(&entry);
            }
        }
        for entry in &entries.deny {
            if let Some(entry) = entry.to_entry() {
                policy.deny.add_entry(&entry);
            }
        }
        policy
    }

    fn merge(mut self, other: &Self) -> Self {
        for d in other.allow.domains() {
            self.allow.add_domain(d);
        }
        for p in other.allow.patterns() {
            self.allow.add_pattern(&p.to_string());
        }
        for d in other.deny.domains() {
            self.deny.add_domain(d);
        }
        for p in other.deny.patterns() {
            self.deny.add_pattern(&p.to_string());
        }
        self
    }
}

/// Arguments to `PolicyEngine::record_decision`.
pub struct RecordDecisionRequest {
    pub token: String,
    pub project: String,
    pub entry: Entry,
    pub scope: Scope,
    pub allowed: bool,
}

struct Tiers {
    global: ProxyPolicy,
    projects: HashMap<String, ProxyPolicy>,
    tokens: HashMap<String, ProxyPolicy>,
}

/// Owns all three policy tiers and mediates every read/write against them.
pub struct PolicyEngine {
    config_root: PathBuf,
    store: crate::decisions::DecisionStore,
    tiers: RwLock<Tiers>,
    global_mu: Mutex<()>,
    project_mus: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PolicyEngine {
    /// Build an engine seeded with the default allow list and the static
    /// global config's allow/deny entries, with an empty project/token map.
    pub fn new(config_root: PathBuf, seed: ProxyPolicy) -> Self {
        Self {
            store: crate::decisions::DecisionStore::new(&config_root),
            config_root,
            tiers: RwLock::new(Tiers {
                global: seed,
                projects: HashMap::new(),
                tokens: HashMap::new(),
            }),
            global_mu: Mutex::new(()),
            project_mus: Mutex::new(HashMap::new()),
        }
    }

    pub fn config_root(&self) -> &std::path::Path {
        &self.config_root
    }

    async fn project_lock(&self, project: &str) -> Arc<Mutex<()>> {
        let mut mus = self.project_mus.lock().await;
        mus.entry(project.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Evaluate policy for a `(token, project, domain)` triple. Never
    /// performs I/O; takes only a reader lock.
    pub async fn check(&self, token: &str, project: &str, domain: &str) -> Decision {
        let domain = normalize_host(domain);
        let tiers = self.tiers.read().await;

        if tiers.global.deny.contains(&domain) {
            return Decision::Deny("denied by global policy".to_string());
        }
        if let Some(p) = tiers.projects.get(project)
            && p.deny.contains(&domain)
        {
            return Decision::Deny("denied by project policy".to_string());
        }
        if let Some(t) = tiers.tokens.get(token)
            && t.deny.contains(&domain)
        {
            return Decision::Deny("denied by session policy".to_string());
        }

        if tiers.global.allow.contains(&domain) {
            return Decision::Allow;
        }
        if let Some(p) = tiers.projects.get(project)
            && p.allow.contains(&domain)
        {
            return Decision::Allow;
        }
        if let Some(t) = tiers.tokens.get(token)
            && t.allow.contains(&domain)
        {
            return Decision::Allow;
        }

        Decision::AskHuman
    }

    /// On first observation of a project (e.g. at token registration),
    /// load its on-disk state so entries apply without a SIGHUP.
    pub async fn ensure_project(&self, project: &str) -> Result<(), PolicyError> {
        let already_loaded = self.tiers.read().await.projects.contains_key(project);
        if already_loaded {
            return Ok(());
        }
        self.reload_project(project).await
    }

    /// Re-read `projects/<name>.yaml` + `decisions/projects/<name>.yaml`,
    /// build a fresh policy outside the lock, then swap it in.
    pub async fn reload_project(&self, project: &str) -> Result<(), PolicyError> {
        let static_cfg = crate::config::load_project_config(&self.config_root, project)
            .await
            .map_err(PolicyError::Reload)?;
        let decisions = self
            .store
            .load_project(project)
            .await
            .map_err(PolicyError::Reload)?;

        let fresh = ProxyPolicy::from_decision_entries(&static_cfg.proxy.entries())
            .merge(&ProxyPolicy::from_decision_entries(&decisions.proxy));

        let mut tiers = self.tiers.write().await;
        tiers.projects.insert(project.to_string(), fresh);
        Ok(())
    }

    /// Re-read the static global config + `decisions/global.yaml`.
    pub async fn reload_global(&self) -> Result<(), PolicyError> {
        let static_cfg = crate::config::load_global_config(&self.config_root)
            .await
            .map_err(PolicyError::Reload)?;
        let decisions = self.store.load_global().await.map_err(PolicyError::Reload)?;

        let seeded = ProxyPolicy {
            allow: crate::config::default_allow_set(),
            deny: DomainSet::empty(),
        };
        let fresh_policy = seeded
            .merge(&ProxyPolicy::from_decision_entries(&static_cfg.proxy.entries()))
            .merge(&ProxyPolicy::from_decision_entries(&decisions.proxy));

        let mut tiers = self.tiers.write().await;
        tiers.global = fresh_policy;
        Ok(())
    }

    /// Reload global state and rebuild the project map. Never touches the
    /// token (session) tier.
    pub async fn reload_all(&self) -> Result<(), PolicyError> {
        self.reload_global().await?;
        let projects: Vec<String> = {
            let tiers = self.tiers.read().await;
            tiers.projects.keys().cloned().collect()
        };
        for project in projects {
            self.reload_project(&project).await?;
        }
        Ok(())
    }

    /// Remove a token's session-tier policy, e.g. on revocation.
    pub async fn revoke_token(&self, token: &str) {
        self.tiers.write().await.tokens.remove(token);
    }

    /// Mutate the project-tier cache in memory only, without touching disk.
    /// Used by session-scope approvals to warm the project cache (§4.6 step
    /// 5); denials never call this — see DESIGN.md's Open Questions.
    pub async fn warm_project_cache(&self, project: &str, entry: &Entry) {
        let mut tiers = self.tiers.write().await;
        tiers
            .projects
            .entry(project.to_string())
            .or_default()
            .allow
            .add_entry(entry);
    }

    /// Persist a decision at the requested scope and, for `project`/`global`,
    /// reload that tier's in-memory state from disk only on success.
    pub async fn record_decision(&self, req: RecordDecisionRequest) -> Result<(), PolicyError> {
        match req.scope {
            Scope::Once => Ok(()),
            Scope::Session => {
                let mut tiers = self.tiers.write().await;
                let policy = tiers.tokens.entry(req.token.clone()).or_default();
                let set = if req.allowed {
                    &mut policy.allow
                } else {
                    &mut policy.deny
                };
                set.add_entry(&req.entry);
                Ok(())
            }
            Scope::Project => {
                let lock = self.project_lock(&req.project).await;
                let _guard = lock.lock().await;
                let mut decisions = self
                    .store
                    .load_project(&req.project)
                    .await
                    .map_err(PolicyError::RecordDecision)?;
                decisions.add_entry(EntryDto::from_entry(&req.entry), req.allowed);
                self.store
                    .write_project(&req.project, &decisions)
                    .await
                    .map_err(PolicyError::RecordDecision)?;
                drop(_guard);
                self.reload_project(&req.project).await
            }
            Scope::Global => {
                let _guard = self.global_mu.lock().await;
                let mut decisions = self
                    .store
                    .load_global()
                    .await
                    .map_err(PolicyError::RecordDecision)?;
                decisions.add_entry(EntryDto::from_entry(&req.entry), req.allowed);
                self.store
                    .write_global(&decisions)
                    .await
                    .map_err(PolicyError::RecordDecision)?;
                drop(_guard);
                self.reload_global().await
            }
        }
    }
}

#[async_trait::async_trait]
impl crate::tokens::RevocationSubscriber for PolicyEngine {
    async fn on_revoke(&self, token: &str) {
        self.revoke_token(token).await;
    }
}
