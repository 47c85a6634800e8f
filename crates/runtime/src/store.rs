//! Persistence for the runtime registry and the active-runtime record.
//!
//! Both files live in the state directory and are written via temp file
//! + rename. The registry is operator-editable; the active-runtime
//! record is owned exclusively by the executor.

use std::path::{Path, PathBuf};

use ih_domain::config::{ConfigIssue, ConfigSeverity, RuntimeSettings};
use ih_domain::{Error, Result};

use crate::registry::{ActiveRuntime, Registry, Transport};
use crate::template;

pub struct RuntimeStore {
    state_dir: PathBuf,
}

impl RuntimeStore {
    /// Resolve the state directory: explicit override, else the
    /// platform state dir, else a dot directory in the home dir.
    pub fn new(settings: &RuntimeSettings) -> Self {
        let state_dir = settings
            .state_dir
            .clone()
            .or_else(|| dirs::state_dir().map(|d| d.join("idlehands")))
            .or_else(|| dirs::home_dir().map(|d| d.join(".idlehands")))
            .unwrap_or_else(|| PathBuf::from(".idlehands"));
        Self { state_dir }
    }

    pub fn with_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn registry_path(&self) -> PathBuf {
        self.state_dir.join("runtimes.json")
    }

    pub fn active_path(&self) -> PathBuf {
        self.state_dir.join("active_runtime.json")
    }

    // ── Registry ────────────────────────────────────────────────────

    /// Load the registry, creating an empty one on first use.
    pub fn load_registry(&self) -> Result<Registry> {
        let path = self.registry_path();
        if !path.exists() {
            let empty = Registry::default();
            self.save_registry(&empty)?;
            tracing::info!(path = %path.display(), "bootstrapped empty runtime registry");
            return Ok(empty);
        }
        let text = std::fs::read_to_string(&path)?;
        let registry: Registry = serde_json::from_str(&text).map_err(|e| {
            Error::Config(format!(
                "{} is not a valid registry ({e}) — fix or remove the file",
                path.display()
            ))
        })?;
        let issues = validate_registry(&registry);
        if let Some(fatal) = issues
            .iter()
            .find(|i| i.severity == ConfigSeverity::Error)
        {
            return Err(Error::Config(fatal.to_string()));
        }
        for warning in &issues {
            tracing::warn!(%warning, "registry validation");
        }
        Ok(registry)
    }

    pub fn save_registry(&self, registry: &Registry) -> Result<()> {
        let json = serde_json::to_string_pretty(registry)?;
        self.write_atomic(&self.registry_path(), &json)
    }

    // ── Active runtime ──────────────────────────────────────────────

    pub fn load_active(&self) -> Result<Option<ActiveRuntime>> {
        let path = self.active_path();
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        match serde_json::from_str(&text) {
            Ok(active) => Ok(Some(active)),
            Err(e) => {
                // A corrupt record is treated as "nothing running";
                // the next successful plan overwrites it.
                tracing::warn!(error = %e, "active runtime record unreadable, ignoring");
                Ok(None)
            }
        }
    }

    pub fn save_active(&self, active: &ActiveRuntime) -> Result<()> {
        let json = serde_json::to_string_pretty(active)?;
        self.write_atomic(&self.active_path(), &json)
    }

    pub fn clear_active(&self) -> Result<()> {
        let path = self.active_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────

    fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir)?;
        let tmp = tempfile::NamedTempFile::new_in(&self.state_dir)?;
        std::fs::write(tmp.path(), content)?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Structural validation: id uniqueness, reference resolution, ssh
/// connection requirements, template variable checks.
pub fn validate_registry(registry: &Registry) -> Vec<ConfigIssue> {
    let mut issues = Vec::new();
    let mut err = |field: String, message: String| {
        issues.push(ConfigIssue {
            severity: ConfigSeverity::Error,
            field,
            message,
        });
    };

    let mut seen = std::collections::HashSet::new();
    for host in &registry.hosts {
        if !seen.insert(format!("host:{}", host.id)) {
            err(format!("hosts.{}", host.id), "duplicate host id".into());
        }
        if host.transport == Transport::Ssh && host.connection.host.is_none() {
            err(
                format!("hosts.{}.connection.host", host.id),
                "required for ssh transport".into(),
            );
        }
    }
    for backend in &registry.backends {
        if !seen.insert(format!("backend:{}", backend.id)) {
            err(format!("backends.{}", backend.id), "duplicate backend id".into());
        }
        if let crate::registry::Policy::Ids(ids) = &backend.host_filters {
            for id in ids {
                if registry.host(id).is_none() {
                    err(
                        format!("backends.{}.host_filters", backend.id),
                        format!("unknown host id {id}"),
                    );
                }
            }
        }
        for cmd in [&backend.apply_cmd, &backend.verify_cmd, &backend.rollback_cmd]
            .into_iter()
            .flatten()
        {
            if let Err(e) = template::validate_refs(cmd) {
                err(format!("backends.{}", backend.id), e.to_string());
            }
        }
    }
    for model in &registry.models {
        if !seen.insert(format!("model:{}", model.id)) {
            err(format!("models.{}", model.id), "duplicate model id".into());
        }
        if let crate::registry::Policy::Ids(ids) = &model.host_policy {
            for id in ids {
                if registry.host(id).is_none() {
                    err(
                        format!("models.{}.host_policy", model.id),
                        format!("unknown host id {id}"),
                    );
                }
            }
        }
        if let crate::registry::Policy::Ids(ids) = &model.backend_policy {
            for id in ids {
                if registry.backend(id).is_none() {
                    err(
                        format!("models.{}.backend_policy", model.id),
                        format!("unknown backend id {id}"),
                    );
                }
            }
        }
        for cmd in [&model.launch.start_cmd, &model.launch.probe_cmd] {
            if let Err(e) = template::validate_refs(cmd) {
                err(format!("models.{}.launch", model.id), e.to_string());
            }
        }
    }

    // apply without rollback is survivable but worth flagging.
    for backend in &registry.backends {
        if backend.apply_cmd.is_some() && backend.rollback_cmd.is_none() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: format!("backends.{}", backend.id),
                message: "apply_cmd without rollback_cmd — a failed apply cannot be undone".into(),
            });
        }
    }

    issues
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Redaction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Deep copy of the registry as JSON with secrets masked for display.
pub fn redact_registry(registry: &Registry) -> serde_json::Value {
    let mut value = serde_json::to_value(registry).unwrap_or_default();
    if let Some(hosts) = value.get_mut("hosts").and_then(|v| v.as_array_mut()) {
        for host in hosts {
            if let Some(conn) = host.get_mut("connection") {
                for secret in ["password", "key_path"] {
                    if let Some(field) = conn.get_mut(secret) {
                        if !field.is_null() {
                            *field = serde_json::Value::String("***".into());
                        }
                    }
                }
            }
        }
    }
    value
}
