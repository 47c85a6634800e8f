//! The declarative runtime registry: hosts, backends, models, and the
//! single active-runtime record.

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hosts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Local,
    Ssh,
}

/// A machine that can run an inference server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "d_true")]
    pub enabled: bool,
    pub transport: Transport,
    #[serde(default)]
    pub connection: Connection,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub health: HealthCheck,
    #[serde(default)]
    pub model_control: ModelControl,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Connection {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
    /// Never logged; masked in all display output.
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Capabilities {
    #[serde(default)]
    pub gpu_tags: Vec<String>,
    #[serde(default)]
    pub backends: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(default = "d_health_cmd")]
    pub check_cmd: String,
    #[serde(default = "d_health_timeout")]
    pub timeout_sec: u64,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            check_cmd: d_health_cmd(),
            timeout_sec: d_health_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelControl {
    /// Command that stops any running inference server on the host.
    #[serde(default)]
    pub stop_cmd: String,
    #[serde(default)]
    pub cleanup_cmd: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backends
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Vulkan,
    Rocm,
    Cuda,
    Metal,
    Cpu,
    Custom,
}

/// A compute toolchain plus the commands that activate it on a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(rename = "type")]
    pub backend_type: BackendType,
    #[serde(default)]
    pub host_filters: Policy,
    #[serde(default)]
    pub apply_cmd: Option<String>,
    #[serde(default)]
    pub verify_cmd: Option<String>,
    #[serde(default)]
    pub rollback_cmd: Option<String>,
    #[serde(default)]
    pub env: Option<String>,
    #[serde(default)]
    pub args: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Models
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A weights source plus the start/probe command templates that serve it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Weights path or identifier on the target host.
    pub source: String,
    #[serde(default)]
    pub host_policy: Policy,
    #[serde(default)]
    pub backend_policy: Policy,
    pub launch: Launch,
    #[serde(default)]
    pub runtime_defaults: RuntimeDefaults,
    #[serde(default)]
    pub chat_template: Option<String>,
    #[serde(default)]
    pub split_policy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Launch {
    pub start_cmd: String,
    pub probe_cmd: String,
    #[serde(default = "d_probe_timeout")]
    pub probe_timeout_sec: u64,
    #[serde(default = "d_probe_interval")]
    pub probe_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeDefaults {
    #[serde(default = "d_port")]
    pub port: u16,
}

impl Default for RuntimeDefaults {
    fn default() -> Self {
        Self { port: d_port() }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Policies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Host/backend eligibility: `"any"` (first enabled match) or an
/// ordered id list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(from = "PolicyRepr", into = "PolicyRepr")]
pub enum Policy {
    #[default]
    Any,
    Ids(Vec<String>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PolicyRepr {
    Tag(String),
    Ids(Vec<String>),
}

impl From<PolicyRepr> for Policy {
    fn from(repr: PolicyRepr) -> Self {
        match repr {
            PolicyRepr::Tag(s) if s == "any" => Policy::Any,
            PolicyRepr::Tag(s) => Policy::Ids(vec![s]),
            PolicyRepr::Ids(ids) => Policy::Ids(ids),
        }
    }
}

impl From<Policy> for PolicyRepr {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Any => PolicyRepr::Tag("any".into()),
            Policy::Ids(ids) => PolicyRepr::Ids(ids),
        }
    }
}

impl Policy {
    pub fn is_any(&self) -> bool {
        matches!(self, Policy::Any)
    }

    /// True when `id` satisfies this policy.
    pub fn permits(&self, id: &str) -> bool {
        match self {
            Policy::Any => true,
            Policy::Ids(ids) => ids.iter().any(|i| i == id),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry + active runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The on-disk registry (`runtimes.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default = "d_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub backends: Vec<Backend>,
    #[serde(default)]
    pub models: Vec<Model>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            schema_version: d_schema_version(),
            hosts: Vec::new(),
            backends: Vec::new(),
            models: Vec::new(),
        }
    }
}

impl Registry {
    pub fn host(&self, id: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.id == id)
    }

    pub fn backend(&self, id: &str) -> Option<&Backend> {
        self.backends.iter().find(|b| b.id == id)
    }

    pub fn model(&self, id: &str) -> Option<&Model> {
        self.models.iter().find(|m| m.id == id)
    }
}

/// The single record describing what is currently serving. Owned by the
/// executor; written exactly once per successful plan execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveRuntime {
    pub model_id: String,
    #[serde(default)]
    pub backend_id: Option<String>,
    /// Ordered: target hosts first, then RPC helpers.
    pub host_ids: Vec<String>,
    pub healthy: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_health_cmd() -> String {
    "uptime".into()
}
fn d_health_timeout() -> u64 {
    5
}
fn d_probe_timeout() -> u64 {
    8
}
fn d_probe_interval() -> u64 {
    1500
}
fn d_port() -> u16 {
    8080
}
fn d_schema_version() -> u32 {
    1
}
