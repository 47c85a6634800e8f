//! HTTP health probing of inference endpoints.
//!
//! `GET /v1/models` is the primary probe (it also reports which models
//! are loaded); `GET /health` is the fallback when the models route
//! answers with a non-200. Probes are serialized per host and carry no
//! implicit retries; retrying is [`wait_for_models_ready`]'s job.

use std::time::Duration;

use serde::Deserialize;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    /// HTTP 200: the server is answering.
    Ready,
    /// HTTP 503: up, but the model is still loading.
    Loading,
    /// Connection refused, DNS failure, or timeout.
    Down,
    /// Anything else (auth walls, proxies, surprises).
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub status: ProbeStatus,
    pub http_code: Option<u16>,
    /// Model ids reported by `/v1/models`, when parseable.
    pub model_ids: Vec<String>,
    pub body: String,
    /// Transport-level error text, when the request never got a response.
    pub error: Option<String>,
}

impl ProbeResult {
    fn from_error(e: &reqwest::Error) -> Self {
        let status = if e.is_connect() || e.is_timeout() {
            ProbeStatus::Down
        } else {
            let text = e.to_string().to_ascii_lowercase();
            if text.contains("dns") || text.contains("resolve") {
                ProbeStatus::Down
            } else {
                ProbeStatus::Unknown
            }
        };
        Self {
            status,
            http_code: None,
            model_ids: Vec::new(),
            body: String::new(),
            error: Some(e.to_string()),
        }
    }

    /// One-line summary for wait reports and error messages.
    pub fn summary(&self) -> String {
        let mut s = format!("{:?}", self.status).to_lowercase();
        if let Some(code) = self.http_code {
            s.push_str(&format!(" (HTTP {code})"));
        }
        if let Some(ref err) = self.error {
            let preview: String = err.chars().take(160).collect();
            s.push_str(&format!(": {preview}"));
        }
        s
    }
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

fn classify_code(code: u16) -> ProbeStatus {
    match code {
        200 => ProbeStatus::Ready,
        503 => ProbeStatus::Loading,
        _ => ProbeStatus::Unknown,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Probing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Probe `/v1/models` on a host:port, falling back to `/health` on a
/// non-200 response.
pub async fn probe_models_endpoint(
    client: &reqwest::Client,
    host: &str,
    port: u16,
    timeout: Duration,
) -> ProbeResult {
    let models_url = format!("http://{host}:{port}/v1/models");
    let response = match client.get(&models_url).timeout(timeout).send().await {
        Ok(r) => r,
        Err(e) => return ProbeResult::from_error(&e),
    };

    let code = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();

    if code == 200 {
        let model_ids = serde_json::from_str::<ModelsResponse>(&body)
            .map(|r| r.data.into_iter().map(|m| m.id).collect())
            .unwrap_or_default();
        return ProbeResult {
            status: ProbeStatus::Ready,
            http_code: Some(code),
            model_ids,
            body,
            error: None,
        };
    }

    // Non-200 from /v1/models: some servers only implement /health.
    let health_url = format!("http://{host}:{port}/health");
    match client.get(&health_url).timeout(timeout).send().await {
        Ok(r) => {
            let health_code = r.status().as_u16();
            let health_body = r.text().await.unwrap_or_default();
            ProbeResult {
                status: classify_code(health_code),
                http_code: Some(health_code),
                model_ids: Vec::new(),
                body: health_body,
                error: None,
            }
        }
        Err(_) => ProbeResult {
            status: classify_code(code),
            http_code: Some(code),
            model_ids: Vec::new(),
            body,
            error: None,
        },
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wait-until-ready
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub interval: Duration,
    /// Per-attempt probe timeout.
    pub probe_timeout: Duration,
    /// When set, readiness additionally requires this id among the
    /// reported models (servers that report no ids at all still pass).
    pub expected_model_id: Option<String>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            interval: Duration::from_millis(1500),
            probe_timeout: Duration::from_secs(8),
            expected_model_id: None,
        }
    }
}

#[derive(Debug)]
pub struct WaitReport {
    pub ok: bool,
    pub attempts: u32,
    pub last: ProbeResult,
    pub reason: Option<String>,
}

/// Poll until the endpoint reports ready (and the expected model, if
/// requested) or the time budget runs out.
pub async fn wait_for_models_ready(
    client: &reqwest::Client,
    host: &str,
    port: u16,
    opts: &WaitOptions,
) -> WaitReport {
    let deadline = tokio::time::Instant::now() + opts.timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let last = probe_models_endpoint(client, host, port, opts.probe_timeout).await;

        if last.status == ProbeStatus::Ready {
            let model_ok = match &opts.expected_model_id {
                None => true,
                Some(expected) => {
                    last.model_ids.is_empty()
                        || last.model_ids.iter().any(|id| id.contains(expected.as_str()))
                }
            };
            if model_ok {
                tracing::debug!(host, port, attempts, "endpoint ready");
                return WaitReport {
                    ok: true,
                    attempts,
                    last,
                    reason: None,
                };
            }
        }

        if tokio::time::Instant::now() + opts.interval > deadline {
            let reason = format!(
                "endpoint {host}:{port} not ready after {attempts} probes: {}",
                last.summary()
            );
            tracing::warn!(host, port, attempts, "wait_for_models_ready exhausted");
            return WaitReport {
                ok: false,
                attempts,
                last,
                reason: Some(reason),
            };
        }
        tokio::time::sleep(opts.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_matches_contract() {
        assert_eq!(classify_code(200), ProbeStatus::Ready);
        assert_eq!(classify_code(503), ProbeStatus::Loading);
        assert_eq!(classify_code(404), ProbeStatus::Unknown);
        assert_eq!(classify_code(401), ProbeStatus::Unknown);
    }

    #[test]
    fn models_response_parses_ids() {
        let body = r#"{"object":"list","data":[{"id":"qwen2.5-coder-32b","object":"model"}]}"#;
        let parsed: ModelsResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.data.len(), 1);
        assert_eq!(parsed.data[0].id, "qwen2.5-coder-32b");
    }

    #[tokio::test]
    async fn refused_connection_is_down() {
        // Port 9 (discard) is near-universally closed for HTTP.
        let client = reqwest::Client::new();
        let result =
            probe_models_endpoint(&client, "127.0.0.1", 9, Duration::from_millis(800)).await;
        assert_eq!(result.status, ProbeStatus::Down);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn wait_gives_up_within_budget() {
        let client = reqwest::Client::new();
        let opts = WaitOptions {
            timeout: Duration::from_millis(600),
            interval: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(200),
            expected_model_id: None,
        };
        let report = wait_for_models_ready(&client, "127.0.0.1", 9, &opts).await;
        assert!(!report.ok);
        assert!(report.attempts >= 1);
        assert!(report.reason.as_deref().unwrap_or("").contains("not ready"));
    }
}
