//! Host-side client (C9) for the in-container REPL HTTP service, mirroring
//! `session_manager.py`'s `httpx.Client` usage against `/health` and
//! `/exec`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Request body for `POST /exec`.
#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    code: &'a str,
    timeout: u64,
}

/// Response body from `POST /exec`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecResult {
    pub ok: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub error: String,
}

/// Thin HTTP client bound to one session's REPL base URL.
pub struct ReplClient {
    http: reqwest::Client,
    base_url: String,
}

impl ReplClient {
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self { http: reqwest::Client::new(), base_url }
    }

    /// Poll `/health` until it answers 200, up to `attempts` tries spaced by
    /// `interval`. Returns `true` if it became healthy in time.
    pub async fn wait_healthy(&self, attempts: u32, interval: Duration) -> bool {
        for _ in 0..attempts {
            if self.health_once().await {
                return true;
            }
            tokio::time::sleep(interval).await;
        }
        false
    }

    async fn health_once(&self) -> bool {
        self.http
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok_and(|resp| resp.status().is_success())
    }

    /// Execute code in the session's REPL, waiting up to `timeout` plus a
    /// small margin for the HTTP round trip.
    ///
    /// # Errors
    ///
    /// Returns a [`reqwest::Error`] if the request could not be sent or the
    /// REPL returned a non-success status.
    pub async fn exec(&self, code: &str, timeout: Duration) -> reqwest::Result<ExecResult> {
        let resp = self
            .http
            .post(format!("{}/exec", self.base_url))
            .timeout(timeout + Duration::from_secs(5))
            .json(&ExecRequest { code, timeout: timeout.as_secs() })
            .send()
            .await?
            .error_for_status()?;

        resp.json().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_request_serializes_with_timeout_seconds() {
        let req = ExecRequest { code: "print(1)", timeout: 30 };
        let json = serde_json::to_string(&req).expect("serialize");
        assert!(json.contains("\"timeout\":30"));
        assert!(json.contains("print(1)"));
    }
}
