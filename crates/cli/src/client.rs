//! Daemon HTTP client

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tenantmux_common::{ActionResponse, Instance, OperationOutcome};

pub const ADMIN_TOKEN_HEADER: &str = "x-tenantmux-admin-token";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot reach daemon at {addr}: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{reason} ({status})")]
    Rejected { status: StatusCode, reason: String },

    #[error("unexpected response: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Client for the daemon's operator API
#[derive(Clone)]
pub struct DaemonClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl DaemonClient {
    pub fn new(addr: &str, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: addr.trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn addr(&self) -> &str {
        &self.base
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self.http.request(method, format!("{}{}", self.base, path));
        match &self.token {
            Some(token) => req.header(ADMIN_TOKEN_HEADER, token),
            None => req,
        }
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = req.send().await.map_err(|source| {
            if source.is_connect() || source.is_timeout() {
                ClientError::Unreachable {
                    addr: self.base.clone(),
                    source,
                }
            } else {
                ClientError::Http(source)
            }
        })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }

        let body = resp.text().await.unwrap_or_default();
        let reason = rejection_reason(status, &body);
        Err(ClientError::Rejected { status, reason })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.request(Method::GET, path)).await
    }

    async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        self.send(self.request(Method::POST, path).json(body)).await
    }

    /// Check if the daemon is healthy
    pub async fn health(&self) -> Result<Value> {
        self.get("/api/health").await
    }

    // Instance operations

    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        self.get("/api/instances").await
    }

    pub async fn get_instance(&self, tenant: &str) -> Result<Instance> {
        self.get(&format!("/api/instances/{}", tenant)).await
    }

    pub async fn create_instance(
        &self,
        tenant: &str,
        app_dir: Option<&str>,
    ) -> Result<ActionResponse> {
        self.post(
            "/api/instances",
            &json!({ "tenant_id": tenant, "app_dir": app_dir }),
        )
        .await
    }

    pub async fn delete_instance(&self, tenant: &str) -> Result<ActionResponse> {
        self.send(self.request(Method::DELETE, &format!("/api/instances/{}", tenant)))
            .await
    }

    /// Run a lifecycle action: start, stop, restart, kill or install
    pub async fn instance_action(
        &self,
        tenant: &str,
        action: &str,
        wait: bool,
    ) -> Result<ActionResponse> {
        let mut path = format!("/api/instances/{}/{}", tenant, action);
        if wait {
            path.push_str("?wait=true");
        }
        self.send(self.request(Method::POST, &path)).await
    }

    pub async fn logs(&self, tenant: &str, lines: usize) -> Result<Vec<String>> {
        let body: Value = self
            .get(&format!("/api/instances/{}/logs?lines={}", tenant, lines))
            .await?;
        log_lines(body)
    }

    pub async fn diagnostics(&self, tenant: &str) -> Result<Value> {
        self.get(&format!("/api/instances/{}/diagnostics", tenant))
            .await
    }

    pub async fn port_owner(&self, port: u16) -> Result<Value> {
        self.get(&format!("/api/ports/{}", port)).await
    }

    pub async fn drift(&self) -> Result<Vec<Value>> {
        self.get("/api/drift").await
    }

    // Proxy operations

    pub async fn proxy_status(&self) -> Result<Value> {
        self.get("/api/proxy").await
    }

    pub async fn proxy_validate(&self) -> Result<Value> {
        self.get("/api/proxy/validate").await
    }

    pub async fn proxy_regenerate(&self) -> Result<ActionResponse> {
        self.send(self.request(Method::POST, "/api/proxy/regenerate"))
            .await
    }

    pub async fn proxy_repair(&self, dry_run: bool) -> Result<Value> {
        self.post("/api/proxy/repair", &json!({ "dry_run": dry_run }))
            .await
    }

    // Settings

    pub async fn branding(&self) -> Result<Option<String>> {
        let body: Value = self.get("/api/settings/branding").await?;
        Ok(body["site_title"].as_str().map(String::from))
    }

    pub async fn set_branding(&self, title: Option<&str>) -> Result<ActionResponse> {
        self.send(
            self.request(Method::PUT, "/api/settings/branding")
                .json(&json!({ "site_title": title })),
        )
        .await
    }
}

/// `lines` of a log response; a missing or mistyped field is an error
fn log_lines(mut body: Value) -> Result<Vec<String>> {
    let lines = body.get_mut("lines").map(Value::take).unwrap_or(Value::Null);
    Ok(serde_json::from_value(lines)?)
}

/// Human-readable reason from an error response body
fn rejection_reason(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<ActionResponse>(body) {
        Ok(ActionResponse { outcome, .. }) => match outcome {
            OperationOutcome::Rejected { reason, .. } => reason,
            OperationOutcome::RolledBack { reason } => format!("rolled back: {}", reason),
            OperationOutcome::Applied { detail } => detail,
        },
        Err(_) if body.is_empty() => status.to_string(),
        Err(_) => body.to_string(),
    }
}
