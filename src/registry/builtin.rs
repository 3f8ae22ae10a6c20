//! Built-in handlers.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::WorkHandler;
use crate::error::{Error, Result};
use crate::model::WorkOutcome;

pub const HEARTBEAT: &str = "HEARTBEAT";
pub const HTTP_REQUEST: &str = "HTTP_REQUEST";

/// Always succeeds and echoes its input. Useful for liveness checks of the
/// whole allocate → execute → finish path.
pub struct HeartbeatHandler;

#[async_trait]
impl WorkHandler for HeartbeatHandler {
    async fn run(&self, input: &serde_json::Value) -> Result<WorkOutcome> {
        Ok(WorkOutcome::ok(json!({ "echo": input })))
    }
}

#[derive(Debug, Deserialize)]
struct HttpRequestInput {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<serde_json::Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Performs one HTTP request. Non-2xx responses are reported as failures with
/// the status and body as error detail.
pub struct HttpRequestHandler {
    client: reqwest::Client,
}

impl HttpRequestHandler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpRequestHandler {
    fn default() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl WorkHandler for HttpRequestHandler {
    async fn run(&self, input: &serde_json::Value) -> Result<WorkOutcome> {
        let req: HttpRequestInput = serde_json::from_value(input.clone())
            .map_err(|e| Error::InvalidInput(format!("{HTTP_REQUEST}: {e}")))?;
        let method = reqwest::Method::from_bytes(req.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| Error::InvalidInput(format!("{HTTP_REQUEST}: method: {e}")))?;
        let url = reqwest::Url::parse(&req.url)
            .map_err(|e| Error::InvalidInput(format!("{HTTP_REQUEST}: url: {e}")))?;

        let mut builder = self.client.request(method, url);
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        if let Some(ref body) = req.body {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => return Ok(WorkOutcome::failed(json!({ "message": e.to_string() }))),
        };
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<serde_json::Value>(&text)
            .unwrap_or(serde_json::Value::String(text));

        if status.is_success() {
            Ok(WorkOutcome::ok(json!({ "status": status.as_u16(), "body": body })))
        } else {
            Ok(WorkOutcome::failed(
                json!({ "status": status.as_u16(), "body": body }),
            ))
        }
    }
}
