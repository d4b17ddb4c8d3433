//! Outbound request execution for handlers that call a third-party API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::context::RenderContext;
use crate::error::{EngineError, Result};
use crate::models::db::{HttpMethod, Param, RequestSpec};
use crate::template::Renderer;

/// Status reported to templates when the upstream call could not complete.
pub const UPSTREAM_FAILURE_STATUS: u16 = 599;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedResponse {
    pub status: u16,
    pub data: Value,
}

impl NormalizedResponse {
    pub fn failure() -> Self {
        Self {
            status: UPSTREAM_FAILURE_STATUS,
            data: Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The `response` template section. A null body is left out so loops over
    /// `response.data` see an undefined value.
    pub fn to_context_value(&self) -> Value {
        if self.data.is_null() {
            json!({ "status": self.status })
        } else {
            json!({ "status": self.status, "data": self.data })
        }
    }
}

/// A fully rendered request, ready to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: &ResolvedRequest) -> Result<NormalizedResponse>;
}

pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::config(format!("http client: {e}")))?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: &ResolvedRequest) -> Result<NormalizedResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| EngineError::Upstream(e.to_string()))?;
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| EngineError::Upstream(format!("invalid url {}: {e}", request.url)))?;

        let mut builder = self.client.request(method, url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        let has_content_type = request
            .headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("content-type"));
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            if !has_content_type {
                builder = builder.header("Content-Type", "application/json");
            }
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| EngineError::Upstream(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| EngineError::Upstream(e.to_string()))?;

        let data = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(NormalizedResponse { status, data })
    }
}

pub struct RequestExecutor<'a> {
    renderer: &'a Renderer,
    client: &'a dyn HttpClient,
}

impl<'a> RequestExecutor<'a> {
    pub fn new(renderer: &'a Renderer, client: &'a dyn HttpClient) -> Self {
        Self { renderer, client }
    }

    /// Renders every template of the request spec against `ctx`.
    pub fn resolve(&self, spec: &RequestSpec, ctx: &RenderContext) -> Result<ResolvedRequest> {
        let url = self.renderer.render(&spec.url_template, ctx)?;
        let query = self.render_params(&spec.url_parameters, ctx)?;
        let headers = self.render_params(&spec.header_parameters, ctx)?;
        let body = match &spec.data {
            Some(data) if !data.trim().is_empty() => Some(self.renderer.render(data, ctx)?),
            _ => None,
        };
        Ok(ResolvedRequest {
            method: spec.method,
            url: url.trim().to_string(),
            query,
            headers,
            body,
        })
    }

    fn render_params(&self, params: &[Param], ctx: &RenderContext) -> Result<Vec<(String, String)>> {
        let mut out = Vec::with_capacity(params.len());
        for p in params {
            out.push((p.key.clone(), self.renderer.render(&p.value_template, ctx)?));
        }
        Ok(out)
    }

    /// Resolves and sends the request. Render errors propagate; transport
    /// failures become a response with [`UPSTREAM_FAILURE_STATUS`].
    pub async fn execute(&self, spec: &RequestSpec, ctx: &RenderContext) -> Result<NormalizedResponse> {
        let resolved = self.resolve(spec, ctx)?;
        debug!(method = resolved.method.as_str(), url = resolved.url, "Executing handler request");
        match self.client.send(&resolved).await {
            Ok(response) => {
                debug!(url = resolved.url, status = response.status, "Handler request completed");
                Ok(response)
            }
            Err(e) => {
                warn!(url = resolved.url, error = %e, "Handler request failed");
                Ok(NormalizedResponse::failure())
            }
        }
    }
}
