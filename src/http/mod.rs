//! HTTP transport: the only layer that touches the network.

pub mod mock;

use crate::config::Config;
use crate::error::{ApiError, Result};
use crate::request::Request;
use crate::types::Payload;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT,
};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use url::Url;

/// Media type selecting the v5 API.
pub const V5_ACCEPT: &str = "application/vnd.twitchtv.v5+json";

/// Executes a single request. Implementations never retry; retry and rate
/// limiting belong to the dispatcher.
pub trait Transport: Send + Sync {
    /// Resolve with the raw response for any HTTP status. Only
    /// connection-level failures (`Network`, `Timeout`) are errors here.
    fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>>;
}

/// Buffered HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl Response {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self::new(status, body.to_string()).with_header("content-type", "application/json")
    }

    /// Invalid header names or values are skipped.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(n, v);
        }
        self
    }

    /// Map a non-success status to `ApiError::Http`.
    pub fn error_for_status(self) -> Result<Self> {
        if self.status.is_success() {
            return Ok(self);
        }
        Err(ApiError::Http {
            status: self.status.as_u16(),
            message: error_message(self.status, &self.body),
        })
    }

    /// Check the status, then decode the body as JSON (empty body -> `null`).
    pub fn into_payload(self) -> Result<Payload> {
        let ok = self.error_for_status()?;
        let body = if ok.body.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&ok.body).map_err(|e| ApiError::Decode(e.to_string()))?
        };
        Ok(Payload {
            status: ok.status.as_u16(),
            body,
        })
    }
}

/// Twitch error bodies look like `{"error":"Not Found","status":404,"message":"..."}`.
pub fn error_message(status: StatusCode, body: &str) -> String {
    let from_json = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .and_then(|m| m.as_str())
                .filter(|m| !m.is_empty())
                .map(str::to_string)
        });
    if let Some(msg) = from_json {
        return msg;
    }
    let text = body.trim();
    if !text.is_empty() {
        return text.to_string();
    }
    status
        .canonical_reason()
        .unwrap_or("unknown status")
        .to_string()
}

pub fn build_client(cfg: &Config) -> Result<Client> {
    let mut default_headers = HeaderMap::new();
    default_headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&cfg.user_agent)
            .map_err(|e| ApiError::Config(format!("invalid user agent: {}", e)))?,
    );
    default_headers.insert(ACCEPT, HeaderValue::from_static(V5_ACCEPT));
    // Credentials are attached per request so callers can override them.
    Client::builder()
        .default_headers(default_headers)
        .timeout(Duration::from_secs(cfg.timeout_secs))
        .use_rustls_tls()
        .build()
        .map_err(|e| ApiError::Config(format!("failed to build HTTP client: {}", e)))
}

/// Percent-encode one path segment (everything but RFC 3986 unreserved).
pub fn encode_path_segment(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

/// Production transport over reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
    client_id: String,
    token: Option<String>,
}

impl ReqwestTransport {
    pub fn new(cfg: &Config) -> Result<Self> {
        Ok(Self {
            client: build_client(cfg)?,
            base_url: cfg.api_url.trim_end_matches('/').to_string(),
            client_id: cfg.client_id.clone(),
            token: cfg.token.clone(),
        })
    }

    pub fn url_for(&self, request: &Request) -> Result<Url> {
        let raw = if request.is_absolute() {
            request.path.clone()
        } else {
            format!("{}/{}", self.base_url, request.path)
        };
        let mut url = Url::parse(&raw)
            .map_err(|e| ApiError::InvalidRequest(format!("bad URL for {}: {}", request.path, e)))?;
        if !request.params.is_empty() {
            url.query_pairs_mut().extend_pairs(request.params.iter());
        }
        Ok(url)
    }

    async fn execute(&self, request: &Request) -> Result<Response> {
        let url = self.url_for(request)?;
        debug!("{} {}", request.method, url);

        let mut req = self.client.request(request.method.clone(), url);
        for (k, v) in &request.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if !request.has_header("Client-ID") {
            req = req.header("Client-ID", self.client_id.as_str());
        }
        if let Some(token) = &self.token {
            if !request.has_header(AUTHORIZATION.as_str()) {
                req = req.header(AUTHORIZATION, format!("OAuth {}", token));
            }
        }
        if let Some(body) = &request.body {
            req = req
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_string());
        }

        let res = req.send().await?;
        let status = res.status();
        let headers = res.headers().clone();
        let body = res.text().await?;
        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

impl Transport for ReqwestTransport {
    fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
        self.execute(request).boxed()
    }
}
