use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Serialize, Serializer};
use tracing::debug;

use crate::config::DedupScope;
use crate::dedup::RequestDeduplicator;
use crate::identity::{Identity, normalize_path};

/// Deduplicator shared by every merged upstream call
pub type ResponseDeduplicator = RequestDeduplicator<UpstreamResponse, UpstreamError>;

fn serialize_method<S: Serializer>(method: &Method, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(method.as_str())
}

fn serialize_body<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    match std::str::from_utf8(body) {
        Ok(text) => serializer.serialize_str(text),
        Err(_) => serializer.serialize_bytes(body),
    }
}

/// A request to forward upstream.
///
/// Serializable so that it can serve as a guard signature directly.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamRequest {
    #[serde(serialize_with = "serialize_method")]
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub content_type: Option<String>,
    #[serde(serialize_with = "serialize_body")]
    pub body: Bytes,
}

impl UpstreamRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: None,
            content_type: None,
            body: Bytes::new(),
        }
    }

    /// Identity used to merge concurrent requests: method, normalized path
    /// with query, then content type and body when present.
    pub fn identity(&self) -> Result<String> {
        let mut target = normalize_path(&self.path).to_string();
        if let Some(query) = self.query.as_deref().filter(|q| !q.is_empty()) {
            target.push('?');
            target.push_str(query);
        }

        let mut identity = Identity::new(self.method.as_str()).part(target);
        if let Some(content_type) = &self.content_type {
            identity = identity.part(content_type);
        }
        if self.body.is_empty() {
            return Ok(identity.build());
        }
        let body = match std::str::from_utf8(&self.body) {
            Ok(text) => identity.json(text)?,
            Err(_) => identity.json(self.body.as_ref())?,
        };
        Ok(body.build())
    }
}

/// Upstream response, buffered so that merged callers can each get a copy
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Transport or body failure talking to the upstream.
///
/// Cheap to clone, so one failure can be handed to every merged caller.
#[derive(Debug, Clone)]
pub struct UpstreamError(Arc<anyhow::Error>);

impl UpstreamError {
    /// Full chain of causes, one per line
    pub fn chain_message(&self) -> String {
        let chain: Vec<String> = self.0.chain().map(|e| e.to_string()).collect();
        chain.join("\n  caused by: ")
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for UpstreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<anyhow::Error> for UpstreamError {
    fn from(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }
}

/// HTTP client that merges concurrent identical upstream requests
pub struct DedupClient {
    client: reqwest::Client,
    base_url: Url,
    token: Option<SecretString>,
    scope: DedupScope,
    dedup: Arc<ResponseDeduplicator>,
}

impl DedupClient {
    pub fn new(
        base_url: &str,
        token: Option<SecretString>,
        scope: DedupScope,
        dedup: Arc<ResponseDeduplicator>,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid upstream URL: {}", base_url))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            token,
            scope,
            dedup,
        })
    }

    pub fn scope(&self) -> DedupScope {
        self.scope
    }

    pub fn dedup(&self) -> &Arc<ResponseDeduplicator> {
        &self.dedup
    }

    /// Sends `request` upstream, sharing the outcome with any identical
    /// request already in flight when the method is within scope.
    pub async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let builder = self.build(&request)?;
        if !self.scope.merges(&request.method) {
            return fetch(builder).await.map_err(UpstreamError::from);
        }

        let identity = request.identity()?;
        self.dedup
            .execute(identity, move || async move {
                fetch(builder).await.map_err(UpstreamError::from)
            })
            .await
    }

    fn url_for(&self, request: &UpstreamRequest) -> Url {
        let mut url = self.base_url.clone();
        let path = format!(
            "{}/{}",
            self.base_url.path().trim_end_matches('/'),
            request.path.trim_start_matches('/')
        );
        url.set_path(&path);
        url.set_query(request.query.as_deref().filter(|q| !q.is_empty()));
        url
    }

    fn build(&self, request: &UpstreamRequest) -> Result<RequestBuilder> {
        let url = self.url_for(request);
        debug!(method = %request.method, url = %url, "Building upstream request");

        let mut builder = self.client.request(request.method.clone(), url);
        if let Some(content_type) = &request.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        if let Some(token) = &self.token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token.expose_secret()));
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }
        Ok(builder)
    }
}

async fn fetch(builder: RequestBuilder) -> Result<UpstreamResponse> {
    let response = builder.send().await.context("Upstream request failed")?;

    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response
        .bytes()
        .await
        .context("Failed to read upstream response body")?;

    debug!(status, bytes = body.len(), "Upstream responded");
    Ok(UpstreamResponse {
        status,
        content_type,
        body,
    })
}
