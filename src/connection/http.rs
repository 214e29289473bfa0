//! HTTP connection: POST the conversation, decode the streamed body.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{until_cancelled, Connection};
use crate::config::TurnstileConfig;
use crate::error::{Result, TurnstileError};
use crate::parser::{self, ChunkStream, WireFormat};
use crate::types::Message;

#[derive(Serialize)]
struct ConnectBody<'a> {
    messages: Vec<&'a Message>,
    data: Option<&'a Value>,
}

static SHARED_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

fn shared_client() -> &'static reqwest::Client {
    SHARED_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_default()
    })
}

/// Streams chunks from an HTTP endpoint.
///
/// The request body is `{"messages": [...], "data": ...}`; the response body
/// is decoded as SSE or NDJSON according to the configured wire format.
#[derive(Debug, Clone)]
pub struct HttpConnection {
    url: String,
    headers: HeaderMap,
    format: WireFormat,
    client: Option<reqwest::Client>,
}

impl HttpConnection {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HeaderMap::new(),
            format: WireFormat::default(),
            client: None,
        }
    }

    /// Build from the configured endpoint, headers and wire format.
    pub fn from_config(config: &TurnstileConfig) -> Result<Self> {
        let url = config.api_url.clone().ok_or_else(|| {
            TurnstileError::Configuration("api_url is not configured".to_string())
        })?;
        Self::new(url)
            .with_format(config.wire_format)
            .with_headers(&config.headers)
    }

    pub fn with_format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TurnstileError::Configuration(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TurnstileError::Configuration(format!("invalid header value: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn with_headers(self, headers: &HashMap<String, String>) -> Result<Self> {
        headers
            .iter()
            .try_fold(self, |conn, (name, value)| conn.with_header(name, value))
    }

    /// Use a specific client instead of the shared one.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    fn client(&self) -> &reqwest::Client {
        self.client.as_ref().unwrap_or_else(|| shared_client())
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn connect(
        &self,
        messages: &[Arc<Message>],
        data: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<ChunkStream> {
        let body = ConnectBody {
            messages: messages.iter().map(Arc::as_ref).collect(),
            data: data.as_ref(),
        };
        tracing::debug!(url = %self.url, messages = messages.len(), format = %self.format, "connecting");

        let send = self
            .client()
            .post(&self.url)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, accept_for(self.format))
            .json(&body)
            .send();

        let resp = tokio::select! {
            _ = cancel.cancelled() => return Ok(futures::stream::empty().boxed()),
            resp = send => resp?,
        };

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(TurnstileError::Api { status, message });
        }

        let stream = parser::decode(self.format, resp.bytes_stream());
        Ok(until_cancelled(stream, cancel))
    }
}

fn accept_for(format: WireFormat) -> &'static str {
    match format {
        WireFormat::Sse => "text/event-stream",
        WireFormat::Ndjson => "application/x-ndjson",
    }
}
