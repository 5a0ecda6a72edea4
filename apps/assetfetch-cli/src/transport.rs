use anyhow::{Context, Result};
use assetfetch_core::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

/// [`HttpTransport`] over a shared reqwest client. Request headers (including
/// `Range`) are sent as given; the per-request timeout is applied here as
/// well as by the dispatcher.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("assetfetch/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.get(&request.url).timeout(request.timeout);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        let response = builder.send().await.map_err(map_error)?;
        let status = response.status();
        let reason = status.canonical_reason().unwrap_or_default().to_string();
        let body = response.bytes().await.map_err(map_error)?;
        debug!(
            target: "assetfetch::http",
            url = %request.url,
            status = status.as_u16(),
            bytes = body.len(),
            "response"
        );
        Ok(HttpResponse {
            status: status.as_u16(),
            reason,
            body,
        })
    }
}

fn map_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}
