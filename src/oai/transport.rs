use crate::error::OaiError;
use async_trait::async_trait;
use reqwest::header::USER_AGENT;
use std::time::Duration;

/// One bounded HTTP GET against an OAI endpoint, returning the body text.
#[async_trait]
pub trait OaiTransport: Send + Sync {
    async fn fetch(
        &self,
        base_url: &str,
        params: &[(String, String)],
        timeout: Duration,
    ) -> Result<String, OaiError>;
}

/// Builds the outbound client, routing through `proxy` when given
/// (`socks5h://` is assumed when no scheme is present).
pub fn build_http_client(proxy: Option<&str>) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();

    if let Some(raw) = proxy {
        let t = raw.trim();
        if !t.is_empty() {
            let url = if t.contains("://") {
                t.to_string()
            } else {
                format!("socks5h://{}", t)
            };
            builder = builder.proxy(reqwest::Proxy::all(&url)?);
        }
    }

    builder.build()
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    user_agent: String,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client, user_agent: impl Into<String>) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
        }
    }
}

#[async_trait]
impl OaiTransport for ReqwestTransport {
    async fn fetch(
        &self,
        base_url: &str,
        params: &[(String, String)],
        timeout: Duration,
    ) -> Result<String, OaiError> {
        let resp = self
            .client
            .get(base_url)
            .query(params)
            .header(USER_AGENT, self.user_agent.as_str())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OaiError::transport(
                        base_url,
                        format!("request timed out after {}s", timeout.as_secs()),
                    )
                } else {
                    OaiError::transport(base_url, e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(OaiError::Transport {
                endpoint: base_url.to_string(),
                status: Some(status.as_u16()),
                detail: format!("HTTP {}", status),
            });
        }

        resp.text()
            .await
            .map_err(|e| OaiError::transport(base_url, format!("failed to read body: {}", e)))
    }
}
