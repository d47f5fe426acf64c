//! reqwest-backed [`Transport`].

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{multipart, Url};
use tracing::debug;

use crate::config::GatewayConfig;
use crate::guide::HttpMethod;
use crate::transport::{RequestAuth, RequestBody, Transport, TransportOutcome, TransportRequest};

fn user_agent() -> String {
    format!("sgw/{}", env!("CARGO_PKG_VERSION"))
}

/// Base client builder with harmonized defaults.
pub fn builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .user_agent(user_agent())
        .connect_timeout(Duration::from_secs(5))
        .tcp_keepalive(Duration::from_secs(60))
}

pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("invalid base url {base_url}"))?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("base url {base_url} cannot carry a path"));
        }
        let client = builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self { client, base })
    }

    pub fn from_config(cfg: &GatewayConfig) -> Result<Self> {
        let base_url = cfg
            .base_url
            .as_deref()
            .context("gateway.base_url is not configured")?;
        Self::new(base_url, cfg.request_timeout())
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn build(&self, request: TransportRequest) -> Result<reqwest::RequestBuilder> {
        let url = join_url(&self.base, &request.segments, &request.query)?;
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };
        let mut rb = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/json");
        rb = match request.auth {
            RequestAuth::None => rb,
            RequestAuth::Basic { user, password } => rb.basic_auth(user, Some(password)),
            RequestAuth::Bearer(token) => rb.bearer_auth(token),
        };
        rb = match request.body {
            RequestBody::Empty => rb,
            RequestBody::Form(pairs) => rb.form(&pairs),
            RequestBody::Json(value) => rb.json(&value),
            RequestBody::Multipart {
                field,
                file_name,
                bytes,
            } => rb.multipart(
                multipart::Form::new().part(field, multipart::Part::bytes(bytes).file_name(file_name)),
            ),
        };
        Ok(rb)
    }
}

/// Appends unescaped `segments` to `base`, percent-encoding each one.
pub fn join_url(base: &Url, segments: &[String], query: &[(String, String)]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow!("base url {base} cannot carry a path"))?
        .pop_if_empty()
        .extend(segments);
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> TransportOutcome {
        let method = request.method.as_str();
        let path = request.path();
        let rb = match self.build(request) {
            Ok(rb) => rb,
            Err(err) => {
                return TransportOutcome::NoContact {
                    error: format!("{err:#}"),
                }
            }
        };
        let started = Instant::now();
        let response = match rb.send().await {
            Ok(resp) => resp,
            Err(err) => {
                debug!(
                    target: "sgw.wire",
                    method,
                    path = %path,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %err,
                    "no contact"
                );
                return TransportOutcome::NoContact {
                    error: err.to_string(),
                };
            }
        };
        let status = response.status().as_u16();
        match response.bytes().await {
            Ok(body) => {
                debug!(
                    target: "sgw.wire",
                    method,
                    path = %path,
                    status,
                    bytes = body.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "delivered"
                );
                TransportOutcome::Delivered {
                    status,
                    body: body.to_vec(),
                }
            }
            Err(err) => {
                debug!(target: "sgw.wire", method, path = %path, status, error = %err, "body lost");
                TransportOutcome::NoContact {
                    error: err.to_string(),
                }
            }
        }
    }
}
