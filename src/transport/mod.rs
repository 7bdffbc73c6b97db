//! Outbound HTTP transports.
//!
//! - `tunnel`: one fresh CONNECT tunnel through the edge server per request.
//! - `direct`: reqwest, either straight out or through the supervised local proxy.
//! - `http1`: one hyper HTTP/1.1 exchange over a tunnel socket.
//!
//! Redirects are never followed: callers inspect 3xx statuses themselves.

pub mod direct;
pub mod http1;
pub mod tunnel;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub use direct::ReqwestTransport;
pub use tunnel::TunnelTransport;

/// Charset assumed when a response does not declare one.
const DEFAULT_CHARSET: &str = "gbk";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to reach edge server {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tunnel rejected by edge server: {0}")]
    TunnelRejected(String),
    #[error("edge server closed the connection before answering CONNECT")]
    TunnelClosed,
    #[error("TLS handshake with {host} failed: {source}")]
    Handshake {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("TLS setup error: {0}")]
    Tls(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("HTTP protocol error: {0}")]
    Http(#[from] hyper::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

fn parse_url(url: &str) -> Result<Url, TransportError> {
    Url::parse(url).map_err(|e| TransportError::InvalidRequest(format!("{url}: {e}")))
}

impl HttpRequest {
    pub fn get(url: &str) -> Result<Self, TransportError> {
        Ok(Self {
            method: Method::Get,
            url: parse_url(url)?,
            headers: Vec::new(),
            body: Vec::new(),
        })
    }

    pub fn post_form<'a, I>(url: &str, fields: I) -> Result<Self, TransportError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        Self::post_body(url, "application/x-www-form-urlencoded; charset=UTF-8", body.into_bytes())
    }

    pub fn post_body(url: &str, content_type: &str, body: Vec<u8>) -> Result<Self, TransportError> {
        Ok(Self {
            method: Method::Post,
            url: parse_url(url)?,
            headers: vec![("Content-Type".into(), content_type.into())],
            body,
        })
    }

    pub fn with_query<'a, I>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.url.query_pairs_mut().extend_pairs(pairs);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.set_header(name, value);
        self
    }

    /// Replaces any existing header of the same name.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    /// `(name, value)` of every `Set-Cookie` header, attributes stripped.
    pub fn set_cookies(&self) -> impl Iterator<Item = (String, String)> + '_ {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("set-cookie"))
            .filter_map(|(_, v)| {
                let pair = v.split(';').next()?;
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
            })
    }

    /// Body decoded with the declared charset, falling back to GBK.
    pub fn text(&self) -> String {
        let label = self
            .header("content-type")
            .and_then(|ct| {
                ct.split(';')
                    .filter_map(|p| p.trim().strip_prefix("charset="))
                    .next()
                    .map(|c| c.trim_matches('"').to_string())
            })
            .unwrap_or_else(|| DEFAULT_CHARSET.to_string());
        let encoding = encoding_rs::Encoding::for_label(label.as_bytes()).unwrap_or(encoding_rs::GBK);
        let (text, _, _) = encoding.decode(&self.body);
        text.into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.text())
    }
}

/// A way of delivering one request and returning its response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;

    /// Short label for logs.
    fn name(&self) -> &'static str;
}

/// Public egress address as reported by an IP echo endpoint.
pub async fn egress_ip(transport: &dyn Transport, check_url: &str) -> Result<String, TransportError> {
    let resp = transport.send(HttpRequest::get(check_url)?).await?;
    Ok(resp.text().trim().to_string())
}
