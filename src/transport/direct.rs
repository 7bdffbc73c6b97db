use super::{HttpRequest, HttpResponse, Method, Transport, TransportError};
use async_trait::async_trait;
use std::time::Duration;

/// reqwest-backed transport, either direct or through the local forwarding proxy.
/// Certificates are verified as usual on this path.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    label: &'static str,
}

impl ReqwestTransport {
    pub fn direct(timeout: Duration) -> Result<Self, TransportError> {
        let client = Self::builder(timeout).build()?;
        Ok(Self { client, label: "direct" })
    }

    /// Routes every request through the proxy listening on `127.0.0.1:port`.
    pub fn via_local_proxy(port: u16, timeout: Duration) -> Result<Self, TransportError> {
        let proxy = reqwest::Proxy::all(format!("http://127.0.0.1:{port}"))?;
        let client = Self::builder(timeout).proxy(proxy).build()?;
        Ok(Self { client, label: "proxy" })
    }

    fn builder(timeout: Duration) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .connect_timeout(timeout)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };
        let mut builder = self.client.request(method, request.url);
        for (k, v) in &request.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();
        let body = resp.bytes().await?.to_vec();
        Ok(HttpResponse { status, headers, body })
    }

    fn name(&self) -> &'static str {
        self.label
    }
}
