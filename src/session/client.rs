use super::cookies::CookieMap;
use crate::collab::{CollabError, TokenSource};
use crate::transport::{HttpRequest, HttpResponse, Transport, TransportError};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Cookie carrying the rotating per-request token.
pub const TOKEN_COOKIE: &str = "v";

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("session token unavailable: {0}")]
    Token(#[from] CollabError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Sends requests on behalf of the logged-in session: refreshes the token
/// cookie immediately before every request and absorbs `Set-Cookie` replies.
pub struct SiteClient {
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenSource>,
    jar: Mutex<CookieMap>,
    user_agent: String,
}

fn cookie_header(jar: &CookieMap) -> String {
    jar.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl SiteClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenSource>,
        cookies: CookieMap,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            tokens,
            jar: Mutex::new(cookies),
            user_agent: user_agent.into(),
        }
    }

    fn jar(&self) -> MutexGuard<'_, CookieMap> {
        self.jar.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn cookies(&self) -> CookieMap {
        self.jar().clone()
    }

    pub fn replace_cookies(&self, cookies: CookieMap) {
        *self.jar() = cookies;
    }

    pub async fn send(&self, mut request: HttpRequest) -> Result<HttpResponse, RequestError> {
        let token = self.tokens.session_token().await?;
        let header = {
            let mut jar = self.jar();
            jar.insert(TOKEN_COOKIE.to_string(), token);
            cookie_header(&jar)
        };
        if request.header("user-agent").is_none() {
            request.set_header("User-Agent", &self.user_agent);
        }
        request.set_header("Cookie", &header);

        let response = self.transport.send(request).await?;

        let mut jar = self.jar();
        for (name, value) in response.set_cookies() {
            if value.is_empty() {
                jar.remove(&name);
            } else {
                jar.insert(name, value);
            }
        }
        Ok(response)
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse, RequestError> {
        self.send(HttpRequest::get(url)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTokens(AtomicUsize);

    #[async_trait]
    impl TokenSource for CountingTokens {
        async fn session_token(&self) -> Result<String, CollabError> {
            Ok(format!("t{}", self.0.fetch_add(1, Ordering::SeqCst)))
        }
    }

    #[derive(Default)]
    struct EchoTransport {
        seen: Mutex<Vec<HttpRequest>>,
    }

    #[async_trait]
    impl Transport for EchoTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.seen.lock().unwrap().push(request);
            Ok(HttpResponse {
                status: 200,
                headers: vec![
                    ("Set-Cookie".into(), "sess=abc; Path=/".into()),
                    ("Set-Cookie".into(), "old=; Max-Age=0".into()),
                ],
                body: Vec::new(),
            })
        }

        fn name(&self) -> &'static str {
            "echo"
        }
    }

    #[tokio::test]
    async fn every_request_carries_a_fresh_token() {
        let transport = Arc::new(EchoTransport::default());
        let mut jar = CookieMap::new();
        jar.insert("old".into(), "1".into());
        let client = SiteClient::new(transport.clone(), Arc::new(CountingTokens(AtomicUsize::new(0))), jar, "ua");

        client.get("https://q.example.com/a").await.unwrap();
        client.get("https://q.example.com/b").await.unwrap();

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].header("cookie"), Some("old=1; v=t0"));
        assert_eq!(seen[1].header("cookie"), Some("sess=abc; v=t1"));
        assert_eq!(seen[1].header("user-agent"), Some("ua"));

        let cookies = client.cookies();
        assert_eq!(cookies.get("sess").map(String::as_str), Some("abc"));
        assert!(!cookies.contains_key("old"));
    }
}
