//! One HTTP/1.1 exchange over an already established stream, driven by
//! hyper's connection-level client.

use super::{HttpRequest, HttpResponse, Method, TransportError};
use bytes::Bytes;
use http::header::{ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, HOST};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::Builder;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Headers owned by the connection layer rather than by callers.
const RESERVED: [&str; 4] = ["host", "connection", "content-length", "accept-encoding"];

/// Converts `req` into an origin-form request with `Connection: close` and
/// identity encoding.
pub fn build_request(req: &HttpRequest) -> Result<http::Request<Full<Bytes>>, TransportError> {
    let mut target = req.url.path().to_string();
    if let Some(q) = req.url.query() {
        target.push('?');
        target.push_str(q);
    }
    let host = match (req.url.host_str(), req.url.port()) {
        (Some(h), Some(p)) => format!("{h}:{p}"),
        (Some(h), None) => h.to_string(),
        (None, _) => String::new(),
    };
    let method = match req.method {
        Method::Get => http::Method::GET,
        Method::Post => http::Method::POST,
    };

    let mut builder = http::Request::builder().method(method).uri(target).header(HOST, host);
    for (k, v) in &req.headers {
        if RESERVED.iter().any(|h| k.eq_ignore_ascii_case(h)) {
            continue;
        }
        builder = builder.header(k.as_str(), v.as_str());
    }
    builder = builder.header(ACCEPT_ENCODING, "identity").header(CONNECTION, "close");
    if req.method == Method::Post {
        builder = builder.header(CONTENT_LENGTH, req.body.len());
    }
    builder
        .body(Full::new(Bytes::from(req.body.clone())))
        .map_err(|e| TransportError::InvalidRequest(format!("{}: {e}", req.url)))
}

/// Writes `req` on `stream` and reads the response back.
pub async fn exchange<S>(stream: S, req: &HttpRequest) -> Result<HttpResponse, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let request = build_request(req)?;
    let mut builder = Builder::new();
    builder.title_case_headers(true);
    let (mut sender, conn) = builder.handshake(TokioIo::new(stream)).await?;
    let driver = tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!(%err, "connection closed with error");
        }
    });

    let result = async {
        let resp = sender.send_request(request).await?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();
        let body = resp.into_body().collect().await?.to_bytes().to_vec();
        Ok::<_, TransportError>(HttpResponse { status, headers, body })
    }
    .await;
    driver.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Reads one request head from `server`, answers with `raw` and closes.
    fn answer(mut server: DuplexStream, raw: &'static [u8]) -> tokio::task::JoinHandle<String> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut buf = [0u8; 1024];
            while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = server.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                seen.extend_from_slice(&buf[..n]);
            }
            server.write_all(raw).await.unwrap();
            server.shutdown().await.unwrap();
            String::from_utf8_lossy(&seen).into_owned()
        })
    }

    #[test]
    fn builds_origin_form_request_with_fixed_headers() {
        let req = HttpRequest::get("https://q.10jqka.com.cn/gn/index/page/2/?x=1")
            .unwrap()
            .with_header("Cookie", "v=abc")
            .with_header("Connection", "keep-alive");
        let built = build_request(&req).unwrap();
        assert_eq!(*built.method(), http::Method::GET);
        assert_eq!(built.uri(), "/gn/index/page/2/?x=1");
        let headers = built.headers();
        assert_eq!(headers[HOST], "q.10jqka.com.cn");
        assert_eq!(headers["cookie"], "v=abc");
        assert_eq!(headers[CONNECTION], "close");
        assert_eq!(headers.get_all(CONNECTION).iter().count(), 1);
        assert!(headers.get(CONTENT_LENGTH).is_none());
    }

    #[test]
    fn builds_post_with_port_and_length() {
        let req = HttpRequest::post_form("http://127.0.0.1:9000/login", [("a", "1")]).unwrap();
        let built = build_request(&req).unwrap();
        assert_eq!(built.headers()[HOST], "127.0.0.1:9000");
        assert_eq!(built.headers()[CONTENT_LENGTH], "3");
    }

    #[test]
    fn rejects_unencodable_header_value() {
        let req = HttpRequest::get("https://q.test/").unwrap().with_header("Referer", "a\nb");
        assert!(matches!(build_request(&req), Err(TransportError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn exchanges_content_length_response() {
        let (client, server) = tokio::io::duplex(4096);
        let server = answer(server, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nSet-Cookie: a=1\r\n\r\nhello");
        let req = HttpRequest::get("https://example.com/index?p=1")
            .unwrap()
            .with_header("User-Agent", "ua");
        let resp = exchange(client, &req).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"hello");
        assert_eq!(resp.header("set-cookie"), Some("a=1"));

        let seen = server.await.unwrap();
        assert!(seen.starts_with("GET /index?p=1 HTTP/1.1\r\n"), "{seen}");
        assert!(seen.contains("Host: example.com\r\n"), "{seen}");
        assert!(seen.contains("User-Agent: ua\r\n"), "{seen}");
    }

    #[tokio::test]
    async fn exchanges_chunked_redirect() {
        let (client, server) = tokio::io::duplex(4096);
        let _server = answer(
            server,
            b"HTTP/1.1 302 Found\r\nTransfer-Encoding: chunked\r\nLocation: /login\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
        );
        let resp = exchange(client, &HttpRequest::get("http://example.com/").unwrap()).await.unwrap();
        assert!(resp.is_redirect());
        assert_eq!(resp.header("location"), Some("/login"));
        assert_eq!(resp.body, b"Wikipedia");
    }

    #[tokio::test]
    async fn reads_until_close_without_length() {
        let (client, server) = tokio::io::duplex(4096);
        let _server = answer(server, b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\n1.2.3.4\n");
        let resp = exchange(client, &HttpRequest::get("http://ip.test/").unwrap()).await.unwrap();
        assert_eq!(resp.text().trim(), "1.2.3.4");
    }

    #[tokio::test]
    async fn garbage_reply_is_a_protocol_error() {
        let (client, server) = tokio::io::duplex(4096);
        let _server = answer(server, b"SSH-2.0-OpenSSH\r\n\r\n");
        let err = exchange(client, &HttpRequest::get("http://example.com/").unwrap()).await.unwrap_err();
        assert!(matches!(err, TransportError::Http(_)), "{err:?}");
    }
}
