//! Password login with device registration and slide-captcha verification.
//!
//! Every request goes through [`SiteClient`], so each carries a fresh token
//! and every cookie the site hands out along the way ends up in the jar. The
//! jar after a successful login is the new session.

use super::client::{RequestError, SiteClient};
use super::cookies::CookieMap;
use super::Reauthenticator;
use crate::collab::{CaptchaSolver, CollabError, CredentialCipher, LoginParams};
use crate::config::Site;
use crate::transport::{HttpRequest, HttpResponse};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const FORM: &str = "application/x-www-form-urlencoded; charset=UTF-8";
const RSA_VERSION: &str = "default_4";
const NONCE_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const NONCE_LEN: usize = 16;

// Scale of the slide answer relative to the served background image.
const X_SCALE: f64 = 0.908;
const Y_SCALE: f64 = 0.9323 - 1e-9;
const CAPTCHA_WIDTH: u32 = 309;
const CAPTCHA_HEIGHT: f64 = 177.22058823529412;

pub const DEFAULT_CAPTCHA_ATTEMPTS: u32 = 10;

#[derive(Debug, Error)]
pub enum LoginError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Collab(#[from] CollabError),
    #[error("unexpected {step} response: {detail}")]
    Protocol { step: &'static str, detail: String },
    #[error("captcha not solved after {0} attempts")]
    Captcha(u32),
    #[error("login rejected (errorcode {code}): {message}")]
    Rejected { code: i64, message: String },
}

impl From<crate::transport::TransportError> for LoginError {
    fn from(err: crate::transport::TransportError) -> Self {
        LoginError::Request(err.into())
    }
}

#[derive(Debug, Clone)]
pub struct LoginEndpoints {
    pub hawkeye_url: String,
    pub upass_base: String,
    pub captcha_base: String,
}

impl LoginEndpoints {
    pub fn from_site(site: &Site) -> Self {
        Self {
            hawkeye_url: site.hawkeye_url.clone(),
            upass_base: site.upass_base.trim_end_matches('/').to_string(),
            captcha_base: site.captcha_base.trim_end_matches('/').to_string(),
        }
    }

    fn upass(&self, path: &str) -> String {
        format!("{}/{}", self.upass_base, path)
    }

    fn captcha(&self, path: &str) -> String {
        format!("{}/{}", self.captcha_base, path)
    }
}

#[derive(Deserialize)]
struct HawkeyeReply {
    data: HawkeyeData,
}

#[derive(Deserialize)]
struct HawkeyeData {
    pass_code: String,
    device_code: String,
    expires_time: serde_json::Value,
}

#[derive(Deserialize)]
struct LoginReply {
    errorcode: serde_json::Value,
    #[serde(default)]
    errormsg: Option<String>,
}

impl LoginReply {
    fn code(&self) -> i64 {
        match &self.errorcode {
            serde_json::Value::Number(n) => n.as_i64().unwrap_or(-1),
            serde_json::Value::String(s) => s.trim().parse().unwrap_or(-1),
            _ => -1,
        }
    }
}

#[derive(Deserialize)]
struct PreHandle {
    data: PreHandleData,
}

#[derive(Deserialize)]
struct PreHandleData {
    #[serde(rename = "urlParams")]
    url_params: String,
    imgs: Vec<String>,
    sign: String,
}

#[derive(Deserialize)]
struct TicketReply {
    #[serde(default)]
    ticket: Option<String>,
}

/// Solved captcha material attached to the second login submission.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptchaProof {
    pub phrase: String,
    pub ticket: String,
    pub signature: String,
}

struct SignedCredentials {
    uname: String,
    passwd: String,
    salt: String,
    dsk: String,
    crnd: String,
}

/// Verification phrase for a slide displacement: the truncated x offset and
/// the y offset scaled to the page's rendering, then the rendered size.
pub fn slide_phrase(x: f64, y: f64) -> String {
    format!(
        "{};{};{};{}",
        x.trunc() * X_SCALE,
        y * Y_SCALE,
        CAPTCHA_WIDTH,
        CAPTCHA_HEIGHT
    )
}

/// Payload of a JSONP reply `callback(...)`.
pub fn strip_jsonp<'a>(text: &'a str, callback: &str) -> Option<&'a str> {
    text.trim()
        .strip_prefix(callback)?
        .trim_start()
        .strip_prefix('(')?
        .trim_end()
        .trim_end_matches(';')
        .strip_suffix(')')
}

fn client_nonce() -> String {
    let mut rng = rand::thread_rng();
    (0..NONCE_LEN)
        .map(|_| NONCE_ALPHABET[rng.gen_range(0..NONCE_ALPHABET.len())] as char)
        .collect()
}

fn parse_json<T: DeserializeOwned>(step: &'static str, resp: &HttpResponse) -> Result<T, LoginError> {
    resp.json().map_err(|e| LoginError::Protocol {
        step,
        detail: format!("status {}: {}", resp.status, e),
    })
}

fn parse_jsonp<T: DeserializeOwned>(step: &'static str, resp: &HttpResponse, callback: &str) -> Result<T, LoginError> {
    let text = resp.text();
    let payload = strip_jsonp(&text, callback).ok_or_else(|| LoginError::Protocol {
        step,
        detail: format!("missing {callback}(...) wrapper"),
    })?;
    serde_json::from_str(payload).map_err(|e| LoginError::Protocol { step, detail: e.to_string() })
}

pub struct PasswordLogin {
    username: String,
    password: String,
    cipher: Arc<dyn CredentialCipher>,
    captcha: Arc<dyn CaptchaSolver>,
    endpoints: LoginEndpoints,
    captcha_attempts: u32,
}

impl PasswordLogin {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        cipher: Arc<dyn CredentialCipher>,
        captcha: Arc<dyn CaptchaSolver>,
        endpoints: LoginEndpoints,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            cipher,
            captcha,
            endpoints,
            captcha_attempts: DEFAULT_CAPTCHA_ATTEMPTS,
        }
    }

    pub fn with_captcha_attempts(mut self, attempts: u32) -> Self {
        self.captcha_attempts = attempts.max(1);
        self
    }

    /// Registers a device fingerprint and stores the issued device cookie.
    async fn register_device(&self, client: &SiteClient) -> Result<(), LoginError> {
        let fingerprint = self.cipher.device_fingerprint().await?;
        let body = format!(
            "pass_code=&user_id=null&source_type=web&collections={fingerprint}&protocol=fingerprint_1"
        );
        let resp = client
            .send(HttpRequest::post_body(&self.endpoints.hawkeye_url, FORM, body.into_bytes())?)
            .await?;
        let reply: HawkeyeReply = parse_json("hawkeye", &resp)?;
        let expires = match &reply.data.expires_time {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        client
            .send(HttpRequest::post_form(
                &self.endpoints.upass("common/setDeviceCookie"),
                [
                    ("u_dpass", reply.data.pass_code.as_str()),
                    ("u_did", reply.data.device_code.as_str()),
                    ("u_uver", "1.0.0"),
                    ("expires_time", expires.as_str()),
                ],
            )?)
            .await?;
        Ok(())
    }

    async fn sign_credentials(&self, client: &SiteClient) -> Result<SignedCredentials, LoginError> {
        let crnd = client_nonce();
        let uname = self.cipher.encrypt(self.username.as_bytes()).await?;
        let resp = client
            .send(HttpRequest::post_form(
                &self.endpoints.upass("user/getGS"),
                [("uname", uname.as_str()), ("rsa_version", RSA_VERSION), ("crnd", crnd.as_str())],
            )?)
            .await?;
        let params: LoginParams = parse_json("getGS", &resp)?;

        let password = self.password.as_bytes();
        Ok(SignedCredentials {
            passwd: self.cipher.encrypt_password(password).await?,
            salt: self.cipher.derive_login_salt(&params, &crnd, password).await?,
            uname,
            dsk: params.dsk,
            crnd,
        })
    }

    async fn submit(
        &self,
        client: &SiteClient,
        creds: &SignedCredentials,
        proof: Option<&CaptchaProof>,
    ) -> Result<LoginReply, LoginError> {
        let timestamp = Utc::now().timestamp().to_string();
        let mut form: Vec<(&str, &str)> = vec![
            ("uname", creds.uname.as_str()),
            ("passwd", creds.passwd.as_str()),
            ("saltLoginTimes", "1"),
            ("longLogin", "on"),
            ("rsa_version", RSA_VERSION),
            ("source", "pc_web"),
            ("request_type", "login"),
            ("captcha_type", "4"),
        ];
        if let Some(proof) = proof {
            form.push(("captcha_phrase", proof.phrase.as_str()));
            form.push(("captcha_ticket", proof.ticket.as_str()));
            form.push(("captcha_signature", proof.signature.as_str()));
        }
        form.extend([
            ("upwd_score", "55"),
            ("ignore_upwd_score", ""),
            ("passwdSalt", creds.salt.as_str()),
            ("dsk", creds.dsk.as_str()),
            ("crnd", creds.crnd.as_str()),
            ("ttype", "WEB"),
            ("sdtis", "C22"),
            ("timestamp", timestamp.as_str()),
        ]);

        let resp = client
            .send(HttpRequest::post_form(&self.endpoints.upass("login/dologinreturnjson2"), form)?)
            .await?;
        parse_json("login", &resp)
    }

    async fn try_captcha(&self, client: &SiteClient) -> Result<Option<CaptchaProof>, LoginError> {
        let random = (Utc::now().timestamp_millis() as f64 / 500.0).to_string();
        let resp = client
            .send(HttpRequest::get(&self.endpoints.captcha("getPreHandle"))?.with_query([
                ("captcha_type", "4"),
                ("appid", "registernew"),
                ("random", random.as_str()),
                ("callback", "PreHandle"),
            ]))
            .await?;
        let pre: PreHandle = parse_jsonp("getPreHandle", &resp, "PreHandle")?;
        let [background_key, target_key, ..] = pre.data.imgs.as_slice() else {
            return Err(LoginError::Protocol {
                step: "getPreHandle",
                detail: format!("expected two images, got {}", pre.data.imgs.len()),
            });
        };

        let image_url = self.endpoints.captcha(&format!("getImg?{}", pre.data.url_params));
        let background = client
            .send(HttpRequest::get(&image_url)?.with_query([("iuk", background_key.as_str())]))
            .await?
            .body;
        let target = client
            .send(HttpRequest::get(&image_url)?.with_query([("iuk", target_key.as_str())]))
            .await?
            .body;

        let (x, y) = self.captcha.solve_slide(&target, &background).await?;
        let phrase = slide_phrase(x, y);

        let ticket_url = self.endpoints.captcha(&format!("getTicket?{}", pre.data.url_params));
        let resp = client
            .send(HttpRequest::get(&ticket_url)?.with_query([("phrase", phrase.as_str()), ("callback", "verify")]))
            .await?;
        let reply: TicketReply = parse_jsonp("getTicket", &resp, "verify")?;

        Ok(reply.ticket.filter(|t| !t.is_empty()).map(|ticket| CaptchaProof {
            phrase,
            ticket,
            signature: pre.data.sign,
        }))
    }

    async fn solve_captcha(&self, client: &SiteClient) -> Result<CaptchaProof, LoginError> {
        let max = self.captcha_attempts;
        for attempt in 1..=max {
            match self.try_captcha(client).await {
                Ok(Some(proof)) => return Ok(proof),
                Ok(None) => warn!(attempt, max, "captcha answer rejected; retrying"),
                Err(err) => warn!(%err, attempt, max, "captcha attempt failed; retrying"),
            }
        }
        Err(LoginError::Captcha(max))
    }
}

#[async_trait]
impl Reauthenticator for PasswordLogin {
    async fn login(&self, client: &SiteClient) -> Result<CookieMap, LoginError> {
        self.register_device(client).await?;
        let creds = self.sign_credentials(client).await?;

        let first = self.submit(client, &creds, None).await?;
        if first.code() == 0 {
            info!("login accepted");
            return Ok(client.cookies());
        }
        debug!(errorcode = first.code(), "login needs captcha verification");

        let proof = self.solve_captcha(client).await?;
        let second = self.submit(client, &creds, Some(&proof)).await?;
        match second.code() {
            0 => {
                info!("login accepted after captcha");
                Ok(client.cookies())
            }
            code => Err(LoginError::Rejected {
                code,
                message: second.errormsg.unwrap_or_default(),
            }),
        }
    }
}
