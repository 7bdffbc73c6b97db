//! Narrow interfaces to the site-specific black boxes: the session-token
//! script, the credential crypto routines and the slide-captcha solver.
//!
//! The production implementations run a helper process per call. The
//! operation name is appended to the configured command line, the input is
//! written to stdin as JSON and the trimmed stdout is the result.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("helper command is empty")]
    EmptyCommand,
    #[error("failed to run helper {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("helper {program} {op} exited with {status}: {stderr}")]
    Failed {
        program: String,
        op: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("helper {op} timed out after {timeout:?}")]
    Timeout { op: String, timeout: Duration },
    #[error("helper {op} returned unusable output: {detail}")]
    BadOutput { op: String, detail: String },
}

/// Server-issued parameters of the salted password login.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginParams {
    pub dsk: String,
    pub ssv: String,
    pub dsv: String,
}

/// Produces the short-lived `v` token the site expects on every request.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn session_token(&self) -> Result<String, CollabError>;
}

/// Deterministic credential transforms used by the login handshake.
#[async_trait]
pub trait CredentialCipher: Send + Sync {
    /// Encrypted device description submitted for a device cookie.
    async fn device_fingerprint(&self) -> Result<String, CollabError>;
    async fn encrypt(&self, plain: &[u8]) -> Result<String, CollabError>;
    /// Encrypted digest of the password as the login form expects it.
    async fn encrypt_password(&self, password: &[u8]) -> Result<String, CollabError>;
    async fn derive_login_salt(
        &self,
        params: &LoginParams,
        client_nonce: &str,
        password: &[u8],
    ) -> Result<String, CollabError>;
}

#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    /// Displacement `(x, y)` of the slider piece over the background.
    async fn solve_slide(&self, target: &[u8], background: &[u8]) -> Result<(f64, f64), CollabError>;
}

/// An external helper invoked once per operation.
#[derive(Debug, Clone)]
pub struct HelperCommand {
    argv: Vec<String>,
    timeout: Duration,
}

impl HelperCommand {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Result<Self, CollabError> {
        if argv.first().map_or(true, |p| p.trim().is_empty()) {
            return Err(CollabError::EmptyCommand);
        }
        Ok(Self { argv, timeout })
    }

    fn program(&self) -> &str {
        &self.argv[0]
    }

    pub async fn invoke(&self, op: &str, input: &serde_json::Value) -> Result<String, CollabError> {
        let program = self.program().to_string();
        let mut child = Command::new(&program)
            .args(&self.argv[1..])
            .arg(op)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CollabError::Spawn { program: program.clone(), source })?;

        // A timeout drops `child`, which kills it.
        let stdin = child.stdin.take();
        let payload = input.to_string();
        let exchange = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(payload.as_bytes()).await?;
                // dropping stdin sends EOF
            }
            child.wait_with_output().await
        };
        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| CollabError::Timeout { op: op.to_string(), timeout: self.timeout })?
            .map_err(|source| CollabError::Spawn { program: program.clone(), source })?;

        if !output.status.success() {
            return Err(CollabError::Failed {
                program,
                op: op.to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let out = String::from_utf8(output.stdout).map_err(|e| CollabError::BadOutput {
            op: op.to_string(),
            detail: e.to_string(),
        })?;
        Ok(out.trim().to_string())
    }
}

fn non_empty(op: &str, out: String) -> Result<String, CollabError> {
    if out.is_empty() {
        return Err(CollabError::BadOutput { op: op.to_string(), detail: "empty output".into() });
    }
    Ok(out)
}

/// Token script behind a helper process (`<cmd> token`).
#[derive(Debug, Clone)]
pub struct CommandTokenSource(pub HelperCommand);

#[async_trait]
impl TokenSource for CommandTokenSource {
    async fn session_token(&self) -> Result<String, CollabError> {
        non_empty("token", self.0.invoke("token", &json!({})).await?)
    }
}

/// Credential crypto behind a helper process. Byte inputs travel base64-encoded.
#[derive(Debug, Clone)]
pub struct CommandCipher(pub HelperCommand);

#[async_trait]
impl CredentialCipher for CommandCipher {
    async fn device_fingerprint(&self) -> Result<String, CollabError> {
        non_empty("fingerprint", self.0.invoke("fingerprint", &json!({})).await?)
    }

    async fn encrypt(&self, plain: &[u8]) -> Result<String, CollabError> {
        let input = json!({ "data": BASE64.encode(plain) });
        non_empty("encrypt", self.0.invoke("encrypt", &input).await?)
    }

    async fn encrypt_password(&self, password: &[u8]) -> Result<String, CollabError> {
        let input = json!({ "data": BASE64.encode(password) });
        non_empty("encrypt-password", self.0.invoke("encrypt-password", &input).await?)
    }

    async fn derive_login_salt(
        &self,
        params: &LoginParams,
        client_nonce: &str,
        password: &[u8],
    ) -> Result<String, CollabError> {
        let input = json!({
            "dsk": params.dsk,
            "ssv": params.ssv,
            "dsv": params.dsv,
            "crnd": client_nonce,
            "password": BASE64.encode(password),
        });
        non_empty("salt", self.0.invoke("salt", &input).await?)
    }
}

#[derive(Debug, Deserialize)]
struct SlideOutput {
    x: f64,
    y: f64,
}

/// Slide recognizer behind a helper process. Prints `{"x": .., "y": ..}`.
#[derive(Debug, Clone)]
pub struct CommandCaptchaSolver(pub HelperCommand);

#[async_trait]
impl CaptchaSolver for CommandCaptchaSolver {
    async fn solve_slide(&self, target: &[u8], background: &[u8]) -> Result<(f64, f64), CollabError> {
        let input = json!({
            "target": BASE64.encode(target),
            "background": BASE64.encode(background),
        });
        let out = self.0.invoke("slide", &input).await?;
        let parsed: SlideOutput = serde_json::from_str(&out).map_err(|e| CollabError::BadOutput {
            op: "slide".into(),
            detail: e.to_string(),
        })?;
        Ok((parsed.x, parsed.y))
    }
}

/// The three collaborators bundled for the session layer.
#[derive(Clone)]
pub struct Collaborators {
    pub tokens: Arc<dyn TokenSource>,
    pub cipher: Arc<dyn CredentialCipher>,
    pub captcha: Arc<dyn CaptchaSolver>,
}

impl Collaborators {
    pub fn from_config(cfg: &crate::config::Helpers) -> Result<Self, CollabError> {
        let timeout = Duration::from_secs(cfg.timeout_seconds.max(1));
        Ok(Self {
            tokens: Arc::new(CommandTokenSource(HelperCommand::new(cfg.token.clone(), timeout)?)),
            cipher: Arc::new(CommandCipher(HelperCommand::new(cfg.crypto.clone(), timeout)?)),
            captcha: Arc::new(CommandCaptchaSolver(HelperCommand::new(cfg.captcha.clone(), timeout)?)),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> HelperCommand {
        HelperCommand::new(
            vec!["sh".into(), "-c".into(), script.into(), "helper".into()],
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn token_is_trimmed_stdout() {
        let tokens = CommandTokenSource(sh("cat >/dev/null; echo \"  A1b2C3  \""));
        assert_eq!(tokens.session_token().await.unwrap(), "A1b2C3");
    }

    #[tokio::test]
    async fn operation_name_is_last_argument() {
        // $1 is the appended operation name
        let helper = sh("cat >/dev/null; echo \"op=$1\"");
        assert_eq!(helper.invoke("salt", &json!({})).await.unwrap(), "op=salt");
    }

    #[tokio::test]
    async fn stdin_carries_json_input() {
        let helper = sh("cat");
        let out = helper.invoke("encrypt", &json!({ "data": "aGk=" })).await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["data"], "aGk=");
    }

    #[tokio::test]
    async fn slide_output_is_parsed() {
        let solver = CommandCaptchaSolver(sh("cat >/dev/null; echo '{\"x\": 123.6, \"y\": 40}'"));
        assert_eq!(solver.solve_slide(b"t", b"b").await.unwrap(), (123.6, 40.0));
    }

    #[tokio::test]
    async fn failures_are_reported() {
        let helper = sh("cat >/dev/null; echo boom >&2; exit 3");
        match helper.invoke("token", &json!({})).await.unwrap_err() {
            CollabError::Failed { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {other}"),
        }

        let empty = CommandTokenSource(sh("cat >/dev/null"));
        assert!(matches!(empty.session_token().await, Err(CollabError::BadOutput { .. })));

        let slow = HelperCommand::new(
            vec!["sh".into(), "-c".into(), "sleep 5".into()],
            Duration::from_millis(100),
        )
        .unwrap();
        assert!(matches!(slow.invoke("token", &json!({})).await, Err(CollabError::Timeout { .. })));

        assert!(matches!(HelperCommand::new(vec![], Duration::from_secs(1)), Err(CollabError::EmptyCommand)));
    }

    #[tokio::test]
    async fn helper_ignoring_stdin_times_out() {
        let deaf = HelperCommand::new(
            vec!["sh".into(), "-c".into(), "exec sleep 5".into()],
            Duration::from_millis(200),
        )
        .unwrap();
        // larger than any pipe buffer, so the write itself blocks
        let input = json!({ "data": "x".repeat(1 << 20) });
        let started = std::time::Instant::now();
        assert!(matches!(deaf.invoke("encrypt", &input).await, Err(CollabError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
