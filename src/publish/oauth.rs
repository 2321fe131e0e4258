use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{http_client, is_ci};
use crate::config::YoutubeSettings;
use crate::error::{PipelineError, Result};

pub const YOUTUBE_SCOPE: &str = "https://www.googleapis.com/auth/youtube";
const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
/// Tokens this close to expiry are refreshed up front.
const EXPIRY_MARGIN_SECS: u64 = 60;
const CONSENT_DEADLINE: Duration = Duration::from_secs(300);

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The `installed` (desktop) or `web` block of a Google client secrets file.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.into()
}
fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.into()
}

#[derive(Deserialize)]
struct SecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("client secrets {}: {e}", path.display())))?;
        Self::parse(&raw).map_err(|reason| PipelineError::Config(format!("client secrets {}: {reason}", path.display())))
    }

    fn parse(raw: &str) -> std::result::Result<Self, String> {
        let file: SecretsFile = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        file.installed
            .or(file.web)
            .ok_or_else(|| "neither an \"installed\" nor a \"web\" client".to_string())
    }

    pub fn authorization_url(&self, redirect_uri: &str, state: &str) -> Result<String> {
        let url = reqwest::Url::parse_with_params(
            &self.auth_uri,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", YOUTUBE_SCOPE),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state),
            ],
        )
        .map_err(|e| PipelineError::Config(format!("bad auth_uri {}: {e}", self.auth_uri)))?;
        Ok(url.into())
    }
}

/// Cached OAuth credential, stored as JSON in the configured token file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix seconds.
    pub expires_at: u64,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl StoredToken {
    pub fn is_fresh(&self, now: u64) -> bool {
        self.expires_at > now + EXPIRY_MARGIN_SECS
    }

    fn from_response(resp: TokenResponse, previous_refresh: Option<String>, now: u64) -> Self {
        Self {
            access_token: resp.access_token,
            // refresh answers usually omit the refresh token
            refresh_token: resp.refresh_token.or(previous_refresh),
            expires_at: now + resp.expires_in,
            scopes: resp
                .scope
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_else(|| vec![YOUTUBE_SCOPE.to_string()]),
        }
    }

    fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), self)?;
        tmp.as_file_mut().write_all(b"\n")?;
        tmp.persist(path).map_err(|e| PipelineError::Io(e.error))?;
        debug!("Saved OAuth token to {}", path.display());
        Ok(())
    }

    /// Decodes the base64 form produced by `export-token`.
    pub fn decode_exported(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| PipelineError::Config(format!("exported token is not base64: {e}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

enum RefreshError {
    /// The grant was revoked or expired; the cached token is useless.
    Revoked(String),
    Other(PipelineError),
}

/// Hands out a valid YouTube access token, refreshing or re-consenting as
/// needed.
pub struct Authenticator {
    client: reqwest::Client,
    token_file: PathBuf,
    secrets_file: PathBuf,
    secret_env: Option<String>,
    interactive: bool,
}

impl Authenticator {
    pub fn new(settings: &YoutubeSettings) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            token_file: settings.token_file.clone(),
            secrets_file: settings.client_secrets.clone(),
            secret_env: settings.token_secret_env.clone(),
            interactive: !is_ci(),
        })
    }

    #[cfg(test)]
    pub(crate) fn non_interactive(mut self) -> Self {
        self.interactive = false;
        self
    }

    pub fn token_file(&self) -> &Path {
        &self.token_file
    }

    pub async fn access_token(&self) -> Result<String> {
        if let Some(token) = self.cached_token()? {
            if token.is_fresh(now_secs()) {
                debug!("Using cached OAuth token from {}", self.token_file.display());
                return Ok(token.access_token);
            }
            match token.refresh_token.as_deref() {
                Some(refresh) => {
                    let secrets = ClientSecrets::load(&self.secrets_file)?;
                    match self.refresh(&secrets, refresh).await {
                        Ok(fresh) => {
                            info!("Refreshed YouTube access token");
                            if let Err(e) = fresh.save(&self.token_file) {
                                warn!("Could not persist refreshed token: {}", e);
                            }
                            return Ok(fresh.access_token);
                        }
                        Err(RefreshError::Revoked(reason)) => {
                            warn!("Refresh token rejected ({}), deleting {}", reason, self.token_file.display());
                            self.reset()?;
                        }
                        Err(RefreshError::Other(e)) => return Err(e),
                    }
                }
                None => warn!("Cached token has no refresh token and is expired"),
            }
        }

        if !self.interactive {
            return Err(PipelineError::AuthExpired {
                token_file: self.token_file.clone(),
                remediation: self.remediation(),
            });
        }
        let secrets = ClientSecrets::load(&self.secrets_file)?;
        let token = self.consent(&secrets).await?;
        token.save(&self.token_file)?;
        Ok(token.access_token)
    }

    fn remediation(&self) -> String {
        let mut msg = String::from(
            "no usable YouTube credential and this is a non-interactive run. \
             Run `shortsmith auth` on a machine with a browser",
        );
        match &self.secret_env {
            Some(var) => msg.push_str(&format!(
                ", then `shortsmith export-token` and store the output in the {var} secret"
            )),
            None => msg.push_str(&format!(" and copy {} to this runner", self.token_file.display())),
        }
        msg
    }

    /// The token file, or on first use the base64 token from the configured
    /// secret variable.
    fn cached_token(&self) -> Result<Option<StoredToken>> {
        if let Some(token) = StoredToken::load(&self.token_file)? {
            return Ok(Some(token));
        }
        let Some(var) = &self.secret_env else {
            return Ok(None);
        };
        let Ok(encoded) = std::env::var(var) else {
            return Ok(None);
        };
        if encoded.trim().is_empty() {
            return Ok(None);
        }
        let token = StoredToken::decode_exported(&encoded)?;
        info!("Bootstrapped OAuth token from {}", var);
        if let Err(e) = token.save(&self.token_file) {
            warn!("Could not write bootstrapped token: {}", e);
        }
        Ok(Some(token))
    }

    async fn refresh(&self, secrets: &ClientSecrets, refresh_token: &str) -> std::result::Result<StoredToken, RefreshError> {
        let resp = self
            .client
            .post(&secrets.token_uri)
            .form(&[
                ("client_id", secrets.client_id.as_str()),
                ("client_secret", secrets.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| RefreshError::Other(e.into()))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| RefreshError::Other(e.into()))?;
        if status.is_success() {
            let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| RefreshError::Other(e.into()))?;
            return Ok(StoredToken::from_response(parsed, Some(refresh_token.to_string()), now_secs()));
        }
        match serde_json::from_str::<TokenErrorResponse>(&body) {
            Ok(err) if err.error == "invalid_grant" => Err(RefreshError::Revoked(
                err.error_description.unwrap_or(err.error),
            )),
            _ => Err(RefreshError::Other(PipelineError::publish(
                "youtube",
                format!("token refresh failed with HTTP {status}: {body}"),
                status.is_server_error(),
            ))),
        }
    }

    async fn exchange_code(&self, secrets: &ClientSecrets, code: &str, redirect_uri: &str) -> Result<StoredToken> {
        let resp = self
            .client
            .post(&secrets.token_uri)
            .form(&[
                ("client_id", secrets.client_id.as_str()),
                ("client_secret", secrets.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(PipelineError::AuthExpired {
                token_file: self.token_file.clone(),
                remediation: format!("authorization code exchange failed (HTTP {status}): {body}"),
            });
        }
        let parsed: TokenResponse = serde_json::from_str(&body)?;
        Ok(StoredToken::from_response(parsed, None, now_secs()))
    }

    /// Loopback consent: prints the consent URL and waits for the browser
    /// redirect on an ephemeral local port.
    async fn consent(&self, secrets: &ClientSecrets) -> Result<StoredToken> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let redirect_uri = format!("http://127.0.0.1:{}", listener.local_addr()?.port());
        let state = {
            use rand::Rng;
            format!("{:016x}", rand::rng().random::<u64>())
        };
        let url = secrets.authorization_url(&redirect_uri, &state)?;
        info!("Open this URL in a browser to authorize YouTube uploads:\n{}", url);

        let code = timeout(CONSENT_DEADLINE, wait_for_code(&listener, &state))
            .await
            .map_err(|_| PipelineError::AuthExpired {
                token_file: self.token_file.clone(),
                remediation: format!("no consent received within {:?}", CONSENT_DEADLINE),
            })??;
        info!("Authorization code received, exchanging for tokens");
        self.exchange_code(secrets, &code, &redirect_uri).await
    }

    /// Deletes the cached token. Returns whether there was one.
    pub fn reset(&self) -> Result<bool> {
        match fs::remove_file(&self.token_file) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Base64 of the token file, for storing as a CI secret.
    pub fn export(&self) -> Result<String> {
        let bytes = fs::read(&self.token_file).map_err(|e| {
            PipelineError::Config(format!("no token at {} ({e}); run `shortsmith auth` first", self.token_file.display()))
        })?;
        Ok(STANDARD.encode(bytes))
    }
}

enum Callback {
    Code(String),
    Denied(String),
    Ignore,
}

/// Reads `GET /?code=..&state=..` off the request line.
fn parse_callback(request_line: &str, expected_state: &str) -> Callback {
    let Some(target) = request_line.split_whitespace().nth(1) else {
        return Callback::Ignore;
    };
    let Ok(url) = reqwest::Url::parse(&format!("http://127.0.0.1{target}")) else {
        return Callback::Ignore;
    };
    let mut code = None;
    let mut state = None;
    for (k, v) in url.query_pairs() {
        match k.as_ref() {
            "code" => code = Some(v.into_owned()),
            "state" => state = Some(v.into_owned()),
            "error" => return Callback::Denied(v.into_owned()),
            _ => {}
        }
    }
    match (code, state) {
        (Some(code), Some(state)) if state == expected_state => Callback::Code(code),
        (Some(_), _) => Callback::Denied("state mismatch".into()),
        _ => Callback::Ignore,
    }
}

async fn wait_for_code(listener: &TcpListener, state: &str) -> Result<String> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!("OAuth callback connection from {}", peer);
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let outcome = parse_callback(&line, state);
        let body = match &outcome {
            Callback::Code(_) => "Authorization complete. You can close this tab.",
            Callback::Denied(_) => "Authorization failed. Check the terminal.",
            Callback::Ignore => "Waiting for authorization...",
        };
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let mut stream = reader.into_inner();
        stream.write_all(response.as_bytes()).await?;
        let _ = stream.shutdown().await;
        match outcome {
            Callback::Code(code) => return Ok(code),
            Callback::Denied(reason) => {
                return Err(PipelineError::AuthExpired {
                    token_file: PathBuf::new(),
                    remediation: format!("consent was not granted: {reason}"),
                });
            }
            Callback::Ignore => continue,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn write_fresh_token(path: &Path) {
        StoredToken {
            access_token: "ya29.fresh".into(),
            refresh_token: Some("1//refresh".into()),
            expires_at: now_secs() + 3600,
            scopes: vec![YOUTUBE_SCOPE.into()],
        }
        .save(path)
        .unwrap();
    }

    pub(crate) fn settings_in(dir: &Path) -> YoutubeSettings {
        YoutubeSettings {
            token_file: dir.join("token.json"),
            client_secrets: dir.join("client_secrets.json"),
            token_secret_env: None,
            category_id: "22".into(),
            privacy: "public".into(),
            playlist_id: None,
            playlist_title: None,
            playlist_language: None,
            chunk_size_mb: 8,
        }
    }

    fn write_secrets(dir: &Path, token_uri: &str) {
        let raw = serde_json::json!({
            "installed": {
                "client_id": "cid.apps.googleusercontent.com",
                "client_secret": "shh",
                "token_uri": token_uri,
            }
        });
        fs::write(dir.join("client_secrets.json"), raw.to_string()).unwrap();
    }

    fn write_expired_token(path: &Path) {
        StoredToken {
            access_token: "ya29.old".into(),
            refresh_token: Some("1//refresh".into()),
            expires_at: 10,
            scopes: vec![],
        }
        .save(path)
        .unwrap();
    }

    #[test]
    fn freshness_keeps_a_safety_margin() {
        let token = StoredToken {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: 1_000,
            scopes: vec![],
        };
        assert!(token.is_fresh(900));
        assert!(!token.is_fresh(950));
    }

    #[test]
    fn web_client_block_is_accepted() {
        let secrets = ClientSecrets::parse(r#"{"web":{"client_id":"id","client_secret":"s"}}"#).unwrap();
        assert_eq!(secrets.client_id, "id");
        assert_eq!(secrets.token_uri, DEFAULT_TOKEN_URI);
        assert!(ClientSecrets::parse(r#"{"other":{}}"#).is_err());
    }

    #[test]
    fn consent_url_requests_offline_youtube_scope() {
        let secrets = ClientSecrets::parse(r#"{"installed":{"client_id":"id","client_secret":"s"}}"#).unwrap();
        let url = secrets.authorization_url("http://127.0.0.1:8765", "abc").unwrap();
        assert!(url.starts_with(DEFAULT_AUTH_URI));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("prompt=consent"));
        assert!(url.contains("scope=https%3A%2F%2Fwww.googleapis.com%2Fauth%2Fyoutube"));
        assert!(url.contains("redirect_uri=http%3A%2F%2F127.0.0.1%3A8765"));
    }

    #[test]
    fn callback_state_must_match() {
        assert!(matches!(
            parse_callback("GET /?state=abc&code=4%2F0Ab HTTP/1.1\r\n", "abc"),
            Callback::Code(c) if c == "4/0Ab"
        ));
        assert!(matches!(parse_callback("GET /?state=zzz&code=x HTTP/1.1", "abc"), Callback::Denied(_)));
        assert!(matches!(parse_callback("GET /?error=access_denied HTTP/1.1", "abc"), Callback::Denied(_)));
        assert!(matches!(parse_callback("GET /favicon.ico HTTP/1.1", "abc"), Callback::Ignore));
    }

    #[tokio::test]
    async fn fresh_token_is_used_without_network() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(dir.path());
        write_fresh_token(&settings.token_file);
        let auth = Authenticator::new(&settings).unwrap().non_interactive();
        assert_eq!(auth.access_token().await.unwrap(), "ya29.fresh");
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_keeps_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"ya29.new","expires_in":3599,"scope":"https://www.googleapis.com/auth/youtube","token_type":"Bearer"}"#)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let settings = settings_in(dir.path());
        write_secrets(dir.path(), &format!("{}/token", server.url()));
        write_expired_token(&settings.token_file);

        let auth = Authenticator::new(&settings).unwrap().non_interactive();
        assert_eq!(auth.access_token().await.unwrap(), "ya29.new");
        mock.assert_async().await;

        let saved = StoredToken::load(&settings.token_file).unwrap().unwrap();
        assert_eq!(saved.access_token, "ya29.new");
        assert_eq!(saved.refresh_token.as_deref(), Some("1//refresh"));
    }

    #[tokio::test]
    async fn revoked_grant_deletes_token_and_fails_with_remediation_in_ci() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let mut settings = settings_in(dir.path());
        settings.token_secret_env = Some("SHORTSMITH_TEST_TOKEN_SECRET_NEVER_SET".into());
        write_secrets(dir.path(), &format!("{}/token", server.url()));
        write_expired_token(&settings.token_file);

        let auth = Authenticator::new(&settings).unwrap().non_interactive();
        let err = auth.access_token().await.unwrap_err();
        match &err {
            PipelineError::AuthExpired { remediation, .. } => {
                assert!(remediation.contains("shortsmith auth"));
                assert!(remediation.contains("SHORTSMITH_TEST_TOKEN_SECRET_NEVER_SET"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!err.is_retryable());
        assert!(!settings.token_file.exists());
    }

    #[test]
    fn export_decodes_back_to_the_same_token() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(dir.path());
        write_fresh_token(&settings.token_file);
        let auth = Authenticator::new(&settings).unwrap();
        let decoded = StoredToken::decode_exported(&auth.export().unwrap()).unwrap();
        assert_eq!(decoded.access_token, "ya29.fresh");
        assert!(auth.reset().unwrap());
        assert!(!auth.reset().unwrap());
    }
}
