use async_trait::async_trait;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ChannelConfig;
use crate::content::VideoMetadata;
use crate::error::{PipelineError, Result};

pub mod facebook;
pub mod instagram;
pub mod oauth;
pub mod youtube;

/// Identifier a platform handed back for a created video or media object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub platform: &'static str,
    pub id: String,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    fn platform(&self) -> &'static str;

    /// Uploads `video`. Only returns `Ok` once the platform confirmed a
    /// created resource.
    async fn publish(&self, video: &Path, meta: &VideoMetadata) -> Result<UploadResult>;
}

/// One publisher per destination section present in the channel config.
pub fn publishers_for(cfg: &ChannelConfig) -> Result<Vec<Box<dyn Publisher>>> {
    let mut out: Vec<Box<dyn Publisher>> = Vec::new();
    if let Some(yt) = &cfg.youtube {
        out.push(Box::new(youtube::YoutubePublisher::new(yt)?));
    }
    if let Some(ig) = &cfg.instagram {
        out.push(Box::new(instagram::InstagramPublisher::new(ig)?));
    }
    if let Some(fb) = &cfg.facebook {
        out.push(Box::new(facebook::FacebookPublisher::new(fb)?));
    }
    if out.is_empty() {
        warn!("Channel '{}' has no publish destinations configured", cfg.name);
    } else {
        let names: Vec<&str> = out.iter().map(|p| p.platform()).collect();
        info!("Publish destinations: {}", names.join(", "));
    }
    Ok(out)
}

/// True under GitHub Actions or any runner that exports `CI`.
pub fn is_ci() -> bool {
    env::var_os("CI").is_some() || env::var_os("GITHUB_ACTIONS").is_some()
}

pub(crate) fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()?)
}

/// Long-lived access token from the environment variable named in config.
pub(crate) fn env_token(platform: &str, var: &str) -> Result<String> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(PipelineError::publish(
            platform,
            format!("environment variable {var} is not set"),
            false,
        )),
    }
}

#[derive(Deserialize)]
struct GraphErrorBody {
    error: GraphErrorDetail,
}

#[derive(Deserialize)]
struct GraphErrorDetail {
    message: String,
    #[serde(default)]
    code: Option<i64>,
}

/// Maps a failed HTTP answer to `PublishFailed`, pulling the message out of a
/// Graph/Google style `{"error": {...}}` body when there is one.
pub(crate) fn http_failure(platform: &str, status: reqwest::StatusCode, body: &str) -> PipelineError {
    let detail = match serde_json::from_str::<GraphErrorBody>(body) {
        Ok(parsed) => match parsed.error.code {
            Some(code) => format!("{} (code {})", parsed.error.message, code),
            None => parsed.error.message,
        },
        Err(_) => body.chars().take(300).collect(),
    };
    let retryable = status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
    PipelineError::publish(platform, format!("HTTP {status}: {detail}"), retryable)
}

/// Reads `{"id": "..."}` out of a creation response.
pub(crate) fn created_id(platform: &str, body: &serde_json::Value) -> Result<String> {
    body.get("id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| PipelineError::publish(platform, format!("response carried no id: {body}"), false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn graph_error_message_is_extracted() {
        let body = r#"{"error":{"message":"Invalid OAuth access token.","type":"OAuthException","code":190}}"#;
        let err = http_failure("instagram", StatusCode::BAD_REQUEST, body);
        let text = err.to_string();
        assert!(text.contains("Invalid OAuth access token. (code 190)"), "{text}");
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_errors_are_retryable() {
        let err = http_failure("youtube", StatusCode::BAD_GATEWAY, "<html>oops</html>");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("<html>oops</html>"));
    }

    #[test]
    fn missing_id_is_a_failure() {
        let ok = serde_json::json!({"id": "17890"});
        assert_eq!(created_id("facebook", &ok).unwrap(), "17890");
        let bad = serde_json::json!({"success": true});
        assert!(created_id("facebook", &bad).is_err());
    }

    #[test]
    fn unset_token_variable_is_not_retryable() {
        let err = env_token("facebook", "SHORTSMITH_TEST_UNSET_TOKEN_VARIABLE").unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("SHORTSMITH_TEST_UNSET_TOKEN_VARIABLE"));
    }
}
