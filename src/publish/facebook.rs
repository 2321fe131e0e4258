use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::path::Path;
use tracing::info;

use super::{created_id, env_token, http_client, http_failure, Publisher, UploadResult};
use crate::config::FacebookSettings;
use crate::content::VideoMetadata;
use crate::error::Result;

const PLATFORM: &str = "facebook";
const VIDEO_BASE: &str = "https://graph-video.facebook.com";

/// Page video upload as a single multipart POST.
pub struct FacebookPublisher {
    client: reqwest::Client,
    settings: FacebookSettings,
    base: String,
}

impl FacebookPublisher {
    pub fn new(settings: &FacebookSettings) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            settings: settings.clone(),
            base: VIDEO_BASE.into(),
        })
    }

    async fn upload(&self, token: String, video: &Path, meta: &VideoMetadata) -> Result<String> {
        let bytes = tokio::fs::read(video).await?;
        let part = Part::bytes(bytes).file_name("video.mp4").mime_str("video/mp4")?;
        let form = Form::new()
            .text("title", meta.title.clone())
            .text("description", meta.description.clone())
            .text("access_token", token)
            .part("source", part);
        let url = format!("{}/{}/{}/videos", self.base, self.settings.api_version, self.settings.page_id);
        let resp = self.client.post(url).multipart(form).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(http_failure(PLATFORM, status, &body));
        }
        let body: Value = resp.json().await?;
        created_id(PLATFORM, &body)
    }
}

#[async_trait]
impl Publisher for FacebookPublisher {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    async fn publish(&self, video: &Path, meta: &VideoMetadata) -> Result<UploadResult> {
        let token = env_token(PLATFORM, &self.settings.token_env)?;
        info!("Uploading {} to Facebook page {}", video.display(), self.settings.page_id);
        let id = self.upload(token, video, meta).await?;
        info!("Facebook video id {}", id);
        Ok(UploadResult { platform: PLATFORM, id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use mockito::Matcher;

    fn publisher(base: &str) -> FacebookPublisher {
        let settings = FacebookSettings {
            token_env: "FB_TOKEN".into(),
            page_id: "4242".into(),
            api_version: "v18.0".into(),
        };
        let mut fb = FacebookPublisher::new(&settings).unwrap();
        fb.base = base.to_string();
        fb
    }

    fn meta() -> VideoMetadata {
        VideoMetadata {
            title: "Verse 2.47".into(),
            description: "You have a right to your actions.".into(),
            tags: vec![],
            thumbnail: None,
        }
    }

    #[tokio::test]
    async fn multipart_upload_returns_video_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v18.0/4242/videos")
            .match_header("content-type", Matcher::Regex("^multipart/form-data".into()))
            .match_body(Matcher::Regex("name=\"source\"".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"10223"}"#)
            .create_async()
            .await;
        let dir = tempfile::TempDir::new().unwrap();
        let video = dir.path().join("v.mp4");
        std::fs::write(&video, b"fake mp4 payload").unwrap();

        let id = publisher(&server.url()).upload("tok".into(), &video, &meta()).await.unwrap();
        assert_eq!(id, "10223");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn permission_error_is_not_retryable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v18.0/4242/videos")
            .with_status(403)
            .with_body(r#"{"error":{"message":"(#200) Permissions error","code":200}}"#)
            .create_async()
            .await;
        let dir = tempfile::TempDir::new().unwrap();
        let video = dir.path().join("v.mp4");
        std::fs::write(&video, b"fake").unwrap();

        let err = publisher(&server.url()).upload("tok".into(), &video, &meta()).await.unwrap_err();
        assert!(matches!(err, PipelineError::PublishFailed { retryable: false, .. }));
        assert!(err.to_string().contains("Permissions error"));
    }
}
