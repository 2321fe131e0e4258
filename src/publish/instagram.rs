use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::{created_id, env_token, http_client, http_failure, Publisher, UploadResult};
use crate::config::InstagramSettings;
use crate::content::VideoMetadata;
use crate::error::{PipelineError, Result};
use crate::retry::{PollError, PollPolicy, PollStatus};

const PLATFORM: &str = "instagram";
const GRAPH_BASE: &str = "https://graph.facebook.com";
const MAX_CAPTION_CHARS: usize = 2200;

/// Reels through the Instagram Graph API: the video must sit at a public URL,
/// then container -> poll -> publish.
pub struct InstagramPublisher {
    client: reqwest::Client,
    settings: InstagramSettings,
    graph_base: String,
    poll: PollPolicy,
}

#[derive(Debug, Deserialize)]
struct ContainerStatus {
    #[serde(default)]
    status_code: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Classifies one container status check.
fn container_state(status: &ContainerStatus) -> PollStatus<()> {
    match status.status_code.as_deref() {
        Some("FINISHED") => PollStatus::Ready(()),
        Some(code @ ("ERROR" | "EXPIRED")) => PollStatus::Failed(format!(
            "container {}: {}",
            code,
            status.status.as_deref().unwrap_or("no detail")
        )),
        Some(other) => PollStatus::Pending(other.to_string()),
        None => PollStatus::Pending("UNKNOWN".into()),
    }
}

fn reel_caption(meta: &VideoMetadata) -> String {
    let caption = format!("{}\n\n{}", meta.title, meta.description);
    if caption.chars().count() <= MAX_CAPTION_CHARS {
        return caption;
    }
    caption.chars().take(MAX_CAPTION_CHARS).collect()
}

/// One Facebook page and the Instagram business account linked to it.
#[derive(Debug, Clone, PartialEq)]
pub struct BusinessAccount {
    pub page_name: String,
    pub page_id: String,
    pub instagram_id: Option<String>,
}

impl InstagramPublisher {
    pub fn new(settings: &InstagramSettings) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            settings: settings.clone(),
            graph_base: GRAPH_BASE.into(),
            poll: PollPolicy::new(Duration::from_secs(settings.poll_interval_secs), settings.poll_attempts),
        })
    }

    #[cfg(test)]
    fn with_graph_base(mut self, base: &str) -> Self {
        self.graph_base = base.to_string();
        self.poll = PollPolicy::new(Duration::ZERO, self.poll.max_attempts);
        self
    }

    fn graph_url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.graph_base, self.settings.api_version, path)
    }

    /// Puts the file on the temporary host and returns its public URL.
    async fn host_file(&self, video: &Path) -> Result<String> {
        let bytes = tokio::fs::read(video).await?;
        let name = video
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video.mp4".into());
        let part = Part::bytes(bytes).file_name(name).mime_str("video/mp4")?;
        let form = Form::new().text("reqtype", "fileupload").part("fileToUpload", part);
        let resp = self.client.post(&self.settings.file_host).multipart(form).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        let url = body.trim();
        if !status.is_success() || !url.starts_with("http") {
            return Err(PipelineError::publish(
                PLATFORM,
                format!("file host answered {status}: {}", url.chars().take(200).collect::<String>()),
                true,
            ));
        }
        info!("Video hosted at {}", url);
        Ok(url.to_string())
    }

    async fn post_graph(&self, path: &str, params: &[(&str, &str)]) -> Result<Value> {
        let resp = self.client.post(self.graph_url(path)).form(params).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(http_failure(PLATFORM, status, &body));
        }
        Ok(resp.json().await?)
    }

    async fn create_container(&self, token: &str, account: &str, video_url: &str, caption: &str) -> Result<String> {
        let body = self
            .post_graph(
                &format!("{account}/media"),
                &[
                    ("media_type", "REELS"),
                    ("video_url", video_url),
                    ("caption", caption),
                    ("share_to_feed", "true"),
                    ("access_token", token),
                ],
            )
            .await?;
        created_id(PLATFORM, &body)
    }

    async fn check_container(&self, token: &str, container: &str) -> Result<PollStatus<()>> {
        let resp = self
            .client
            .get(self.graph_url(container))
            .query(&[("fields", "status_code,status"), ("access_token", token)])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(http_failure(PLATFORM, status, &body));
        }
        let parsed: ContainerStatus = resp.json().await?;
        debug!("Container {} status {:?}", container, parsed.status_code);
        Ok(container_state(&parsed))
    }

    async fn wait_until_ready(&self, token: &str, container: &str) -> Result<()> {
        self.poll
            .poll("instagram container", || self.check_container(token, container))
            .await
            .map_err(|e| {
                let retryable = !matches!(e, PollError::Failed(_));
                PipelineError::publish(PLATFORM, e.to_string(), retryable)
            })
    }

    async fn publish_container(&self, token: &str, account: &str, container: &str) -> Result<String> {
        let body = self
            .post_graph(
                &format!("{account}/media_publish"),
                &[("creation_id", container), ("access_token", token)],
            )
            .await?;
        created_id(PLATFORM, &body)
    }

    /// Lists the pages the token can manage and their linked Instagram
    /// business accounts.
    pub async fn find_business_accounts(&self) -> Result<Vec<BusinessAccount>> {
        let token = env_token(PLATFORM, &self.settings.token_env)?;
        let resp = self
            .client
            .get(self.graph_url("me/accounts"))
            .query(&[("access_token", token.as_str())])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(http_failure(PLATFORM, status, &body));
        }
        let pages: Value = resp.json().await?;
        let mut out = Vec::new();
        for page in pages.get("data").and_then(Value::as_array).into_iter().flatten() {
            let Some(page_id) = page.get("id").and_then(Value::as_str) else {
                continue;
            };
            let page_name = page.get("name").and_then(Value::as_str).unwrap_or("?").to_string();
            let linked: Value = self
                .client
                .get(self.graph_url(page_id))
                .query(&[("fields", "instagram_business_account"), ("access_token", token.as_str())])
                .send()
                .await?
                .json()
                .await?;
            let instagram_id = linked
                .pointer("/instagram_business_account/id")
                .and_then(Value::as_str)
                .map(str::to_string);
            out.push(BusinessAccount {
                page_name,
                page_id: page_id.to_string(),
                instagram_id,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl Publisher for InstagramPublisher {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    async fn publish(&self, video: &Path, meta: &VideoMetadata) -> Result<UploadResult> {
        let token = env_token(PLATFORM, &self.settings.token_env)?;
        let account = env_token(PLATFORM, &self.settings.account_id_env)?;
        info!("Publishing Reel for account {}", account);
        let video_url = self.host_file(video).await?;
        let container = self.create_container(&token, &account, &video_url, &reel_caption(meta)).await?;
        info!("Created media container {}", container);
        self.wait_until_ready(&token, &container).await?;
        let id = self.publish_container(&token, &account, &container).await?;
        info!("Reel published, media id {}", id);
        Ok(UploadResult { platform: PLATFORM, id })
    }
}
