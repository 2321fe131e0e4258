use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::oauth::Authenticator;
use super::{created_id, http_failure, Publisher, UploadResult};
use crate::config::YoutubeSettings;
use crate::content::VideoMetadata;
use crate::error::{PipelineError, Result};

const PLATFORM: &str = "youtube";
const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/youtube/v3";
const API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const MAX_CHUNK_RETRIES: u32 = 5;

/// Resumable upload through the YouTube Data API v3.
pub struct YoutubePublisher {
    client: reqwest::Client,
    auth: Authenticator,
    settings: YoutubeSettings,
    upload_base: String,
    api_base: String,
    backoff: Duration,
}

/// Next byte to send after a `308 Resume Incomplete`, from `Range: bytes=0-N`.
fn next_offset(range: Option<&str>) -> u64 {
    range
        .and_then(|r| r.rsplit('-').next())
        .and_then(|end| end.trim().parse::<u64>().ok())
        .map(|end| end + 1)
        .unwrap_or(0)
}

fn chunk_size(mb: usize) -> u64 {
    // the API wants multiples of 256 KiB
    const QUANTUM: u64 = 256 * 1024;
    let bytes = (mb.max(1) as u64) * 1024 * 1024;
    (bytes / QUANTUM).max(1) * QUANTUM
}

async fn read_range(path: &Path, start: u64, end: u64) -> Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = vec![0u8; (end - start) as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

enum ChunkOutcome {
    Done(String),
    Continue(u64),
}

impl YoutubePublisher {
    pub fn new(settings: &YoutubeSettings) -> Result<Self> {
        // 308 is a resume signal here, not a redirect
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            auth: Authenticator::new(settings)?,
            settings: settings.clone(),
            upload_base: UPLOAD_BASE.into(),
            api_base: API_BASE.into(),
            backoff: Duration::from_secs(2),
        })
    }

    #[cfg(test)]
    fn with_endpoints(mut self, base: &str) -> Self {
        self.upload_base = format!("{base}/upload/youtube/v3");
        self.api_base = format!("{base}/youtube/v3");
        self.backoff = Duration::ZERO;
        self
    }

    fn video_resource(&self, meta: &VideoMetadata) -> Value {
        json!({
            "snippet": {
                "title": meta.title,
                "description": meta.description,
                "tags": meta.tags,
                "categoryId": self.settings.category_id,
            },
            "status": {
                "privacyStatus": self.settings.privacy,
                "selfDeclaredMadeForKids": false,
            }
        })
    }

    async fn start_session(&self, token: &str, meta: &VideoMetadata, total: u64) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}/videos", self.upload_base))
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .bearer_auth(token)
            .header("X-Upload-Content-Type", "video/mp4")
            .header("X-Upload-Content-Length", total.to_string())
            .json(&self.video_resource(meta))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(http_failure(PLATFORM, status, &body));
        }
        resp.headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| PipelineError::publish(PLATFORM, "upload session had no Location header", true))
    }

    async fn interpret(&self, resp: reqwest::Response) -> Result<ChunkOutcome> {
        let status = resp.status();
        if status.is_success() {
            let body: Value = resp.json().await?;
            return Ok(ChunkOutcome::Done(created_id(PLATFORM, &body)?));
        }
        if status == StatusCode::PERMANENT_REDIRECT {
            let range = resp.headers().get(RANGE).and_then(|v| v.to_str().ok());
            return Ok(ChunkOutcome::Continue(next_offset(range)));
        }
        let body = resp.text().await.unwrap_or_default();
        Err(http_failure(PLATFORM, status, &body))
    }

    /// Asks the session how many bytes it already holds.
    async fn query_offset(&self, token: &str, session: &str, total: u64) -> Result<ChunkOutcome> {
        let resp = self
            .client
            .put(session)
            .bearer_auth(token)
            .header(CONTENT_LENGTH, 0)
            .header(CONTENT_RANGE, format!("bytes */{total}"))
            .send()
            .await?;
        self.interpret(resp).await
    }

    async fn upload(&self, token: &str, session: &str, video: &Path, total: u64) -> Result<String> {
        let chunk = chunk_size(self.settings.chunk_size_mb);
        let mut offset = 0u64;
        let mut failures = 0u32;
        let mut stalls = 0u32;
        loop {
            if offset >= total {
                // every byte acknowledged but no resource yet
                match self.query_offset(token, session, total).await? {
                    ChunkOutcome::Done(id) => return Ok(id),
                    ChunkOutcome::Continue(next) if next < total => offset = next,
                    ChunkOutcome::Continue(_) => {
                        return Err(PipelineError::publish(PLATFORM, "upload never finalized", true));
                    }
                }
            }
            let end = (offset + chunk).min(total);
            let body = read_range(video, offset, end).await?;
            debug!("PUT bytes {}-{}/{}", offset, end - 1, total);
            let sent = self
                .client
                .put(session)
                .bearer_auth(token)
                .header(CONTENT_LENGTH, end - offset)
                .header(CONTENT_RANGE, format!("bytes {}-{}/{}", offset, end - 1, total))
                .body(body)
                .send()
                .await;

            let outcome = match sent {
                Ok(resp) => self.interpret(resp).await,
                Err(e) => Err(e.into()),
            };
            match outcome {
                Ok(ChunkOutcome::Done(id)) => return Ok(id),
                Ok(ChunkOutcome::Continue(next)) if next <= offset => {
                    stalls += 1;
                    if stalls > MAX_CHUNK_RETRIES {
                        return Err(PipelineError::publish(
                            PLATFORM,
                            format!("session stuck at byte {offset} after {stalls} attempts"),
                            true,
                        ));
                    }
                    warn!("Server acknowledged nothing past {}, resending ({}/{})", offset, stalls, MAX_CHUNK_RETRIES);
                    if !self.backoff.is_zero() {
                        sleep(self.backoff * 2u32.pow(stalls - 1)).await;
                    }
                    offset = next;
                }
                Ok(ChunkOutcome::Continue(next)) => {
                    info!("Uploaded {:.0}%", next as f64 * 100.0 / total as f64);
                    offset = next;
                    failures = 0;
                    stalls = 0;
                }
                Err(e) if e.is_retryable() && failures < MAX_CHUNK_RETRIES => {
                    failures += 1;
                    warn!("Chunk at {} failed ({}), retry {}/{}", offset, e, failures, MAX_CHUNK_RETRIES);
                    if !self.backoff.is_zero() {
                        sleep(self.backoff * 2u32.pow(failures - 1)).await;
                    }
                    match self.query_offset(token, session, total).await? {
                        ChunkOutcome::Done(id) => return Ok(id),
                        ChunkOutcome::Continue(next) => offset = next,
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_json(&self, token: &str, url: &str, query: &[(&str, &str)]) -> Result<Value> {
        let resp = self.client.get(url).query(query).bearer_auth(token).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(http_failure(PLATFORM, status, &body));
        }
        Ok(resp.json().await?)
    }

    async fn post_json(&self, token: &str, url: &str, part: &str, body: &Value) -> Result<Value> {
        let resp = self
            .client
            .post(url)
            .query(&[("part", part)])
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(http_failure(PLATFORM, status, &text));
        }
        Ok(resp.json().await?)
    }

    async fn find_playlist(&self, token: &str, title: &str) -> Result<Option<String>> {
        let url = format!("{}/playlists", self.api_base);
        let mut page: Option<String> = None;
        loop {
            let mut query = vec![("part", "snippet"), ("mine", "true"), ("maxResults", "50")];
            if let Some(p) = page.as_deref() {
                query.push(("pageToken", p));
            }
            let body = self.get_json(token, &url, &query).await?;
            let items = body.get("items").and_then(Value::as_array).cloned().unwrap_or_default();
            for item in items {
                let name = item.pointer("/snippet/title").and_then(Value::as_str);
                if name == Some(title) {
                    if let Some(id) = item.get("id").and_then(Value::as_str) {
                        return Ok(Some(id.to_string()));
                    }
                }
            }
            match body.get("nextPageToken").and_then(Value::as_str) {
                Some(next) => page = Some(next.to_string()),
                None => return Ok(None),
            }
        }
    }

    async fn get_or_create_playlist(&self, token: &str, title: &str) -> Result<String> {
        if let Some(id) = self.find_playlist(token, title).await? {
            info!("Found existing playlist '{}' ({})", title, id);
            return Ok(id);
        }
        info!("Playlist '{}' not found, creating it", title);
        let mut snippet = json!({
            "title": title,
            "description": format!("{title} - daily uploads"),
        });
        if let Some(lang) = &self.settings.playlist_language {
            snippet["defaultLanguage"] = json!(lang);
        }
        let body = json!({
            "snippet": snippet,
            "status": {"privacyStatus": self.settings.privacy},
        });
        let created = self
            .post_json(token, &format!("{}/playlists", self.api_base), "snippet,status", &body)
            .await?;
        created_id(PLATFORM, &created)
    }

    async fn add_to_playlist(&self, token: &str, playlist_id: &str, video_id: &str) -> Result<()> {
        let body = json!({
            "snippet": {
                "playlistId": playlist_id,
                "resourceId": {"kind": "youtube#video", "videoId": video_id},
            }
        });
        self.post_json(token, &format!("{}/playlistItems", self.api_base), "snippet", &body)
            .await?;
        Ok(())
    }

    /// Playlist trouble never fails the upload.
    /// `thumbnails.set`; YouTube accepts JPEGs up to 2 MB.
    async fn set_thumbnail(&self, token: &str, video_id: &str, thumbnail: &Path) -> Result<()> {
        let bytes = tokio::fs::read(thumbnail).await?;
        let resp = self
            .client
            .post(format!("{}/thumbnails/set", self.upload_base))
            .query(&[("videoId", video_id)])
            .bearer_auth(token)
            .header(CONTENT_TYPE, "image/jpeg")
            .body(bytes)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(http_failure(PLATFORM, status, &body));
        }
        Ok(())
    }

    async fn attach_to_playlist(&self, token: &str, video_id: &str) {
        let playlist = match (&self.settings.playlist_id, &self.settings.playlist_title) {
            (Some(id), _) => Some(id.clone()),
            (None, Some(title)) => match self.get_or_create_playlist(token, title).await {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!("Could not resolve playlist '{}': {}", title, e);
                    None
                }
            },
            (None, None) => None,
        };
        if let Some(playlist_id) = playlist {
            match self.add_to_playlist(token, &playlist_id, video_id).await {
                Ok(()) => info!("Added {} to playlist {}", video_id, playlist_id),
                Err(e) => warn!("Error adding to playlist {}: {}", playlist_id, e),
            }
        }
    }
}

#[async_trait]
impl Publisher for YoutubePublisher {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    async fn publish(&self, video: &Path, meta: &VideoMetadata) -> Result<UploadResult> {
        let total = tokio::fs::metadata(video).await?.len();
        if total == 0 {
            return Err(PipelineError::publish(PLATFORM, format!("{} is empty", video.display()), false));
        }
        let token = self.auth.access_token().await?;
        info!("Uploading {} ({} bytes) to YouTube: {}", video.display(), total, meta.title);
        let session = self.start_session(&token, meta, total).await?;
        let id = self.upload(&token, &session, video, total).await?;
        info!("Upload complete, video id {}", id);
        if let Some(thumbnail) = &meta.thumbnail {
            match self.set_thumbnail(&token, &id, thumbnail).await {
                Ok(()) => info!("Thumbnail set for {}", id),
                Err(e) => warn!("Could not set thumbnail for {}: {}", id, e),
            }
        }
        self.attach_to_playlist(&token, &id).await;
        Ok(UploadResult { platform: PLATFORM, id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::oauth::tests::{settings_in, write_fresh_token};
    use mockito::Matcher;
    use tempfile::TempDir;

    fn meta() -> VideoMetadata {
        VideoMetadata {
            title: "Rumi Quote".into(),
            description: "Let the beauty we love be what we do.\n\n- Rumi".into(),
            tags: vec!["quotes".into(), "rumi".into()],
            thumbnail: None,
        }
    }

    #[test]
    fn resume_offset_follows_range_header() {
        assert_eq!(next_offset(Some("bytes=0-1048575")), 1_048_576);
        assert_eq!(next_offset(Some("bytes=0-262143")), 262_144);
        assert_eq!(next_offset(None), 0);
        assert_eq!(next_offset(Some("garbage")), 0);
    }

    #[test]
    fn chunks_are_whole_quanta() {
        assert_eq!(chunk_size(8), 8 * 1024 * 1024);
        assert_eq!(chunk_size(0) % (256 * 1024), 0);
    }

    #[test]
    fn snippet_carries_category_and_privacy() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings_in(dir.path());
        settings.privacy = "unlisted".into();
        let yt = YoutubePublisher::new(&settings).unwrap();
        let body = yt.video_resource(&meta());
        assert_eq!(body["snippet"]["categoryId"], "22");
        assert_eq!(body["snippet"]["tags"][1], "rumi");
        assert_eq!(body["status"]["privacyStatus"], "unlisted");
        assert_eq!(body["status"]["selfDeclaredMadeForKids"], false);
    }

    #[tokio::test]
    async fn resumable_upload_continues_after_308_and_adds_to_playlist() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();

        let init = server
            .mock("POST", "/upload/youtube/v3/videos")
            .match_query(Matcher::UrlEncoded("uploadType".into(), "resumable".into()))
            .match_header("authorization", "Bearer ya29.fresh")
            .with_status(200)
            .with_header("location", format!("{url}/session/abc").as_str())
            .create_async()
            .await;
        let first = server
            .mock("PUT", "/session/abc")
            .match_header("content-range", "bytes 0-1048575/1500000")
            .with_status(308)
            .with_header("range", "bytes=0-1048575")
            .create_async()
            .await;
        let last = server
            .mock("PUT", "/session/abc")
            .match_header("content-range", "bytes 1048576-1499999/1500000")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"dQw4w9WgXcQ","kind":"youtube#video"}"#)
            .create_async()
            .await;
        let playlist = server
            .mock("POST", "/youtube/v3/playlistItems")
            .match_query(Matcher::Any)
            .match_body(Matcher::PartialJsonString(
                r#"{"snippet":{"playlistId":"PL123","resourceId":{"videoId":"dQw4w9WgXcQ"}}}"#.into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"item1"}"#)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let mut settings = settings_in(dir.path());
        settings.playlist_id = Some("PL123".into());
        settings.chunk_size_mb = 1;
        write_fresh_token(&settings.token_file);
        let video = dir.path().join("short.mp4");
        std::fs::write(&video, vec![7u8; 1_500_000]).unwrap();

        let yt = YoutubePublisher::new(&settings).unwrap().with_endpoints(&url);
        let result = yt.publish(&video, &meta()).await.unwrap();
        assert_eq!(result, UploadResult { platform: "youtube", id: "dQw4w9WgXcQ".into() });
        init.assert_async().await;
        first.assert_async().await;
        last.assert_async().await;
        playlist.assert_async().await;
    }

    #[tokio::test]
    async fn session_that_never_advances_gives_up() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();
        let _init = server
            .mock("POST", "/upload/youtube/v3/videos")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("location", format!("{url}/session/stuck").as_str())
            .create_async()
            .await;
        // 308 with no Range header: nothing was persisted
        let stuck = server
            .mock("PUT", "/session/stuck")
            .match_header("content-range", "bytes 0-299999/300000")
            .with_status(308)
            .expect(6)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let settings = settings_in(dir.path());
        write_fresh_token(&settings.token_file);
        let video = dir.path().join("short.mp4");
        std::fs::write(&video, vec![1u8; 300_000]).unwrap();

        let yt = YoutubePublisher::new(&settings).unwrap().with_endpoints(&url);
        let err = yt.publish(&video, &meta()).await.unwrap_err();
        assert!(matches!(err, PipelineError::PublishFailed { retryable: true, .. }));
        assert!(err.to_string().contains("stuck at byte 0"));
        stuck.assert_async().await;
    }

    #[tokio::test]
    async fn thumbnail_is_posted_after_upload_and_its_failure_is_tolerated() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();
        let _init = server
            .mock("POST", "/upload/youtube/v3/videos")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("location", format!("{url}/session/thumb").as_str())
            .create_async()
            .await;
        let _put = server
            .mock("PUT", "/session/thumb")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"vid7"}"#)
            .create_async()
            .await;
        let thumb = server
            .mock("POST", "/upload/youtube/v3/thumbnails/set")
            .match_query(Matcher::UrlEncoded("videoId".into(), "vid7".into()))
            .match_header("content-type", "image/jpeg")
            .match_body(b"\xff\xd8jpeg".to_vec())
            .with_status(403)
            .with_body(r#"{"error":{"message":"forbidden","code":403}}"#)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let settings = settings_in(dir.path());
        write_fresh_token(&settings.token_file);
        let video = dir.path().join("short.mp4");
        std::fs::write(&video, b"mp4 bytes").unwrap();
        let jpeg = dir.path().join("thumbnail.jpg");
        std::fs::write(&jpeg, b"\xff\xd8jpeg").unwrap();
        let mut meta = meta();
        meta.thumbnail = Some(jpeg);

        let yt = YoutubePublisher::new(&settings).unwrap().with_endpoints(&url);
        let result = yt.publish(&video, &meta).await.unwrap();
        assert_eq!(result.id, "vid7");
        thumb.assert_async().await;
    }

    #[tokio::test]
    async fn playlist_failure_does_not_fail_the_upload() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();
        let _init = server
            .mock("POST", "/upload/youtube/v3/videos")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("location", format!("{url}/session/xyz").as_str())
            .create_async()
            .await;
        let _put = server
            .mock("PUT", "/session/xyz")
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"vid42"}"#)
            .create_async()
            .await;
        let _list = server
            .mock("GET", "/youtube/v3/playlists")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body(r#"{"error":{"message":"quotaExceeded","code":403}}"#)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let mut settings = settings_in(dir.path());
        settings.playlist_title = Some("Daily Quotes".into());
        write_fresh_token(&settings.token_file);
        let video = dir.path().join("short.mp4");
        std::fs::write(&video, b"not really a video but bytes").unwrap();

        let yt = YoutubePublisher::new(&settings).unwrap().with_endpoints(&url);
        assert_eq!(yt.publish(&video, &meta()).await.unwrap().id, "vid42");
    }

    #[tokio::test]
    async fn rejected_session_is_a_publish_failure() {
        let mut server = mockito::Server::new_async().await;
        let _init = server
            .mock("POST", "/upload/youtube/v3/videos")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"error":{"message":"uploadLimitExceeded","code":400}}"#)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let settings = settings_in(dir.path());
        write_fresh_token(&settings.token_file);
        let video = dir.path().join("short.mp4");
        std::fs::write(&video, b"bytes").unwrap();

        let yt = YoutubePublisher::new(&settings).unwrap().with_endpoints(&server.url());
        let err = yt.publish(&video, &meta()).await.unwrap_err();
        assert!(matches!(err, PipelineError::PublishFailed { retryable: false, .. }));
        assert!(err.to_string().contains("uploadLimitExceeded"));
    }
}
