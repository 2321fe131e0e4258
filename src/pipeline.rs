//! One render/publish job per invocation: take the head of the queue, turn
//! it into a video inside a scratch directory, publish it, and only then
//! consume the queue entry.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::assets::{AssetResolver, Background, BackgroundKind, BackgroundOrigin};
use crate::caption::OverlayRender;
use crate::compose::{Compose, ConcatSpec, Motion, RenderSpec};
use crate::config::ChannelConfig;
use crate::content::{ContentItem, Story, VideoMetadata};
use crate::error::{PipelineError, Result};
use crate::publish::{Publisher, UploadResult};
use crate::queue::WorkQueue;
use crate::story;
use crate::subtitle;
use crate::thumbnail;
use crate::tts::{Narrate, Narration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    AssetsResolved,
    NarrationReady,
    Composed,
    MuxedWithAudio,
    Done,
    Failed,
}

impl JobState {
    fn next(self) -> Option<JobState> {
        use JobState::*;
        match self {
            Pending => Some(AssetsResolved),
            AssetsResolved => Some(NarrationReady),
            NarrationReady => Some(Composed),
            Composed => Some(MuxedWithAudio),
            MuxedWithAudio => Some(Done),
            Done | Failed => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Progress of one item through the stages.
#[derive(Debug)]
pub struct Job {
    key: String,
    state: JobState,
}

impl Job {
    pub fn new(key: String) -> Self {
        Self {
            key,
            state: JobState::Pending,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Moves one step forward. Skipping a state or leaving `Failed` is a bug
    /// in the caller and reported as an error.
    fn advance(&mut self, to: JobState) -> Result<()> {
        if self.state.next() != Some(to) {
            return Err(PipelineError::Queue(format!(
                "job {:?}: illegal transition {} -> {}",
                self.key, self.state, to
            )));
        }
        info!("job: {} -> {}", self.state, to);
        self.state = to;
        Ok(())
    }

    fn fail(&mut self, err: &PipelineError) {
        error!("job failed in state {}: {}", self.state, err);
        self.state = JobState::Failed;
    }

    fn ensure_publishable(&self) -> Result<()> {
        match self.state {
            JobState::Done => Ok(()),
            other => Err(PipelineError::publish(
                "pipeline",
                format!("refusing to publish a job in state {other}"),
                false,
            )),
        }
    }
}

/// The replaceable collaborators of a run.
pub struct Stages<'a> {
    pub assets: AssetResolver<'a>,
    pub narrator: Box<dyn Narrate + 'a>,
    pub overlay: Box<dyn OverlayRender + 'a>,
    pub composer: Box<dyn Compose + 'a>,
    pub publishers: Vec<Box<dyn Publisher>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub keep_artifacts: bool,
}

#[derive(Debug, PartialEq)]
pub enum RunOutcome {
    QueueEmpty,
    /// Composed only; the video sits in the output directory.
    DryRun { video: PathBuf },
    Published {
        key: String,
        uploads: Vec<UploadResult>,
        kept: Option<PathBuf>,
    },
}

/// File name for a finished video, derived from the item title.
pub fn video_file_name(item: &ContentItem) -> String {
    let mut slug = String::new();
    for c in item.title().chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug: String = slug.chars().take(60).collect();
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "video.mp4".into()
    } else {
        format!("{slug}.mp4")
    }
}

/// What a finished render leaves behind.
#[derive(Debug)]
struct Rendered {
    video: PathBuf,
    /// Cache files and source images used; removed once published.
    consumed: Vec<PathBuf>,
    thumbnail: Option<PathBuf>,
}

/// Removes the cache files a published job used. Entries shared between
/// scenes may already be gone.
fn prune_cache(entries: &[PathBuf]) {
    let mut removed = 0;
    for path in entries {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove cache entry {}: {}", path.display(), e),
        }
    }
    if removed > 0 {
        info!("Removed {} cache file(s) used by this job", removed);
    }
}

fn ensure_output(video: &Path) -> Result<()> {
    match fs::metadata(video) {
        Ok(m) if m.len() > 0 => Ok(()),
        _ => Err(PipelineError::CompositionFailed {
            status: "missing output".into(),
            stderr: format!("{} is missing or empty", video.display()),
        }),
    }
}

/// Rename, falling back to copy + delete across filesystems.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(dir) = to.parent() {
        fs::create_dir_all(dir)?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            fs::copy(from, to)?;
            fs::remove_file(from)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Moves the upload JPEG next to a kept video.
fn keep_thumbnail(thumbnail: Option<&Path>, video: &Path) {
    let Some(thumbnail) = thumbnail else { return };
    let out = video.with_extension("jpg");
    if let Err(e) = move_file(thumbnail, &out) {
        warn!("Could not keep thumbnail {}: {}", thumbnail.display(), e);
    }
}

/// First free `name`, `name-2`, ... in `dir`.
fn free_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = name.rsplit_once('.').unwrap_or((name, "mp4"));
    (2..)
        .map(|n| dir.join(format!("{stem}-{n}.{ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

pub struct Pipeline<'a> {
    cfg: &'a ChannelConfig,
    stages: Stages<'a>,
    options: RunOptions,
}

impl<'a> Pipeline<'a> {
    pub fn new(cfg: &'a ChannelConfig, stages: Stages<'a>, options: RunOptions) -> Self {
        Self { cfg, stages, options }
    }

    pub async fn run_once(&self) -> Result<RunOutcome> {
        let queue = WorkQueue::load(&self.cfg.queue, self.cfg.kind)?;
        if queue.is_empty() {
            info!("Queue {} has nothing to process", queue.path().display());
            return Ok(RunOutcome::QueueEmpty);
        }
        let Some(item) = queue.head() else {
            warn!("No entry in {} matches the {:?} shape", queue.path().display(), self.cfg.kind);
            return Ok(RunOutcome::QueueEmpty);
        };
        let key = item.unique_key();
        info!("Processing '{}' ({} item(s) queued)", item.title(), queue.len());

        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-", self.cfg.name))
            .tempdir()?;
        debug!("Scratch directory {}", scratch.path().display());

        let result = self.process(&queue, &item, &key, scratch.path()).await;
        self.finish_scratch(scratch);
        result
    }

    fn finish_scratch(&self, scratch: TempDir) {
        if self.options.keep_artifacts {
            let kept = scratch.keep();
            info!("Keeping job artifacts in {}", kept.display());
        } else if let Err(e) = scratch.close() {
            warn!("Could not remove scratch directory: {}", e);
        }
    }

    async fn process(&self, queue: &WorkQueue, item: &ContentItem, key: &str, scratch: &Path) -> Result<RunOutcome> {
        let mut job = Job::new(key.to_string());
        let rendered = match item {
            ContentItem::Story(story) => self.render_story(&mut job, item, story, scratch).await,
            _ => self.render(&mut job, item, scratch).await,
        };
        let Rendered {
            video,
            consumed,
            thumbnail,
        } = match rendered {
            Ok(r) => r,
            Err(e) => {
                job.fail(&e);
                return Err(e);
            }
        };
        let mut meta = VideoMetadata::for_item(item, &self.cfg.metadata);
        meta.thumbnail = thumbnail;

        if self.options.dry_run {
            let out = free_path(&self.cfg.output_dir, &video_file_name(item));
            move_file(&video, &out)?;
            keep_thumbnail(meta.thumbnail.as_deref(), &out);
            info!("Dry run: video left at {}, queue untouched", out.display());
            return Ok(RunOutcome::DryRun { video: out });
        }

        job.ensure_publishable()?;
        let uploads = self.publish_all(&video, &meta).await;
        if uploads.is_empty() {
            let err = PipelineError::publish("all", "no destination confirmed the upload; queue left untouched", true);
            job.fail(&err);
            return Err(err);
        }

        let remaining = queue.remove(key)?;
        debug!("{} item(s) left after consuming {:?}", remaining, key);
        prune_cache(&consumed);

        let kept = if self.cfg.keep_published {
            let out = free_path(&self.cfg.output_dir, &video_file_name(item));
            move_file(&video, &out)?;
            keep_thumbnail(meta.thumbnail.as_deref(), &out);
            info!("Published video kept at {}", out.display());
            Some(out)
        } else {
            None
        };
        debug!("job for {:?} ended in state {}", key, job.state());
        Ok(RunOutcome::Published {
            key: key.to_string(),
            uploads,
            kept,
        })
    }

    /// Pending through Done; returns the finished video inside `scratch`.
    async fn render(&self, job: &mut Job, item: &ContentItem, scratch: &Path) -> Result<Rendered> {
        let assets = self.stages.assets.resolve(item, scratch).await?;
        let mut consumed: Vec<PathBuf> = assets.background.cache_entry().map(Path::to_path_buf).into_iter().collect();
        job.advance(JobState::AssetsResolved)?;

        let narration = self.stages.narrator.narrate(&item.narration_segments(), scratch).await?;
        consumed.extend(narration.cache_entries.iter().cloned());
        job.advance(JobState::NarrationReady)?;

        let subtitles = self.write_subtitles(&narration, scratch)?;

        let caption_png = scratch.join("caption.png");
        self.stages
            .overlay
            .render_to(&item.caption(self.cfg.caption.header.as_deref()), &caption_png)?;

        let spec = RenderSpec::new(
            assets,
            Some(caption_png),
            subtitles,
            narration.audio.clone(),
            narration.duration,
            scratch.join("video.mp4"),
            &self.cfg.render,
        );
        let video = self.stages.composer.compose(&spec).await?;
        job.advance(JobState::Composed)?;

        // the composer muxes audio in the same pass; confirm it left a file
        ensure_output(&video)?;
        job.advance(JobState::MuxedWithAudio)?;
        job.advance(JobState::Done)?;
        Ok(Rendered {
            video,
            consumed,
            thumbnail: None,
        })
    }

    fn write_subtitles(&self, narration: &Narration, dir: &Path) -> Result<Option<PathBuf>> {
        let timings = narration.word_timings(self.cfg.subtitles.mode);
        if timings.is_empty() {
            return Ok(None);
        }
        let srt = dir.join("subtitles.srt");
        subtitle::write_srt(&srt, &timings)?;
        debug!("Wrote {} subtitle cues to {}", timings.len(), srt.display());
        Ok(Some(srt))
    }

    /// A story becomes one segment per scene, an optional intro over the
    /// thumbnail, then a concat pass that adds the shared layers.
    async fn render_story(&self, job: &mut Job, item: &ContentItem, story: &Story, scratch: &Path) -> Result<Rendered> {
        let settings = &self.cfg.story;
        let limit = self.cfg.test_mode.then_some(settings.test_scene_limit);
        if limit.is_some() {
            info!("Test mode: rendering at most {} scene(s) of '{}'", settings.test_scene_limit, story.title);
        }
        let plans = story::plan_scenes(story, settings.scene_zoom, limit);
        if plans.is_empty() {
            return Err(PipelineError::Queue(format!("story '{}' has no scene to render", story.title)));
        }

        let mut consumed = Vec::new();
        let mut backgrounds = Vec::with_capacity(plans.len());
        for plan in &plans {
            let bg = self.stages.assets.scene_background(&plan.prompt, &plan.stem(), scratch).await?;
            consumed.extend(bg.cache_entry().map(Path::to_path_buf));
            backgrounds.push(bg);
        }
        let thumb = self.story_thumbnail(story, scratch, &mut consumed).await;
        let decorations = self.stages.assets.decorations();
        job.advance(JobState::AssetsResolved)?;

        let channel = settings
            .channel_title
            .clone()
            .or_else(|| self.cfg.caption.header.clone())
            .unwrap_or_else(|| self.cfg.name.clone());
        let mut segments: Vec<(String, Background, Motion, Narration)> = Vec::new();
        if settings.intro {
            let background = match &thumb {
                Some(t) => Background {
                    path: t.frame.clone(),
                    kind: BackgroundKind::Still,
                    origin: BackgroundOrigin::Local,
                },
                None => backgrounds[0].clone(),
            };
            let narration = self
                .narrate_segment(&story::intro_line(story, &channel), &scratch.join("intro"), &mut consumed)
                .await?;
            segments.push(("intro".into(), background, Motion::ZoomIn(self.cfg.render.ken_burns.zoom), narration));
        }
        for (plan, background) in plans.iter().zip(backgrounds) {
            let narration = self.narrate_segment(&plan.text, &scratch.join(plan.stem()), &mut consumed).await?;
            segments.push((plan.stem(), background, plan.motion, narration));
        }
        job.advance(JobState::NarrationReady)?;

        let mut parts = Vec::with_capacity(segments.len());
        let mut total = 0.0;
        for (stem, background, motion, narration) in segments {
            let dir = scratch.join(&stem);
            let subtitles = self.write_subtitles(&narration, &dir)?;
            let mut spec = RenderSpec::segment(
                background,
                motion,
                subtitles,
                narration.audio.clone(),
                narration.duration,
                dir.join("segment.mp4"),
                &self.cfg.render,
            );
            if stem == "intro" {
                let caption_png = dir.join("caption.png");
                self.stages.overlay.render_to(&item.caption(Some(channel.as_str())), &caption_png)?;
                spec.caption = Some(caption_png);
            }
            let part = self.stages.composer.compose(&spec).await?;
            ensure_output(&part)?;
            debug!("Segment {} ready ({:.2}s)", stem, spec.duration);
            total += spec.duration;
            parts.push(part);
        }
        job.advance(JobState::Composed)?;

        let spec = ConcatSpec {
            segments: parts,
            list: scratch.join("segments.txt"),
            ambient_overlay: decorations.ambient_overlay,
            logo: decorations.logo,
            music: decorations.music,
            duration: total,
            output: scratch.join("video.mp4"),
        };
        let video = self.stages.composer.concat(&spec).await?;
        ensure_output(&video)?;
        info!("Story '{}' joined from {} segment(s), {:.2}s", story.title, spec.segments.len(), total);
        job.advance(JobState::MuxedWithAudio)?;
        job.advance(JobState::Done)?;
        Ok(Rendered {
            video,
            consumed,
            thumbnail: thumb.map(|t| t.jpeg),
        })
    }

    async fn narrate_segment(&self, text: &str, dir: &Path, consumed: &mut Vec<PathBuf>) -> Result<Narration> {
        fs::create_dir_all(dir)?;
        let narration = self.stages.narrator.narrate(&[text.to_string()], dir).await?;
        consumed.extend(narration.cache_entries.iter().cloned());
        Ok(narration)
    }

    /// A missing or broken thumbnail never fails the job.
    async fn story_thumbnail(
        &self,
        story: &Story,
        scratch: &Path,
        consumed: &mut Vec<PathBuf>,
    ) -> Option<thumbnail::Thumbnail> {
        let imageid = story.thumbnail.as_ref().and_then(|t| t.imageid.as_deref());
        let prompt = story::thumbnail_prompt(story);
        let source = self.stages.assets.thumbnail_source(imageid, prompt.as_deref()).await?;
        let logo = self.cfg.assets.logo.as_deref().filter(|p| p.exists());
        match thumbnail::prepare(
            &source.path,
            logo,
            &self.cfg.assets,
            (self.cfg.render.width, self.cfg.render.height),
            self.cfg.story.thumbnail_max_bytes,
            &scratch.join("thumbnail"),
        ) {
            Ok(t) => {
                consumed.push(source.path);
                Some(t)
            }
            Err(e) => {
                warn!("Skipping the thumbnail: {}", e);
                None
            }
        }
    }

    /// Tries every destination; a failure on one does not stop the others.
    async fn publish_all(&self, video: &Path, meta: &VideoMetadata) -> Vec<UploadResult> {
        let mut uploads = Vec::new();
        for publisher in &self.stages.publishers {
            info!("Publishing to {}", publisher.platform());
            match publisher.publish(video, meta).await {
                Ok(result) => {
                    info!("{} accepted the video as {}", result.platform, result.id);
                    uploads.push(result);
                }
                Err(e) => error!(
                    "Publishing to {} failed (retryable: {}): {}",
                    publisher.platform(),
                    e.is_retryable(),
                    e
                ),
            }
        }
        uploads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::MINIMAL;
    use crate::assets::tests::{noisy_png, StubBackend};
    use crate::assets::GeneratedImage;
    use crate::config::{ImageGenSettings, SubtitleMode};
    use crate::content::{CaptionText, ContentKind};
    use crate::queue;
    use crate::tts::{Narration, SegmentSpan};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Reports one fake TTS cache file per call when `cache` is set.
    struct StubNarrator {
        cache: Option<PathBuf>,
    }

    #[async_trait]
    impl Narrate for StubNarrator {
        async fn narrate(&self, segments: &[String], scratch: &Path) -> Result<Narration> {
            let audio = scratch.join("narration.wav");
            crate::media::write_silence(&audio, 0.2, 8_000)?;
            let mut cache_entries = Vec::new();
            if let Some(dir) = &self.cache {
                fs::create_dir_all(dir)?;
                let entry = dir.join(format!("{:x}.wav", md5::compute(segments.join(" ").as_bytes())));
                fs::write(&entry, b"tts")?;
                cache_entries.push(entry);
            }
            Ok(Narration {
                audio,
                duration: 7.3,
                segments: vec![SegmentSpan {
                    text: segments.join(" "),
                    start: 0.0,
                    duration: 7.3,
                    timings: None,
                }],
                cache_entries,
            })
        }
    }

    struct StubOverlay;

    impl OverlayRender for StubOverlay {
        fn render_to(&self, _caption: &CaptionText, out: &Path) -> Result<()> {
            fs::write(out, b"png")?;
            Ok(())
        }
    }

    /// Writes fake videos and records what it was asked to build.
    struct StubComposer {
        durations: Arc<std::sync::Mutex<Vec<f64>>>,
        concats: Arc<std::sync::Mutex<Vec<ConcatSpec>>>,
    }

    #[async_trait]
    impl Compose for StubComposer {
        async fn compose(&self, spec: &RenderSpec) -> Result<PathBuf> {
            if let Ok(mut d) = self.durations.lock() {
                d.push(spec.duration);
            }
            fs::write(&spec.output, b"mp4 bytes")?;
            Ok(spec.output.clone())
        }

        async fn concat(&self, spec: &ConcatSpec) -> Result<PathBuf> {
            if let Ok(mut c) = self.concats.lock() {
                c.push(spec.clone());
            }
            fs::write(&spec.output, b"joined mp4 bytes")?;
            Ok(spec.output.clone())
        }
    }

    struct StubPublisher {
        succeed: bool,
        calls: Arc<AtomicU32>,
        thumbnails: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Publisher for StubPublisher {
        fn platform(&self) -> &'static str {
            "stub"
        }

        async fn publish(&self, video: &Path, meta: &VideoMetadata) -> Result<UploadResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(video.exists());
            if meta.thumbnail.as_deref().is_some_and(Path::exists) {
                self.thumbnails.fetch_add(1, Ordering::SeqCst);
            }
            if self.succeed {
                Ok(UploadResult {
                    platform: "stub",
                    id: "vid-1".into(),
                })
            } else {
                Err(PipelineError::publish("stub", "service unavailable", true))
            }
        }
    }

    struct Fixture {
        dir: TempDir,
        cfg: ChannelConfig,
        durations: Arc<std::sync::Mutex<Vec<f64>>>,
        concats: Arc<std::sync::Mutex<Vec<ConcatSpec>>>,
        calls: Arc<AtomicU32>,
        thumbnails: Arc<AtomicU32>,
    }

    fn fixture(items: &[serde_json::Value]) -> Fixture {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("assets")).unwrap();
        fs::write(dir.path().join("assets/bg.mp4"), b"bg").unwrap();
        fs::create_dir_all(dir.path().join("data")).unwrap();
        let mut cfg = ChannelConfig::from_toml_str(MINIMAL, dir.path()).unwrap();
        cfg.subtitles.mode = SubtitleMode::Estimated;
        queue::create(&cfg.queue, items).unwrap();
        Fixture {
            dir,
            cfg,
            durations: Arc::new(std::sync::Mutex::new(Vec::new())),
            concats: Arc::new(std::sync::Mutex::new(Vec::new())),
            calls: Arc::new(AtomicU32::new(0)),
            thumbnails: Arc::new(AtomicU32::new(0)),
        }
    }

    fn stages_with<'a>(fx: &'a Fixture, assets: AssetResolver<'a>, tts_cache: Option<PathBuf>, succeed: bool) -> Stages<'a> {
        Stages {
            assets,
            narrator: Box::new(StubNarrator { cache: tts_cache }),
            overlay: Box::new(StubOverlay),
            composer: Box::new(StubComposer {
                durations: fx.durations.clone(),
                concats: fx.concats.clone(),
            }),
            publishers: vec![Box::new(StubPublisher {
                succeed,
                calls: fx.calls.clone(),
                thumbnails: fx.thumbnails.clone(),
            })],
        }
    }

    fn stages<'a>(fx: &'a Fixture, succeed: bool) -> Stages<'a> {
        stages_with(fx, AssetResolver::new(&fx.cfg), None, succeed)
    }

    /// Switches the fixture to generated backgrounds at a small frame size.
    fn generating(fx: &mut Fixture) {
        fx.cfg.assets.backgrounds.clear();
        fx.cfg.render.width = 64;
        fx.cfg.render.height = 96;
        let mut images: ImageGenSettings = toml::from_str("endpoint = \"http://127.0.0.1:9/generate\"").unwrap();
        images.backoff_secs = 0;
        fx.cfg.image_generation = Some(images);
    }

    fn stub_backend() -> Box<StubBackend> {
        Box::new(StubBackend {
            calls: Arc::new(AtomicU32::new(0)),
            reply: GeneratedImage {
                bytes: noisy_png(),
                content_type: Some("image/png".into()),
            },
        })
    }

    fn files_in(dir: &Path) -> usize {
        fs::read_dir(dir).map(|rd| rd.filter_map(|e| e.ok()).count()).unwrap_or(0)
    }

    fn story_item() -> serde_json::Value {
        json!({
            "video_title": "The Lamp",
            "image_style_for_all_images": "ink wash",
            "scenes": [
                {"text": "A lamp is lit.", "image_prompt": "a lamp"},
                {"text": "The wind rises.", "image_prompt": "wind"},
                {"text": "The lamp holds.", "image_prompt": "a steady flame"}
            ],
            "youtube_thumbnail": {"image_prompt": "a glowing lamp"},
            "video_outro": {"outro_scenes": [{"text": "Thanks for listening."}]}
        })
    }

    fn queued(cfg: &ChannelConfig) -> Vec<serde_json::Value> {
        serde_json::from_str(&fs::read_to_string(&cfg.queue).unwrap()).unwrap()
    }

    fn videos_in(dir: &Path) -> usize {
        fs::read_dir(dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .filter(|e| e.path().extension().is_some_and(|x| x == "mp4"))
                    .count()
            })
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn failed_publish_keeps_item_and_leaves_no_video() {
        let fx = fixture(&[json!({"quote": "A", "author": "B"})]);
        let pipeline = Pipeline::new(&fx.cfg, stages(&fx, false), RunOptions::default());

        let err = pipeline.run_once().await.unwrap_err();
        assert!(matches!(err, PipelineError::PublishFailed { .. }));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queued(&fx.cfg), vec![json!({"quote": "A", "author": "B"})]);
        assert_eq!(videos_in(&fx.cfg.output_dir), 0);
    }

    #[tokio::test]
    async fn successful_publish_consumes_exactly_the_processed_item() {
        let fx = fixture(&[
            json!({"quote": "First", "author": "One"}),
            json!({"quote": "Second", "author": "Two"}),
        ]);
        let pipeline = Pipeline::new(&fx.cfg, stages(&fx, true), RunOptions::default());

        let outcome = pipeline.run_once().await.unwrap();
        match outcome {
            RunOutcome::Published { uploads, kept, .. } => {
                assert_eq!(uploads.len(), 1);
                let kept = kept.unwrap();
                assert!(kept.exists());
                assert_eq!(kept.parent(), Some(fx.cfg.output_dir.as_path()));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(queued(&fx.cfg), vec![json!({"quote": "Second", "author": "Two"})]);
        // 7.3s narration, 1s padding, 6s floor
        let durations = fx.durations.lock().unwrap().clone();
        assert_eq!(durations.len(), 1);
        assert!((durations[0] - 8.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn dry_run_never_publishes_or_touches_the_queue() {
        let fx = fixture(&[json!({"quote": "A", "author": "B"})]);
        let options = RunOptions {
            dry_run: true,
            keep_artifacts: false,
        };
        let pipeline = Pipeline::new(&fx.cfg, stages(&fx, true), options);

        match pipeline.run_once().await.unwrap() {
            RunOutcome::DryRun { video } => assert!(video.exists()),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
        assert_eq!(queued(&fx.cfg).len(), 1);
    }

    #[tokio::test]
    async fn successful_publish_prunes_the_caches_it_used() {
        let mut fx = fixture(&[json!({"quote": "A", "author": "B"})]);
        generating(&mut fx);
        let images = fx.cfg.cache_dir().join("images");
        let tts = fx.cfg.cache_dir().join("tts");
        let assets = AssetResolver::with_backend(&fx.cfg, stub_backend());
        let pipeline = Pipeline::new(&fx.cfg, stages_with(&fx, assets, Some(tts.clone()), true), RunOptions::default());

        assert!(matches!(pipeline.run_once().await.unwrap(), RunOutcome::Published { .. }));
        assert_eq!(files_in(&images), 0);
        assert_eq!(files_in(&tts), 0);
    }

    #[tokio::test]
    async fn failed_publish_keeps_cache_entries_for_the_retry() {
        let mut fx = fixture(&[json!({"quote": "A", "author": "B"})]);
        generating(&mut fx);
        let images = fx.cfg.cache_dir().join("images");
        let tts = fx.cfg.cache_dir().join("tts");
        let assets = AssetResolver::with_backend(&fx.cfg, stub_backend());
        let pipeline = Pipeline::new(&fx.cfg, stages_with(&fx, assets, Some(tts.clone()), false), RunOptions::default());

        assert!(pipeline.run_once().await.is_err());
        assert_eq!(files_in(&images), 1);
        assert_eq!(files_in(&tts), 1);
    }

    #[tokio::test]
    async fn story_renders_intro_and_scenes_then_joins_them() {
        let mut fx = fixture(&[story_item()]);
        fx.cfg.kind = ContentKind::Story;
        generating(&mut fx);
        let images = fx.cfg.cache_dir().join("images");
        let assets = AssetResolver::with_backend(&fx.cfg, stub_backend());
        let pipeline = Pipeline::new(&fx.cfg, stages_with(&fx, assets, None, true), RunOptions::default());

        let kept = match pipeline.run_once().await.unwrap() {
            RunOutcome::Published { kept, .. } => kept.unwrap(),
            other => panic!("unexpected outcome {other:?}"),
        };
        // intro, three scenes, one outro scene
        let durations = fx.durations.lock().unwrap().clone();
        assert_eq!(durations.len(), 5);
        let concats = fx.concats.lock().unwrap().clone();
        assert_eq!(concats.len(), 1);
        assert_eq!(concats[0].segments.len(), 5);
        assert!((concats[0].duration - durations.iter().sum::<f64>()).abs() < 1e-9);
        assert!(concats[0].segments[0].ends_with("intro/segment.mp4"));

        assert_eq!(fx.thumbnails.load(Ordering::SeqCst), 1);
        assert!(kept.with_extension("jpg").exists());
        assert!(queued(&fx.cfg).is_empty());
        assert_eq!(files_in(&images), 0);
    }

    #[tokio::test]
    async fn test_mode_story_stops_after_the_scene_limit() {
        let mut fx = fixture(&[story_item()]);
        fx.cfg.kind = ContentKind::Story;
        fx.cfg.test_mode = true;
        fx.cfg.story.test_scene_limit = 1;
        fx.cfg.story.intro = false;
        fx.cfg.render.width = 64;
        fx.cfg.render.height = 96;
        let options = RunOptions {
            dry_run: true,
            keep_artifacts: false,
        };
        let pipeline = Pipeline::new(&fx.cfg, stages(&fx, true), options);

        assert!(matches!(pipeline.run_once().await.unwrap(), RunOutcome::DryRun { .. }));
        assert_eq!(fx.durations.lock().unwrap().len(), 1);
        assert_eq!(fx.concats.lock().unwrap()[0].segments.len(), 1);
        assert_eq!(fx.thumbnails.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_queue_is_not_an_error() {
        let fx = fixture(&[]);
        let pipeline = Pipeline::new(&fx.cfg, stages(&fx, true), RunOptions::default());
        assert_eq!(pipeline.run_once().await.unwrap(), RunOutcome::QueueEmpty);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn states_only_move_forward_one_step() {
        let mut job = Job::new("k".into());
        assert!(job.advance(JobState::NarrationReady).is_err());
        job.advance(JobState::AssetsResolved).unwrap();
        assert!(job.ensure_publishable().is_err());
        job.fail(&PipelineError::asset("background", "gone"));
        assert_eq!(job.state(), JobState::Failed);
        assert!(job.advance(JobState::NarrationReady).is_err());
    }

    #[test]
    fn video_names_are_slugged_titles() {
        let item = ContentItem::from_value(
            crate::content::ContentKind::Quote,
            &json!({"quote": "Be here now.", "author": "Ram Dass"}),
        )
        .unwrap();
        let name = video_file_name(&item);
        assert!(name.ends_with(".mp4"));
        assert!(!name.contains(' '));
        assert!(name.starts_with("ram-dass"), "{name}");
    }

    #[test]
    fn long_titles_never_end_in_a_separator() {
        let title = format!("{} beyond", "a".repeat(59));
        let item = ContentItem::from_value(crate::content::ContentKind::Chapter, &json!({"title": title})).unwrap();
        assert_eq!(video_file_name(&item), format!("{}.mp4", "a".repeat(59)));
    }

    #[test]
    fn free_path_appends_counter() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("clip.mp4"), b"x").unwrap();
        assert_eq!(free_path(dir.path(), "clip.mp4"), dir.path().join("clip-2.mp4"));
        assert_eq!(free_path(dir.path(), "new.mp4"), dir.path().join("new.mp4"));
    }
}
