use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::content::ContentKind;
use crate::error::{PipelineError, Result};

/// Everything one channel run needs, loaded once from the channel's TOML file
/// and handed to every stage by reference.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub kind: ContentKind,
    pub queue: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub keep_published: bool,
    #[serde(default)]
    pub render: RenderSettings,
    #[serde(default)]
    pub assets: AssetSettings,
    pub caption: CaptionSettings,
    #[serde(default)]
    pub tts: TtsSettings,
    #[serde(default)]
    pub subtitles: SubtitleSettings,
    #[serde(default)]
    pub metadata: MetadataSettings,
    #[serde(default)]
    pub image_generation: Option<ImageGenSettings>,
    #[serde(default)]
    pub youtube: Option<YoutubeSettings>,
    #[serde(default)]
    pub instagram: Option<InstagramSettings>,
    #[serde(default)]
    pub facebook: Option<FacebookSettings>,
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub story: StorySettings,
    /// Set by [`ChannelConfig::apply_test_mode`].
    #[serde(skip)]
    pub test_mode: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub codec: String,
    pub preset: String,
    pub crf: u32,
    pub pixel_format: String,
    pub audio_codec: String,
    /// Shortest video we ever produce, in seconds.
    pub min_duration: f64,
    /// Added after the narration so the last word is never clipped.
    pub padding: f64,
    pub timeout_secs: u64,
    pub ken_burns: KenBurnsSettings,
    pub test: TestOverrides,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            width: 720,
            height: 1280,
            fps: 30,
            codec: "libx264".into(),
            preset: "medium".into(),
            crf: 23,
            pixel_format: "yuv420p".into(),
            audio_codec: "aac".into(),
            min_duration: 6.0,
            padding: 1.0,
            timeout_secs: 1800,
            ken_burns: KenBurnsSettings::default(),
            test: TestOverrides::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KenBurnsSettings {
    pub enabled: bool,
    /// Total zoom gained over the clip, 0.05 means 1.0 -> 1.05.
    pub zoom: f64,
}

impl Default for KenBurnsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            zoom: 0.05,
        }
    }
}

/// Values swapped in by `--test` for faster iteration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TestOverrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub preset: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssetSettings {
    /// Checked in order; the first one that exists wins.
    pub backgrounds: Vec<PathBuf>,
    pub background_fit: BackgroundFit,
    pub background_opacity: f32,
    pub ambient_overlay: Option<PathBuf>,
    pub ambient_opacity: f32,
    pub logo: Option<PathBuf>,
    pub logo_width: u32,
    pub logo_padding: u32,
    pub music: Option<PathBuf>,
    pub music_volume: f32,
    pub narration_volume: f32,
}

/// How a background that is not Ken-Burns animated fills the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundFit {
    /// Scale up and crop the overflow.
    Cover,
    /// Scale down and letterbox with black.
    Contain,
}

impl Default for AssetSettings {
    fn default() -> Self {
        Self {
            backgrounds: Vec::new(),
            background_fit: BackgroundFit::Cover,
            background_opacity: 1.0,
            ambient_overlay: None,
            ambient_opacity: 0.10,
            logo: None,
            logo_width: 100,
            logo_padding: 40,
            music: None,
            music_volume: 0.20,
            narration_volume: 1.0,
        }
    }
}

/// Multi-scene story channels.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorySettings {
    /// Zoom each scene gains or loses; odd scenes push in, even ones pull out.
    pub scene_zoom: f64,
    /// Open with a narrated intro over the thumbnail.
    pub intro: bool,
    /// Name spoken in the intro. Falls back to the caption header, then the channel name.
    pub channel_title: Option<String>,
    /// Main scenes rendered with `--test`; outro scenes are skipped too.
    pub test_scene_limit: usize,
    /// Searched for a file named after the story's thumbnail `imageid`.
    pub thumbnails_dir: Option<PathBuf>,
    pub thumbnail_max_bytes: u64,
}

impl Default for StorySettings {
    fn default() -> Self {
        Self {
            scene_zoom: 0.15,
            intro: true,
            channel_title: None,
            test_scene_limit: 5,
            thumbnails_dir: None,
            thumbnail_max_bytes: 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptionSettings {
    /// Font candidates for body and attribution text, first existing wins.
    pub fonts: Vec<PathBuf>,
    #[serde(default)]
    pub header_font: Option<PathBuf>,
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default = "default_header_size")]
    pub header_size: f32,
    #[serde(default = "default_header_alpha")]
    pub header_alpha: u8,
    #[serde(default = "default_header_y")]
    pub header_y: f32,
    #[serde(default = "default_body_size")]
    pub body_size: f32,
    #[serde(default)]
    pub attribution_size: Option<f32>,
    #[serde(default = "default_attribution_gap")]
    pub attribution_gap: f32,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default = "default_margin")]
    pub margin: u32,
    #[serde(default = "default_line_spacing")]
    pub line_spacing: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TtsBackendKind {
    Piper,
    #[default]
    Edge,
    Xtts,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsSettings {
    pub backend: TtsBackendKind,
    pub voice: String,
    pub rate: Option<String>,
    pub pitch: Option<String>,
    /// Piper `.onnx` model or Coqui model name.
    pub model: Option<String>,
    pub speaker_wav: Option<PathBuf>,
    pub language: Option<String>,
    /// Silence before the first narration segment, seconds.
    pub lead_in: f64,
    /// Silence between narration segments, seconds.
    pub segment_pause: f64,
    pub sample_rate: u32,
    pub cache: bool,
    /// Override for the backend executable.
    pub binary: Option<PathBuf>,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            backend: TtsBackendKind::Edge,
            voice: "en-US-GuyNeural".into(),
            rate: None,
            pitch: None,
            model: None,
            speaker_wav: None,
            language: None,
            lead_in: 0.0,
            segment_pause: 0.0,
            sample_rate: 24_000,
            cache: true,
            binary: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubtitleMode {
    /// Backend word timings, estimated ones when the backend has none.
    Words,
    /// Always estimate from the text and measured duration.
    Estimated,
    #[default]
    Off,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubtitleSettings {
    pub mode: SubtitleMode,
    pub font_name: String,
    pub font_size: u32,
    pub margin_v: u32,
    pub primary_colour: String,
    pub back_colour: String,
    pub outline: u32,
    pub shadow: u32,
    pub border_style: u32,
}

impl Default for SubtitleSettings {
    fn default() -> Self {
        Self {
            mode: SubtitleMode::Off,
            font_name: "Arial".into(),
            font_size: 16,
            margin_v: 50,
            primary_colour: "&H00FFFFFF".into(),
            back_colour: "&H99000000".into(),
            outline: 1,
            shadow: 1,
            border_style: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MetadataSettings {
    pub hashtags: Vec<String>,
    pub tags: Vec<String>,
    pub title_suffix: Option<String>,
    pub footer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageGenSettings {
    pub endpoint: String,
    #[serde(default = "default_image_token_env")]
    pub token_env: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    #[serde(default = "default_image_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub prompt_suffix: Option<String>,
    /// Used when the content item carries no prompt of its own.
    #[serde(default)]
    pub default_prompt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct YoutubeSettings {
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
    #[serde(default = "default_client_secrets")]
    pub client_secrets: PathBuf,
    /// Env var holding a base64 token cache, used to seed CI runs.
    #[serde(default)]
    pub token_secret_env: Option<String>,
    #[serde(default = "default_category")]
    pub category_id: String,
    #[serde(default = "default_privacy")]
    pub privacy: String,
    #[serde(default)]
    pub playlist_id: Option<String>,
    #[serde(default)]
    pub playlist_title: Option<String>,
    #[serde(default)]
    pub playlist_language: Option<String>,
    #[serde(default = "default_chunk_mb")]
    pub chunk_size_mb: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstagramSettings {
    #[serde(default = "default_ig_token_env")]
    pub token_env: String,
    #[serde(default = "default_ig_account_env")]
    pub account_id_env: String,
    #[serde(default = "default_graph_version")]
    pub api_version: String,
    #[serde(default = "default_file_host")]
    pub file_host: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FacebookSettings {
    #[serde(default = "default_ig_token_env")]
    pub token_env: String,
    #[serde(default = "default_page_id")]
    pub page_id: String,
    #[serde(default = "default_graph_version")]
    pub api_version: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ToolSettings {
    pub ffmpeg: Option<PathBuf>,
    pub ffprobe: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}
fn default_header_size() -> f32 {
    30.0
}
fn default_header_alpha() -> u8 {
    51
}
fn default_header_y() -> f32 {
    70.0
}
fn default_body_size() -> f32 {
    50.0
}
fn default_attribution_gap() -> f32 {
    100.0
}
fn default_color() -> String {
    "#FFFFFF".into()
}
fn default_margin() -> u32 {
    70
}
fn default_line_spacing() -> f32 {
    1.4
}
fn default_image_token_env() -> String {
    "IMAGE_API_TOKEN".into()
}
fn default_attempts() -> u32 {
    3
}
fn default_backoff_secs() -> u64 {
    2
}
fn default_image_timeout() -> u64 {
    60
}
fn default_token_file() -> PathBuf {
    PathBuf::from("token.json")
}
fn default_client_secrets() -> PathBuf {
    PathBuf::from("client_secrets.json")
}
fn default_category() -> String {
    "22".into()
}
fn default_privacy() -> String {
    "public".into()
}
fn default_chunk_mb() -> usize {
    8
}
fn default_ig_token_env() -> String {
    "IG_ACCESS_TOKEN".into()
}
fn default_ig_account_env() -> String {
    "IG_BUSINESS_ID".into()
}
fn default_graph_version() -> String {
    "v18.0".into()
}
fn default_file_host() -> String {
    "https://catbox.moe/user/api.php".into()
}
fn default_poll_interval() -> u64 {
    10
}
fn default_poll_attempts() -> u32 {
    30
}
fn default_page_id() -> String {
    "me".into()
}

fn resolve(base: &Path, p: &mut PathBuf) {
    if p.is_relative() {
        *p = base.join(&*p);
    }
}

impl ChannelConfig {
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading channel config {}", path.display());
        let raw = fs::read_to_string(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&raw, base)
    }

    /// Parses a config and resolves every relative path against `base`.
    pub fn from_toml_str(raw: &str, base: &Path) -> Result<Self> {
        let mut cfg: ChannelConfig =
            toml::from_str(raw).map_err(|e| PipelineError::Config(e.to_string()))?;
        cfg.resolve_paths(base);
        cfg.validate()?;
        debug!("Channel '{}' ({:?}) config resolved", cfg.name, cfg.kind);
        Ok(cfg)
    }

    fn resolve_paths(&mut self, base: &Path) {
        resolve(base, &mut self.queue);
        resolve(base, &mut self.output_dir);
        if let Some(c) = self.cache_dir.as_mut() {
            resolve(base, c);
        }
        for p in self.assets.backgrounds.iter_mut() {
            resolve(base, p);
        }
        for p in [
            self.assets.ambient_overlay.as_mut(),
            self.assets.logo.as_mut(),
            self.assets.music.as_mut(),
            self.caption.header_font.as_mut(),
            self.tts.speaker_wav.as_mut(),
            self.story.thumbnails_dir.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            resolve(base, p);
        }
        for p in self.caption.fonts.iter_mut() {
            resolve(base, p);
        }
        if let Some(yt) = self.youtube.as_mut() {
            resolve(base, &mut yt.token_file);
            resolve(base, &mut yt.client_secrets);
        }
        // Piper models are files, Coqui models are registry names.
        if self.tts.backend == TtsBackendKind::Piper {
            if let Some(model) = self.tts.model.as_mut() {
                let mut p = PathBuf::from(model.as_str());
                resolve(base, &mut p);
                *model = p.to_string_lossy().into_owned();
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.render;
        if r.width == 0 || r.height == 0 || r.width % 2 != 0 || r.height % 2 != 0 {
            return Err(PipelineError::Config(format!(
                "render size must be even and non-zero, got {}x{}",
                r.width, r.height
            )));
        }
        if r.fps == 0 {
            return Err(PipelineError::Config("render.fps must be positive".into()));
        }
        if r.padding < 0.0 || r.min_duration < 0.0 {
            return Err(PipelineError::Config(
                "render.padding and render.min_duration must not be negative".into(),
            ));
        }
        if self.assets.backgrounds.is_empty() && self.image_generation.is_none() {
            return Err(PipelineError::Config(
                "need at least one [assets] background or an [image_generation] section".into(),
            ));
        }
        if self.caption.fonts.is_empty() {
            return Err(PipelineError::Config("caption.fonts must list at least one font".into()));
        }
        if !(0.0..1.0).contains(&self.story.scene_zoom) {
            return Err(PipelineError::Config("story.scene_zoom must be within 0..1".into()));
        }
        for (name, v) in [
            ("assets.background_opacity", self.assets.background_opacity),
            ("assets.ambient_opacity", self.assets.ambient_opacity),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(PipelineError::Config(format!("{name} must be within 0..=1")));
            }
        }
        Ok(())
    }

    /// Reduced resolution and faster encoding for `--test` runs. Explicit
    /// overrides go through the same checks as the main settings.
    pub fn apply_test_mode(&mut self) -> Result<()> {
        let t = self.render.test.clone();
        let even = |v: u32| (v / 2).max(2) & !1;
        self.render.width = t.width.unwrap_or_else(|| even(self.render.width));
        self.render.height = t.height.unwrap_or_else(|| even(self.render.height));
        self.render.fps = t.fps.unwrap_or(self.render.fps.min(30));
        self.render.preset = t.preset.unwrap_or_else(|| "ultrafast".into());
        self.validate()?;
        self.test_mode = true;
        info!(
            "TEST MODE: rendering at {}x{} @ {} fps",
            self.render.width, self.render.height, self.render.fps
        );
        Ok(())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join("cache"))
    }
}
