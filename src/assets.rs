use async_trait::async_trait;
use image::ImageFormat;
use rand::Rng;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::caption::{self, LoadedFont};
use crate::config::{ChannelConfig, ImageGenSettings};
use crate::content::ContentItem;
use crate::error::{PipelineError, Result};
use crate::retry::RetryPolicy;

/// Anything smaller is an error page, not a picture.
const MIN_IMAGE_BYTES: usize = 1000;

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// A remote text-to-image service.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn generate(&self, prompt: &str, width: u32, height: u32, seed: u32) -> Result<GeneratedImage>;
}

pub struct HttpImageBackend {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpImageBackend {
    pub fn from_settings(settings: &ImageGenSettings) -> Self {
        let token = std::env::var(&settings.token_env).ok().filter(|t| !t.is_empty());
        if token.is_none() {
            warn!("{} is not set, calling {} without credentials", settings.token_env, settings.endpoint);
        }
        Self {
            client: reqwest::Client::new(),
            endpoint: settings.endpoint.clone(),
            token,
            timeout: Duration::from_secs(settings.timeout_secs),
        }
    }
}

#[async_trait]
impl ImageBackend for HttpImageBackend {
    async fn generate(&self, prompt: &str, width: u32, height: u32, seed: u32) -> Result<GeneratedImage> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&json!({
                "prompt": prompt,
                "width": width,
                "height": height,
                "seed": seed,
            }));
        if let Some(token) = &self.token {
            let value = if token.starts_with("Bearer ") {
                token.clone()
            } else {
                format!("Bearer {token}")
            };
            req = req.header(AUTHORIZATION, value);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().await?.to_vec();
        if !status.is_success() {
            let snippet: String = String::from_utf8_lossy(&bytes).chars().take(200).collect();
            return Err(PipelineError::asset("generated image", format!("HTTP {status}: {snippet}")));
        }
        Ok(GeneratedImage { bytes, content_type })
    }
}

/// Decides whether a 200 response really carries an image.
pub fn sniff(img: &GeneratedImage) -> std::result::Result<ImageFormat, String> {
    if let Some(ct) = &img.content_type {
        if ct.contains("json") || ct.starts_with("text/") {
            return Err(format!("content-type {ct}"));
        }
    }
    let head = &img.bytes[..img.bytes.len().min(100)];
    let first = img.bytes.iter().find(|b| !b.is_ascii_whitespace());
    if first == Some(&b'{') || first == Some(&b'[') {
        return Err("body is JSON".into());
    }
    if String::from_utf8_lossy(head).contains("object Object") {
        return Err("body is a serialised JS object".into());
    }
    if img.bytes.len() < MIN_IMAGE_BYTES {
        return Err(format!("only {} bytes", img.bytes.len()));
    }
    image::guess_format(&img.bytes).map_err(|e| format!("unknown image format: {e}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundKind {
    Video,
    Still,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundOrigin {
    Local,
    Generated,
    Placeholder,
}

#[derive(Debug, Clone)]
pub struct Background {
    pub path: PathBuf,
    pub kind: BackgroundKind,
    pub origin: BackgroundOrigin,
}

impl Background {
    /// The image cache file behind a generated background.
    pub fn cache_entry(&self) -> Option<&Path> {
        (self.origin == BackgroundOrigin::Generated).then_some(self.path.as_path())
    }
}

/// Layers shared by every segment of a render.
#[derive(Debug, Clone, Default)]
pub struct Decorations {
    pub music: Option<PathBuf>,
    pub ambient_overlay: Option<PathBuf>,
    pub logo: Option<PathBuf>,
}

/// Concrete inputs for one render.
#[derive(Debug, Clone)]
pub struct ResolvedAssets {
    pub background: Background,
    pub music: Option<PathBuf>,
    pub ambient_overlay: Option<PathBuf>,
    pub logo: Option<PathBuf>,
}

const STILL_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "webp", "bmp", "gif"];

fn kind_of(path: &Path) -> BackgroundKind {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if STILL_EXTENSIONS.contains(&ext.as_str()) {
        BackgroundKind::Still
    } else {
        BackgroundKind::Video
    }
}

fn optional(label: &str, path: &Option<PathBuf>) -> Option<PathBuf> {
    let p = path.as_ref()?;
    if p.exists() {
        Some(p.clone())
    } else {
        warn!("{} {} not found, rendering without it", label, p.display());
        None
    }
}

pub struct AssetResolver<'a> {
    cfg: &'a ChannelConfig,
    images: Option<Box<dyn ImageBackend>>,
}

impl<'a> AssetResolver<'a> {
    pub fn new(cfg: &'a ChannelConfig) -> Self {
        let images = cfg
            .image_generation
            .as_ref()
            .map(|s| Box::new(HttpImageBackend::from_settings(s)) as Box<dyn ImageBackend>);
        Self { cfg, images }
    }

    #[cfg(test)]
    pub fn with_backend(cfg: &'a ChannelConfig, backend: Box<dyn ImageBackend>) -> Self {
        Self {
            cfg,
            images: Some(backend),
        }
    }

    pub async fn resolve(&self, item: &ContentItem, scratch: &Path) -> Result<ResolvedAssets> {
        let background = self.background(item, scratch).await?;
        info!(
            "Background: {} ({:?}, {:?})",
            background.path.display(),
            background.kind,
            background.origin
        );
        let extras = self.decorations();
        Ok(ResolvedAssets {
            background,
            music: extras.music,
            ambient_overlay: extras.ambient_overlay,
            logo: extras.logo,
        })
    }

    pub fn decorations(&self) -> Decorations {
        let assets = &self.cfg.assets;
        Decorations {
            music: optional("Music", &assets.music),
            ambient_overlay: optional("Ambient overlay", &assets.ambient_overlay),
            logo: optional("Logo", &assets.logo),
        }
    }

    /// Still for one story scene: generated when a backend is configured,
    /// a placeholder card titled `label` otherwise.
    pub async fn scene_background(&self, prompt: &str, label: &str, scratch: &Path) -> Result<Background> {
        if let (Some(settings), Some(backend)) = (&self.cfg.image_generation, &self.images) {
            match self.generate(settings, backend.as_ref(), prompt).await {
                Ok(path) => {
                    return Ok(Background {
                        path,
                        kind: BackgroundKind::Still,
                        origin: BackgroundOrigin::Generated,
                    });
                }
                Err(e) => warn!("Image for {} gave up, using a placeholder: {}", label, e),
            }
        }
        self.placeholder(label, prompt, scratch.join(format!("placeholder_{label}.png")))
    }

    /// Source image for a story thumbnail: a file in the thumbnails directory
    /// whose name starts with `imageid`, else a generated image.
    pub async fn thumbnail_source(&self, imageid: Option<&str>, prompt: Option<&str>) -> Option<Background> {
        let imageid = imageid.map(str::trim).filter(|id| !id.is_empty());
        if let (Some(id), Some(dir)) = (imageid, &self.cfg.story.thumbnails_dir) {
            match local_thumbnail(dir, id) {
                Some(path) => {
                    info!("Using thumbnail source {}", path.display());
                    return Some(Background {
                        path,
                        kind: BackgroundKind::Still,
                        origin: BackgroundOrigin::Local,
                    });
                }
                None => info!("No thumbnail named {}* in {}, generating one", id, dir.display()),
            }
        }
        let prompt = prompt?;
        let (Some(settings), Some(backend)) = (&self.cfg.image_generation, &self.images) else {
            warn!("No image generation configured, story goes without a thumbnail");
            return None;
        };
        match self.generate(settings, backend.as_ref(), prompt).await {
            Ok(path) => Some(Background {
                path,
                kind: BackgroundKind::Still,
                origin: BackgroundOrigin::Generated,
            }),
            Err(e) => {
                warn!("Thumbnail generation gave up: {}", e);
                None
            }
        }
    }

    async fn background(&self, item: &ContentItem, scratch: &Path) -> Result<Background> {
        if let Some(path) = self.cfg.assets.backgrounds.iter().find(|p| p.exists()) {
            return Ok(Background {
                path: path.clone(),
                kind: kind_of(path),
                origin: BackgroundOrigin::Local,
            });
        }
        if !self.cfg.assets.backgrounds.is_empty() {
            warn!("No configured background exists on disk");
        }

        let prompt = item
            .image_prompt()
            .or_else(|| self.cfg.image_generation.as_ref()?.default_prompt.clone())
            .unwrap_or_else(|| item.title());

        if let (Some(settings), Some(backend)) = (&self.cfg.image_generation, &self.images) {
            match self.generate(settings, backend.as_ref(), &prompt).await {
                Ok(path) => {
                    return Ok(Background {
                        path,
                        kind: BackgroundKind::Still,
                        origin: BackgroundOrigin::Generated,
                    });
                }
                Err(e) => warn!("Image generation gave up, using a placeholder: {}", e),
            }
        }
        self.placeholder(&item.title(), &prompt, scratch.join("placeholder.png"))
    }

    async fn generate(&self, settings: &ImageGenSettings, backend: &dyn ImageBackend, prompt: &str) -> Result<PathBuf> {
        let full_prompt = match &settings.prompt_suffix {
            Some(suffix) => format!("{prompt}{suffix}"),
            None => prompt.to_string(),
        };
        let cache_dir = self.cfg.cache_dir().join("images");
        let stem = format!("{:x}", md5::compute(full_prompt.as_bytes()));
        for ext in ["jpg", "png", "webp"] {
            let cached = cache_dir.join(format!("{stem}.{ext}"));
            if cached.exists() {
                info!("Using cached image {}", cached.display());
                return Ok(cached);
            }
        }

        let width = settings.width.unwrap_or(self.cfg.render.width);
        let height = settings.height.unwrap_or(self.cfg.render.height);
        let policy = RetryPolicy::new(settings.attempts, Duration::from_secs(settings.backoff_secs));
        let prompt_ref = full_prompt.as_str();
        let (bytes, format) = policy
            .run("image generation", move |_| {
                // fresh seed per attempt
                let seed: u32 = rand::rng().random_range(1..=100_000);
                async move {
                    info!("Requesting image (seed {}): {:.60}", seed, prompt_ref);
                    let img = backend.generate(prompt_ref, width, height, seed).await?;
                    let format = sniff(&img).map_err(|reason| PipelineError::asset("generated image", reason))?;
                    Ok::<_, PipelineError>((img.bytes, format))
                }
            })
            .await?;

        fs::create_dir_all(&cache_dir)?;
        let ext = format.extensions_str().first().copied().unwrap_or("img");
        let path = cache_dir.join(format!("{stem}.{ext}"));
        fs::write(&path, &bytes)?;
        info!("Generated image cached at {}", path.display());
        Ok(path)
    }

    fn placeholder(&self, title: &str, prompt: &str, path: PathBuf) -> Result<Background> {
        let font = LoadedFont::first_of(&self.cfg.caption.fonts).ok();
        let excerpt: String = prompt.chars().take(60).collect();
        let img = caption::draw_placeholder(self.cfg.render.width, self.cfg.render.height, title, &excerpt, font.as_ref())?;
        caption::save_png(&img, &path)?;
        Ok(Background {
            path,
            kind: BackgroundKind::Still,
            origin: BackgroundOrigin::Placeholder,
        })
    }
}

/// First readable image in `dir` whose file name starts with `id`.
fn local_thumbnail(dir: &Path, id: &str) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.file_name().is_some_and(|n| n.to_string_lossy().starts_with(id)))
        .collect();
    candidates.sort();
    candidates.into_iter().find(|p| image::image_dimensions(p).is_ok())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::MINIMAL;
    use crate::content::ContentKind;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    pub(crate) struct StubBackend {
        pub calls: Arc<AtomicU32>,
        pub reply: GeneratedImage,
    }

    #[async_trait]
    impl ImageBackend for StubBackend {
        async fn generate(&self, _prompt: &str, _w: u32, _h: u32, _seed: u32) -> Result<GeneratedImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    pub(crate) fn noisy_png() -> Vec<u8> {
        let mut state = 0x1234_5678u32;
        let img = image::RgbImage::from_fn(64, 64, |_, _| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let b = state.to_le_bytes();
            image::Rgb([b[1], b[2], b[3]])
        });
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn generating_config(dir: &Path) -> ChannelConfig {
        let mut cfg = ChannelConfig::from_toml_str(MINIMAL, dir).unwrap();
        cfg.assets.backgrounds.clear();
        cfg.render.width = 64;
        cfg.render.height = 96;
        let mut images: ImageGenSettings = toml::from_str("endpoint = \"http://127.0.0.1:9/generate\"").unwrap();
        images.backoff_secs = 0;
        cfg.image_generation = Some(images);
        cfg
    }

    fn quote() -> ContentItem {
        ContentItem::from_value(ContentKind::Quote, &serde_json::json!({"quote": "A", "author": "B"})).unwrap()
    }

    #[tokio::test]
    async fn first_existing_background_wins() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("assets")).unwrap();
        fs::write(dir.path().join("assets/bg.mp4"), b"x").unwrap();
        let cfg = ChannelConfig::from_toml_str(MINIMAL, dir.path()).unwrap();
        let resolved = AssetResolver::new(&cfg).resolve(&quote(), dir.path()).await.unwrap();
        assert_eq!(resolved.background.path, dir.path().join("assets/bg.mp4"));
        assert_eq!(resolved.background.kind, BackgroundKind::Video);
        assert_eq!(resolved.background.origin, BackgroundOrigin::Local);
        // configured music path does not exist
        assert!(resolved.music.is_none());
    }

    #[tokio::test]
    async fn json_error_body_falls_back_to_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = generating_config(dir.path());
        let calls = Arc::new(AtomicU32::new(0));
        let mut body = br#"{"error":"model overloaded"}"#.to_vec();
        body.resize(2048, b' ');
        let stub = StubBackend {
            calls: calls.clone(),
            reply: GeneratedImage {
                bytes: body,
                content_type: Some("image/jpeg".into()),
            },
        };
        let resolver = AssetResolver::with_backend(&cfg, Box::new(stub));
        let resolved = resolver.resolve(&quote(), dir.path()).await.unwrap();
        assert_eq!(resolved.background.origin, BackgroundOrigin::Placeholder);
        assert_eq!(resolved.background.path, dir.path().join("placeholder.png"));
        assert!(resolved.background.path.exists());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn generated_image_is_cached_by_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = generating_config(dir.path());
        let calls = Arc::new(AtomicU32::new(0));
        let stub = || StubBackend {
            calls: calls.clone(),
            reply: GeneratedImage {
                bytes: noisy_png(),
                content_type: Some("image/png".into()),
            },
        };
        let first = AssetResolver::with_backend(&cfg, Box::new(stub()))
            .resolve(&quote(), dir.path())
            .await
            .unwrap();
        assert_eq!(first.background.origin, BackgroundOrigin::Generated);
        assert_eq!(first.background.path.extension().unwrap(), "png");

        let second = AssetResolver::with_backend(&cfg, Box::new(stub()))
            .resolve(&quote(), dir.path())
            .await
            .unwrap();
        assert_eq!(second.background.path, first.background.path);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn scene_backgrounds_fall_back_to_labelled_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = ChannelConfig::from_toml_str(MINIMAL, dir.path()).unwrap();
        cfg.render.width = 64;
        cfg.render.height = 96;
        let bg = AssetResolver::new(&cfg)
            .scene_background("a lighthouse", "scene_003", dir.path())
            .await
            .unwrap();
        assert_eq!(bg.origin, BackgroundOrigin::Placeholder);
        assert_eq!(bg.path, dir.path().join("placeholder_scene_003.png"));
        assert!(bg.cache_entry().is_none());
    }

    #[tokio::test]
    async fn generated_scene_background_reports_its_cache_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = generating_config(dir.path());
        let stub = StubBackend {
            calls: Arc::new(AtomicU32::new(0)),
            reply: GeneratedImage {
                bytes: noisy_png(),
                content_type: Some("image/png".into()),
            },
        };
        let bg = AssetResolver::with_backend(&cfg, Box::new(stub))
            .scene_background("a lighthouse", "scene_001", dir.path())
            .await
            .unwrap();
        let entry = bg.cache_entry().unwrap();
        assert!(entry.starts_with(cfg.cache_dir().join("images")));
        assert!(entry.exists());
    }

    #[tokio::test]
    async fn thumbnail_source_prefers_a_local_file_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let thumbs = dir.path().join("thumbnails");
        fs::create_dir_all(&thumbs).unwrap();
        fs::write(thumbs.join("arch01_broken.png"), b"nope").unwrap();
        fs::write(thumbs.join("arch01_v2.png"), noisy_png()).unwrap();
        let mut cfg = generating_config(dir.path());
        cfg.story.thumbnails_dir = Some(thumbs.clone());
        let calls = Arc::new(AtomicU32::new(0));
        let stub = StubBackend {
            calls: calls.clone(),
            reply: GeneratedImage {
                bytes: noisy_png(),
                content_type: None,
            },
        };
        let resolver = AssetResolver::with_backend(&cfg, Box::new(stub));

        let local = resolver.thumbnail_source(Some("arch01"), Some("archer")).await.unwrap();
        assert_eq!(local.path, thumbs.join("arch01_v2.png"));
        assert_eq!(local.origin, BackgroundOrigin::Local);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let generated = resolver.thumbnail_source(Some("zzz"), Some("archer")).await.unwrap();
        assert_eq!(generated.origin, BackgroundOrigin::Generated);
        assert!(resolver.thumbnail_source(None, None).await.is_none());
    }

    #[test]
    fn sniff_rejects_disguised_errors() {
        let small = GeneratedImage {
            bytes: vec![0xFF, 0xD8, 0xFF, 0xE0],
            content_type: None,
        };
        assert!(sniff(&small).unwrap_err().contains("bytes"));

        let mut js = b"[object Object]".to_vec();
        js.resize(4096, b' ');
        assert!(sniff(&GeneratedImage { bytes: js, content_type: None }).is_err());

        let png = GeneratedImage {
            bytes: noisy_png(),
            content_type: Some("application/json".into()),
        };
        assert!(sniff(&png).unwrap_err().contains("content-type"));
    }

    #[test]
    fn sniff_accepts_real_png() {
        let png = GeneratedImage {
            bytes: noisy_png(),
            content_type: None,
        };
        assert_eq!(sniff(&png).unwrap(), ImageFormat::Png);
    }
}
