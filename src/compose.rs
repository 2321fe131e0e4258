use async_trait::async_trait;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::assets::{Background, BackgroundKind, ResolvedAssets};
use crate::config::{BackgroundFit, ChannelConfig, RenderSettings};
use crate::error::{PipelineError, Result};
use crate::filtergraph::{AudioFilter, FilterGraph, Fit, InputSpec, Position, RenderedGraph, VideoFilter, VideoLabel};
use crate::media::{self, Toolchain, stderr_excerpt};
use crate::subtitle;

/// Ken Burns direction for a still background.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Motion {
    /// Zoom from 1.0 up by the given amount.
    ZoomIn(f64),
    /// Zoom from 1.0 plus the amount back down to 1.0.
    ZoomOut(f64),
}

impl Motion {
    /// zoompan `z` expression spread over `frames` output frames.
    pub fn expression(&self, frames: u64) -> String {
        match self {
            Motion::ZoomIn(z) => format!("1.0+{z}*on/{frames}"),
            Motion::ZoomOut(z) => format!("{}-{z}*on/{frames}", 1.0 + z),
        }
    }
}

/// Everything one ffmpeg invocation needs.
#[derive(Debug, Clone)]
pub struct RenderSpec {
    pub background: Background,
    pub motion: Motion,
    pub ambient_overlay: Option<PathBuf>,
    pub logo: Option<PathBuf>,
    pub caption: Option<PathBuf>,
    pub subtitles: Option<PathBuf>,
    pub narration: PathBuf,
    pub narration_duration: f64,
    pub music: Option<PathBuf>,
    pub duration: f64,
    pub output: PathBuf,
}

/// Narration plus padding, never below the floor.
pub fn target_duration(narration: f64, render: &RenderSettings) -> f64 {
    (narration + render.padding).max(render.min_duration)
}

impl RenderSpec {
    pub fn new(
        assets: ResolvedAssets,
        caption: Option<PathBuf>,
        subtitles: Option<PathBuf>,
        narration: PathBuf,
        narration_duration: f64,
        output: PathBuf,
        render: &RenderSettings,
    ) -> Self {
        Self {
            background: assets.background,
            motion: Motion::ZoomIn(render.ken_burns.zoom),
            ambient_overlay: assets.ambient_overlay,
            logo: assets.logo,
            caption,
            subtitles,
            narration,
            narration_duration,
            music: assets.music,
            duration: target_duration(narration_duration, render),
            output,
        }
    }

    /// One story segment: background, narration and subtitles only. Music,
    /// overlays and the logo are added once when the segments are joined.
    pub fn segment(
        background: Background,
        motion: Motion,
        subtitles: Option<PathBuf>,
        narration: PathBuf,
        narration_duration: f64,
        output: PathBuf,
        render: &RenderSettings,
    ) -> Self {
        Self {
            background,
            motion,
            ambient_overlay: None,
            logo: None,
            caption: None,
            subtitles,
            narration,
            narration_duration,
            music: None,
            duration: narration_duration + render.padding,
            output,
        }
    }
}

/// Finished segments joined back to back and decorated in one encode.
#[derive(Debug, Clone)]
pub struct ConcatSpec {
    pub segments: Vec<PathBuf>,
    /// Where the concat demuxer list is written.
    pub list: PathBuf,
    pub ambient_overlay: Option<PathBuf>,
    pub logo: Option<PathBuf>,
    pub music: Option<PathBuf>,
    /// Sum of the segment durations.
    pub duration: f64,
    pub output: PathBuf,
}

/// Concat demuxer list. Quotes are closed, escaped and reopened.
pub fn concat_list(segments: &[PathBuf]) -> String {
    segments
        .iter()
        .map(|p| {
            let path = p.to_string_lossy().replace('\\', "/").replace('\'', r"'\''");
            format!("file '{path}'\n")
        })
        .collect()
}

/// Intermediate size for zoom/pan so sub-pixel motion survives the final downscale.
pub fn supersample(width: u32, height: u32) -> (u32, u32) {
    const MAX_WIDTH: f64 = 4800.0;
    let factor = if width >= 3840 { 1.1 } else { 1.25 };
    let w = (width as f64 * factor).min(MAX_WIDTH.max(width as f64));
    let h = w * height as f64 / width as f64;
    let even = |v: f64| {
        let v = (v - 1e-6).ceil() as u32;
        v + (v % 2)
    };
    (even(w), even(h))
}

fn is_still(path: &Path) -> bool {
    matches!(
        path.extension().map(|e| e.to_string_lossy().to_ascii_lowercase()).as_deref(),
        Some("png" | "jpg" | "jpeg" | "webp" | "bmp")
    )
}

/// Ambient overlay and logo on top of `video`.
fn decorate(
    g: &mut FilterGraph,
    mut video: VideoLabel,
    ambient: Option<&Path>,
    logo: Option<&Path>,
    duration: f64,
    cfg: &ChannelConfig,
) -> VideoLabel {
    let (w, h) = (cfg.render.width, cfg.render.height);
    let assets = &cfg.assets;
    if let Some(ambient) = ambient {
        let input = if is_still(ambient) {
            InputSpec::Still {
                path: ambient.to_path_buf(),
                duration,
            }
        } else {
            InputSpec::Looped { path: ambient.to_path_buf() }
        };
        let layer = g.video_input(input);
        let layer = g.video(
            layer,
            &[
                VideoFilter::Scale { width: w as i64, height: h as i64, fit: None, flags: None },
                VideoFilter::Format("rgba"),
                VideoFilter::Opacity(assets.ambient_opacity),
            ],
        );
        video = g.overlay(video, layer, Position::Origin, true);
    }

    if let Some(logo) = logo {
        let layer = g.video_input(InputSpec::Once { path: logo.to_path_buf() });
        let layer = g.video(
            layer,
            &[VideoFilter::Scale { width: assets.logo_width as i64, height: -1, fit: None, flags: None }],
        );
        video = g.overlay(video, layer, Position::TopRight(assets.logo_padding), false);
    }
    video
}

pub fn build_graph(spec: &RenderSpec, cfg: &ChannelConfig) -> RenderedGraph {
    let render = &cfg.render;
    let (w, h, fps) = (render.width, render.height, render.fps);
    let assets = &cfg.assets;
    let mut g = FilterGraph::new();

    let mut video = match spec.background.kind {
        BackgroundKind::Still if render.ken_burns.enabled => {
            let bg = g.video_input(InputSpec::Still {
                path: spec.background.path.clone(),
                duration: spec.duration,
            });
            let (rw, rh) = supersample(w, h);
            let frames = (spec.duration * fps as f64 - 1e-6).ceil().max(1.0) as u64;
            g.video(
                bg,
                &[
                    VideoFilter::Fps(fps),
                    VideoFilter::Scale { width: rw as i64, height: rh as i64, fit: Some(Fit::Increase), flags: None },
                    VideoFilter::Crop { width: rw, height: rh },
                    // zoom from the output frame index so it cannot drift
                    VideoFilter::ZoomPan {
                        zoom: spec.motion.expression(frames),
                        width: rw,
                        height: rh,
                        fps,
                    },
                    VideoFilter::SetPts("N/FRAME_RATE/TB"),
                    VideoFilter::Scale { width: w as i64, height: h as i64, fit: None, flags: Some("lanczos") },
                    VideoFilter::SetSar,
                ],
            )
        }
        kind => {
            let bg = g.video_input(match kind {
                BackgroundKind::Still => InputSpec::Still {
                    path: spec.background.path.clone(),
                    duration: spec.duration,
                },
                BackgroundKind::Video => InputSpec::Looped {
                    path: spec.background.path.clone(),
                },
            });
            let framing = match assets.background_fit {
                BackgroundFit::Cover => [
                    VideoFilter::Scale { width: w as i64, height: h as i64, fit: Some(Fit::Increase), flags: None },
                    VideoFilter::Crop { width: w, height: h },
                ],
                BackgroundFit::Contain => [
                    VideoFilter::Scale { width: w as i64, height: h as i64, fit: Some(Fit::Decrease), flags: None },
                    VideoFilter::Pad { width: w, height: h, color: "black".into() },
                ],
            };
            let mut chain = framing.to_vec();
            chain.extend([VideoFilter::SetSar, VideoFilter::Fps(fps)]);
            g.video(bg, &chain)
        }
    };

    if assets.background_opacity < 1.0 {
        let base = g.video_input(InputSpec::Color {
            color: "black".into(),
            width: w,
            height: h,
            fps,
            duration: spec.duration,
        });
        let dimmed = g.video(
            video,
            &[VideoFilter::Format("yuva420p"), VideoFilter::Opacity(assets.background_opacity)],
        );
        video = g.overlay(base, dimmed, Position::Origin, false);
    }

    video = decorate(&mut g, video, spec.ambient_overlay.as_deref(), spec.logo.as_deref(), spec.duration, cfg);

    if let Some(caption) = &spec.caption {
        let caption = g.video_input(InputSpec::Once { path: caption.clone() });
        video = g.overlay(video, caption, Position::Center, false);
    }

    if let Some(srt) = &spec.subtitles {
        video = g.video(
            video,
            &[VideoFilter::Subtitles {
                path: srt.clone(),
                force_style: Some(subtitle::force_style(&cfg.subtitles)),
            }],
        );
    }

    let voice = g.audio_input(InputSpec::Once { path: spec.narration.clone() });
    let voice = g.audio(
        voice,
        &[AudioFilter::Volume(assets.narration_volume), AudioFilter::Apad(spec.duration)],
    );
    let mut tracks = vec![voice];
    if let Some(music) = &spec.music {
        let bgm = g.audio_input(InputSpec::Looped { path: music.clone() });
        tracks.push(g.audio(bgm, &[AudioFilter::Volume(assets.music_volume)]));
    }
    // the padded narration is first, so the mix lasts the whole clip
    let audio = g.amix(tracks);

    g.finish(Some(video), Some(audio))
}

fn encode_args(args: &mut Vec<OsString>, render: &RenderSettings, duration: f64) {
    for (flag, value) in [
        ("-c:v", render.codec.clone()),
        ("-preset", render.preset.clone()),
        ("-crf", render.crf.to_string()),
        ("-pix_fmt", render.pixel_format.clone()),
        ("-r", render.fps.to_string()),
        ("-c:a", render.audio_codec.clone()),
        ("-b:a", "192k".to_string()),
        ("-t", format!("{duration:.3}")),
        ("-movflags", "+faststart".to_string()),
    ] {
        args.push(flag.into());
        args.push(value.into());
    }
}

/// Full ffmpeg argument list. Length comes from `-t`; there is no `-shortest`.
pub fn ffmpeg_args(spec: &RenderSpec, cfg: &ChannelConfig) -> Vec<OsString> {
    let graph = build_graph(spec, cfg);
    let mut args: Vec<OsString> = vec!["-y".into(), "-hide_banner".into(), "-loglevel".into(), "error".into()];
    args.extend(graph.args());
    encode_args(&mut args, &cfg.render, spec.duration);
    args.push(spec.output.as_os_str().to_owned());
    args
}

pub fn build_concat_graph(spec: &ConcatSpec, cfg: &ChannelConfig) -> RenderedGraph {
    let mut g = FilterGraph::new();
    let (video, voice) = g.av_input(InputSpec::ConcatList { path: spec.list.clone() });
    let video = decorate(&mut g, video, spec.ambient_overlay.as_deref(), spec.logo.as_deref(), spec.duration, cfg);
    let audio = match &spec.music {
        Some(music) => {
            let bgm = g.audio_input(InputSpec::Looped { path: music.clone() });
            let bgm = g.audio(bgm, &[AudioFilter::Volume(cfg.assets.music_volume)]);
            g.amix(vec![voice, bgm])
        }
        None => voice,
    };
    g.finish(Some(video), Some(audio))
}

pub fn concat_args(spec: &ConcatSpec, cfg: &ChannelConfig) -> Vec<OsString> {
    let graph = build_concat_graph(spec, cfg);
    let mut args: Vec<OsString> = vec!["-y".into(), "-hide_banner".into(), "-loglevel".into(), "error".into()];
    args.extend(graph.args());
    encode_args(&mut args, &cfg.render, spec.duration);
    args.push(spec.output.as_os_str().to_owned());
    args
}

/// Turns a [`RenderSpec`] into a finished video file.
#[async_trait]
pub trait Compose: Send + Sync {
    async fn compose(&self, spec: &RenderSpec) -> Result<PathBuf>;

    /// Joins finished segments into one video.
    async fn concat(&self, spec: &ConcatSpec) -> Result<PathBuf>;
}

pub struct FfmpegComposer {
    cfg: ChannelConfig,
    tools: Toolchain,
}

impl FfmpegComposer {
    pub fn new(cfg: &ChannelConfig, tools: &Toolchain) -> Self {
        Self {
            cfg: cfg.clone(),
            tools: tools.clone(),
        }
    }

    fn fail(&self, output: &Path, status: String, stderr: &str) -> PipelineError {
        if output.exists() {
            match fs::remove_file(output) {
                Ok(()) => info!("Removed partial output {}", output.display()),
                Err(e) => warn!("Could not remove partial output {}: {}", output.display(), e),
            }
        }
        let excerpt = stderr_excerpt(stderr, 10);
        error!("ffmpeg failed ({}):\n{}", status, excerpt);
        PipelineError::CompositionFailed { status, stderr: excerpt }
    }
}

#[async_trait]
impl Compose for FfmpegComposer {
    async fn compose(&self, spec: &RenderSpec) -> Result<PathBuf> {
        let render = &self.cfg.render;
        let args = ffmpeg_args(spec, &self.cfg);
        info!(
            "Composing {:.2}s video ({:.2}s narration) into {}",
            spec.duration,
            spec.narration_duration,
            spec.output.display()
        );
        let deadline = Duration::from_secs(render.timeout_secs);
        if let Err(e) = media::run_tool(&self.tools.ffmpeg, &args, deadline).await {
            return Err(self.fail(&spec.output, e.status, &e.stderr));
        }
        match fs::metadata(&spec.output) {
            Ok(m) if m.len() > 0 => {}
            _ => return Err(self.fail(&spec.output, "empty output".into(), "")),
        }
        match media::probe_duration(&self.tools, &spec.output).await {
            Ok(d) if d + 0.05 < spec.narration_duration => {
                return Err(self.fail(
                    &spec.output,
                    format!("output is {d:.2}s, shorter than the {:.2}s narration", spec.narration_duration),
                    "",
                ));
            }
            Ok(d) => info!("Composed {} ({:.2}s)", spec.output.display(), d),
            Err(e) => warn!("Could not verify output duration: {}", e),
        }
        Ok(spec.output.clone())
    }

    async fn concat(&self, spec: &ConcatSpec) -> Result<PathBuf> {
        if spec.segments.is_empty() {
            return Err(PipelineError::CompositionFailed {
                status: "no segments".into(),
                stderr: String::new(),
            });
        }
        fs::write(&spec.list, concat_list(&spec.segments))?;
        let args = concat_args(spec, &self.cfg);
        info!(
            "Joining {} segment(s), {:.2}s, into {}",
            spec.segments.len(),
            spec.duration,
            spec.output.display()
        );
        let deadline = Duration::from_secs(self.cfg.render.timeout_secs);
        if let Err(e) = media::run_tool(&self.tools.ffmpeg, &args, deadline).await {
            return Err(self.fail(&spec.output, e.status, &e.stderr));
        }
        match fs::metadata(&spec.output) {
            Ok(m) if m.len() > 0 => {}
            _ => return Err(self.fail(&spec.output, "empty output".into(), "")),
        }
        Ok(spec.output.clone())
    }
}
