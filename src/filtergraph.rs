//! Typed builder for ffmpeg `-filter_complex` graphs.
//!
//! Every filter output is a [`VideoLabel`] or [`AudioLabel`] that is moved
//! into the next node, so a pad cannot be consumed twice or left dangling
//! without the compiler noticing.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;

/// A video pad. Not `Clone`: consuming it is the only way to use it.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct VideoLabel(Pad);

/// An audio pad. Not `Clone`.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct AudioLabel(Pad);

#[derive(Debug, PartialEq, Eq)]
enum Pad {
    /// Stream of an input file, e.g. `0:v`.
    Input(String),
    /// Output of a filter chain, e.g. `v3`.
    Node(String),
}

impl Pad {
    fn in_graph(&self) -> String {
        match self {
            Pad::Input(s) | Pad::Node(s) => format!("[{s}]"),
        }
    }

    fn map_target(&self) -> String {
        match self {
            Pad::Input(s) => s.clone(),
            Pad::Node(s) => format!("[{s}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputSpec {
    /// Single image repeated for `duration` seconds.
    Still { path: PathBuf, duration: f64 },
    /// Media looped forever; the output `-t` bounds it.
    Looped { path: PathBuf },
    Once { path: PathBuf },
    /// Concat demuxer list; yields the joined streams of every listed file.
    ConcatList { path: PathBuf },
    /// Solid colour canvas from the lavfi device.
    Color {
        color: String,
        width: u32,
        height: u32,
        fps: u32,
        duration: f64,
    },
}

impl InputSpec {
    fn push_args(&self, out: &mut Vec<OsString>) {
        match self {
            InputSpec::Still { path, duration } => {
                out.extend(["-loop".into(), "1".into(), "-t".into(), secs(*duration).into(), "-i".into()]);
                out.push(path.clone().into_os_string());
            }
            InputSpec::Looped { path } => {
                out.extend(["-stream_loop".into(), "-1".into(), "-i".into()]);
                out.push(path.clone().into_os_string());
            }
            InputSpec::Once { path } => {
                out.push("-i".into());
                out.push(path.clone().into_os_string());
            }
            InputSpec::ConcatList { path } => {
                out.extend(["-f".into(), "concat".into(), "-safe".into(), "0".into(), "-i".into()]);
                out.push(path.clone().into_os_string());
            }
            InputSpec::Color {
                color,
                width,
                height,
                fps,
                duration,
            } => {
                out.extend([
                    "-f".into(),
                    "lavfi".into(),
                    "-t".into(),
                    secs(*duration).into(),
                    "-i".into(),
                    format!("color=c={color}:s={width}x{height}:r={fps}").into(),
                ]);
            }
        }
    }
}

fn secs(v: f64) -> String {
    format!("{v:.3}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    /// Cover the box, cropping afterwards.
    Increase,
    /// Fit inside the box, padding afterwards.
    Decrease,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VideoFilter {
    /// `-1` keeps the aspect ratio for that side.
    Scale {
        width: i64,
        height: i64,
        fit: Option<Fit>,
        flags: Option<&'static str>,
    },
    /// Centred crop.
    Crop { width: u32, height: u32 },
    /// Centred pad.
    Pad { width: u32, height: u32, color: String },
    SetSar,
    Fps(u32),
    Format(&'static str),
    /// Multiplies the alpha channel.
    Opacity(f32),
    /// Centre zoom driven by the output frame index `on`.
    ZoomPan {
        zoom: String,
        width: u32,
        height: u32,
        fps: u32,
    },
    SetPts(&'static str),
    Subtitles {
        path: PathBuf,
        force_style: Option<String>,
    },
}

impl fmt::Display for VideoFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoFilter::Scale {
                width,
                height,
                fit,
                flags,
            } => {
                write!(f, "scale={width}:{height}")?;
                match fit {
                    Some(Fit::Increase) => write!(f, ":force_original_aspect_ratio=increase")?,
                    Some(Fit::Decrease) => write!(f, ":force_original_aspect_ratio=decrease")?,
                    None => {}
                }
                if let Some(flags) = flags {
                    write!(f, ":flags={flags}")?;
                }
                Ok(())
            }
            VideoFilter::Crop { width, height } => write!(f, "crop={width}:{height}"),
            VideoFilter::Pad { width, height, color } => {
                write!(f, "pad={width}:{height}:(ow-iw)/2:(oh-ih)/2:color={color}")
            }
            VideoFilter::SetSar => write!(f, "setsar=1"),
            VideoFilter::Fps(fps) => write!(f, "fps={fps}"),
            VideoFilter::Format(fmt_name) => write!(f, "format={fmt_name}"),
            VideoFilter::Opacity(alpha) => write!(f, "colorchannelmixer=aa={alpha}"),
            VideoFilter::ZoomPan {
                zoom,
                width,
                height,
                fps,
            } => write!(
                f,
                "zoompan=z='{zoom}':d=1:x='iw/2-(iw/zoom/2)':y='ih/2-(ih/zoom/2)':s={width}x{height}:fps={fps}"
            ),
            VideoFilter::SetPts(expr) => write!(f, "setpts={expr}"),
            VideoFilter::Subtitles { path, force_style } => {
                write!(f, "subtitles='{}'", escape_filter_path(&path.to_string_lossy()))?;
                if let Some(style) = force_style {
                    write!(f, ":force_style='{}'", style.replace('\'', ""))?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AudioFilter {
    Volume(f32),
    /// Pads with silence until the stream lasts `whole_dur` seconds.
    Apad(f64),
    Aresample(u32),
    Aformat { sample_rate: u32, mono: bool },
}

impl fmt::Display for AudioFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioFilter::Volume(v) => write!(f, "volume={v}"),
            AudioFilter::Apad(d) => write!(f, "apad=whole_dur={}", secs(*d)),
            AudioFilter::Aresample(r) => write!(f, "aresample={r}"),
            AudioFilter::Aformat { sample_rate, mono } => write!(
                f,
                "aformat=sample_fmts=s16:sample_rates={sample_rate}:channel_layouts={}",
                if *mono { "mono" } else { "stereo" }
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Origin,
    Center,
    /// Top-right corner inset by the same margin on both axes.
    TopRight(u32),
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Origin => write!(f, "0:0"),
            Position::Center => write!(f, "(W-w)/2:(H-h)/2"),
            Position::TopRight(m) => write!(f, "W-w-{m}:{m}"),
        }
    }
}

/// Escapes a path for use inside a single-quoted filter argument.
///
/// The graph parser strips the quotes and the option parser then unescapes
/// `\:` and `\'`. A quote cannot appear inside quotes at the graph level, so
/// it closes the quoted run, emits an escaped backslash and quote, and reopens.
pub fn escape_filter_path(path: &str) -> String {
    path.replace('\\', "/").replace(':', "\\:").replace('\'', r"'\\\''")
}

#[derive(Debug, Default)]
pub struct FilterGraph {
    inputs: Vec<InputSpec>,
    chains: Vec<String>,
    next: usize,
}

impl FilterGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_input(&mut self, spec: InputSpec) -> usize {
        self.inputs.push(spec);
        self.inputs.len() - 1
    }

    pub fn video_input(&mut self, spec: InputSpec) -> VideoLabel {
        let idx = self.add_input(spec);
        VideoLabel(Pad::Input(format!("{idx}:v")))
    }

    pub fn audio_input(&mut self, spec: InputSpec) -> AudioLabel {
        let idx = self.add_input(spec);
        AudioLabel(Pad::Input(format!("{idx}:a")))
    }

    /// An input whose video and audio streams are both used.
    pub fn av_input(&mut self, spec: InputSpec) -> (VideoLabel, AudioLabel) {
        let idx = self.add_input(spec);
        (
            VideoLabel(Pad::Input(format!("{idx}:v"))),
            AudioLabel(Pad::Input(format!("{idx}:a"))),
        )
    }

    fn fresh(&mut self, prefix: char) -> Pad {
        let name = format!("{prefix}{}", self.next);
        self.next += 1;
        Pad::Node(name)
    }

    fn push_chain(&mut self, inputs: &[&Pad], body: String, out: &Pad) {
        let ins: String = inputs.iter().map(|p| p.in_graph()).collect();
        self.chains.push(format!("{ins}{body}{}", out.in_graph()));
    }

    /// Applies `filters` in order. An empty list returns the label unchanged.
    pub fn video(&mut self, input: VideoLabel, filters: &[VideoFilter]) -> VideoLabel {
        if filters.is_empty() {
            return input;
        }
        let body = filters.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(",");
        let out = self.fresh('v');
        self.push_chain(&[&input.0], body, &out);
        VideoLabel(out)
    }

    pub fn audio(&mut self, input: AudioLabel, filters: &[AudioFilter]) -> AudioLabel {
        if filters.is_empty() {
            return input;
        }
        let body = filters.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(",");
        let out = self.fresh('a');
        self.push_chain(&[&input.0], body, &out);
        AudioLabel(out)
    }

    /// Draws `top` over `base`. With `shortest` the result ends with the shorter input.
    pub fn overlay(&mut self, base: VideoLabel, top: VideoLabel, at: Position, shortest: bool) -> VideoLabel {
        let mut body = format!("overlay={at}");
        if shortest {
            body.push_str(":shortest=1");
        }
        let out = self.fresh('v');
        self.push_chain(&[&base.0, &top.0], body, &out);
        VideoLabel(out)
    }

    /// Mixes without amix's per-input attenuation so configured volumes hold.
    /// The mix ends with the first input.
    pub fn amix(&mut self, inputs: Vec<AudioLabel>) -> AudioLabel {
        let mut inputs = inputs;
        if inputs.len() == 1 {
            if let Some(only) = inputs.pop() {
                return only;
            }
        }
        let pads: Vec<&Pad> = inputs.iter().map(|l| &l.0).collect();
        let body = format!(
            "amix=inputs={}:duration=first:dropout_transition=0:normalize=0",
            pads.len()
        );
        let out = self.fresh('a');
        self.push_chain(&pads, body, &out);
        AudioLabel(out)
    }

    /// Joins audio streams back to back.
    pub fn concat_audio(&mut self, inputs: Vec<AudioLabel>) -> AudioLabel {
        let mut inputs = inputs;
        if inputs.len() == 1 {
            if let Some(only) = inputs.pop() {
                return only;
            }
        }
        let pads: Vec<&Pad> = inputs.iter().map(|l| &l.0).collect();
        let body = format!("concat=n={}:v=0:a=1", pads.len());
        let out = self.fresh('a');
        self.push_chain(&pads, body, &out);
        AudioLabel(out)
    }

    /// Seals the graph. The given labels become the `-map` targets.
    pub fn finish(self, video: Option<VideoLabel>, audio: Option<AudioLabel>) -> RenderedGraph {
        let mut maps = Vec::new();
        if let Some(v) = video {
            maps.push(v.0.map_target());
        }
        if let Some(a) = audio {
            maps.push(a.0.map_target());
        }
        RenderedGraph {
            inputs: self.inputs,
            filter: self.chains.join(";"),
            maps,
        }
    }
}

/// A finished graph ready to be turned into ffmpeg arguments.
#[derive(Debug, Clone)]
pub struct RenderedGraph {
    pub inputs: Vec<InputSpec>,
    pub filter: String,
    pub maps: Vec<String>,
}

impl RenderedGraph {
    /// `-i ...` groups, the filter graph and the `-map` flags.
    pub fn args(&self) -> Vec<OsString> {
        let mut out = Vec::new();
        for input in &self.inputs {
            input.push_args(&mut out);
        }
        if !self.filter.is_empty() {
            out.push("-filter_complex".into());
            out.push(self.filter.clone().into());
        }
        for m in &self.maps {
            out.push("-map".into());
            out.push(m.into());
        }
        out
    }
}

impl fmt::Display for RenderedGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.filter)
    }
}
