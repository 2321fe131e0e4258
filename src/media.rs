use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use regex::Regex;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::ToolSettings;
use crate::error::{PipelineError, Result};

/// Resolved locations of the external media binaries.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Toolchain {
    /// Configured paths win, then `PATH` lookup, then the bare name.
    pub fn discover(settings: &ToolSettings) -> Self {
        let find = |configured: &Option<PathBuf>, name: &str| {
            configured.clone().unwrap_or_else(|| {
                which::which(name).unwrap_or_else(|_| {
                    warn!("{} not found on PATH, relying on the bare name", name);
                    PathBuf::from(name)
                })
            })
        };
        Self {
            ffmpeg: find(&settings.ffmpeg, "ffmpeg"),
            ffprobe: find(&settings.ffprobe, "ffprobe"),
        }
    }
}

#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// A subprocess that did not spawn, ran past its deadline or exited non-zero.
#[derive(Debug, Clone)]
pub struct ToolFailure {
    pub status: String,
    pub stderr: String,
}

impl std::fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status, stderr_excerpt(&self.stderr, 5))
    }
}

/// Runs `program` to completion and returns its output whatever the exit status.
/// The child is killed when the deadline passes.
pub async fn capture<I, S>(program: &Path, args: I, deadline: Duration) -> std::result::Result<ToolOutput, ToolFailure>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    debug!("exec: {:?}", cmd.as_std());

    let child = cmd.spawn().map_err(|e| ToolFailure {
        status: format!("could not start {}: {}", program.display(), e),
        stderr: String::new(),
    })?;
    match timeout(deadline, child.wait_with_output()).await {
        Ok(Ok(out)) => Ok(ToolOutput {
            status: out.status,
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        }),
        Ok(Err(e)) => Err(ToolFailure {
            status: format!("waiting on {} failed: {}", program.display(), e),
            stderr: String::new(),
        }),
        Err(_) => Err(ToolFailure {
            status: format!("{} timed out after {:?}", program.display(), deadline),
            stderr: String::new(),
        }),
    }
}

/// Like [`capture`] but a non-zero exit is a failure.
pub async fn run_tool<I, S>(program: &Path, args: I, deadline: Duration) -> std::result::Result<ToolOutput, ToolFailure>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let out = capture(program, args, deadline).await?;
    if !out.status.success() {
        return Err(ToolFailure {
            status: out.status.to_string(),
            stderr: out.stderr,
        });
    }
    Ok(out)
}

/// First and last `n` non-empty lines of a tool's stderr.
pub fn stderr_excerpt(stderr: &str, n: usize) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() <= n * 2 {
        return lines.join("\n");
    }
    let mut out = lines[..n].join("\n");
    out.push_str(&format!("\n... ({} lines omitted) ...\n", lines.len() - n * 2));
    out.push_str(&lines[lines.len() - n..].join("\n"));
    out
}

const PROBE_DEADLINE: Duration = Duration::from_secs(60);

/// Measured duration of a media file in seconds.
///
/// Tries ffprobe, then the WAV header, then the `Duration:` line that
/// `ffmpeg -i` prints.
pub async fn probe_duration(tools: &Toolchain, path: &Path) -> Result<f64> {
    let args: [&OsStr; 7] = [
        "-v".as_ref(),
        "error".as_ref(),
        "-show_entries".as_ref(),
        "format=duration".as_ref(),
        "-of".as_ref(),
        "default=noprint_wrappers=1:nokey=1".as_ref(),
        path.as_os_str(),
    ];
    match run_tool(&tools.ffprobe, args, PROBE_DEADLINE).await {
        Ok(out) => match out.stdout.trim().parse::<f64>() {
            Ok(d) if d > 0.0 => return Ok(d),
            _ => debug!("ffprobe gave no usable duration for {}", path.display()),
        },
        Err(e) => debug!("ffprobe failed for {}: {}", path.display(), e),
    }

    if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("wav")) {
        match wav_duration_seconds(path) {
            Ok(d) if d > 0.0 => return Ok(d),
            Ok(_) => {}
            Err(e) => debug!("WAV header read failed for {}: {}", path.display(), e),
        }
    }

    let args: [&OsStr; 2] = ["-i".as_ref(), path.as_os_str()];
    let reason = match capture(&tools.ffmpeg, args, PROBE_DEADLINE).await {
        Ok(out) => match parse_ffmpeg_duration(&out.stderr) {
            Some(d) => return Ok(d),
            None => "no Duration line in ffmpeg output".to_string(),
        },
        Err(e) => e.to_string(),
    };
    Err(PipelineError::Probe {
        path: path.to_path_buf(),
        reason,
    })
}

pub fn wav_duration_seconds(path: &Path) -> Result<f64> {
    let reader = WavReader::open(path).map_err(|e| PipelineError::Probe {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let spec = reader.spec();
    let samples = reader.len();
    let frames = samples as f64 / spec.channels as f64;
    Ok(frames / spec.sample_rate as f64)
}

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("static duration regex")
    })
}

pub fn parse_ffmpeg_duration(stderr: &str) -> Option<f64> {
    let caps = duration_regex().captures(stderr)?;
    let h: f64 = caps[1].parse().ok()?;
    let m: f64 = caps[2].parse().ok()?;
    let s: f64 = caps[3].parse().ok()?;
    Some(h * 3600.0 + m * 60.0 + s)
}

/// Writes `seconds` of mono 16-bit silence.
pub fn write_silence(path: &Path, seconds: f64, sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let to_io = |e: hound::Error| PipelineError::Io(std::io::Error::other(e.to_string()));
    let mut writer = WavWriter::create(path, spec).map_err(to_io)?;
    let frames = (seconds.max(0.0) * sample_rate as f64).round() as u64;
    for _ in 0..frames {
        writer.write_sample(0i16).map_err(to_io)?;
    }
    writer.finalize().map_err(to_io)?;
    debug!("Wrote {:.2}s of silence to {}", seconds, path.display());
    Ok(())
}
