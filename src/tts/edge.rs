use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{SpeechBackend, SYNTH_DEADLINE};
use crate::config::TtsSettings;
use crate::error::{PipelineError, Result};
use crate::media;
use crate::subtitle::{self, WordTiming};

/// Cloud neural voices through the `edge-tts` client. The subtitle file it
/// writes next to the audio supplies the timings.
pub struct EdgeBackend {
    binary: PathBuf,
    rate: Option<String>,
    pitch: Option<String>,
}

impl EdgeBackend {
    pub fn new(settings: &TtsSettings) -> Self {
        Self {
            binary: settings.binary.clone().unwrap_or_else(|| PathBuf::from("edge-tts")),
            rate: settings.rate.clone(),
            pitch: settings.pitch.clone(),
        }
    }

    fn args(&self, text: &str, voice: &str, out: &Path, cues: &Path) -> Vec<String> {
        let mut args = vec!["--voice".to_string(), voice.to_string(), "--text".into(), text.to_string()];
        // `=` keeps values such as `-10%` from parsing as flags
        if let Some(rate) = &self.rate {
            args.push(format!("--rate={rate}"));
        }
        if let Some(pitch) = &self.pitch {
            args.push(format!("--pitch={pitch}"));
        }
        args.push("--write-media".into());
        args.push(out.to_string_lossy().into_owned());
        args.push("--write-subtitles".into());
        args.push(cues.to_string_lossy().into_owned());
        args
    }
}

/// Turns word- or sentence-level cues into word timings.
pub fn cues_to_timings(raw: &str) -> Vec<WordTiming> {
    subtitle::parse_cues(raw)
        .into_iter()
        .flat_map(|(start, end, text)| subtitle::distribute_words(&text, start, end))
        .collect()
}

#[async_trait]
impl SpeechBackend for EdgeBackend {
    fn name(&self) -> &'static str {
        "edge-tts"
    }

    fn extension(&self) -> &'static str {
        "mp3"
    }

    async fn synthesize(&self, text: &str, voice: &str, out: &Path) -> Result<Option<Vec<WordTiming>>> {
        let cues = out.with_extension("vtt");
        let args = self.args(text, voice, out, &cues);
        media::run_tool(&self.binary, &args, SYNTH_DEADLINE)
            .await
            .map_err(|e| PipelineError::synthesis("edge-tts", e.to_string()))?;

        let timings = match fs::read_to_string(&cues) {
            Ok(raw) => {
                let t = cues_to_timings(&raw);
                debug!("edge-tts reported {} timed words", t.len());
                (!t.is_empty()).then_some(t)
            }
            Err(e) => {
                warn!("edge-tts wrote no subtitle cues ({}), continuing without timings", e);
                None
            }
        };
        let _ = fs::remove_file(&cues);
        Ok(timings)
    }
}
