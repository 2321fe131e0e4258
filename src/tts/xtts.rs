use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::{SpeechBackend, SYNTH_DEADLINE};
use crate::config::TtsSettings;
use crate::error::{PipelineError, Result};
use crate::media;
use crate::subtitle::WordTiming;

const DEFAULT_MODEL: &str = "tts_models/multilingual/multi-dataset/xtts_v2";

/// Coqui XTTS voice cloning via the `tts` CLI. Either a built-in speaker
/// name (the configured voice) or a reference recording.
pub struct XttsBackend {
    binary: PathBuf,
    model: String,
    speaker_wav: Option<PathBuf>,
    language: String,
}

impl XttsBackend {
    pub fn new(settings: &TtsSettings) -> Self {
        Self {
            binary: settings.binary.clone().unwrap_or_else(|| PathBuf::from("tts")),
            model: settings.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            speaker_wav: settings.speaker_wav.clone(),
            language: settings.language.clone().unwrap_or_else(|| "en".into()),
        }
    }

    fn args(&self, text: &str, voice: &str, out: &Path) -> Vec<String> {
        let mut args = vec![
            "--text".to_string(),
            text.to_string(),
            "--model_name".into(),
            self.model.clone(),
            "--language_idx".into(),
            self.language.clone(),
        ];
        match &self.speaker_wav {
            Some(wav) => {
                args.push("--speaker_wav".into());
                args.push(wav.to_string_lossy().into_owned());
            }
            None => {
                args.push("--speaker_idx".into());
                args.push(voice.to_string());
            }
        }
        args.push("--out_path".into());
        args.push(out.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl SpeechBackend for XttsBackend {
    fn name(&self) -> &'static str {
        "xtts"
    }

    fn extension(&self) -> &'static str {
        "wav"
    }

    async fn synthesize(&self, text: &str, voice: &str, out: &Path) -> Result<Option<Vec<WordTiming>>> {
        let args = self.args(text, voice, out);
        media::run_tool(&self.binary, &args, SYNTH_DEADLINE)
            .await
            .map_err(|e| PipelineError::synthesis("xtts", e.to_string()))?;
        Ok(None)
    }
}
