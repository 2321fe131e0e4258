use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error};

use super::{SpeechBackend, SYNTH_DEADLINE};
use crate::config::TtsSettings;
use crate::error::{PipelineError, Result};
use crate::media::stderr_excerpt;
use crate::subtitle::WordTiming;

/// Offline synthesis with the `piper` CLI; text goes in on stdin.
pub struct PiperBackend {
    binary: PathBuf,
    model: Option<String>,
}

impl PiperBackend {
    pub fn new(settings: &TtsSettings) -> Self {
        Self {
            binary: settings.binary.clone().unwrap_or_else(|| PathBuf::from("piper")),
            model: settings.model.clone(),
        }
    }

    fn args(&self, voice: &str, out: &Path) -> Vec<String> {
        // the model file is the voice
        let model = self.model.clone().unwrap_or_else(|| voice.to_string());
        vec![
            "--model".into(),
            model,
            "--output_file".into(),
            out.to_string_lossy().into_owned(),
        ]
    }
}

#[async_trait]
impl SpeechBackend for PiperBackend {
    fn name(&self) -> &'static str {
        "piper"
    }

    fn extension(&self) -> &'static str {
        "wav"
    }

    async fn synthesize(&self, text: &str, voice: &str, out: &Path) -> Result<Option<Vec<WordTiming>>> {
        let args = self.args(voice, out);
        debug!("exec: {} {:?}", self.binary.display(), args);
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::synthesis("piper", format!("failed to spawn {}: {e}", self.binary.display())))?;

        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| PipelineError::synthesis("piper", "failed to open stdin"))?;
            stdin.write_all(text.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = timeout(SYNTH_DEADLINE, child.wait_with_output())
            .await
            .map_err(|_| PipelineError::synthesis("piper", format!("timed out after {:?}", SYNTH_DEADLINE)))??;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("Piper TTS command failed for {}: {}", out.display(), stderr_excerpt(&stderr, 3));
            return Err(PipelineError::synthesis(
                "piper",
                format!("{}: {}", output.status, stderr_excerpt(&stderr, 3)),
            ));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_setting_wins_over_voice() {
        let settings = TtsSettings {
            model: Some("/models/en_US-lessac-medium.onnx".into()),
            ..TtsSettings::default()
        };
        let args = PiperBackend::new(&settings).args("ignored", Path::new("/tmp/out.wav"));
        assert_eq!(args, ["--model", "/models/en_US-lessac-medium.onnx", "--output_file", "/tmp/out.wav"]);
    }

    #[tokio::test]
    async fn missing_binary_is_a_synthesis_error() {
        let settings = TtsSettings {
            binary: Some(PathBuf::from("/nonexistent/piper")),
            ..TtsSettings::default()
        };
        let err = PiperBackend::new(&settings)
            .synthesize("hi", "voice.onnx", Path::new("/tmp/never.wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::SynthesisFailed { .. }));
    }
}
