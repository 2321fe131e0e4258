//! Speech synthesis: interchangeable backends behind [`SpeechBackend`], a
//! content-hash cache in front of them, and the [`Narrator`] that stitches
//! segments and silences into one narration track.

pub mod edge;
pub mod piper;
pub mod xtts;

use async_trait::async_trait;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{SubtitleMode, TtsBackendKind, TtsSettings};
use crate::error::{PipelineError, Result};
use crate::filtergraph::{AudioFilter, FilterGraph, InputSpec};
use crate::media::{self, Toolchain};
use crate::subtitle::{self, WordTiming};

/// Upper bound for one synthesis call.
pub(crate) const SYNTH_DEADLINE: Duration = Duration::from_secs(300);

#[async_trait]
pub trait SpeechBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Extension of the audio files this backend writes.
    fn extension(&self) -> &'static str;

    /// Writes speech for `text` to `out`. `None` means the backend has no
    /// timing information, which is a normal outcome.
    async fn synthesize(&self, text: &str, voice: &str, out: &Path) -> Result<Option<Vec<WordTiming>>>;
}

pub fn backend_for(settings: &TtsSettings) -> Box<dyn SpeechBackend> {
    match settings.backend {
        TtsBackendKind::Piper => Box::new(piper::PiperBackend::new(settings)),
        TtsBackendKind::Edge => Box::new(edge::EdgeBackend::new(settings)),
        TtsBackendKind::Xtts => Box::new(xtts::XttsBackend::new(settings)),
    }
}

fn verse_ref_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\|\|\s*[\d.\-]+").expect("static verse ref regex"))
}

fn decimal_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d)\.(\d)").expect("static decimal regex"))
}

fn symbol_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\w\s\x{0900}-\x{097F}]").expect("static symbol regex"))
}

/// Strips what trips speech engines up: verse references such as `|| 2.47`,
/// danda punctuation, decimals (read as dates by some voices) and symbols.
pub fn clean_text_for_tts(text: &str) -> String {
    let text = verse_ref_regex().replace_all(text, "");
    let text = text.replace('|', "").replace('॥', "").replace('।', " ");
    let text = decimal_regex().replace_all(&text, "$1 $2");
    let text = symbol_regex().replace_all(&text, " ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Audio plus whatever timings the backend produced.
#[derive(Debug, Clone)]
pub struct Synthesized {
    pub audio: PathBuf,
    pub timings: Option<Vec<WordTiming>>,
    /// Cache files behind this result; empty when caching is off.
    pub cache_entries: Vec<PathBuf>,
}

/// Wraps a backend with an `md5(voice_text)` keyed cache: the audio file
/// and a JSON sidecar holding the timings.
pub struct CachedSynthesizer {
    backend: Box<dyn SpeechBackend>,
    cache_dir: Option<PathBuf>,
}

impl CachedSynthesizer {
    pub fn new(backend: Box<dyn SpeechBackend>, cache_dir: Option<PathBuf>) -> Self {
        Self { backend, cache_dir }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn cache_key(voice: &str, text: &str) -> String {
        format!("{:x}", md5::compute(format!("{voice}_{text}").as_bytes()))
    }

    /// Synthesises into the cache, or into `scratch` when caching is off.
    pub async fn synthesize(&self, text: &str, voice: &str, scratch: &Path) -> Result<Synthesized> {
        let key = Self::cache_key(voice, text);
        let ext = self.backend.extension();
        let dir = self.cache_dir.as_deref().unwrap_or(scratch);
        let audio = dir.join(format!("{key}.{ext}"));
        let sidecar = dir.join(format!("{key}.json"));
        let cache_entries = if self.cache_dir.is_some() {
            vec![audio.clone(), sidecar.clone()]
        } else {
            Vec::new()
        };

        if self.cache_dir.is_some() && audio.exists() {
            let timings = match fs::read_to_string(&sidecar) {
                Ok(raw) => serde_json::from_str::<Option<Vec<WordTiming>>>(&raw).unwrap_or_else(|e| {
                    warn!("Ignoring unreadable timing sidecar {}: {}", sidecar.display(), e);
                    None
                }),
                Err(_) => None,
            };
            info!("TTS cache hit {} ({} timings)", key, timings.as_ref().map_or(0, Vec::len));
            return Ok(Synthesized {
                audio,
                timings,
                cache_entries,
            });
        }

        fs::create_dir_all(dir)?;
        let partial = dir.join(format!("{key}.partial.{ext}"));
        info!("Synthesising {} chars with {} ({})", text.chars().count(), self.backend.name(), voice);
        let result = self.backend.synthesize(text, voice, &partial).await;
        let timings = match result {
            Ok(t) => t,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(e);
            }
        };
        match fs::metadata(&partial) {
            Ok(m) if m.len() > 0 => {}
            _ => {
                let _ = fs::remove_file(&partial);
                return Err(PipelineError::synthesis(self.backend.name(), "backend produced no audio"));
            }
        }
        fs::rename(&partial, &audio)?;
        fs::write(&sidecar, serde_json::to_vec(&timings)?)?;
        Ok(Synthesized {
            audio,
            timings,
            cache_entries,
        })
    }
}

/// One spoken segment's place on the narration timeline.
#[derive(Debug, Clone)]
pub struct SegmentSpan {
    pub text: String,
    pub start: f64,
    pub duration: f64,
    /// Backend timings, already shifted to the narration timeline.
    pub timings: Option<Vec<WordTiming>>,
}

#[derive(Debug, Clone)]
pub struct Narration {
    pub audio: PathBuf,
    /// Probed from the final file.
    pub duration: f64,
    pub segments: Vec<SegmentSpan>,
    /// TTS cache files used; removed once the video is published.
    pub cache_entries: Vec<PathBuf>,
}

impl Narration {
    /// Word timings for the subtitle track. Segments without backend
    /// timings are estimated from their text and measured span.
    pub fn word_timings(&self, mode: SubtitleMode) -> Vec<WordTiming> {
        let mut out = Vec::new();
        for seg in &self.segments {
            match (mode, &seg.timings) {
                (SubtitleMode::Off, _) => return Vec::new(),
                (SubtitleMode::Words, Some(t)) if !t.is_empty() => out.extend(t.iter().cloned()),
                _ => out.extend(subtitle::estimate_timings(&seg.text, seg.start, seg.duration)),
            }
        }
        subtitle::normalize_timings(out)
    }
}

/// Start offsets of each segment given its duration, the lead-in and the pause between segments.
pub fn segment_offsets(durations: &[f64], lead_in: f64, pause: f64) -> Vec<f64> {
    let mut cursor = lead_in.max(0.0);
    durations
        .iter()
        .enumerate()
        .map(|(i, d)| {
            if i > 0 {
                cursor += pause.max(0.0);
            }
            let start = cursor;
            cursor += d;
            start
        })
        .collect()
}

pub struct Narrator<'a> {
    synth: CachedSynthesizer,
    settings: &'a TtsSettings,
    tools: &'a Toolchain,
}

/// Produces the narration track for a list of spoken segments.
#[async_trait]
pub trait Narrate: Send + Sync {
    async fn narrate(&self, segments: &[String], scratch: &Path) -> Result<Narration>;
}

impl<'a> Narrator<'a> {
    pub fn new(synth: CachedSynthesizer, settings: &'a TtsSettings, tools: &'a Toolchain) -> Self {
        Self { synth, settings, tools }
    }
}

#[async_trait]
impl Narrate for Narrator<'_> {
    /// Speaks every segment, joins them with the configured silences into
    /// `scratch/narration.wav` and measures the result.
    async fn narrate(&self, segments: &[String], scratch: &Path) -> Result<Narration> {
        let mut pieces = Vec::new();
        for raw in segments {
            let text = clean_text_for_tts(raw);
            if text.is_empty() {
                debug!("Segment empty after cleaning, skipped: {:?}", raw);
                continue;
            }
            let synthesized = self.synth.synthesize(&text, &self.settings.voice, scratch).await?;
            let duration = media::probe_duration(self.tools, &synthesized.audio).await?;
            pieces.push((text, synthesized, duration));
        }
        if pieces.is_empty() {
            return Err(PipelineError::synthesis(self.synth.backend_name(), "nothing to narrate"));
        }

        let durations: Vec<f64> = pieces.iter().map(|(_, _, d)| *d).collect();
        let offsets = segment_offsets(&durations, self.settings.lead_in, self.settings.segment_pause);
        let rate = self.settings.sample_rate;

        let mut timeline: Vec<PathBuf> = Vec::new();
        if self.settings.lead_in > 0.0 {
            let lead = scratch.join("lead_in.wav");
            media::write_silence(&lead, self.settings.lead_in, rate)?;
            timeline.push(lead);
        }
        let pause = if self.settings.segment_pause > 0.0 && pieces.len() > 1 {
            let p = scratch.join("pause.wav");
            media::write_silence(&p, self.settings.segment_pause, rate)?;
            Some(p)
        } else {
            None
        };
        let mut spans = Vec::with_capacity(pieces.len());
        let mut cache_entries = Vec::new();
        for (i, ((text, synthesized, duration), start)) in pieces.into_iter().zip(offsets).enumerate() {
            if i > 0 {
                if let Some(p) = &pause {
                    timeline.push(p.clone());
                }
            }
            timeline.push(synthesized.audio);
            cache_entries.extend(synthesized.cache_entries);
            spans.push(SegmentSpan {
                text,
                start,
                duration,
                timings: synthesized.timings.map(|t| subtitle::offset_timings(&t, start)),
            });
        }

        let audio = scratch.join("narration.wav");
        self.concat(&timeline, &audio).await?;
        let duration = media::probe_duration(self.tools, &audio).await?;
        info!("Narration ready: {} segment(s), {:.2}s", spans.len(), duration);
        Ok(Narration {
            audio,
            duration,
            segments: spans,
            cache_entries,
        })
    }

}

impl Narrator<'_> {
    async fn concat(&self, parts: &[PathBuf], out: &Path) -> Result<()> {
        let rate = self.settings.sample_rate;
        let mut graph = FilterGraph::new();
        let mut labels = Vec::with_capacity(parts.len());
        for p in parts {
            let a = graph.audio_input(InputSpec::Once { path: p.clone() });
            labels.push(graph.audio(
                a,
                &[
                    AudioFilter::Aresample(rate),
                    AudioFilter::Aformat {
                        sample_rate: rate,
                        mono: true,
                    },
                ],
            ));
        }
        let joined = graph.concat_audio(labels);
        let rendered = graph.finish(None, Some(joined));

        let mut args: Vec<std::ffi::OsString> = vec!["-y".into(), "-hide_banner".into()];
        args.extend(rendered.args());
        args.extend(["-ac".into(), "1".into(), "-ar".into(), rate.to_string().into()]);
        args.extend(["-c:a".into(), "pcm_s16le".into()]);
        args.push(out.as_os_str().to_owned());
        media::run_tool(&self.tools.ffmpeg, &args, SYNTH_DEADLINE)
            .await
            .map_err(|e| PipelineError::synthesis("ffmpeg concat", e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Writes fixed bytes and reports one timing per word.
    pub(crate) struct StubBackend {
        pub calls: Arc<AtomicU32>,
        pub with_timings: bool,
    }

    #[async_trait]
    impl SpeechBackend for StubBackend {
        fn name(&self) -> &'static str {
            "stub"
        }
        fn extension(&self) -> &'static str {
            "wav"
        }
        async fn synthesize(&self, text: &str, _voice: &str, out: &Path) -> Result<Option<Vec<WordTiming>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            media::write_silence(out, 0.5, 8_000)?;
            Ok(self.with_timings.then(|| {
                text.split_whitespace()
                    .enumerate()
                    .map(|(i, w)| WordTiming::new(w, i as f64 * 0.1, i as f64 * 0.1 + 0.1))
                    .collect()
            }))
        }
    }

    #[test]
    fn cleaning_removes_refs_dandas_and_decimals() {
        assert_eq!(
            clean_text_for_tts("कर्मण्येवाधिकारस्ते मा फलेषु कदाचन। || 2.47 ||"),
            "कर्मण्येवाधिकारस्ते मा फलेषु कदाचन"
        );
        assert_eq!(clean_text_for_tts("Chapter 1.2: rise!"), "Chapter 1 2 rise");
        assert_eq!(clean_text_for_tts("॥ ।"), "");
    }

    #[test]
    fn cache_key_covers_voice_and_text() {
        let a = CachedSynthesizer::cache_key("hi-IN-MadhurNeural", "नमस्ते");
        assert_eq!(a, format!("{:x}", md5::compute("hi-IN-MadhurNeural_नमस्ते".as_bytes())));
        assert_ne!(a, CachedSynthesizer::cache_key("en-US-GuyNeural", "नमस्ते"));
    }

    #[tokio::test]
    async fn cache_hit_returns_audio_and_timings_without_resynthesis() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let synth = CachedSynthesizer::new(
            Box::new(StubBackend {
                calls: calls.clone(),
                with_timings: true,
            }),
            Some(dir.path().join("tts")),
        );
        let first = synth.synthesize("hello brave world", "v", dir.path()).await.unwrap();
        let second = synth.synthesize("hello brave world", "v", dir.path()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.audio, second.audio);
        assert_eq!(second.cache_entries, first.cache_entries);
        assert_eq!(first.cache_entries.len(), 2);
        assert!(first.cache_entries.iter().all(|p| p.exists()));
        assert_eq!(second.timings.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn missing_timings_are_cached_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let synth = CachedSynthesizer::new(
            Box::new(StubBackend {
                calls: Arc::new(AtomicU32::new(0)),
                with_timings: false,
            }),
            Some(dir.path().to_path_buf()),
        );
        synth.synthesize("quiet", "v", dir.path()).await.unwrap();
        let hit = synth.synthesize("quiet", "v", dir.path()).await.unwrap();
        assert!(hit.timings.is_none());
    }

    #[tokio::test]
    async fn uncached_synthesis_reports_no_cache_entries() {
        let dir = tempfile::tempdir().unwrap();
        let synth = CachedSynthesizer::new(
            Box::new(StubBackend {
                calls: Arc::new(AtomicU32::new(0)),
                with_timings: false,
            }),
            None,
        );
        let out = synth.synthesize("scratch only", "v", dir.path()).await.unwrap();
        assert!(out.audio.starts_with(dir.path()));
        assert!(out.cache_entries.is_empty());
    }

    #[test]
    fn offsets_include_lead_in_and_pauses() {
        let offsets = segment_offsets(&[1.5, 2.0, 1.0], 2.0, 3.0);
        assert_eq!(offsets, vec![2.0, 6.5, 11.5]);
    }

    #[test]
    fn word_mode_falls_back_to_estimates_per_segment() {
        let narration = Narration {
            audio: PathBuf::from("n.wav"),
            duration: 5.0,
            segments: vec![
                SegmentSpan {
                    text: "first words".into(),
                    start: 0.0,
                    duration: 1.0,
                    timings: Some(vec![WordTiming::new("first", 0.0, 0.4), WordTiming::new("words", 0.6, 1.0)]),
                },
                SegmentSpan {
                    text: "then estimated".into(),
                    start: 2.0,
                    duration: 1.0,
                    timings: None,
                },
            ],
            cache_entries: Vec::new(),
        };
        let words = narration.word_timings(SubtitleMode::Words);
        assert_eq!(words.len(), 4);
        assert_eq!(words[2].word, "then");
        assert_eq!(words[2].start, 2.0);
        assert!(narration.word_timings(SubtitleMode::Off).is_empty());

        let estimated = narration.word_timings(SubtitleMode::Estimated);
        assert_eq!(estimated[1].word, "words");
        assert!((estimated[1].start - 0.5).abs() < 1e-9);
    }
}
