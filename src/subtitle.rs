use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::OnceLock;

use crate::config::SubtitleSettings;
use crate::error::Result;

/// One spoken word and when it is heard, in seconds from the start of the narration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

impl WordTiming {
    pub fn new(word: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            word: word.into(),
            start,
            end,
        }
    }
}

/// Boundary events closer than this are the same event.
pub const TIMING_EPSILON: f64 = 0.001;

/// Sorts by start time and keeps an entry only if it starts more than
/// [`TIMING_EPSILON`] after the last kept one. Blank words are dropped and
/// ends are clamped so no entry runs backwards.
pub fn normalize_timings(mut timings: Vec<WordTiming>) -> Vec<WordTiming> {
    timings.retain(|t| !t.word.trim().is_empty() && t.start.is_finite() && t.end.is_finite());
    timings.sort_by(|a, b| a.start.total_cmp(&b.start));
    let mut out: Vec<WordTiming> = Vec::with_capacity(timings.len());
    for mut t in timings {
        if let Some(last) = out.last() {
            if t.start - last.start <= TIMING_EPSILON {
                continue;
            }
        }
        t.word = t.word.trim().to_string();
        t.end = t.end.max(t.start);
        out.push(t);
    }
    out
}

pub fn offset_timings(timings: &[WordTiming], by: f64) -> Vec<WordTiming> {
    timings
        .iter()
        .map(|t| WordTiming::new(t.word.clone(), t.start + by, t.end + by))
        .collect()
}

const COMMA_PAUSE: f64 = 0.2;
const SENTENCE_END_PAUSE: f64 = 0.4;
const LENGTH_EXPONENT: f64 = 0.75;

fn word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\w[\w'-]*)|([,.!?।॥])").expect("static word regex"))
}

/// Guesses per-word timings for `text` spoken over `duration` seconds from `start`.
///
/// Punctuation claims a fixed pause and the remaining time is shared by
/// word length raised to 0.75, so long words get more time but not
/// proportionally more.
pub fn estimate_timings(text: &str, start: f64, duration: f64) -> Vec<WordTiming> {
    let elements: Vec<&str> = word_regex().find_iter(text).map(|m| m.as_str()).collect();
    if elements.is_empty() {
        return Vec::new();
    }
    let mut total_pause_time = 0.0;
    let mut words = Vec::new();
    for &element in &elements {
        match element {
            "," => total_pause_time += COMMA_PAUSE,
            "." | "!" | "?" | "।" | "॥" => total_pause_time += SENTENCE_END_PAUSE,
            _ => words.push(element),
        }
    }
    if words.is_empty() {
        return Vec::new();
    }
    // Not enough room for the pauses: squeeze them instead of the words.
    let pause_scale = if total_pause_time > duration * 0.5 {
        duration * 0.5 / total_pause_time
    } else {
        1.0
    };
    let word_time_available = (duration - total_pause_time * pause_scale).max(0.0);
    let total_weight: f64 = words
        .iter()
        .map(|w| (w.chars().count() as f64).powf(LENGTH_EXPONENT))
        .sum();

    let mut out = Vec::with_capacity(words.len());
    let mut cursor = start;
    for element in elements {
        match element {
            "," => cursor += COMMA_PAUSE * pause_scale,
            "." | "!" | "?" | "।" | "॥" => cursor += SENTENCE_END_PAUSE * pause_scale,
            word => {
                let weight = (word.chars().count() as f64).powf(LENGTH_EXPONENT);
                let d = if total_weight > 0.0 {
                    word_time_available * weight / total_weight
                } else {
                    0.0
                };
                out.push(WordTiming::new(word, cursor, cursor + d));
                cursor += d;
            }
        }
    }
    out
}

/// Splits a multi-word cue into words sharing its span by character count.
pub fn distribute_words(cue: &str, start: f64, end: f64) -> Vec<WordTiming> {
    let words: Vec<&str> = cue.split_whitespace().collect();
    let total_chars: usize = words.iter().map(|w| w.chars().count()).sum();
    if words.is_empty() || total_chars == 0 {
        return Vec::new();
    }
    let span = (end - start).max(0.0);
    let mut cursor = start;
    words
        .into_iter()
        .map(|w| {
            let d = span * w.chars().count() as f64 / total_chars as f64;
            let t = WordTiming::new(w, cursor, cursor + d);
            cursor += d;
            t
        })
        .collect()
}

fn cue_time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:(\d+):)?(\d{2}):(\d{2})[,.](\d{3})\s*-->\s*(?:(\d+):)?(\d{2}):(\d{2})[,.](\d{3})")
            .expect("static cue regex")
    })
}

/// Reads SRT or WebVTT cues as `(start, end, text)`.
pub fn parse_cues(raw: &str) -> Vec<(f64, f64, String)> {
    let ts = |h: Option<regex::Match>, m: &str, s: &str, ms: &str| -> f64 {
        let h: f64 = h.and_then(|h| h.as_str().parse().ok()).unwrap_or(0.0);
        let m: f64 = m.parse().unwrap_or(0.0);
        let s: f64 = s.parse().unwrap_or(0.0);
        let ms: f64 = ms.parse().unwrap_or(0.0);
        h * 3600.0 + m * 60.0 + s + ms / 1000.0
    };
    let mut cues = Vec::new();
    let mut lines = raw.lines().peekable();
    while let Some(line) = lines.next() {
        let Some(c) = cue_time_regex().captures(line.trim()) else {
            continue;
        };
        let start = ts(c.get(1), &c[2], &c[3], &c[4]);
        let end = ts(c.get(5), &c[6], &c[7], &c[8]);
        let mut text = Vec::new();
        while let Some(next) = lines.peek() {
            if next.trim().is_empty() {
                break;
            }
            text.push(next.trim());
            lines.next();
        }
        let text = text.join(" ");
        if !text.is_empty() {
            cues.push((start, end, text));
        }
    }
    cues
}

pub fn write_srt(path: &Path, entries: &[WordTiming]) -> Result<()> {
    let mut f = BufWriter::new(File::create(path)?);
    for (i, t) in entries.iter().enumerate() {
        writeln!(f, "{}", i + 1)?;
        writeln!(f, "{} --> {}", format_srt_time(t.start), format_srt_time(t.end))?;
        for line in wrap_text(&t.word, 80) {
            writeln!(f, "{}", line)?;
        }
        writeln!(f)?;
    }
    f.flush()?;
    Ok(())
}

fn format_srt_time(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_sec = total_ms / 1000;
    let s = total_sec % 60;
    let total_min = total_sec / 60;
    let m = total_min % 60;
    let h = total_min / 60;
    format!("{:02}:{:02}:{:02},{:03}", h, m, s, ms)
}

fn wrap_text(s: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in s.split_whitespace() {
        if current.len() + word.len() + 1 > width && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
            current.push_str(word);
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// libass override style for burned-in subtitles, bottom-centred.
pub fn force_style(s: &SubtitleSettings) -> String {
    format!(
        "FontName={},FontSize={},PrimaryColour={},BackColour={},BorderStyle={},Outline={},Shadow={},Alignment=2,MarginV={}",
        s.font_name, s.font_size, s.primary_colour, s.back_colour, s.border_style, s.outline, s.shadow, s.margin_v
    )
}
