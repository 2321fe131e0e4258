//! Scene planning for multi-scene stories.

use tracing::warn;

use crate::compose::Motion;
use crate::content::{ChannelIntro, Story};

/// One scene to narrate and render.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenePlan {
    /// 1-based; motion alternates on it.
    pub number: usize,
    pub text: String,
    pub prompt: String,
    pub motion: Motion,
}

impl ScenePlan {
    /// Stem for the scene's files inside the scratch directory.
    pub fn stem(&self) -> String {
        format!("scene_{:03}", self.number)
    }
}

/// Prefixes `prompt` with the story's style unless it already mentions it.
pub fn styled_prompt(style: Option<&str>, prompt: &str) -> String {
    let prompt = prompt.trim();
    match style.map(str::trim).filter(|s| !s.is_empty()) {
        Some(style) if !prompt.contains(style) => format!("{style} {prompt}").trim().to_string(),
        _ => prompt.to_string(),
    }
}

/// Main scenes then outro scenes, numbered in order. With `limit` only that
/// many main scenes are kept and the outro is dropped.
pub fn plan_scenes(story: &Story, zoom: f64, limit: Option<usize>) -> Vec<ScenePlan> {
    let main = story.scenes.iter().take(limit.unwrap_or(usize::MAX));
    let outro = story
        .outro
        .iter()
        .flat_map(|o| &o.outro_scenes)
        .take(if limit.is_some() { 0 } else { usize::MAX });

    let mut plans = Vec::new();
    for scene in main.chain(outro) {
        let text = scene.text.trim();
        if text.is_empty() {
            warn!("Skipping a scene of '{}' with no text", story.title);
            continue;
        }
        let number = plans.len() + 1;
        let prompt = scene
            .image_prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(text);
        plans.push(ScenePlan {
            number,
            text: text.to_string(),
            prompt: styled_prompt(story.image_style(), prompt),
            motion: if number % 2 == 1 { Motion::ZoomIn(zoom) } else { Motion::ZoomOut(zoom) },
        });
    }
    plans
}

/// Line spoken over the intro.
pub fn intro_line(story: &Story, channel: &str) -> String {
    let title = story.title.trim();
    match &story.channel_intro {
        Some(ChannelIntro::Detailed { voice_over_text: Some(text) }) if !text.trim().is_empty() => {
            text.trim().to_string()
        }
        Some(ChannelIntro::Name(name)) if !name.trim().is_empty() => {
            format!("Welcome to {}. Today's story: {title}", name.trim())
        }
        _ => format!("Welcome to {channel}. Today's story: {title}"),
    }
}

/// Styled prompt for a generated thumbnail, if the story asks for one.
pub fn thumbnail_prompt(story: &Story) -> Option<String> {
    let prompt = story.thumbnail.as_ref()?.image_prompt.as_deref()?;
    if prompt.trim().is_empty() {
        return None;
    }
    Some(styled_prompt(story.image_style(), prompt))
}
