use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::config::MetadataSettings;
use crate::error::{PipelineError, Result};

/// Which shape the items of a channel's queue have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Quote,
    Verse,
    Product,
    Mcq,
    Chapter,
    Story,
}

/// Accepts both `"499"` and `499` for price-like fields.
fn stringish<'de, D>(d: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub quote: String,
    pub author: String,
    #[serde(default, alias = "quoteinhinglish")]
    pub transliteration: Option<String>,
    #[serde(default, alias = "authnameinenglish")]
    pub author_en: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verse {
    #[serde(alias = "verse")]
    pub verse_number: String,
    #[serde(default, alias = "hook_text")]
    pub hook: String,
    #[serde(alias = "quote_hindi_sansrikt")]
    pub text: String,
    #[serde(default, alias = "meaning_simple_hindi")]
    pub meaning: String,
    #[serde(default)]
    pub cta: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, alias = "background_theme_detailed_prompt")]
    pub background_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub title: String,
    pub url: String,
    #[serde(default, deserialize_with = "stringish")]
    pub price: Option<String>,
    #[serde(default, deserialize_with = "stringish")]
    pub savings: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub is_prime: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McqQuestion {
    pub question: String,
    pub options: Vec<String>,
    pub answer: String,
    #[serde(default, alias = "detailedexplanation")]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mcq {
    #[serde(alias = "youtubetitle")]
    pub title: String,
    #[serde(default)]
    pub hook: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "intro_script")]
    pub intro: Option<String>,
    pub questions: Vec<McqQuestion>,
    #[serde(default, alias = "outro_script")]
    pub outro: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterPart {
    pub title: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    #[serde(alias = "book_name")]
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub chapters: Vec<ChapterPart>,
    #[serde(default)]
    pub full_text: Option<String>,
    #[serde(default)]
    pub image_style: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryScene {
    pub text: String,
    #[serde(default)]
    pub image_prompt: Option<String>,
}

/// `channel_intro` is either the channel's name or a block with the line to speak.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelIntro {
    Name(String),
    Detailed {
        #[serde(default)]
        voice_over_text: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoryThumbnail {
    #[serde(default)]
    pub imageid: Option<String>,
    #[serde(default)]
    pub image_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorySeo {
    #[serde(default)]
    pub video_title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "50_tags")]
    pub tags: Vec<String>,
    #[serde(default, rename = "10_hashtags")]
    pub hashtags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoryOutro {
    #[serde(default)]
    pub outro_scenes: Vec<StoryScene>,
}

/// A narrated story told over one generated image per scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    #[serde(rename = "video_title")]
    pub title: String,
    pub scenes: Vec<StoryScene>,
    #[serde(default)]
    pub image_style_for_all_images: Option<String>,
    #[serde(default)]
    pub image_style_for_all_images_generate: Option<String>,
    #[serde(default)]
    pub channel_intro: Option<ChannelIntro>,
    #[serde(default, rename = "youtube_thumbnail")]
    pub thumbnail: Option<StoryThumbnail>,
    #[serde(default, rename = "youtube_metadata_for_better_seo")]
    pub seo: Option<StorySeo>,
    #[serde(default, rename = "video_outro")]
    pub outro: Option<StoryOutro>,
}

impl Story {
    /// Style prefix shared by every image prompt of the story.
    pub fn image_style(&self) -> Option<&str> {
        [&self.image_style_for_all_images, &self.image_style_for_all_images_generate]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
    }
}

/// One unit of queued content.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentItem {
    Quote(Quote),
    Verse(Verse),
    Product(Product),
    Mcq(Mcq),
    Chapter(Chapter),
    Story(Story),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemMeta {
    pub category: Option<String>,
    pub tags: Vec<String>,
}

/// Text laid out by the caption renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionText {
    pub header: Option<String>,
    pub body: String,
    pub attribution: Option<String>,
}

impl ContentItem {
    pub fn from_value(kind: ContentKind, value: &Value) -> Result<Self> {
        let v = value.clone();
        let item = match kind {
            ContentKind::Quote => Self::Quote(serde_json::from_value(v)?),
            ContentKind::Verse => Self::Verse(serde_json::from_value(v)?),
            ContentKind::Product => Self::Product(serde_json::from_value(v)?),
            ContentKind::Mcq => Self::Mcq(serde_json::from_value(v)?),
            ContentKind::Chapter => Self::Chapter(serde_json::from_value(v)?),
            ContentKind::Story => Self::Story(serde_json::from_value(v)?),
        };
        if let Self::Story(story) = &item {
            if story.scenes.iter().all(|s| s.text.trim().is_empty()) {
                return Err(PipelineError::Queue(format!("story '{}' has no narrated scenes", story.title)));
            }
        }
        if item.unique_key().trim().is_empty() {
            return Err(PipelineError::Queue("content item has an empty identifying key".into()));
        }
        Ok(item)
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Quote(_) => ContentKind::Quote,
            Self::Verse(_) => ContentKind::Verse,
            Self::Product(_) => ContentKind::Product,
            Self::Mcq(_) => ContentKind::Mcq,
            Self::Chapter(_) => ContentKind::Chapter,
            Self::Story(_) => ContentKind::Story,
        }
    }

    pub fn primary_text(&self) -> &str {
        match self {
            Self::Quote(q) => &q.quote,
            Self::Verse(v) => &v.text,
            Self::Product(p) => &p.title,
            Self::Mcq(m) => m.questions.first().map_or(m.title.as_str(), |q| q.question.as_str()),
            Self::Chapter(c) => &c.title,
            Self::Story(s) => &s.title,
        }
    }

    pub fn secondary_text(&self) -> Option<&str> {
        match self {
            Self::Quote(q) => Some(&q.author),
            Self::Verse(v) => (!v.meaning.is_empty()).then_some(v.meaning.as_str()),
            Self::Product(p) => p.description.as_deref(),
            Self::Mcq(m) => m.hook.as_deref(),
            Self::Chapter(c) => c.author.as_deref(),
            Self::Story(_) => None,
        }
    }

    pub fn metadata(&self) -> ItemMeta {
        match self {
            Self::Quote(q) => ItemMeta {
                category: q.category.clone(),
                tags: q.tags.clone(),
            },
            Self::Verse(v) => ItemMeta {
                category: v.category.clone(),
                tags: Vec::new(),
            },
            Self::Product(p) => ItemMeta {
                category: p.category.clone(),
                tags: Vec::new(),
            },
            Self::Mcq(_) => ItemMeta::default(),
            Self::Chapter(c) => ItemMeta {
                category: None,
                tags: c.author.iter().cloned().collect(),
            },
            Self::Story(s) => ItemMeta {
                category: None,
                tags: s.seo.as_ref().map(|m| m.tags.clone()).unwrap_or_default(),
            },
        }
    }

    /// Identity used to find this item again in the queue file.
    pub fn unique_key(&self) -> String {
        match self {
            Self::Quote(q) => format!("{}\u{1f}{}", q.quote.trim(), q.author.trim()),
            Self::Verse(v) => format!("{}\u{1f}{}", v.verse_number.trim(), v.text.trim()),
            Self::Product(p) => p.url.trim().to_string(),
            Self::Mcq(m) => m.title.trim().to_string(),
            Self::Chapter(c) => c.title.trim().to_string(),
            Self::Story(s) => s.title.trim().to_string(),
        }
    }

    pub fn title(&self) -> String {
        match self {
            Self::Quote(q) => match &q.author_en {
                Some(en) if !en.is_empty() => format!("{} ({en})", q.author),
                _ => q.author.clone(),
            },
            Self::Verse(v) if !v.hook.is_empty() => v.hook.clone(),
            Self::Verse(v) => v.verse_number.clone(),
            Self::Product(p) => p.title.clone(),
            Self::Mcq(m) => m.title.clone(),
            Self::Chapter(c) => c.title.clone(),
            Self::Story(s) => s.title.clone(),
        }
    }

    pub fn caption(&self, header: Option<&str>) -> CaptionText {
        let header = header.map(str::to_string);
        match self {
            Self::Quote(q) => CaptionText {
                header,
                body: format!("\"{}\"", q.quote.trim()),
                attribution: Some(format!("- {} -", q.author.trim())),
            },
            Self::Verse(v) => CaptionText {
                header,
                body: v.text.trim().to_string(),
                attribution: Some(format!("|| {} ||", v.verse_number.trim())),
            },
            Self::Product(p) => CaptionText {
                header,
                body: p.title.trim().to_string(),
                attribution: price_line(p),
            },
            Self::Mcq(m) => {
                let body = match m.questions.first() {
                    Some(q) => {
                        let mut s = q.question.trim().to_string();
                        for (i, opt) in q.options.iter().enumerate() {
                            s.push('\n');
                            s.push_str(&format!("{}) {}", option_letter(i), opt.trim()));
                        }
                        s
                    }
                    None => m.title.clone(),
                };
                CaptionText {
                    header: header.or_else(|| m.hook.clone()),
                    body,
                    attribution: None,
                }
            }
            Self::Chapter(c) => CaptionText {
                header,
                body: c.title.trim().to_string(),
                attribution: c.author.as_ref().map(|a| format!("- {} -", a.trim())),
            },
            Self::Story(s) => CaptionText {
                header,
                body: s.title.trim().to_string(),
                attribution: None,
            },
        }
    }

    /// Narration split into segments; silence is inserted between them.
    pub fn narration_segments(&self) -> Vec<String> {
        let segments: Vec<String> = match self {
            Self::Quote(q) => vec![q.quote.clone(), q.author.clone()],
            Self::Verse(v) => vec![v.text.clone(), v.meaning.clone()],
            Self::Product(p) => {
                let mut s = vec![p.title.clone()];
                if let Some(line) = price_line(p) {
                    s.push(line);
                }
                if let Some(d) = &p.description {
                    s.push(d.clone());
                }
                s
            }
            Self::Mcq(m) => {
                let mut s: Vec<String> = m.intro.iter().cloned().collect();
                for q in &m.questions {
                    let mut line = q.question.trim().to_string();
                    for (i, opt) in q.options.iter().enumerate() {
                        line.push_str(&format!(" {}: {}.", option_letter(i), opt.trim()));
                    }
                    s.push(line);
                    s.push(format!("The answer is {}.", q.answer.trim()));
                    if let Some(e) = &q.explanation {
                        s.push(e.clone());
                    }
                }
                s.extend(m.outro.iter().cloned());
                s
            }
            Self::Chapter(c) => {
                if c.chapters.is_empty() {
                    c.full_text
                        .as_deref()
                        .unwrap_or_default()
                        .split('\n')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .enumerate()
                        .map(|(i, p)| format!("Chapter {}. {p}", i + 1))
                        .collect()
                } else {
                    c.chapters
                        .iter()
                        .map(|ch| format!("{}. {}", ch.title.trim(), ch.text.trim()))
                        .collect()
                }
            }
            Self::Story(s) => s
                .scenes
                .iter()
                .chain(s.outro.iter().flat_map(|o| &o.outro_scenes))
                .map(|scene| scene.text.clone())
                .collect(),
        };
        segments
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Prompt for a generated background, if the item carries one.
    pub fn image_prompt(&self) -> Option<String> {
        match self {
            Self::Verse(v) => v.background_prompt.clone().filter(|p| !p.trim().is_empty()),
            Self::Chapter(c) => Some(match &c.image_style {
                Some(style) => format!("{}, {style}", c.title),
                None => c.title.clone(),
            }),
            Self::Story(s) => s
                .thumbnail
                .as_ref()
                .and_then(|t| t.image_prompt.clone())
                .filter(|p| !p.trim().is_empty()),
            _ => None,
        }
    }
}

fn option_letter(i: usize) -> char {
    (b'A' + (i % 26) as u8) as char
}

fn price_line(p: &Product) -> Option<String> {
    match (&p.price, &p.savings) {
        (Some(price), Some(save)) => Some(format!("Now {price} (save {save})")),
        (Some(price), None) => Some(format!("Now {price}")),
        (None, Some(save)) => Some(format!("Save {save}")),
        (None, None) => None,
    }
}

/// Title, description and tags sent to the platforms.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    /// JPEG set as the custom thumbnail where the platform supports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<PathBuf>,
}

const MAX_TITLE_CHARS: usize = 100;
const MAX_TAGS: usize = 30;

fn clamp_title(title: String) -> String {
    if title.chars().count() <= MAX_TITLE_CHARS {
        return title;
    }
    let mut t: String = title.chars().take(MAX_TITLE_CHARS - 3).collect();
    t.push_str("...");
    t
}

fn keywords(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| ".,!?;:\"'()".contains(c)))
        .filter(|w| w.chars().count() > 3)
        .map(str::to_string)
        .collect()
}

impl VideoMetadata {
    pub fn for_item(item: &ContentItem, settings: &MetadataSettings) -> Self {
        let meta = item.metadata();
        let (title, body) = match item {
            ContentItem::Quote(q) => {
                let author = item.title();
                let mut body = format!("{}\n\n", q.quote.trim());
                if let Some(t) = q.transliteration.as_deref().filter(|t| !t.is_empty()) {
                    body.push_str(&format!("{t}\n\n"));
                }
                body.push_str(&format!("- {author}"));
                (format!("{author} Quote"), body)
            }
            ContentItem::Verse(v) => {
                let category = v.category.as_deref().unwrap_or("Bhagavad Gita");
                let full = format!("{category} | {} | {} #Shorts", v.verse_number, v.hook);
                let title = if full.chars().count() > MAX_TITLE_CHARS {
                    format!("{} | {} #Shorts", v.verse_number, v.hook)
                } else {
                    full
                };
                let mut body = format!("{}\n\n{}\n\n{}", v.hook, v.text, v.meaning);
                if let Some(cta) = &v.cta {
                    body.push_str(&format!("\n\n{cta}"));
                }
                (title, body)
            }
            ContentItem::Product(p) => {
                let mut body = p.title.clone();
                if let Some(line) = price_line(p) {
                    body.push_str(&format!("\n{line}"));
                }
                if p.is_prime {
                    body.push_str("\nPrime eligible");
                }
                if let Some(d) = &p.description {
                    body.push_str(&format!("\n\n{d}"));
                }
                body.push_str(&format!("\n\nDeal link: {}", p.url));
                (p.title.clone(), body)
            }
            ContentItem::Mcq(m) => {
                let body = m.description.clone().unwrap_or_else(|| m.title.clone());
                (m.title.clone(), body)
            }
            ContentItem::Chapter(c) => {
                let by = c.author.as_deref().map(|a| format!(" by {a}")).unwrap_or_default();
                let body = c
                    .chapters
                    .iter()
                    .map(|ch| format!("- {}", ch.title))
                    .collect::<Vec<_>>()
                    .join("\n");
                (format!("{}{by} | Book Summary", c.title), body)
            }
            ContentItem::Story(s) => {
                let seo = s.seo.clone().unwrap_or_default();
                let title = seo.video_title.filter(|t| !t.trim().is_empty()).unwrap_or_else(|| s.title.clone());
                let mut body = seo.description.unwrap_or_else(|| s.title.clone());
                if !seo.tags.is_empty() {
                    body.push_str(&format!("\n\ntags: {}", seo.tags.join(", ")));
                }
                if !seo.hashtags.is_empty() {
                    let hashtags = seo
                        .hashtags
                        .iter()
                        .map(|h| format!("#{}", h.trim().trim_start_matches('#')))
                        .collect::<Vec<_>>()
                        .join(" ");
                    body.push_str(&format!("\n\nhashtags: {hashtags}"));
                }
                (title, body)
            }
        };

        let title = match &settings.title_suffix {
            Some(suffix) => clamp_title(format!("{title} {suffix}")),
            None => clamp_title(title),
        };

        let mut tags: Vec<String> = Vec::new();
        let candidates = keywords(item.primary_text())
            .into_iter()
            .chain(item.secondary_text().into_iter().map(|s| s.trim().to_string()))
            .chain(meta.category.clone())
            .chain(meta.tags.clone())
            .chain(settings.tags.iter().cloned());
        for tag in candidates {
            if tag.is_empty() || tag.chars().count() > 100 {
                continue;
            }
            if !tags.iter().any(|t| t.eq_ignore_ascii_case(&tag)) {
                tags.push(tag);
            }
            if tags.len() == MAX_TAGS {
                break;
            }
        }

        let mut description = body;
        if !settings.hashtags.is_empty() {
            let hashtags = settings
                .hashtags
                .iter()
                .map(|h| format!("#{}", h.trim_start_matches('#').replace(' ', "")))
                .collect::<Vec<_>>()
                .join(" ");
            description.push_str(&format!("\n\n{hashtags}"));
        }
        if let Some(footer) = &settings.footer {
            description.push_str(&format!("\n\n{footer}"));
        }

        Self {
            title,
            description: description.trim().to_string(),
            tags,
            thumbnail: None,
        }
    }
}
