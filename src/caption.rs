//! Caption overlay rendering.
//!
//! Text is shaped with rustybuzz so complex scripts (Devanagari conjuncts,
//! combining marks) come out as the font intends, then each positioned
//! glyph is rasterised by fontdue and alpha-blended into a transparent
//! canvas. Line breaking measures shaped advances, never character counts.

use fontdue::{Font, FontSettings};
use image::{ImageFormat, Rgba, RgbaImage};
use rustybuzz::UnicodeBuffer;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::CaptionSettings;
use crate::content::CaptionText;
use crate::error::{PipelineError, Result};

/// A font file held once for both shaping and rasterising.
pub struct LoadedFont {
    path: PathBuf,
    data: Vec<u8>,
    raster: Font,
}

#[derive(Debug, Clone, Copy)]
struct PlacedGlyph {
    id: u16,
    /// Byte offset of the source text this glyph belongs to.
    cluster: u32,
    x: f32,
    y: f32,
}

#[derive(Debug, Clone)]
struct ShapedRun {
    glyphs: Vec<PlacedGlyph>,
    width: f32,
}

impl LoadedFont {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .map_err(|e| PipelineError::asset(path.display().to_string(), format!("cannot read font: {e}")))?;
        if rustybuzz::Face::from_slice(&data, 0).is_none() {
            return Err(PipelineError::asset(path.display().to_string(), "not a usable font face"));
        }
        let raster = Font::from_bytes(data.as_slice(), FontSettings::default())
            .map_err(|e| PipelineError::asset(path.display().to_string(), e))?;
        debug!("Loaded font {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            data,
            raster,
        })
    }

    /// First candidate that exists and parses.
    pub fn first_of(candidates: &[PathBuf]) -> Result<Self> {
        let mut last_err = None;
        for path in candidates {
            if !path.exists() {
                continue;
            }
            match Self::load(path) {
                Ok(f) => return Ok(f),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            let list = candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            PipelineError::asset("font", format!("none of [{list}] exists"))
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn shape(&self, text: &str, px: f32) -> Result<ShapedRun> {
        let face = rustybuzz::Face::from_slice(&self.data, 0)
            .ok_or_else(|| PipelineError::asset(self.path.display().to_string(), "font face vanished"))?;
        let scale = px / face.units_per_em() as f32;
        let mut buffer = UnicodeBuffer::new();
        buffer.push_str(text);
        buffer.guess_segment_properties();
        let shaped = rustybuzz::shape(&face, &[], buffer);

        let mut pen = 0.0f32;
        let mut glyphs = Vec::with_capacity(shaped.len());
        for (info, pos) in shaped.glyph_infos().iter().zip(shaped.glyph_positions()) {
            glyphs.push(PlacedGlyph {
                id: info.glyph_id as u16,
                cluster: info.cluster,
                x: pen + pos.x_offset as f32 * scale,
                y: pos.y_offset as f32 * scale,
            });
            pen += pos.x_advance as f32 * scale;
        }
        Ok(ShapedRun { glyphs, width: pen })
    }

    /// Characters of `text` the font has no glyph for, in text order.
    pub fn missing_chars(&self, text: &str) -> Result<Vec<char>> {
        let run = self.shape(text, 16.0)?;
        let mut missing: Vec<char> = Vec::new();
        for g in run.glyphs.iter().filter(|g| g.id == 0) {
            if let Some(c) = text.get(g.cluster as usize..).and_then(|t| t.chars().next()) {
                if !c.is_whitespace() && !missing.contains(&c) {
                    missing.push(c);
                }
            }
        }
        Ok(missing)
    }

    /// Shaped advance width of `text` at `px`.
    pub fn measure(&self, text: &str, px: f32) -> Result<f32> {
        Ok(self.shape(text, px)?.width)
    }

    fn ascent(&self, px: f32) -> f32 {
        self.raster
            .horizontal_line_metrics(px)
            .map(|m| m.ascent)
            .unwrap_or(px * 0.8)
    }
}

/// Greedy word wrap against shaped widths. `\n` forces a break; a single
/// word wider than `max_width` gets a line of its own.
pub fn wrap_lines(font: &LoadedFont, text: &str, px: f32, max_width: f32) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    for paragraph in text.split('\n') {
        let mut current = String::new();
        for word in paragraph.split_whitespace() {
            if current.is_empty() {
                current.push_str(word);
                continue;
            }
            let candidate = format!("{current} {word}");
            if font.measure(&candidate, px)? <= max_width {
                current = candidate;
            } else {
                lines.push(std::mem::replace(&mut current, word.to_string()));
            }
        }
        if !current.is_empty() {
            lines.push(current);
        }
    }
    Ok(lines)
}

pub fn parse_color(hex: &str) -> Result<[u8; 3]> {
    let h = hex.trim().trim_start_matches('#');
    let bad = || PipelineError::Config(format!("'{hex}' is not a #RRGGBB colour"));
    if h.len() != 6 || !h.is_ascii() {
        return Err(bad());
    }
    let channel = |i: usize| u8::from_str_radix(&h[i..i + 2], 16).map_err(|_| bad());
    Ok([channel(0)?, channel(2)?, channel(4)?])
}

/// Source-over blend of one coverage sample into a straight-alpha pixel.
fn blend(px: &mut Rgba<u8>, color: [u8; 3], alpha: u32) {
    if alpha == 0 {
        return;
    }
    let da = px[3] as u32;
    let out_a = alpha * 255 + da * (255 - alpha);
    if out_a == 0 {
        return;
    }
    for c in 0..3 {
        let src = color[c] as u32 * alpha * 255;
        let dst = px[c] as u32 * da * (255 - alpha);
        px[c] = ((src + dst + out_a / 2) / out_a) as u8;
    }
    px[3] = ((out_a + 127) / 255) as u8;
}

fn draw_run(img: &mut RgbaImage, font: &LoadedFont, run: &ShapedRun, px: f32, x: f32, baseline: f32, color: [u8; 3], opacity: u8) {
    let (w, h) = (img.width() as i32, img.height() as i32);
    for g in &run.glyphs {
        let (metrics, bitmap) = font.raster.rasterize_indexed(g.id, px);
        if metrics.width == 0 || metrics.height == 0 {
            continue;
        }
        let left = (x + g.x).round() as i32 + metrics.xmin;
        let top = (baseline - g.y).round() as i32 - (metrics.height as i32 + metrics.ymin);
        for row in 0..metrics.height {
            let py = top + row as i32;
            if py < 0 || py >= h {
                continue;
            }
            for col in 0..metrics.width {
                let pxl = left + col as i32;
                if pxl < 0 || pxl >= w {
                    continue;
                }
                let coverage = bitmap[row * metrics.width + col] as u32;
                let alpha = (coverage * opacity as u32 + 127) / 255;
                blend(img.get_pixel_mut(pxl as u32, py as u32), color, alpha);
            }
        }
    }
}

/// Lays out header, body and attribution over a transparent canvas.
pub struct CaptionRenderer {
    body_font: LoadedFont,
    header_font: Option<LoadedFont>,
    settings: CaptionSettings,
    color: [u8; 3],
    width: u32,
    height: u32,
}

struct Block {
    run: ShapedRun,
    px: f32,
    top: f32,
}

impl CaptionRenderer {
    pub fn new(settings: &CaptionSettings, width: u32, height: u32) -> Result<Self> {
        let body_font = LoadedFont::first_of(&settings.fonts)?;
        let header_font = match &settings.header_font {
            Some(p) => Some(LoadedFont::load(p)?),
            None => None,
        };
        Ok(Self {
            body_font,
            header_font,
            settings: settings.clone(),
            color: parse_color(&settings.color)?,
            width,
            height,
        })
    }

    pub fn body_font(&self) -> &LoadedFont {
        &self.body_font
    }

    fn line_height(&self, px: f32) -> f32 {
        px * self.settings.line_spacing
    }

    pub fn render(&self, caption: &CaptionText) -> Result<RgbaImage> {
        let s = &self.settings;
        let mut img = RgbaImage::new(self.width, self.height);
        let max_width = self.width.saturating_sub(2 * s.margin) as f32;

        if let Some(header) = caption.header.as_deref().filter(|h| !h.trim().is_empty()) {
            let font = self.header_font.as_ref().unwrap_or(&self.body_font);
            let run = font.shape(header, s.header_size)?;
            let x = (self.width as f32 - run.width) / 2.0;
            let baseline = s.header_y + font.ascent(s.header_size);
            draw_run(&mut img, font, &run, s.header_size, x, baseline, self.color, s.header_alpha);
        }

        let missing = self.body_font.missing_chars(&caption.body)?;
        if !missing.is_empty() {
            warn!("{} has no glyphs for {:?}", self.body_font.path.display(), missing);
        }

        let body_px = s.body_size;
        let attribution_px = s.attribution_size.unwrap_or(body_px * 0.7);
        let mut blocks = Vec::new();
        let mut cursor = 0.0f32;
        for line in wrap_lines(&self.body_font, &caption.body, body_px, max_width)? {
            blocks.push(Block {
                run: self.body_font.shape(&line, body_px)?,
                px: body_px,
                top: cursor,
            });
            cursor += self.line_height(body_px);
        }
        if let Some(attribution) = caption.attribution.as_deref().filter(|a| !a.trim().is_empty()) {
            // gap runs from the bottom of the last body line
            cursor += s.attribution_gap - self.line_height(body_px) + body_px;
            for line in wrap_lines(&self.body_font, attribution, attribution_px, max_width)? {
                blocks.push(Block {
                    run: self.body_font.shape(&line, attribution_px)?,
                    px: attribution_px,
                    top: cursor,
                });
                cursor += self.line_height(attribution_px);
            }
        }

        let offset = ((self.height as f32 - cursor) / 2.0).max(0.0);
        for b in &blocks {
            let x = (self.width as f32 - b.run.width) / 2.0;
            let baseline = offset + b.top + self.body_font.ascent(b.px);
            draw_run(&mut img, &self.body_font, &b.run, b.px, x, baseline, self.color, 255);
        }
        Ok(img)
    }

}

/// Writes the caption overlay PNG for one item.
pub trait OverlayRender: Send + Sync {
    fn render_to(&self, caption: &CaptionText, out: &Path) -> Result<()>;
}

impl OverlayRender for CaptionRenderer {
    fn render_to(&self, caption: &CaptionText, out: &Path) -> Result<()> {
        let img = self.render(caption)?;
        save_png(&img, out)?;
        info!("Caption overlay written to {}", out.display());
        Ok(())
    }
}

pub fn save_png(img: &RgbaImage, out: &Path) -> Result<()> {
    img.save_with_format(out, ImageFormat::Png)
        .map_err(|e| PipelineError::Io(std::io::Error::other(format!("{}: {e}", out.display()))))
}

/// Dark blue-grey gradient with a title and an excerpt, used when no
/// background could be found or generated.
pub fn draw_placeholder(width: u32, height: u32, title: &str, excerpt: &str, font: Option<&LoadedFont>) -> Result<RgbaImage> {
    let mut img = RgbaImage::from_fn(width, height, |_, y| {
        let v = (26.0 + y as f32 / height.max(1) as f32 * 30.0) as u8;
        Rgba([v, v, v.saturating_add(20), 255])
    });
    let Some(font) = font else {
        return Ok(img);
    };
    let max_width = width as f32 * 0.85;
    let title_px = (width as f32 / 14.0).max(12.0);
    let excerpt_px = title_px * 0.5;
    let mut y = height as f32 / 2.0 - title_px;
    for (text, px, color) in [(title, title_px, [255, 255, 255]), (excerpt, excerpt_px, [200, 200, 200])] {
        for line in wrap_lines(font, text, px, max_width)? {
            let run = font.shape(&line, px)?;
            let x = (width as f32 - run.width) / 2.0;
            draw_run(&mut img, font, &run, px, x, y + font.ascent(px), color, 255);
            y += px * 1.3;
        }
        y += px * 0.5;
    }
    Ok(img)
}
