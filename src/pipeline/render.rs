//! Inpainting & renderer (C12, spec §4.12).
//!
//! Glyph rasterization is grounded on `Xion-rofld`'s `caption::text` module
//! (`render_line`'s glyph-iteration + pixel-bounding-box blend loop) ported
//! from `rusttype` to `ab_glyph`, since Xion-rofld's pinned `rusttype 0.2` is
//! too stale to depend on fresh (SPEC_FULL.md §D rationale applies the same
//! reasoning here: keep the teacher's *pattern*, swap the unmaintained
//! crate). Inpainting itself (solid-fill bbox) has no pack precedent and is
//! written directly from spec §4.12.

use ab_glyph::{Font, FontArc, Glyph, PxScale, ScaleFont};
use image::{GenericImage, Rgba, RgbaImage};

use super::grouping::TextGroup;

const STROKE_WIDTH_PX: i64 = 2;
const MIN_FONT_SIZE: f32 = 8.0;
const MAX_FONT_SIZE: f32 = 1000.0;

/// Layout parameters derived for one [`TextGroup`] (spec §4.12).
#[derive(Debug, Clone, Copy)]
pub struct LayoutHints {
    pub font_size: f32,
    pub columns: usize,
    /// Multiplier applied to `font_size` for the horizontal pitch between
    /// columns (manga convention: columns play the role "lines" play in
    /// horizontal text).
    pub line_spacing: f32,
    /// Extra vertical gap between stacked characters within one column.
    pub char_spacing: f32,
}

fn is_cjk(language: &str) -> bool {
    let lang = language.to_lowercase();
    lang.starts_with("zh") || lang.starts_with("ja") || lang.starts_with("ko")
}

/// Derive font size and spacing for rendering `translated_text` into
/// `group`'s bounding quad. Target direction is always vertical regardless
/// of the source direction (manga convention).
pub fn compute_layout(group: &TextGroup, translated_text: &str, language: &str) -> LayoutHints {
    let (left, top, right, bottom) = group.quad.bbox();
    let width = (right - left).max(1) as f32;
    let height = (bottom - top).max(1) as f32;

    let columns = group.member_count.max(1);
    let char_count = translated_text.chars().filter(|c| !c.is_whitespace()).count().max(1);
    let chars_per_column = (char_count as f32 / columns as f32).ceil().max(1.0);

    let cjk = is_cjk(language);
    let line_spacing = if cjk { 1.1 } else { 1.3 };
    let char_spacing_ratio = if cjk { 0.05 } else { 0.0 };

    let size_from_height = height / (chars_per_column * line_spacing);
    let size_from_width = width / columns as f32;
    let font_size = size_from_height.min(size_from_width).clamp(MIN_FONT_SIZE, MAX_FONT_SIZE);

    LayoutHints {
        font_size,
        columns,
        line_spacing,
        char_spacing: font_size * char_spacing_ratio,
    }
}

/// Erase a TextGroup's footprint with a solid white fill. Cannot fail by
/// construction: a bounded write to an in-memory buffer.
pub fn inpaint(image: &mut RgbaImage, group: &TextGroup) {
    let (left, top, right, bottom) = group.quad.bbox();
    let (w, h) = (image.width() as i32, image.height() as i32);
    for y in top.max(0)..bottom.min(h) {
        for x in left.max(0)..right.min(w) {
            image.put_pixel(x as u32, y as u32, Rgba([255, 255, 255, 255]));
        }
    }
}

/// Renders `translated_text` into `group`'s footprint: walks columns
/// right→left, characters within a column top→bottom, wrapping to the next
/// column on vertical overflow. Pure: takes everything it needs as
/// arguments, produces no hidden state.
pub fn render_group(image: &mut RgbaImage, group: &TextGroup, translated_text: &str, layout: &LayoutHints, font: &FontArc) {
    let (left, top, right, _bottom) = group.quad.bbox();
    let column_pitch = layout.font_size * layout.line_spacing;
    let vertical_step = layout.font_size + layout.char_spacing;
    let (_, top_bound, _, bottom_bound) = group.quad.bbox();
    let _ = top;

    let scale = PxScale::from(layout.font_size);
    let scaled_font = font.as_scaled(scale);

    let mut column_right_edge = right as f32;
    let mut cursor_y = top_bound as f32 + scaled_font.ascent();
    let mut cursor_x = column_right_edge - column_pitch / 2.0;

    for ch in translated_text.chars() {
        if ch.is_whitespace() {
            cursor_y += vertical_step;
        } else {
            draw_glyph_with_stroke(image, font, &scaled_font, ch, cursor_x, cursor_y);
            cursor_y += vertical_step;
        }

        if cursor_y > bottom_bound as f32 {
            cursor_y = top_bound as f32 + scaled_font.ascent();
            column_right_edge -= column_pitch;
            cursor_x = column_right_edge - column_pitch / 2.0;
            if cursor_x < left as f32 {
                break;
            }
        }
    }
}

fn draw_glyph_with_stroke(
    image: &mut RgbaImage,
    font: &FontArc,
    scaled_font: &ab_glyph::PxScaleFont<&FontArc>,
    ch: char,
    x: f32,
    y: f32,
) {
    let glyph_id = font.glyph_id(ch);
    let glyph: Glyph = glyph_id.with_scale_and_position(scaled_font.scale(), ab_glyph::point(x, y));
    let Some(outlined) = font.outline_glyph(glyph) else {
        return;
    };
    let bounds = outlined.px_bounds();

    // White stroke first (drawn at small offsets), then solid black fill on
    // top, matching spec's "black text, 2px white stroke" (§4.12).
    for dx in -STROKE_WIDTH_PX..=STROKE_WIDTH_PX {
        for dy in -STROKE_WIDTH_PX..=STROKE_WIDTH_PX {
            if dx == 0 && dy == 0 {
                continue;
            }
            outlined.draw(|gx, gy, coverage| {
                if coverage <= 0.0 {
                    return;
                }
                let px = bounds.min.x as i64 + gx as i64 + dx;
                let py = bounds.min.y as i64 + gy as i64 + dy;
                blend_if_in_bounds(image, px, py, Rgba([255, 255, 255, (coverage * 255.0) as u8]));
            });
        }
    }

    outlined.draw(|gx, gy, coverage| {
        if coverage <= 0.0 {
            return;
        }
        let px = bounds.min.x as i64 + gx as i64;
        let py = bounds.min.y as i64 + gy as i64;
        blend_if_in_bounds(image, px, py, Rgba([0, 0, 0, (coverage * 255.0) as u8]));
    });
}

fn blend_if_in_bounds(image: &mut RgbaImage, x: i64, y: i64, color: Rgba<u8>) {
    if x < 0 || y < 0 {
        return;
    }
    let (x, y) = (x as u32, y as u32);
    if image.in_bounds(x, y) {
        image.blend_pixel(x, y, color);
    }
}

/// Full per-page render pass: inpaint every group, then draw its translated
/// text. A single forward pass, no retained state (spec §4.12 "state
/// machine: none").
pub fn render_page(
    mut image: RgbaImage,
    groups: &[TextGroup],
    translations: &[String],
    language: &str,
    font: &FontArc,
) -> anyhow::Result<RgbaImage> {
    validate_lengths(groups.len(), translations.len())?;

    for group in groups {
        inpaint(&mut image, group);
    }
    for (group, translated) in groups.iter().zip(translations.iter()) {
        let layout = compute_layout(group, translated, language);
        render_group(&mut image, group, translated, &layout, font);
    }
    Ok(image)
}

fn validate_lengths(groups_len: usize, translations_len: usize) -> anyhow::Result<()> {
    anyhow::ensure!(
        groups_len == translations_len,
        "translated_texts length {translations_len} does not match text_groups length {groups_len}"
    );
    Ok(())
}
