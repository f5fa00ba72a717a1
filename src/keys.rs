//! Cache-key generator (C1).
//!
//! Two pure functions anchor the cache: [`TranslationKey`] addresses "what
//! was asked for", [`content_fingerprint`] addresses "what the source
//! actually is". Grounded on `core/core_cache/cache_key_generator.py` in
//! `examples/original_source/` for the colon-joined key shape and on
//! `trovato-kernel`'s `sha2`/`hex` use for the fingerprint hashing.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of a source page's canonical pixel content.
pub type ImageFingerprint = String;

/// Request-address tuple used for cache lookup (spec §3 "Translation key").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TranslationKey {
    pub manga_ref: String,
    pub page_index: u32,
    pub language: String,
    pub engine_id: String,
}

impl TranslationKey {
    /// Build a translation key, normalizing each component.
    pub fn new(manga_ref: &str, page_index: u32, language: &str, engine_id: &str) -> Self {
        Self {
            manga_ref: normalize_manga_ref(manga_ref),
            page_index,
            language: language.trim().to_lowercase(),
            engine_id: engine_id.trim().to_lowercase(),
        }
    }

    /// Stable string form, safe to hash or to embed in a sidecar.
    pub fn as_string(&self) -> String {
        format!(
            "translation:{}:{}:{}:{}",
            self.manga_ref, self.page_index, self.language, self.engine_id
        )
    }

    /// Hex digest of [`TranslationKey::as_string`], safe as a filesystem name.
    pub fn hash_hex(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.as_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Parse a key previously produced by [`TranslationKey::as_string`].
    ///
    /// Returns `None` ("unknown") rather than an error — this exists for
    /// administrative listings and cache-management tooling, which should
    /// degrade gracefully on a malformed key rather than fail the caller.
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 5 || parts[0] != "translation" {
            return None;
        }
        let engine_id = parts[parts.len() - 1].to_string();
        let language = parts[parts.len() - 2].to_string();
        let page_index: u32 = parts[parts.len() - 3].parse().ok()?;
        let manga_ref = parts[1..parts.len() - 3].join(":");
        if manga_ref.is_empty() {
            return None;
        }
        Some(Self {
            manga_ref,
            page_index,
            language,
            engine_id,
        })
    }
}

/// Normalize a [`crate::task::model`] `MangaRef`: collapse OS-native
/// separators and strip trailing slashes. Case is preserved.
pub fn normalize_manga_ref(manga_ref: &str) -> String {
    let collapsed = manga_ref.replace('\\', "/");
    let trimmed = collapsed.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Compute the content fingerprint of a source page image.
///
/// Decodes `image_bytes` to RGBA8 and re-encodes as canonical lossless PNG
/// before hashing, so that identical pixel content collides across
/// container formats (spec §4.1) while any pixel change yields a different
/// digest.
pub fn content_fingerprint(image_bytes: &[u8]) -> Result<ImageFingerprint> {
    let decoded = image::load_from_memory(image_bytes)
        .context("failed to decode source image for fingerprinting")?
        .to_rgba8();

    let mut canonical = Vec::new();
    {
        use image::codecs::png::{CompressionType, FilterType, PngEncoder};
        use image::ImageEncoder;
        let encoder =
            PngEncoder::new_with_quality(&mut canonical, CompressionType::Best, FilterType::NoFilter);
        encoder
            .write_image(
                decoded.as_raw(),
                decoded.width(),
                decoded.height(),
                image::ExtendedColorType::Rgba8,
            )
            .context("failed to canonically re-encode image for fingerprinting")?;
    }

    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_key_normalizes_case_and_whitespace() {
        let key = TranslationKey::new("/m/one.zip/", 3, "ZH-CN", "  Google ");
        assert_eq!(key.manga_ref, "/m/one.zip");
        assert_eq!(key.language, "zh-cn");
        assert_eq!(key.engine_id, "google");
    }

    #[test]
    fn translation_key_roundtrips_through_parse() {
        let key = TranslationKey::new("/m/one.zip", 3, "zh", "google");
        let s = key.as_string();
        let parsed = TranslationKey::parse(&s).expect("key should parse");
        assert_eq!(parsed, key);
    }

    #[test]
    fn translation_key_roundtrips_with_colon_in_path() {
        // Windows-style drive letters survive the join/split asymmetry.
        let key = TranslationKey::new("c:/manga/one.zip", 0, "en", "google");
        let parsed = TranslationKey::parse(&key.as_string()).expect("key should parse");
        assert_eq!(parsed, key);
    }

    #[test]
    fn parse_rejects_malformed_keys() {
        assert!(TranslationKey::parse("not-a-key").is_none());
        assert!(TranslationKey::parse("translation:onlytwo:parts").is_none());
    }

    #[test]
    fn fingerprint_is_stable_for_identical_pixels() {
        let img = image::RgbaImage::from_pixel(4, 4, image::Rgba([10, 20, 30, 255]));
        let mut png_bytes = Vec::new();
        image::DynamicImage::ImageRgba8(img.clone())
            .write_to(
                &mut std::io::Cursor::new(&mut png_bytes),
                image::ImageFormat::Png,
            )
            .unwrap();

        let mut jpeg_like_container = Vec::new();
        // Re-encode the SAME pixels through a different container to prove
        // the fingerprint is pixel-based, not byte-based.
        image::DynamicImage::ImageRgba8(img)
            .write_to(
                &mut std::io::Cursor::new(&mut jpeg_like_container),
                image::ImageFormat::Png,
            )
            .unwrap();

        let fp1 = content_fingerprint(&png_bytes).unwrap();
        let fp2 = content_fingerprint(&jpeg_like_container).unwrap();
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn fingerprint_changes_with_pixel_change() {
        let img1 = image::RgbaImage::from_pixel(4, 4, image::Rgba([10, 20, 30, 255]));
        let img2 = image::RgbaImage::from_pixel(4, 4, image::Rgba([11, 20, 30, 255]));
        let mut bytes1 = Vec::new();
        let mut bytes2 = Vec::new();
        image::DynamicImage::ImageRgba8(img1)
            .write_to(&mut std::io::Cursor::new(&mut bytes1), image::ImageFormat::Png)
            .unwrap();
        image::DynamicImage::ImageRgba8(img2)
            .write_to(&mut std::io::Cursor::new(&mut bytes2), image::ImageFormat::Png)
            .unwrap();

        assert_ne!(
            content_fingerprint(&bytes1).unwrap(),
            content_fingerprint(&bytes2).unwrap()
        );
    }
}
