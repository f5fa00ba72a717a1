//! OCR provider contract (C9, spec §4.9).
//!
//! Only the interface is specified — the recognition model itself is an
//! external collaborator. Grounded on the `async_trait` capability-interface
//! pattern used for the teacher's plugin services (`services::content_lock`,
//! `services::audit` held as `Option<Arc<dyn ...>>` in `cron/tasks.rs`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A quadrilateral in image-pixel space, clockwise from top-left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quad {
    pub points: [(i32, i32); 4],
}

impl Quad {
    pub fn from_bbox(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            points: [(left, top), (right, top), (right, bottom), (left, bottom)],
        }
    }

    /// Axis-aligned bounding box as `(left, top, right, bottom)`.
    pub fn bbox(&self) -> (i32, i32, i32, i32) {
        let xs = self.points.iter().map(|p| p.0);
        let ys = self.points.iter().map(|p| p.1);
        (
            xs.clone().min().unwrap_or(0),
            ys.clone().min().unwrap_or(0),
            xs.max().unwrap_or(0),
            ys.max().unwrap_or(0),
        )
    }

    pub fn intersects(&self, other: &Quad) -> bool {
        let (l1, t1, r1, b1) = self.bbox();
        let (l2, t2, r2, b2) = other.bbox();
        l1 < r2 && l2 < r1 && t1 < b2 && t2 < b1
    }

    pub fn union(&self, other: &Quad) -> Quad {
        let (l1, t1, r1, b1) = self.bbox();
        let (l2, t2, r2, b2) = other.bbox();
        Quad::from_bbox(l1.min(l2), t1.min(t2), r1.max(r2), b1.max(b2))
    }
}

/// Text reading direction detected for a region or group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextDirection {
    Horizontal,
    Vertical,
}

/// A single recognized text region, as produced by OCR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextRegion {
    pub quad: Quad,
    pub text: String,
    pub confidence: f32,
    pub direction: TextDirection,
    pub merged_count: u32,
}

/// Caller-supplied hints for an OCR pass (language model, orientation, etc).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OcrOptions {
    pub language_hint: Option<String>,
}

/// Recognizes text regions in a decoded page image. Deterministic for a
/// given `(image_bytes, options)` pair; implementation is external (model
/// runtime) and may be slow — callers must expect it to suspend.
#[async_trait]
pub trait OcrProvider: Send + Sync {
    async fn recognize(
        &self,
        image_bytes: &[u8],
        options: &OcrOptions,
    ) -> anyhow::Result<Vec<TextRegion>>;
}
