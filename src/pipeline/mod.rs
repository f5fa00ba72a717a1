//! Per-page translation pipeline: OCR → grouping → translation → render
//! (spec §4.9–§4.12). Each stage is its own module so the scheduler (C8)
//! can interleave cancellation checks between them.

pub mod grouping;
pub mod ocr;
pub mod render;
pub mod translate;

pub use grouping::{build_groups, TextGroup};
pub use ocr::{OcrOptions, OcrProvider, Quad, TextDirection, TextRegion};
pub use render::{compute_layout, inpaint, render_group, render_page, LayoutHints};
pub use translate::{
    is_failure_marker, parse_numbered_response, EngineError, EngineRefusal, StringCache,
    TranslationEngine, TranslationService,
};
