//! Upload pipeline: PDF in, named [`SourcePages`] out.
//!
//! ```text
//! input ──▶ render ──▶ name
//! (URL/path)  (pdfium → JPEG)  (Cover Page, 1-left, 1-right, …)
//! ```
//!
//! 1. [`input`]: canonicalise the path or URL to a local, magic-checked PDF
//! 2. [`render`]: rasterise every page on the blocking pool and JPEG-encode it
//! 3. naming: [`SourcePages::from_ordered`] assigns page keys in reading order

pub mod input;
pub mod render;

use crate::config::GenerationConfig;
use crate::error::FlipbookError;
use crate::model::SourcePages;
use tracing::info;

/// Resolve, rasterise and name every page of `input`.
pub async fn extract_pages(
    input: &str,
    config: &GenerationConfig,
) -> Result<SourcePages, FlipbookError> {
    let source = input::resolve_pdf(input, config.download_timeout_secs).await?;
    let rendered = render::render_pages(
        source.path(),
        config.max_rendered_pixels,
        config.jpeg_quality,
        config.password.clone(),
    )
    .await?;

    let pages = SourcePages::from_ordered(rendered);
    info!(
        "Extracted {} pages ({} spreads)",
        pages.len(),
        pages.spread_count()
    );
    Ok(pages)
}
