//! PDF rasterisation: every page → JPEG bytes via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with thread-local state; calling it on a Tokio
//! worker would stall the executor for the whole render. The work runs on the
//! blocking pool and hands back plain bytes.
//!
//! ## Why cap pixels?
//!
//! Page sizes vary wildly. `max_pixels` bounds the longest edge so a poster
//! PDF cannot blow up memory or the image-generation payload.

use crate::error::FlipbookError;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming an explicit libpdfium to load.
pub const PDFIUM_LIB_ENV: &str = "PDFIUM_LIB_PATH";

/// One rendered page: JPEG bytes, width, height.
pub type RenderedPage = (Vec<u8>, u32, u32);

/// Rasterise every page of `pdf_path`, in document order.
pub async fn render_pages(
    pdf_path: &Path,
    max_pixels: u32,
    jpeg_quality: u8,
    password: Option<String>,
) -> Result<Vec<RenderedPage>, FlipbookError> {
    let path = pdf_path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        render_pages_blocking(&path, max_pixels, jpeg_quality, password.as_deref())
    })
    .await
    .map_err(|e| FlipbookError::Internal(format!("Render task panicked: {e}")))?
}

fn bind_pdfium() -> Result<Pdfium, FlipbookError> {
    bind_pdfium_from(std::env::var_os(PDFIUM_LIB_ENV).map(PathBuf::from))
}

/// Bind an explicit library when given one, otherwise the default source.
fn bind_pdfium_from(lib: Option<PathBuf>) -> Result<Pdfium, FlipbookError> {
    match lib {
        Some(path) => Pdfium::bind_to_library(&path)
            .map(Pdfium::new)
            .map_err(|e| {
                FlipbookError::Internal(format!(
                    "cannot load pdfium from {} ({e:?})",
                    path.display()
                ))
            }),
        None => bind_default_pdfium(),
    }
}

#[cfg(feature = "auto-pdfium")]
fn bind_default_pdfium() -> Result<Pdfium, FlipbookError> {
    pdfium_auto::bind_pdfium_silent()
        .map_err(|e| FlipbookError::Internal(format!("pdfium download failed: {e}")))
}

#[cfg(not(feature = "auto-pdfium"))]
fn bind_default_pdfium() -> Result<Pdfium, FlipbookError> {
    Pdfium::bind_to_system_library()
        .map(Pdfium::new)
        .map_err(|e| {
            FlipbookError::Internal(format!(
                "pdfium library not available ({e:?}); set {PDFIUM_LIB_ENV} \
                 or build with the auto-pdfium feature"
            ))
        })
}

fn render_pages_blocking(
    pdf_path: &Path,
    max_pixels: u32,
    jpeg_quality: u8,
    password: Option<&str>,
) -> Result<Vec<RenderedPage>, FlipbookError> {
    let pdfium = bind_pdfium()?;

    let document = pdfium.load_pdf_from_file(pdf_path, password).map_err(|e| {
        let detail = format!("{e:?}");
        if detail.to_lowercase().contains("password") {
            if password.is_some() {
                FlipbookError::WrongPassword {
                    path: pdf_path.to_path_buf(),
                }
            } else {
                FlipbookError::PasswordRequired {
                    path: pdf_path.to_path_buf(),
                }
            }
        } else {
            FlipbookError::CorruptPdf {
                path: pdf_path.to_path_buf(),
                detail,
            }
        }
    })?;

    let pages = document.pages();
    let page_count = pages.len() as usize;
    if page_count == 0 {
        return Err(FlipbookError::EmptyDocument {
            path: pdf_path.to_path_buf(),
        });
    }
    info!("PDF loaded: {} pages", page_count);

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut rendered = Vec::with_capacity(page_count);
    for (idx, page) in pages.iter().enumerate() {
        let page_no = idx + 1;
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| FlipbookError::RasterisationFailed {
                page: page_no,
                detail: format!("{e:?}"),
            })?;
        let image = bitmap.as_image();
        let (width, height) = (image.width(), image.height());
        let jpeg = encode_jpeg(&image, jpeg_quality).map_err(|e| {
            FlipbookError::RasterisationFailed {
                page: page_no,
                detail: format!("JPEG encoding: {e}"),
            }
        })?;
        debug!(
            "Rendered page {} → {}x{} px, {} bytes JPEG",
            page_no,
            width,
            height,
            jpeg.len()
        );
        rendered.push((jpeg, width, height));
    }

    Ok(rendered)
}

/// Flatten to RGB and encode as JPEG at `quality` (1–100).
pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let mut buf = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encodes_rgba_as_jpeg() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 4, Rgba([200, 10, 10, 128])));
        let bytes = encode_jpeg(&img, 95).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8], "JPEG SOI marker");
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 4));
    }

    #[test]
    fn lower_quality_is_smaller() {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_fn(64, 64, |x, y| {
            image::Rgb([(x * 4) as u8, (y * 4) as u8, ((x + y) * 2) as u8])
        }));
        let hi = encode_jpeg(&img, 95).unwrap();
        let lo = encode_jpeg(&img, 10).unwrap();
        assert!(lo.len() < hi.len());
    }

    #[test]
    fn explicit_library_path_is_not_replaced_by_a_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("libpdfium.so");
        let Err(err) = bind_pdfium_from(Some(missing.clone())) else {
            panic!("bound a library that does not exist");
        };
        match err {
            FlipbookError::Internal(msg) => {
                assert!(msg.contains(&missing.display().to_string()), "got: {msg}")
            }
            other => panic!("expected Internal, got {other:?}"),
        }
    }
}
