use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use image::{DynamicImage, ImageOutputFormat, RgbaImage};
use log::debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JPEG encoding failed: {0}")]
    Encode(String),
}

static EXPORT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// RGBA -> JPEG bytes (alpha dropped)
pub fn encode_jpeg(image: &RgbaImage, quality: u8) -> Result<Vec<u8>, ExportError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(ExportError::Encode("empty image".to_string()));
    }

    let rgb = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(rgb)
        .write_to(&mut buffer, ImageOutputFormat::Jpeg(quality.clamp(1, 100)))
        .map_err(|e| ExportError::Encode(e.to_string()))?;
    Ok(buffer.into_inner())
}

fn unique_file_name() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let seq = EXPORT_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("capture_{}_{}_{}.jpg", millis, std::process::id(), seq)
}

/// 保存抓拍图片到临时目录，返回文件路径
pub fn save_capture(image: &RgbaImage, dir: &Path, quality: u8) -> Result<PathBuf, ExportError> {
    let bytes = encode_jpeg(image, quality)?;
    fs::create_dir_all(dir)?;

    let path = dir.join(unique_file_name());
    fs::write(&path, &bytes)?;
    debug!(
        "💾 saved {}x{} capture ({} bytes) to {}",
        image.width(),
        image.height(),
        bytes.len(),
        path.display()
    );
    Ok(path)
}
