//! Image stage: per-format recompression, fanned out on a rayon pool.

use std::ffi::OsStr;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{AnimationDecoder, ImageFormat};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use super::{output_path, read, svg, Output};
use crate::config::{Config, ImageSettings};
use crate::error::{BuildError, Result};

/// Format dispatch by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Gif,
    Jpeg,
    Png,
    Svg,
    Other,
}

impl Kind {
    fn of(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(OsStr::to_str)
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("gif") => Kind::Gif,
            Some("jpg" | "jpeg") => Kind::Jpeg,
            Some("png") => Kind::Png,
            Some("svg") => Kind::Svg,
            _ => Kind::Other,
        }
    }
}

/// Map an optipng-style level (0-7) onto the encoder's compression presets
fn png_compression(level: u8) -> CompressionType {
    match level {
        0..=1 => CompressionType::Fast,
        2..=4 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}

/// Recompress one image. Raster output that is not smaller than the input is
/// discarded in favor of the original bytes.
pub fn compress_image(
    path: &Path,
    bytes: &[u8],
    settings: &ImageSettings,
) -> std::result::Result<Vec<u8>, String> {
    let encoded = match Kind::of(path) {
        Kind::Svg => return svg::minify_svg(bytes, settings),
        Kind::Other => return Ok(bytes.to_vec()),
        Kind::Gif => encode_gif(bytes)?,
        Kind::Jpeg => {
            let img = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)
                .map_err(|e| e.to_string())?;
            let mut out = Vec::new();
            let encoder = JpegEncoder::new_with_quality(&mut out, settings.jpeg_quality);
            img.write_with_encoder(encoder).map_err(|e| e.to_string())?;
            out
        }
        Kind::Png => {
            let img = image::load_from_memory_with_format(bytes, ImageFormat::Png)
                .map_err(|e| e.to_string())?;
            let mut out = Vec::new();
            let encoder = PngEncoder::new_with_quality(
                &mut out,
                png_compression(settings.png_level),
                FilterType::Adaptive,
            );
            img.write_with_encoder(encoder).map_err(|e| e.to_string())?;
            out
        }
    };

    if encoded.len() < bytes.len() {
        Ok(encoded)
    } else {
        Ok(bytes.to_vec())
    }
}

fn encode_gif(bytes: &[u8]) -> std::result::Result<Vec<u8>, String> {
    let decoder = GifDecoder::new(Cursor::new(bytes)).map_err(|e| e.to_string())?;
    let frames = decoder
        .into_frames()
        .collect_frames()
        .map_err(|e| e.to_string())?;

    let mut out = Vec::new();
    {
        // The trailer is written when the encoder drops
        let mut encoder = GifEncoder::new(&mut out);
        encoder
            .set_repeat(Repeat::Infinite)
            .map_err(|e| e.to_string())?;
        encoder.encode_frames(frames).map_err(|e| e.to_string())?;
    }
    Ok(out)
}

/// Compress every matched image in parallel, keeping relative structure
pub(super) fn compress(
    inputs: &[PathBuf],
    base: &Path,
    destination: &Path,
    config: &Config,
) -> Result<Vec<Output>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.jobs)
        .build()
        .map_err(|e| BuildError::config(format!("failed to start image workers: {e}")))?;

    let progress = if config.verbose {
        let pb = ProgressBar::new(inputs.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} images")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Some(pb)
    } else {
        None
    };

    let outputs = pool.install(|| {
        inputs
            .par_iter()
            .map(|src| {
                let bytes = read(src)?;
                let contents = compress_image(src, &bytes, &config.images).map_err(|message| {
                    BuildError::Image {
                        path: src.clone(),
                        message,
                    }
                })?;
                crate::debug!("images"; "{} {} -> {} bytes", src.display(), bytes.len(), contents.len());
                if let Some(ref pb) = progress {
                    pb.inc(1);
                }
                Ok(Output {
                    path: output_path(src, base, destination),
                    contents,
                })
            })
            .collect::<Result<Vec<_>>>()
    });

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    outputs
}
