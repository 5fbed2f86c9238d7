//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! Invoked only from the scheduler worker (single-threaded), so none of
//! this needs internal locking. Operates on an in-memory buffer plus
//! metadata and writes artifact files to the configured output directories.

mod gif;
pub mod histogram;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{GenericImageView, ImageEncoder};

use crate::protocol::sanitize_filename;
use crate::scheduler::ProcessingJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Red,
    Green,
    Blue,
}

impl Channel {
    /// Ties break red > green > blue: the earlier channel wins on equal sums.
    pub fn dominant(r: u64, g: u64, b: u64) -> Channel {
        if r >= g && r >= b {
            Channel::Red
        } else if g >= b {
            Channel::Green
        } else {
            Channel::Blue
        }
    }
}

#[derive(Clone)]
pub struct OutputConfig {
    pub histogram_dir: PathBuf,
    pub color_red_dir: PathBuf,
    pub color_green_dir: PathBuf,
    pub color_blue_dir: PathBuf,
}

impl OutputConfig {
    pub fn color_dir(&self, channel: Channel) -> &Path {
        match channel {
            Channel::Red => &self.color_red_dir,
            Channel::Green => &self.color_green_dir,
            Channel::Blue => &self.color_blue_dir,
        }
    }
}

/// `"gif"` (case-insensitive) routes to the animated pipeline; everything
/// else, including unrecognized formats, routes to the static pipeline.
pub fn process_job(job: &ProcessingJob, config: &OutputConfig) -> Result<()> {
    if job.format.eq_ignore_ascii_case("gif") {
        gif::process(job, config)
    } else {
        process_static(job, config)
    }
}

fn process_static(job: &ProcessingJob, config: &OutputConfig) -> Result<()> {
    let filename = sanitize_filename(&job.filename);
    let out_name = format!("{}_{}", job.image_id, filename);

    let mut color_err = None;
    let mut hist_err = None;

    if job.processing_type.wants_color() {
        if let Err(e) = write_color_copy(job, config, &out_name) {
            color_err = Some(e);
        }
    }
    if job.processing_type.wants_histogram() {
        if let Err(e) = write_histogram_copy(job, config, &out_name) {
            hist_err = Some(e);
        }
    }

    match (color_err, hist_err) {
        (None, None) => Ok(()),
        (Some(e), None) | (None, Some(e)) => Err(e),
        (Some(e), Some(_)) => Err(e),
    }
}

fn write_color_copy(job: &ProcessingJob, config: &OutputConfig, out_name: &str) -> Result<()> {
    let image = image::load_from_memory(&job.data).context("Failed to decode static image")?;
    let channel = classify_static(&image);
    // The classified copy is a byte-for-byte copy of the upload: no
    // re-encoding, so no generation loss relative to what the client sent.
    std::fs::write(config.color_dir(channel).join(out_name), &job.data)
        .context("Failed to write color-classified artifact")
}

fn write_histogram_copy(job: &ProcessingJob, config: &OutputConfig, out_name: &str) -> Result<()> {
    let image = image::load_from_memory(&job.data).context("Failed to decode static image")?;
    let (w, h) = image.dimensions();
    let mut rgba = image.to_rgba8().into_raw();
    histogram::equalize_rgb_channels(&mut rgba, (w * h) as usize);

    let encoded = encode_for_format(&job.format, w, h, &rgba)?;
    std::fs::write(config.histogram_dir.join(out_name), encoded)
        .context("Failed to write histogram artifact")
}

fn classify_static(image: &image::DynamicImage) -> Channel {
    let (mut r, mut g, mut b) = (0u64, 0u64, 0u64);
    for (_, _, pixel) in image.pixels() {
        r += pixel[0] as u64;
        g += pixel[1] as u64;
        b += pixel[2] as u64;
    }
    Channel::dominant(r, g, b)
}

/// `png` -> PNG, `jpg`/`jpeg` -> JPEG quality 95, anything else -> PNG (to
/// avoid lossy re-encoding of a format we don't recognize).
fn encode_for_format(format: &str, w: u32, h: u32, rgba: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    if format.eq_ignore_ascii_case("jpg") || format.eq_ignore_ascii_case("jpeg") {
        let rgb: Vec<u8> = rgba.chunks_exact(4).flat_map(|px| [px[0], px[1], px[2]]).collect();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 95)
            .write_image(&rgb, w, h, image::ColorType::Rgb8.into())
            .context("Failed to encode JPEG histogram artifact")?;
    } else {
        image::codecs::png::PngEncoder::new(&mut out)
            .write_image(rgba, w, h, image::ColorType::Rgba8.into())
            .context("Failed to encode PNG histogram artifact")?;
    }
    Ok(out)
}
