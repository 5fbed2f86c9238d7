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

//! Animated GIF pipeline: frame-by-frame color classification and
//! histogram equalization, with the delay-unit normalization heuristic
//! needed because some producers mislabel millisecond delays as the GIF
//! format's native centisecond unit.

use std::io::Cursor;

use anyhow::{Context, Result};

use super::{Channel, OutputConfig};
use crate::processor::histogram::equalize_rgb_channels;
use crate::scheduler::ProcessingJob;

struct DecodedGif {
    width: u16,
    height: u16,
    frames: Vec<Vec<u8>>, // composited RGBA8 canvases, one per frame
    raw_delays: Vec<u16>, // as declared in the source file, pre-normalization
}

fn decode(data: &[u8]) -> Result<DecodedGif> {
    let mut options = ::gif::DecodeOptions::new();
    options.set_color_output(::gif::ColorOutput::RGBA);
    let mut decoder = options.read_info(Cursor::new(data)).context("Failed to decode GIF header")?;

    let width = decoder.width();
    let height = decoder.height();
    let mut canvas = vec![0u8; width as usize * height as usize * 4];
    let mut frames = Vec::new();
    let mut raw_delays = Vec::new();

    while let Some(frame) = decoder.read_next_frame().context("Failed to decode GIF frame")? {
        blit(&mut canvas, width, frame);
        frames.push(canvas.clone());
        raw_delays.push(frame.delay);
    }

    if frames.is_empty() {
        anyhow::bail!("GIF has no frames");
    }

    Ok(DecodedGif { width, height, frames, raw_delays })
}

/// Overwrites `canvas` with `frame`'s pixels at its (left, top) offset.
/// Disposal methods (restore-to-background, restore-to-previous) are not
/// modeled; every frame is assumed opaque over the prior canvas state,
/// which holds for the common case of full-canvas, non-transparent frames.
fn blit(canvas: &mut [u8], canvas_width: u16, frame: &::gif::Frame) {
    let cw = canvas_width as usize;
    for y in 0..frame.height as usize {
        let cy = y + frame.top as usize;
        for x in 0..frame.width as usize {
            let cx = x + frame.left as usize;
            if cx >= cw || cy * cw + cx >= canvas.len() / 4 {
                continue;
            }
            let src = (y * frame.width as usize + x) * 4;
            let dst = (cy * cw + cx) * 4;
            canvas[dst..dst + 4].copy_from_slice(&frame.buffer[src..src + 4]);
        }
    }
}

/// "Any delay >= 20 and divisible by 10" anywhere in the array implies the
/// whole array was authored in milliseconds; convert every entry by
/// `(d + 5) / 10` and clamp to the valid centisecond range.
fn normalize_delays(raw: &[u16]) -> Vec<u16> {
    let assume_ms = raw.iter().any(|&d| d >= 20 && d % 10 == 0);
    raw.iter()
        .map(|&d| {
            let cs = if assume_ms { (d as u32 + 5) / 10 } else { d as u32 };
            cs.clamp(2, 5000) as u16
        })
        .collect()
}

fn output_filename(image_id: &str, filename: &str) -> String {
    let has_gif_ext = filename.len() >= 4
        && filename[filename.len() - 4..].eq_ignore_ascii_case(".gif");
    if has_gif_ext {
        format!("{}_{}", image_id, filename)
    } else {
        format!("{}_{}.gif", image_id, filename)
    }
}

fn classify(decoded: &DecodedGif) -> Channel {
    let (mut r, mut g, mut b) = (0u64, 0u64, 0u64);
    for frame in &decoded.frames {
        for px in frame.chunks_exact(4) {
            r += px[0] as u64;
            g += px[1] as u64;
            b += px[2] as u64;
        }
    }
    Channel::dominant(r, g, b)
}

fn encode(width: u16, height: u16, frames: &[Vec<u8>], delays_cs: &[u16], out: &mut Vec<u8>) -> Result<()> {
    let mut encoder = ::gif::Encoder::new(out, width, height, &[]).context("Failed to create GIF encoder")?;
    encoder.set_repeat(::gif::Repeat::Infinite).context("Failed to set GIF loop mode")?;
    for (frame, &delay_cs) in frames.iter().zip(delays_cs) {
        let mut rgba = frame.clone();
        let mut gif_frame = ::gif::Frame::from_rgba_speed(width, height, &mut rgba, 10);
        gif_frame.delay = delay_cs;
        encoder.write_frame(&gif_frame).context("Failed to write GIF frame")?;
    }
    Ok(())
}

pub fn process(job: &ProcessingJob, config: &OutputConfig) -> Result<()> {
    let decoded = decode(&job.data)?;
    let delays_cs = normalize_delays(&decoded.raw_delays);
    let out_name = output_filename(&job.image_id, &job.filename);

    let mut color_err = None;
    let mut hist_err = None;

    if job.processing_type.wants_color() {
        if let Err(e) = write_color_copy(&decoded, &delays_cs, config, &out_name) {
            color_err = Some(e);
        }
    }
    if job.processing_type.wants_histogram() {
        if let Err(e) = write_histogram_copy(&decoded, &delays_cs, config, &out_name) {
            hist_err = Some(e);
        }
    }

    match (color_err, hist_err) {
        (None, None) => Ok(()),
        (Some(e), None) | (None, Some(e)) => Err(e),
        (Some(e), Some(_)) => Err(e),
    }
}

fn write_color_copy(decoded: &DecodedGif, delays_cs: &[u16], config: &OutputConfig, out_name: &str) -> Result<()> {
    let channel = classify(decoded);
    let mut buf = Vec::new();
    encode(decoded.width, decoded.height, &decoded.frames, delays_cs, &mut buf)?;
    let dir = config.color_dir(channel);
    std::fs::write(dir.join(out_name), buf).context("Failed to write GIF color-classified artifact")
}

fn write_histogram_copy(decoded: &DecodedGif, delays_cs: &[u16], config: &OutputConfig, out_name: &str) -> Result<()> {
    let pixel_count = decoded.width as usize * decoded.height as usize;
    let mut equalized_frames = Vec::with_capacity(decoded.frames.len());
    for frame in &decoded.frames {
        let mut frame = frame.clone();
        equalize_rgb_channels(&mut frame, pixel_count);
        equalized_frames.push(frame);
    }
    let mut buf = Vec::new();
    encode(decoded.width, decoded.height, &equalized_frames, delays_cs, &mut buf)?;
    std::fs::write(config.histogram_dir.join(out_name), buf).context("Failed to write GIF histogram artifact")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_normalization_detects_milliseconds() {
        assert_eq!(normalize_delays(&[40, 60, 80]), vec![4, 6, 8]);
    }

    #[test]
    fn delay_normalization_leaves_centiseconds_alone() {
        assert_eq!(normalize_delays(&[4, 6, 8]), vec![4, 6, 8]);
    }

    #[test]
    fn delay_normalization_clamps_to_valid_range() {
        assert_eq!(normalize_delays(&[0, 1, 999999]), vec![2, 2, 5000]);
    }

    #[test]
    fn output_filename_appends_gif_only_when_missing() {
        assert_eq!(output_filename("id", "cat.gif"), "id_cat.gif");
        assert_eq!(output_filename("id", "cat.GIF"), "id_cat.GIF");
        assert_eq!(output_filename("id", "cat"), "id_cat.gif");
        assert_eq!(output_filename("id", "notagifname"), "id_notagifname.gif");
    }
}
