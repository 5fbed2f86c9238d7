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

//! Per-channel histogram equalization over an interleaved RGBA8 buffer.
//! Channels 0, 1, 2 (R, G, B) are equalized independently; channel 3
//! (alpha) is always left untouched, matching the "channels >= 4 are left
//! untouched" rule from the static pipeline (an RGBA buffer's 4th channel
//! is exactly that case, whether or not the source image had real alpha).

/// Equalizes R, G, B in place over an interleaved RGBA8 buffer of `pixel_count`
/// pixels (`buf.len() == pixel_count * 4`).
pub fn equalize_rgb_channels(buf: &mut [u8], pixel_count: usize) {
    debug_assert_eq!(buf.len(), pixel_count * 4);
    if pixel_count == 0 {
        return;
    }
    for channel in 0..3 {
        let cdf = build_cdf(buf, channel);
        for px in 0..pixel_count {
            let idx = px * 4 + channel;
            let v = buf[idx] as usize;
            buf[idx] = (cdf[v] * 255 / pixel_count) as u8;
        }
    }
}

fn build_cdf(buf: &[u8], channel: usize) -> [usize; 256] {
    let mut histogram = [0usize; 256];
    let mut idx = channel;
    while idx < buf.len() {
        histogram[buf[idx] as usize] += 1;
        idx += 4;
    }
    let mut cdf = [0usize; 256];
    let mut running = 0;
    for (bin, count) in histogram.iter().enumerate() {
        running += count;
        cdf[bin] = running;
    }
    cdf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_image(w: usize, h: usize) -> Vec<u8> {
        // Each of the 256 possible byte values appears exactly once per
        // channel, repeated to fill w*h pixels: a uniformly distributed
        // channel, the precondition under which equalization is idempotent.
        let n = w * h;
        let mut buf = vec![0u8; n * 4];
        for px in 0..n {
            let v = (px % 256) as u8;
            buf[px * 4] = v;
            buf[px * 4 + 1] = v;
            buf[px * 4 + 2] = v;
            buf[px * 4 + 3] = 255;
        }
        buf
    }

    #[test]
    fn idempotent_on_uniformly_distributed_channel() {
        let mut buf = uniform_image(16, 16);
        equalize_rgb_channels(&mut buf, 16 * 16);
        let once = buf.clone();
        equalize_rgb_channels(&mut buf, 16 * 16);
        assert_eq!(buf, once);
    }

    #[test]
    fn alpha_channel_is_never_touched() {
        let mut buf = vec![10, 20, 30, 77, 200, 100, 50, 150];
        equalize_rgb_channels(&mut buf, 2);
        assert_eq!(buf[3], 77);
        assert_eq!(buf[7], 150);
    }

    #[test]
    fn monotone_non_decreasing() {
        let mut buf = vec![0u8; 4 * 4];
        let inputs = [10u8, 10, 50, 200];
        for (px, &v) in inputs.iter().enumerate() {
            buf[px * 4] = v;
            buf[px * 4 + 1] = 0;
            buf[px * 4 + 2] = 0;
            buf[px * 4 + 3] = 255;
        }
        equalize_rgb_channels(&mut buf, 4);
        let outputs: Vec<u8> = (0..4).map(|px| buf[px * 4]).collect();
        for i in 0..inputs.len() {
            for j in 0..inputs.len() {
                if inputs[i] >= inputs[j] {
                    assert!(outputs[i] >= outputs[j]);
                }
            }
        }
    }
}
