//! Canny edge detection over RGB buffers, run on the CPU.

use std::f32::consts::PI;

use anyhow::{bail, Result};

use crate::codec::{RawImage, RGB_CHANNELS};
use crate::engine::CannyThresholds;

const GAUSSIAN_SIZE: usize = 5;
const GAUSSIAN_SIGMA: f32 = 1.4;

const SOBEL_X: [[f32; 3]; 3] = [[-1., 0., 1.], [-2., 0., 2.], [-1., 0., 1.]];
const SOBEL_Y: [[f32; 3]; 3] = [[1., 2., 1.], [0., 0., 0.], [-1., -2., -1.]];

/// Single-channel f32 plane.
struct Plane {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Plane {
    fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    fn luma(image: &RawImage) -> Self {
        let data = image
            .data
            .chunks_exact(RGB_CHANNELS as usize)
            .map(|p| (0.2989 * p[0] as f32 + 0.5870 * p[1] as f32 + 0.1140 * p[2] as f32) / 255.)
            .collect();
        Self {
            width: image.width as usize,
            height: image.height as usize,
            data,
        }
    }

    /// 2D convolution; samples outside the plane repeat the nearest edge pixel.
    fn convolve<const K: usize>(&self, kernel: &[[f32; K]; K]) -> Self {
        let half = (K / 2) as isize;
        let (max_x, max_y) = (self.width as isize - 1, self.height as isize - 1);
        let mut data = vec![0.; self.data.len()];
        for y in 0..self.height {
            for x in 0..self.width {
                let mut acc = 0.;
                for (ky, row) in kernel.iter().enumerate() {
                    let sy = (y as isize + ky as isize - half).clamp(0, max_y);
                    for (kx, weight) in row.iter().enumerate() {
                        let sx = (x as isize + kx as isize - half).clamp(0, max_x);
                        acc += weight * self.at(sx as usize, sy as usize);
                    }
                }
                data[y * self.width + x] = acc;
            }
        }
        Self {
            width: self.width,
            height: self.height,
            data,
        }
    }
}

fn gaussian_kernel() -> [[f32; GAUSSIAN_SIZE]; GAUSSIAN_SIZE] {
    let half = (GAUSSIAN_SIZE / 2) as f32;
    let norm = 1. / (2. * PI * GAUSSIAN_SIGMA * GAUSSIAN_SIGMA);
    let mut kernel = [[0.; GAUSSIAN_SIZE]; GAUSSIAN_SIZE];
    let mut sum = 0.;
    for (y, row) in kernel.iter_mut().enumerate() {
        for (x, value) in row.iter_mut().enumerate() {
            let (dx, dy) = (x as f32 - half, y as f32 - half);
            *value = norm * (-(dx * dx + dy * dy) / (2. * GAUSSIAN_SIGMA * GAUSSIAN_SIGMA)).exp();
            sum += *value;
        }
    }
    kernel.iter_mut().flatten().for_each(|v| *v /= sum);
    kernel
}

/// Thins gradient ridges to single-pixel lines along the gradient direction.
fn non_max_suppression(magnitude: &Plane, gx: &Plane, gy: &Plane) -> Plane {
    let (w, h) = (magnitude.width, magnitude.height);
    let mut data = vec![0.; magnitude.data.len()];
    for y in 1..h.saturating_sub(1) {
        for x in 1..w.saturating_sub(1) {
            let mut angle = gy.at(x, y).atan2(gx.at(x, y)) * 180. / PI;
            if angle < 0. {
                angle += 180.;
            }
            let (a, b) = if !(22.5..157.5).contains(&angle) {
                (magnitude.at(x + 1, y), magnitude.at(x - 1, y))
            } else if angle < 67.5 {
                (magnitude.at(x + 1, y - 1), magnitude.at(x - 1, y + 1))
            } else if angle < 112.5 {
                (magnitude.at(x, y + 1), magnitude.at(x, y - 1))
            } else {
                (magnitude.at(x - 1, y - 1), magnitude.at(x + 1, y + 1))
            };
            let value = magnitude.at(x, y);
            if value >= a && value >= b {
                data[y * w + x] = value;
            }
        }
    }
    Plane {
        width: w,
        height: h,
        data,
    }
}

/// Double threshold relative to the strongest response, then hysteresis.
fn threshold_hysteresis(plane: &mut Plane, t: &CannyThresholds) {
    let max = plane.data.iter().copied().fold(0f32, f32::max);
    let high = max * t.high;
    let low = high * t.low;
    for value in plane.data.iter_mut() {
        *value = if *value >= high && *value > 0. {
            t.strong
        } else if *value >= low && *value > 0. {
            t.weak
        } else {
            0.
        };
    }

    let (w, h) = (plane.width, plane.height);
    for y in 1..h.saturating_sub(1) {
        for x in 1..w.saturating_sub(1) {
            if plane.at(x, y) != t.weak {
                continue;
            }
            let connected = (y - 1..=y + 1)
                .flat_map(|ny| (x - 1..=x + 1).map(move |nx| (nx, ny)))
                .any(|(nx, ny)| plane.at(nx, ny) == t.strong);
            plane.data[y * w + x] = if connected { t.strong } else { 0. };
        }
    }
}

/// Replaces `image` with its edge map, replicated across the RGB channels.
pub fn canny(image: &mut RawImage, thresholds: CannyThresholds) -> Result<()> {
    if image.channels != RGB_CHANNELS || !image.is_well_formed() {
        bail!("canny expects a well-formed RGB image, got {image:?}");
    }

    let blurred = Plane::luma(image).convolve(&gaussian_kernel());
    let gx = blurred.convolve(&SOBEL_X);
    let gy = blurred.convolve(&SOBEL_Y);
    let mut magnitude = Plane {
        width: blurred.width,
        height: blurred.height,
        data: gx.data.iter().zip(&gy.data).map(|(x, y)| x.hypot(*y)).collect(),
    };
    let max = magnitude.data.iter().copied().fold(0f32, f32::max);
    if max > 0. {
        magnitude.data.iter_mut().for_each(|v| *v /= max);
    }

    let mut edges = non_max_suppression(&magnitude, &gx, &gy);
    threshold_hysteresis(&mut edges, &thresholds);

    for (pixel, value) in image
        .data
        .chunks_exact_mut(RGB_CHANNELS as usize)
        .zip(edges.data)
    {
        let value = if thresholds.inverse { 1. - value } else { value };
        pixel.fill((value.clamp(0., 1.) * 255.).round() as u8);
    }
    Ok(())
}
