// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Frame analysis for the Helios classifier.
//!
//! The pipeline is downscale → blur → edge map → dilate, plus a one-off
//! lens-circle search. The "edge fraction" is the share of edge pixels
//! inside the inner 90 % of the lens circle; direct sun casts hard shadow
//! edges, overcast sky washes them out.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};

/// Width frames are downscaled to before analysis.
pub const ANALYSIS_WIDTH: u32 = 240;

/// Sobel magnitude above which a pixel counts as an edge.
const EDGE_PIXEL_THRESHOLD: f32 = 40.0;

/// Share of the lens radius considered for the edge fraction.
const INNER_DISK_SHARE: f32 = 0.9;

/// The lit circular area the fisheye lens projects onto the sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LensCircle {
    pub center_x: f32,
    pub center_y: f32,
    pub radius: f32,
}

/// Downscale to the analysis width (keeping aspect) and blur slightly.
pub fn preprocess(frame: &GrayImage) -> GrayImage {
    let (width, height) = frame.dimensions();
    let scaled = if width > ANALYSIS_WIDTH {
        let target_height =
            ((height as f32) * (ANALYSIS_WIDTH as f32) / (width as f32)).round() as u32;
        imageops::resize(frame, ANALYSIS_WIDTH, target_height.max(1), FilterType::Triangle)
    } else {
        frame.clone()
    };
    imageops::blur(&scaled, 1.2)
}

fn pixel(frame: &GrayImage, x: i64, y: i64) -> f32 {
    let x = x.clamp(0, frame.width() as i64 - 1) as u32;
    let y = y.clamp(0, frame.height() as i64 - 1) as u32;
    frame.get_pixel(x, y).0[0] as f32
}

/// Binary edge map from thresholded Sobel gradient magnitude.
pub fn edge_map(frame: &GrayImage) -> GrayImage {
    let (width, height) = frame.dimensions();
    let mut edges = GrayImage::new(width, height);
    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let gx = pixel(frame, x + 1, y - 1) + 2.0 * pixel(frame, x + 1, y)
                + pixel(frame, x + 1, y + 1)
                - pixel(frame, x - 1, y - 1)
                - 2.0 * pixel(frame, x - 1, y)
                - pixel(frame, x - 1, y + 1);
            let gy = pixel(frame, x - 1, y + 1) + 2.0 * pixel(frame, x, y + 1)
                + pixel(frame, x + 1, y + 1)
                - pixel(frame, x - 1, y - 1)
                - 2.0 * pixel(frame, x, y - 1)
                - pixel(frame, x + 1, y - 1);
            let magnitude = (gx * gx + gy * gy).sqrt();
            if magnitude >= EDGE_PIXEL_THRESHOLD {
                edges.put_pixel(x as u32, y as u32, Luma([255]));
            }
        }
    }
    edges
}

/// 3×3 dilation of a binary map.
pub fn dilate(edges: &GrayImage) -> GrayImage {
    let (width, height) = edges.dimensions();
    let mut dilated = GrayImage::new(width, height);
    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let mut hit = false;
            'window: for dy in -1..=1 {
                for dx in -1..=1 {
                    if pixel(edges, x + dx, y + dy) > 0.0 {
                        hit = true;
                        break 'window;
                    }
                }
            }
            if hit {
                dilated.put_pixel(x as u32, y as u32, Luma([255]));
            }
        }
    }
    dilated
}

/// Mean brightness sampled on a circle perimeter.
fn perimeter_mean(frame: &GrayImage, cx: f32, cy: f32, radius: f32) -> f32 {
    const SAMPLES: usize = 32;
    let mut sum = 0.0;
    for index in 0..SAMPLES {
        let angle = index as f32 * std::f32::consts::TAU / SAMPLES as f32;
        let x = (cx + radius * angle.cos()).round() as i64;
        let y = (cy + radius * angle.sin()).round() as i64;
        sum += pixel(frame, x, y);
    }
    sum / SAMPLES as f32
}

/// Locate the lens circle on a preprocessed frame.
///
/// Coarse ranked search instead of a full Hough transform: candidate
/// centers around the image center, candidate radii between a quarter and
/// half of the short side, ranked by the brightness contrast just inside
/// versus just outside the perimeter.
pub fn detect_lens_circle(frame: &GrayImage) -> Option<LensCircle> {
    let (width, height) = frame.dimensions();
    if width < 16 || height < 16 {
        return None;
    }
    let short_side = width.min(height) as f32;
    let (mid_x, mid_y) = (width as f32 / 2.0, height as f32 / 2.0);

    let mut best: Option<(f32, LensCircle)> = None;
    let center_span = (short_side * 0.2) as i64;
    let mut radius = short_side * 0.25;
    while radius <= short_side * 0.48 {
        let mut offset_y = -center_span;
        while offset_y <= center_span {
            let mut offset_x = -center_span;
            while offset_x <= center_span {
                let cx = mid_x + offset_x as f32;
                let cy = mid_y + offset_y as f32;
                let inside = perimeter_mean(frame, cx, cy, radius * 0.9);
                let outside = perimeter_mean(frame, cx, cy, radius * 1.1);
                let contrast = inside - outside;
                if best.map(|(score, _)| contrast > score).unwrap_or(true) {
                    best = Some((
                        contrast,
                        LensCircle {
                            center_x: cx,
                            center_y: cy,
                            radius,
                        },
                    ));
                }
                offset_x += 4;
            }
            offset_y += 4;
        }
        radius += 4.0;
    }

    // a flat frame has no circle
    best.filter(|(score, _)| *score > 10.0).map(|(_, circle)| circle)
}

/// Edge pixels inside the inner 90 % of the lens, as a share of that
/// disk's area.
pub fn edge_fraction(edges: &GrayImage, circle: &LensCircle) -> f64 {
    let inner_radius = circle.radius * INNER_DISK_SHARE;
    let inner_radius_squared = (inner_radius * inner_radius) as f64;
    let mut edge_pixels = 0u64;
    let mut disk_pixels = 0u64;
    for (x, y, value) in edges.enumerate_pixels() {
        let dx = x as f32 - circle.center_x;
        let dy = y as f32 - circle.center_y;
        if ((dx * dx + dy * dy) as f64) <= inner_radius_squared {
            disk_pixels += 1;
            if value.0[0] > 0 {
                edge_pixels += 1;
            }
        }
    }
    if disk_pixels == 0 {
        return 0.0;
    }
    edge_pixels as f64 / disk_pixels as f64
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Bright disk on a dark background, optionally with a stripe pattern
    /// inside (fake shadow edges).
    pub(crate) fn synthetic_lens_frame(
        width: u32,
        height: u32,
        radius: f32,
        stripes: bool,
    ) -> GrayImage {
        let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
        GrayImage::from_fn(width, height, |x, y| {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            if dx * dx + dy * dy <= radius * radius {
                if stripes && (x / 4) % 2 == 0 {
                    Luma([180])
                } else {
                    Luma([90])
                }
            } else {
                Luma([5])
            }
        })
    }

    #[test]
    fn test_detect_lens_circle_on_synthetic_frame() {
        let frame = synthetic_lens_frame(160, 120, 50.0, false);
        let circle = detect_lens_circle(&frame).expect("circle not found");
        assert!((circle.center_x - 80.0).abs() <= 6.0, "cx {}", circle.center_x);
        assert!((circle.center_y - 60.0).abs() <= 6.0, "cy {}", circle.center_y);
        assert!((circle.radius - 50.0).abs() <= 8.0, "r {}", circle.radius);
    }

    #[test]
    fn test_detect_lens_circle_rejects_flat_frame() {
        let frame = GrayImage::from_pixel(160, 120, Luma([40]));
        assert!(detect_lens_circle(&frame).is_none());
    }

    #[test]
    fn test_edge_map_finds_step_edge() {
        let frame = GrayImage::from_fn(32, 32, |x, _| if x < 16 { Luma([10]) } else { Luma([200]) });
        let edges = edge_map(&frame);
        assert!(edges.get_pixel(16, 16).0[0] > 0);
        assert_eq!(edges.get_pixel(4, 16).0[0], 0);
    }

    #[test]
    fn test_dilate_grows_single_pixel() {
        let mut edges = GrayImage::new(9, 9);
        edges.put_pixel(4, 4, Luma([255]));
        let dilated = dilate(&edges);
        let lit = dilated.pixels().filter(|p| p.0[0] > 0).count();
        assert_eq!(lit, 9);
    }

    #[test]
    fn test_edge_fraction_striped_exceeds_flat() {
        let circle = LensCircle {
            center_x: 80.0,
            center_y: 60.0,
            radius: 50.0,
        };
        let striped = synthetic_lens_frame(160, 120, 50.0, true);
        let flat = synthetic_lens_frame(160, 120, 50.0, false);
        let striped_fraction = edge_fraction(&dilate(&edge_map(&striped)), &circle);
        let flat_fraction = edge_fraction(&dilate(&edge_map(&flat)), &circle);
        assert!(striped_fraction > flat_fraction);
        assert!(striped_fraction > 0.1, "fraction {}", striped_fraction);
        assert!(flat_fraction < 0.2, "fraction {}", flat_fraction);
    }
}
