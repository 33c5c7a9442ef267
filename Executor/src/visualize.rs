//! Evidence-still rendering: detection boxes in the node's label color and
//! translucent ROI polygon overlays, drawn straight onto the RGB frame and
//! saved as JPEG.

use std::path::Path;

use anyhow::{Context, Result};
use image::RgbImage;
use shared_utils::types::RoiRegion;

use crate::roi::polygon_pixels;
use crate::types::{Detection, FrameData};

const ROI_FILL: [u8; 3] = [144, 238, 144];
const ROI_OUTLINE: [u8; 3] = [100, 200, 100];
const ROI_FILL_ALPHA: f32 = 0.15;
const BOX_THICKNESS: u32 = 3;

pub fn hex_to_rgb(hex: &str) -> [u8; 3] {
    let hex = hex.trim_start_matches('#');
    if hex.len() != 6 {
        return [255, 0, 0];
    }
    let parse = |s: &str| u8::from_str_radix(s, 16).unwrap_or(0);
    [parse(&hex[0..2]), parse(&hex[2..4]), parse(&hex[4..6])]
}

pub fn frame_to_image(frame: &FrameData) -> RgbImage {
    RgbImage::from_raw(frame.width, frame.height, frame.pixels.as_ref().clone())
        .unwrap_or_else(|| RgbImage::new(frame.width, frame.height))
}

/// Render detections and ROI overlays onto a copy of the frame.
pub fn annotate(
    frame: &FrameData,
    detections: &[Detection],
    label_color: &str,
    roi_regions: &[RoiRegion],
) -> RgbImage {
    let mut img = frame_to_image(frame);

    for region in roi_regions {
        let polygon = polygon_pixels(region, frame.width, frame.height);
        if polygon.len() < 3 {
            continue;
        }
        fill_polygon(&mut img, &polygon, ROI_FILL, ROI_FILL_ALPHA);
        outline_polygon(&mut img, &polygon, ROI_OUTLINE, 2);
    }

    let color = hex_to_rgb(label_color);
    for det in detections {
        draw_rect(&mut img, &det.bbox, color, BOX_THICKNESS);
    }
    img
}

pub fn save_jpeg(img: &RgbImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    img.save(path)
        .with_context(|| format!("failed to save {}", path.display()))
}

/// Save the unannotated frame, the `*.ori.jpg` sibling of an evidence image.
pub fn save_raw_frame(frame: &FrameData, path: &Path) -> Result<()> {
    save_jpeg(&frame_to_image(frame), path)
}

fn draw_rect(img: &mut RgbImage, bbox: &[f64; 4], color: [u8; 3], thickness: u32) {
    let (w, h) = (img.width() as i64, img.height() as i64);
    let x1 = (bbox[0] as i64).clamp(0, w - 1);
    let y1 = (bbox[1] as i64).clamp(0, h - 1);
    let x2 = (bbox[2] as i64).clamp(0, w - 1);
    let y2 = (bbox[3] as i64).clamp(0, h - 1);
    for t in 0..thickness as i64 {
        for x in x1..=x2 {
            put(img, x, y1 + t, color);
            put(img, x, y2 - t, color);
        }
        for y in y1..=y2 {
            put(img, x1 + t, y, color);
            put(img, x2 - t, y, color);
        }
    }
}

fn put(img: &mut RgbImage, x: i64, y: i64, color: [u8; 3]) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, image::Rgb(color));
    }
}

fn blend(img: &mut RgbImage, x: i64, y: i64, color: [u8; 3], alpha: f32) {
    if x < 0 || y < 0 || x as u32 >= img.width() || y as u32 >= img.height() {
        return;
    }
    let pixel = img.get_pixel_mut(x as u32, y as u32);
    for c in 0..3 {
        pixel.0[c] = (pixel.0[c] as f32 * (1.0 - alpha) + color[c] as f32 * alpha) as u8;
    }
}

/// Scanline fill with per-pixel alpha blending.
fn fill_polygon(img: &mut RgbImage, polygon: &[(f64, f64)], color: [u8; 3], alpha: f32) {
    let min_y = polygon.iter().map(|p| p.1).fold(f64::INFINITY, f64::min).floor().max(0.0) as i64;
    let max_y = polygon
        .iter()
        .map(|p| p.1)
        .fold(f64::NEG_INFINITY, f64::max)
        .ceil()
        .min(img.height() as f64 - 1.0) as i64;

    for y in min_y..=max_y {
        let scan = y as f64 + 0.5;
        let mut crossings = Vec::new();
        let mut j = polygon.len() - 1;
        for i in 0..polygon.len() {
            let (xi, yi) = polygon[i];
            let (xj, yj) = polygon[j];
            if (yi > scan) != (yj > scan) {
                crossings.push(xi + (scan - yi) / (yj - yi) * (xj - xi));
            }
            j = i;
        }
        crossings.sort_by(f64::total_cmp);
        for pair in crossings.chunks_exact(2) {
            let start = pair[0].floor().max(0.0) as i64;
            let end = pair[1].ceil().min(img.width() as f64 - 1.0) as i64;
            for x in start..=end {
                blend(img, x, y, color, alpha);
            }
        }
    }
}

fn outline_polygon(img: &mut RgbImage, polygon: &[(f64, f64)], color: [u8; 3], thickness: i64) {
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        draw_line(img, polygon[j], polygon[i], color, thickness);
        j = i;
    }
}

fn draw_line(img: &mut RgbImage, from: (f64, f64), to: (f64, f64), color: [u8; 3], thickness: i64) {
    let (x0, y0) = (from.0, from.1);
    let (dx, dy) = (to.0 - x0, to.1 - y0);
    let steps = dx.abs().max(dy.abs()).ceil().max(1.0) as i64;
    for step in 0..=steps {
        let t = step as f64 / steps as f64;
        let x = (x0 + dx * t) as i64;
        let y = (y0 + dy * t) as i64;
        for ox in 0..thickness {
            for oy in 0..thickness {
                put(img, x + ox, y + oy, color);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_utils::types::{PolyPoint, RoiMode};

    fn black_frame(width: u32, height: u32) -> FrameData {
        FrameData::new(vec![0u8; (width * height * 3) as usize], width, height)
    }

    #[test]
    fn hex_parsing() {
        assert_eq!(hex_to_rgb("#FF0000"), [255, 0, 0]);
        assert_eq!(hex_to_rgb("00ff7f"), [0, 255, 127]);
        assert_eq!(hex_to_rgb("bogus"), [255, 0, 0]);
    }

    #[test]
    fn boxes_are_drawn_in_label_color() {
        let frame = black_frame(50, 50);
        let det = Detection::new([10.0, 10.0, 30.0, 30.0], "x", 1.0);
        let img = annotate(&frame, &[det], "#00FF00", &[]);
        assert_eq!(img.get_pixel(20, 10).0, [0, 255, 0]); // top edge
        assert_eq!(img.get_pixel(10, 20).0, [0, 255, 0]); // left edge
        assert_eq!(img.get_pixel(20, 20).0, [0, 0, 0]); // interior untouched
    }

    #[test]
    fn roi_fill_is_translucent() {
        let frame = black_frame(40, 40);
        let region = RoiRegion {
            name: "zone".to_string(),
            mode: RoiMode::PostFilter,
            polygon: vec![
                PolyPoint { x: 0.0, y: 0.0 },
                PolyPoint { x: 1.0, y: 0.0 },
                PolyPoint { x: 1.0, y: 1.0 },
                PolyPoint { x: 0.0, y: 1.0 },
            ],
        };
        let img = annotate(&frame, &[], "#FF0000", &[region]);
        let pixel = img.get_pixel(20, 20).0;
        // 15% of the pale-green fill over black.
        assert!(pixel[1] > 20 && pixel[1] < 60);
    }

    #[test]
    fn save_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/frame.jpg");
        let frame = black_frame(8, 8);
        save_raw_frame(&frame, &path).unwrap();
        assert!(path.exists());
    }
}
