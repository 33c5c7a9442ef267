//! ROI geometry: point-in-polygon tests and detection filtering. Polygon
//! vertices are relative (0..1) by convention; coordinates above 1.0 are
//! treated as absolute pixels for graphs authored against a fixed geometry.

use shared_utils::types::{PolyPoint, RoiRegion};

use crate::types::Detection;

/// Polygon scaled to pixel space.
pub fn polygon_pixels(region: &RoiRegion, width: u32, height: u32) -> Vec<(f64, f64)> {
    let relative = region
        .polygon
        .iter()
        .all(|p| p.x <= 1.0 && p.y <= 1.0);
    region
        .polygon
        .iter()
        .map(|p: &PolyPoint| {
            if relative {
                (p.x * width as f64, p.y * height as f64)
            } else {
                (p.x, p.y)
            }
        })
        .collect()
}

/// Ray-casting point-in-polygon. Degenerate polygons (< 3 vertices) contain
/// nothing.
pub fn point_in_polygon(x: f64, y: f64, polygon: &[(f64, f64)]) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Whether a detection's box center falls inside any of the regions.
pub fn center_in_regions(det: &Detection, regions: &[RoiRegion], width: u32, height: u32) -> bool {
    let (cx, cy) = det.center();
    regions
        .iter()
        .any(|region| point_in_polygon(cx, cy, &polygon_pixels(region, width, height)))
}

/// Keep detections whose center lies inside the ROI. With no regions the
/// whole frame is in scope. Returns (kept, filtered_out_count).
pub fn filter_detections(
    detections: Vec<Detection>,
    regions: &[RoiRegion],
    width: u32,
    height: u32,
) -> (Vec<Detection>, usize) {
    if regions.is_empty() {
        return (detections, 0);
    }
    let before = detections.len();
    let kept: Vec<Detection> = detections
        .into_iter()
        .filter(|det| center_in_regions(det, regions, width, height))
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_utils::types::RoiMode;

    fn region(points: &[(f64, f64)]) -> RoiRegion {
        RoiRegion {
            name: "zone".to_string(),
            mode: RoiMode::PostFilter,
            polygon: points.iter().map(|&(x, y)| PolyPoint { x, y }).collect(),
        }
    }

    #[test]
    fn point_in_unit_square() {
        let square = vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        assert!(point_in_polygon(5.0, 5.0, &square));
        assert!(!point_in_polygon(15.0, 5.0, &square));
        assert!(!point_in_polygon(5.0, -1.0, &square));
    }

    #[test]
    fn degenerate_polygon_contains_nothing() {
        assert!(!point_in_polygon(0.0, 0.0, &[(0.0, 0.0), (1.0, 1.0)]));
    }

    #[test]
    fn relative_coordinates_scale_to_frame() {
        // Left half of a 100x100 frame.
        let left = region(&[(0.0, 0.0), (0.5, 0.0), (0.5, 1.0), (0.0, 1.0)]);
        let inside = Detection::new([10.0, 10.0, 30.0, 30.0], "person", 0.9);
        let outside = Detection::new([70.0, 10.0, 90.0, 30.0], "person", 0.9);

        let (kept, dropped) =
            filter_detections(vec![inside.clone(), outside], std::slice::from_ref(&left), 100, 100);
        assert_eq!(kept, vec![inside]);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn no_regions_keeps_everything() {
        let det = Detection::new([0.0, 0.0, 5.0, 5.0], "car", 0.8);
        let (kept, dropped) = filter_detections(vec![det], &[], 100, 100);
        assert_eq!(kept.len(), 1);
        assert_eq!(dropped, 0);
    }
}
