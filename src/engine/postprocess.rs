//! Detector output postprocessing
//!
//! Turns raw `[1, N, 6]` candidate rows into the normalized detection
//! records the wire protocol carries: score filtering, class range check,
//! coordinate normalization with clamping, degenerate-box removal, score
//! ordering, and greedy non-maximum suppression.

use ndarray::ArrayViewD;

use super::labels;
use crate::error::{AppError, Result};
use crate::signaling::message::Detection;

/// Denominator epsilon guarding the IoU division
const IOU_EPSILON: f32 = 1e-6;

/// One raw candidate row in detector input coordinates (0..input_size)
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
    pub score: f32,
    pub class_id: i64,
}

/// Postprocessing parameters
#[derive(Debug, Clone, Copy)]
pub struct PostprocessParams {
    /// Detector input edge used for coordinate normalization
    pub input_size: f32,
    /// Candidates at or below this score are discarded
    pub score_threshold: f32,
    /// Overlap above this IoU suppresses the lower-scored box
    pub iou_threshold: f32,
}

impl Default for PostprocessParams {
    fn default() -> Self {
        Self {
            input_size: 640.0,
            score_threshold: 0.45,
            iou_threshold: 0.5,
        }
    }
}

/// Extract candidate rows from a raw detector output tensor
///
/// The output must be shaped `[1, N, 6]` with rows
/// (x0, y0, x1, y1, score, class-id).
pub fn candidates_from_output(output: &ArrayViewD<'_, f32>) -> Result<Vec<Candidate>> {
    let shape = output.shape();
    if shape.len() != 3 || shape[0] != 1 || shape[2] != 6 {
        return Err(AppError::Inference(format!(
            "unexpected output shape {:?}, expected [1, N, 6]",
            shape
        )));
    }

    let mut candidates = Vec::with_capacity(shape[1]);
    for row in 0..shape[1] {
        candidates.push(Candidate {
            x0: output[[0, row, 0]],
            y0: output[[0, row, 1]],
            x1: output[[0, row, 2]],
            y1: output[[0, row, 3]],
            score: output[[0, row, 4]],
            class_id: output[[0, row, 5]] as i64,
        });
    }
    Ok(candidates)
}

/// Filter, normalize, order and suppress raw candidates
pub fn postprocess(candidates: &[Candidate], params: &PostprocessParams) -> Vec<Detection> {
    let mut kept: Vec<Detection> = candidates
        .iter()
        .filter_map(|c| {
            if c.score <= params.score_threshold {
                return None;
            }
            let label = labels::label_for(c.class_id)?;

            let xmin = (c.x0 / params.input_size).clamp(0.0, 1.0);
            let ymin = (c.y0 / params.input_size).clamp(0.0, 1.0);
            let xmax = (c.x1 / params.input_size).clamp(0.0, 1.0);
            let ymax = (c.y1 / params.input_size).clamp(0.0, 1.0);

            if xmax <= xmin || ymax <= ymin {
                return None;
            }

            Some(Detection {
                label: label.to_string(),
                score: c.score,
                xmin,
                ymin,
                xmax,
                ymax,
            })
        })
        .collect();

    kept.sort_by(|a, b| b.score.total_cmp(&a.score));
    non_maximum_suppression(kept, params.iou_threshold)
}

/// Greedy NMS over score-descending detections
///
/// Suppressed candidates are removed, not re-scored.
fn non_maximum_suppression(sorted: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    let mut survivors: Vec<Detection> = Vec::with_capacity(sorted.len());

    'candidates: for detection in sorted {
        for kept in &survivors {
            if iou(&detection, kept) > iou_threshold {
                continue 'candidates;
            }
        }
        survivors.push(detection);
    }

    survivors
}

/// Intersection-over-union of two normalized boxes
pub fn iou(a: &Detection, b: &Detection) -> f32 {
    let inter_w = (a.xmax.min(b.xmax) - a.xmin.max(b.xmin)).max(0.0);
    let inter_h = (a.ymax.min(b.ymax) - a.ymin.max(b.ymin)).max(0.0);
    let intersection = inter_w * inter_h;

    let area_a = (a.xmax - a.xmin) * (a.ymax - a.ymin);
    let area_b = (b.xmax - b.xmin) * (b.ymax - b.ymin);

    intersection / (area_a + area_b - intersection + IOU_EPSILON)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn candidate(x0: f32, y0: f32, x1: f32, y1: f32, score: f32, class_id: i64) -> Candidate {
        Candidate {
            x0,
            y0,
            x1,
            y1,
            score,
            class_id,
        }
    }

    fn params() -> PostprocessParams {
        PostprocessParams::default()
    }

    #[test]
    fn test_score_threshold_boundary() {
        let candidates = vec![
            candidate(0.0, 0.0, 64.0, 64.0, 0.45, 0), // at threshold: discarded
            candidate(100.0, 100.0, 200.0, 200.0, 0.46, 0),
        ];

        let detections = postprocess(&candidates, &params());
        assert_eq!(detections.len(), 1);
        assert!((detections[0].score - 0.46).abs() < 1e-6);
    }

    #[test]
    fn test_class_id_range() {
        let candidates = vec![
            candidate(0.0, 0.0, 64.0, 64.0, 0.9, 80),
            candidate(0.0, 0.0, 64.0, 64.0, 0.9, -1),
            candidate(100.0, 100.0, 200.0, 200.0, 0.9, 79),
        ];

        let detections = postprocess(&candidates, &params());
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].label, "toothbrush");
    }

    #[test]
    fn test_coordinates_normalized_and_clamped() {
        let candidates = vec![candidate(-10.0, 320.0, 700.0, 640.0, 0.8, 0)];

        let detections = postprocess(&candidates, &params());
        assert_eq!(detections.len(), 1);
        let d = &detections[0];
        assert_eq!(d.xmin, 0.0);
        assert!((d.ymin - 0.5).abs() < 1e-6);
        assert_eq!(d.xmax, 1.0);
        assert_eq!(d.ymax, 1.0);
    }

    #[test]
    fn test_degenerate_boxes_discarded() {
        let candidates = vec![
            candidate(100.0, 100.0, 100.0, 200.0, 0.9, 0), // zero width
            candidate(100.0, 200.0, 200.0, 100.0, 0.9, 0), // inverted
            candidate(700.0, 0.0, 800.0, 64.0, 0.9, 0),    // clamps to zero width
        ];

        assert!(postprocess(&candidates, &params()).is_empty());
    }

    #[test]
    fn test_ordered_by_score_descending() {
        let candidates = vec![
            candidate(0.0, 0.0, 64.0, 64.0, 0.5, 0),
            candidate(200.0, 200.0, 300.0, 300.0, 0.95, 1),
            candidate(400.0, 400.0, 500.0, 500.0, 0.7, 2),
        ];

        let detections = postprocess(&candidates, &params());
        let scores: Vec<f32> = detections.iter().map(|d| d.score).collect();
        assert_eq!(scores, vec![0.95, 0.7, 0.5]);
    }

    #[test]
    fn test_nms_suppresses_heavy_overlap() {
        // Boxes (0.1,0.1,0.5,0.5) and (0.11,0.11,0.51,0.51): IoU ~= 0.92
        let candidates = vec![
            candidate(64.0, 64.0, 320.0, 320.0, 0.9, 0),
            candidate(70.4, 70.4, 326.4, 326.4, 0.8, 0),
        ];

        let detections = postprocess(&candidates, &params());
        assert_eq!(detections.len(), 1);
        assert!((detections[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_disjoint_boxes() {
        let candidates = vec![
            candidate(0.0, 0.0, 100.0, 100.0, 0.9, 0),
            candidate(300.0, 300.0, 400.0, 400.0, 0.8, 0),
        ];

        assert_eq!(postprocess(&candidates, &params()).len(), 2);
    }

    #[test]
    fn test_survivor_pairs_respect_iou_bound() {
        // A grid of partially overlapping boxes at varied scores
        let mut candidates = Vec::new();
        for i in 0..6 {
            let offset = i as f32 * 48.0;
            candidates.push(candidate(
                offset,
                offset,
                offset + 160.0,
                offset + 160.0,
                0.9 - i as f32 * 0.05,
                0,
            ));
        }

        let p = params();
        let detections = postprocess(&candidates, &p);
        for (i, a) in detections.iter().enumerate() {
            for b in detections.iter().skip(i + 1) {
                assert!(iou(a, b) <= p.iou_threshold);
            }
        }
    }

    #[test]
    fn test_iou_epsilon_avoids_nan() {
        let zero = Detection {
            label: "person".to_string(),
            score: 0.9,
            xmin: 0.5,
            ymin: 0.5,
            xmax: 0.5,
            ymax: 0.5,
        };
        let value = iou(&zero, &zero);
        assert!(value.is_finite());
        assert_eq!(value, 0.0);
    }

    #[test]
    fn test_candidates_from_output_shape_check() {
        let good = Array3::<f32>::zeros((1, 4, 6)).into_dyn();
        assert_eq!(candidates_from_output(&good.view()).unwrap().len(), 4);

        let bad = Array3::<f32>::zeros((1, 4, 5)).into_dyn();
        assert!(candidates_from_output(&bad.view()).is_err());

        let batch = Array3::<f32>::zeros((2, 4, 6)).into_dyn();
        assert!(candidates_from_output(&batch.view()).is_err());
    }

    #[test]
    fn test_candidates_from_output_row_order() {
        let mut raw = Array3::<f32>::zeros((1, 1, 6));
        raw[[0, 0, 0]] = 10.0;
        raw[[0, 0, 1]] = 20.0;
        raw[[0, 0, 2]] = 110.0;
        raw[[0, 0, 3]] = 220.0;
        raw[[0, 0, 4]] = 0.77;
        raw[[0, 0, 5]] = 16.0;

        let dyn_view = raw.into_dyn();
        let candidates = candidates_from_output(&dyn_view.view()).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].class_id, 16);
        assert!((candidates[0].score - 0.77).abs() < 1e-6);
    }
}
