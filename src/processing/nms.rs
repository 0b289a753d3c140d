use std::cmp::Ordering;
use ndarray::{ArrayView1, ArrayView2};
use crate::rcnn::bbox::pair_iou;

fn order_by_score(scores: ArrayView1<f32>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(Ordering::Equal));
    order
}

/// Greedy suppression of boxes overlapping a higher scoring kept box by more than `thresh`.
///
/// Returns kept indices ordered by descending score.
pub fn nms(boxes: ArrayView2<f32>, scores: ArrayView1<f32>, thresh: f32) -> Vec<usize> {
    let order = order_by_score(scores);
    let mut suppressed = vec![false; order.len()];
    let mut keep = Vec::new();

    for (pos, &i) in order.iter().enumerate() {
        if suppressed[pos] {
            continue;
        }
        keep.push(i);
        for (other, &j) in order.iter().enumerate().skip(pos + 1) {
            if !suppressed[other] && pair_iou(boxes.row(i), boxes.row(j)) > thresh {
                suppressed[other] = true;
            }
        }
    }
    keep
}

/// Like [`nms`], but a box can only suppress boxes sharing its entry in `idxs`.
pub fn batched_nms(
    boxes: ArrayView2<f32>,
    scores: ArrayView1<f32>,
    idxs: ArrayView1<i64>,
    thresh: f32,
) -> Vec<usize> {
    let order = order_by_score(scores);
    let mut suppressed = vec![false; order.len()];
    let mut keep = Vec::new();

    for (pos, &i) in order.iter().enumerate() {
        if suppressed[pos] {
            continue;
        }
        keep.push(i);
        for (other, &j) in order.iter().enumerate().skip(pos + 1) {
            if suppressed[other] || idxs[j] != idxs[i] {
                continue;
            }
            if pair_iou(boxes.row(i), boxes.row(j)) > thresh {
                suppressed[other] = true;
            }
        }
    }
    keep
}
