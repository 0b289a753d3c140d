use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

pub fn box_area(boxes: ArrayView2<f32>) -> Array1<f32> {
    let widths = &boxes.column(2) - &boxes.column(0);
    let heights = &boxes.column(3) - &boxes.column(1);
    widths * heights
}

/// IoU of two single `(x1, y1, x2, y2)` boxes. A zero union yields `0.0`.
pub fn pair_iou(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    let iw = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let ih = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = iw * ih;
    if inter <= 0.0 {
        return 0.0;
    }
    let union = (a[2] - a[0]) * (a[3] - a[1]) + (b[2] - b[0]) * (b[3] - b[1]) - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Full `[N, K]` overlap matrix between `boxes` and `query_boxes`.
pub fn box_iou(boxes: ArrayView2<f32>, query_boxes: ArrayView2<f32>) -> Array2<f32> {
    let n = boxes.nrows();
    let k = query_boxes.nrows();
    let areas = box_area(boxes);
    let query_areas = box_area(query_boxes);
    let mut overlaps = Array2::<f32>::zeros((n, k));

    for k_idx in 0..k {
        for n_idx in 0..n {
            let iw = (boxes[(n_idx, 2)].min(query_boxes[(k_idx, 2)])
                - boxes[(n_idx, 0)].max(query_boxes[(k_idx, 0)]))
            .max(0.0);
            if iw <= 0.0 {
                continue;
            }
            let ih = (boxes[(n_idx, 3)].min(query_boxes[(k_idx, 3)])
                - boxes[(n_idx, 1)].max(query_boxes[(k_idx, 1)]))
            .max(0.0);
            if ih <= 0.0 {
                continue;
            }
            let inter = iw * ih;
            let union = areas[n_idx] + query_areas[k_idx] - inter;
            if union > 0.0 {
                overlaps[(n_idx, k_idx)] = inter / union;
            }
        }
    }
    overlaps
}

/// Clamps x to `[0, width]` and y to `[0, height]`, `image_shape` being `(height, width)`.
pub fn clip_boxes_to_image(boxes: &mut Array2<f32>, image_shape: (usize, usize)) {
    let (height, width) = (image_shape.0 as f32, image_shape.1 as f32);
    for mut row in boxes.rows_mut() {
        row[0] = row[0].clamp(0.0, width);
        row[1] = row[1].clamp(0.0, height);
        row[2] = row[2].clamp(0.0, width);
        row[3] = row[3].clamp(0.0, height);
    }
}

/// Indices of boxes whose width and height are both at least `min_size`.
pub fn remove_small_boxes(boxes: ArrayView2<f32>, min_size: f32) -> Vec<usize> {
    boxes
        .rows()
        .into_iter()
        .enumerate()
        .filter(|(_, b)| b[2] - b[0] >= min_size && b[3] - b[1] >= min_size)
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use crate::rcnn::bbox::{box_iou, clip_boxes_to_image, pair_iou, remove_small_boxes};

    #[test]
    fn test_box_iou() {
        let boxes = array![
            [0.0, 0.0, 10.0, 10.0],
            [5.0, 5.0, 15.0, 15.0],
            [20.0, 20.0, 30.0, 30.0]
        ];
        let gt = array![[0.0, 0.0, 10.0, 10.0]];

        let overlaps = box_iou(boxes.view(), gt.view());

        assert_eq!(overlaps.dim(), (3, 1));
        assert!((overlaps[(0, 0)] - 1.0).abs() < 1e-6);
        assert!((overlaps[(1, 0)] - 25.0 / 175.0).abs() < 1e-6);
        assert_eq!(overlaps[(2, 0)], 0.0);
        assert!((pair_iou(boxes.row(1), gt.row(0)) - overlaps[(1, 0)]).abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_boxes_have_zero_overlap() {
        let boxes = array![[3.0, 3.0, 3.0, 3.0]];
        let overlaps = box_iou(boxes.view(), boxes.view());
        assert_eq!(overlaps[(0, 0)], 0.0);
    }

    #[test]
    fn test_clip_and_remove_small() {
        let mut boxes = array![[-5.0, -5.0, 50.0, 50.0], [30.0, 10.0, 30.005, 20.0]];
        clip_boxes_to_image(&mut boxes, (20, 40));

        assert_eq!(boxes.row(0).to_vec(), vec![0.0, 0.0, 40.0, 20.0]);
        assert_eq!(remove_small_boxes(boxes.view(), 1e-2), vec![0]);
    }
}
