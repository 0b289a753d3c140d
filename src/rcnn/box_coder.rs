use ndarray::{s, stack, Array2, Array3, ArrayView2, Axis};
use crate::error::RoiHeadError;

/// Encodes boxes as `(dx, dy, dw, dh)` deltas relative to reference boxes and back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxCoder {
    pub weights: (f32, f32, f32, f32),
    pub bbox_xform_clip: f32,
}

impl Default for BoxCoder {
    fn default() -> Self {
        BoxCoder::new((10.0, 10.0, 5.0, 5.0))
    }
}

impl BoxCoder {
    /// Create a new [`BoxCoder`] with the given weights.
    ///
    /// This will default to a `bbox_xform_clip` of `ln(1000/16)`.
    pub fn new(weights: (f32, f32, f32, f32)) -> Self {
        BoxCoder {
            weights,
            bbox_xform_clip: (1000_f32 / 16_f32).ln(),
        }
    }

    pub fn with_clip(weights: (f32, f32, f32, f32), bbox_xform_clip: f32) -> Self {
        BoxCoder {
            weights,
            bbox_xform_clip,
        }
    }

    /// Deltas that move each row of `reference_boxes` onto the same row of `boxes`.
    ///
    /// Reference boxes must have positive width and height.
    pub fn encode(&self, reference_boxes: ArrayView2<f32>, boxes: ArrayView2<f32>) -> Array2<f32> {
        let (wx, wy, ww, wh) = self.weights;

        let ex_widths = &reference_boxes.column(2) - &reference_boxes.column(0);
        let ex_heights = &reference_boxes.column(3) - &reference_boxes.column(1);
        let ex_ctr_x = &reference_boxes.column(0) + &(&ex_widths * 0.5);
        let ex_ctr_y = &reference_boxes.column(1) + &(&ex_heights * 0.5);

        let gt_widths = &boxes.column(2) - &boxes.column(0);
        let gt_heights = &boxes.column(3) - &boxes.column(1);
        let gt_ctr_x = &boxes.column(0) + &(&gt_widths * 0.5);
        let gt_ctr_y = &boxes.column(1) + &(&gt_heights * 0.5);

        let dx = (&gt_ctr_x - &ex_ctr_x) / &ex_widths * wx;
        let dy = (&gt_ctr_y - &ex_ctr_y) / &ex_heights * wy;
        let dw = (&gt_widths / &ex_widths).mapv(f32::ln) * ww;
        let dh = (&gt_heights / &ex_heights).mapv(f32::ln) * wh;

        stack![Axis(1), dx, dy, dw, dh]
    }

    /// Applies one `[N, 4]` set of deltas to `[N, 4]` reference boxes.
    pub fn decode_single(&self, rel_codes: ArrayView2<f32>, boxes: ArrayView2<f32>) -> Array2<f32> {
        let widths = &boxes.column(2) - &boxes.column(0);
        let heights = &boxes.column(3) - &boxes.column(1);
        let center_x = &boxes.column(0) + &(&widths * 0.5);
        let center_y = &boxes.column(1) + &(&heights * 0.5);

        let (wx, wy, ww, wh) = self.weights;

        let dx = rel_codes.column(0).mapv(|v| v / wx);
        let dy = rel_codes.column(1).mapv(|v| v / wy);
        // clamp to avoid overflow in exp
        let dw = rel_codes.column(2).mapv(|v| (v / ww).min(self.bbox_xform_clip));
        let dh = rel_codes.column(3).mapv(|v| (v / wh).min(self.bbox_xform_clip));

        let pred_center_x = &dx * &widths + &center_x;
        let pred_center_y = &dy * &heights + &center_y;
        let pred_w = dw.mapv(f32::exp) * &widths;
        let pred_h = dh.mapv(f32::exp) * &heights;

        let half_w = pred_w * 0.5;
        let half_h = pred_h * 0.5;

        stack![
            Axis(1),
            &pred_center_x - &half_w,
            &pred_center_y - &half_h,
            &pred_center_x + &half_w,
            &pred_center_y + &half_h
        ]
    }

    /// Decodes per-class deltas `[N, 4 * C]` against `[N, 4]` reference boxes into `[N, C, 4]`.
    pub fn decode(
        &self,
        rel_codes: ArrayView2<f32>,
        boxes: ArrayView2<f32>,
    ) -> Result<Array3<f32>, RoiHeadError> {
        if rel_codes.ncols() % 4 != 0 {
            return Err(RoiHeadError::shape(
                "box deltas",
                "a multiple of 4 columns",
                rel_codes.ncols(),
            ));
        }
        if rel_codes.nrows() != boxes.nrows() || boxes.ncols() != 4 {
            return Err(RoiHeadError::shape(
                "reference boxes",
                format!("[{}, 4]", rel_codes.nrows()),
                format!("{:?}", boxes.shape()),
            ));
        }

        let num_classes = rel_codes.ncols() / 4;
        let mut pred_boxes = Array3::<f32>::zeros((boxes.nrows(), num_classes, 4));
        for c in 0..num_classes {
            let decoded = self.decode_single(rel_codes.slice(s![.., 4 * c..4 * c + 4]), boxes);
            pred_boxes.slice_mut(s![.., c, ..]).assign(&decoded);
        }
        Ok(pred_boxes)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{array, s, Array2};
    use crate::rcnn::box_coder::BoxCoder;

    #[test]
    fn test_encode_decode_round_trip() {
        let coder = BoxCoder::default();
        let reference = array![
            [10.0, 20.0, 50.0, 60.0],
            [0.0, 0.0, 3.0, 7.0],
            [100.0, 40.0, 180.0, 64.0]
        ];
        let boxes = array![
            [15.0, 25.0, 55.0, 65.0],
            [1.0, -2.0, 9.0, 4.0],
            [90.0, 45.0, 200.0, 70.0]
        ];

        let deltas = coder.encode(reference.view(), boxes.view());
        let decoded = coder.decode_single(deltas.view(), reference.view());

        for (a, b) in decoded.iter().zip(boxes.iter()) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_identity_match_encodes_to_zero() {
        let coder = BoxCoder::default();
        let boxes = array![[3.0, 4.0, 30.0, 44.0]];
        let deltas = coder.encode(boxes.view(), boxes.view());
        assert!(deltas.iter().all(|d| d.abs() < 1e-6));
    }

    #[test]
    fn test_decode_per_class_layout() {
        let coder = BoxCoder::default();
        let reference = array![[0.0, 0.0, 10.0, 10.0]];
        let mut deltas = Array2::<f32>::zeros((1, 8));
        // shift class 1 right by one box width
        deltas[(0, 4)] = 10.0;

        let decoded = coder.decode(deltas.view(), reference.view()).unwrap();

        assert_eq!(decoded.dim(), (1, 2, 4));
        assert_eq!(decoded.slice(s![0, 0, ..]).to_vec(), vec![0.0, 0.0, 10.0, 10.0]);
        assert_eq!(decoded.slice(s![0, 1, ..]).to_vec(), vec![10.0, 0.0, 20.0, 10.0]);
    }

    #[test]
    fn test_decode_clamps_large_scale_deltas() {
        let coder = BoxCoder::default();
        let reference = array![[0.0, 0.0, 16.0, 16.0]];
        let deltas = array![[0.0, 0.0, 1.0e4, 1.0e4]];

        let decoded = coder.decode_single(deltas.view(), reference.view());

        assert!(decoded.iter().all(|v| v.is_finite()));
        assert!((decoded[(0, 2)] - decoded[(0, 0)] - 1000.0).abs() < 1e-2);
    }

    #[test]
    fn test_decode_rejects_ragged_deltas() {
        let coder = BoxCoder::default();
        let reference = array![[0.0, 0.0, 16.0, 16.0]];
        let deltas = Array2::<f32>::zeros((1, 6));
        assert!(coder.decode(deltas.view(), reference.view()).is_err());
    }
}
