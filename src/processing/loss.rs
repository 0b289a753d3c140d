use std::collections::BTreeMap;
use ndarray::{ArrayView1, ArrayView2};
use tracing::warn;
use crate::error::RoiHeadError;
use crate::utils::numeric::{log_sum_exp, smooth_l1};

pub const LOSS_CLASSIFIER: &str = "loss_classifier";
pub const LOSS_BOX_REG: &str = "loss_box_reg";
pub const LOSS_VESSEL_LENGTH: &str = "loss_vessel_length";

/// The three ROI head losses, kept separate; weighting them is up to the caller.
///
/// `loss_vessel_length` is NaN when no sampled proposal carried a known length,
/// and all three are NaN when nothing was sampled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiLosses {
    pub loss_classifier: f32,
    pub loss_box_reg: f32,
    pub loss_vessel_length: f32,
}

impl RoiLosses {
    pub fn length_loss_defined(&self) -> bool {
        !self.loss_vessel_length.is_nan()
    }

    pub fn to_map(&self) -> BTreeMap<&'static str, f32> {
        BTreeMap::from([
            (LOSS_CLASSIFIER, self.loss_classifier),
            (LOSS_BOX_REG, self.loss_box_reg),
            (LOSS_VESSEL_LENGTH, self.loss_vessel_length),
        ])
    }
}

/// Inputs to [`roi_loss`], all row-aligned over the sampled proposals of a batch.
#[derive(Debug, Clone, Copy)]
pub struct LossInputs<'a> {
    pub class_logits: ArrayView2<'a, f32>,
    pub box_regression: ArrayView2<'a, f32>,
    pub length_pred: ArrayView1<'a, f32>,
    pub labels: ArrayView1<'a, i64>,
    pub regression_targets: ArrayView2<'a, f32>,
    pub length_labels: ArrayView1<'a, f32>,
}

impl LossInputs<'_> {
    fn check_shapes(&self) -> Result<(), RoiHeadError> {
        let n = self.class_logits.nrows();
        let num_classes = self.class_logits.ncols();
        if self.box_regression.dim() != (n, 4 * num_classes) {
            return Err(RoiHeadError::shape(
                "box regression",
                format!("({}, {})", n, 4 * num_classes),
                format!("{:?}", self.box_regression.dim()),
            ));
        }
        if self.regression_targets.dim() != (n, 4) {
            return Err(RoiHeadError::shape(
                "regression targets",
                format!("({}, 4)", n),
                format!("{:?}", self.regression_targets.dim()),
            ));
        }
        for (what, len) in [
            ("length predictions", self.length_pred.len()),
            ("labels", self.labels.len()),
            ("length labels", self.length_labels.len()),
        ] {
            if len != n {
                return Err(RoiHeadError::shape(what, n, len));
            }
        }
        if let Some(&label) = self.labels.iter().find(|&&l| l < 0 || l as usize >= num_classes) {
            return Err(RoiHeadError::LabelOutOfRange { label, num_classes });
        }
        Ok(())
    }
}

/// Cross entropy over every sampled proposal, smooth-L1 on positives at their own class
/// normalized by the sample count, and MSE over proposals with a positive length label.
pub fn roi_loss(inputs: &LossInputs, beta: f32) -> Result<RoiLosses, RoiHeadError> {
    inputs.check_shapes()?;
    let n = inputs.class_logits.nrows();
    if n == 0 {
        warn!("no proposals were sampled, classification and box losses are undefined");
    }

    let mut ce_sum = 0.0_f32;
    let mut box_sum = 0.0_f32;
    for (i, &label) in inputs.labels.iter().enumerate() {
        let row = inputs.class_logits.row(i);
        let cls = label as usize;
        ce_sum += log_sum_exp(row) - row[cls];

        if label > 0 {
            for k in 0..4 {
                let diff =
                    inputs.box_regression[(i, 4 * cls + k)] - inputs.regression_targets[(i, k)];
                box_sum += smooth_l1(diff, beta);
            }
        }
    }

    let mut sq_sum = 0.0_f32;
    let mut num_valid = 0_usize;
    for (&pred, &target) in inputs.length_pred.iter().zip(inputs.length_labels.iter()) {
        if target > 0.0 {
            sq_sum += (pred - target).powi(2);
            num_valid += 1;
        }
    }
    if num_valid == 0 {
        warn!("no sampled proposal has a known length, length loss is undefined");
    }

    Ok(RoiLosses {
        loss_classifier: ce_sum / n as f32,
        loss_box_reg: box_sum / n as f32,
        loss_vessel_length: sq_sum / num_valid as f32,
    })
}
