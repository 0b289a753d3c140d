use ndarray::{Array1, Array2, ArrayViewD};
use ndarray_rand::rand::rngs::StdRng;
use crate::error::RoiHeadError;
use crate::pipeline::config::RoiHeadsConfig;
use crate::pipeline::predictor::{PredictorHead, PredictorOutput};
use crate::pipeline::targets::Target;
use crate::processing::bbox_regression::{TrainingSampleSelector, TrainingSamples};
use crate::processing::loss::{roi_loss, LossInputs, RoiLosses};
use crate::processing::postprocess::{
    postprocess_detections, ImageDetections, PostprocessParams, RawPredictions,
};
use crate::rcnn::box_coder::BoxCoder;

/// What a two-stage detector needs from its box head.
pub trait DetectionHead {
    /// Matches proposals to ground truth and samples the rows to supervise.
    fn compute_targets(
        &self,
        proposals: &[Array2<f32>],
        targets: &[Target],
        rng: &mut StdRng,
    ) -> Result<TrainingSamples, RoiHeadError>;

    /// Projects pooled box features, one row per proposal.
    fn predict(&self, box_features: ArrayViewD<f32>) -> Result<PredictorOutput, RoiHeadError>;

    fn compute_loss(
        &self,
        outputs: &PredictorOutput,
        samples: &TrainingSamples,
    ) -> Result<RoiLosses, RoiHeadError>;

    fn postprocess(
        &self,
        outputs: &PredictorOutput,
        proposals: &[Array2<f32>],
        image_shapes: &[(usize, usize)],
    ) -> Result<Vec<ImageDetections>, RoiHeadError>;
}

/// Box head predicting a class, a per-class box and one vessel length per proposal.
#[derive(Debug, Clone)]
pub struct LengthRegressionHead {
    predictor: PredictorHead,
    selector: TrainingSampleSelector,
    postprocess: PostprocessParams,
    smooth_l1_beta: f32,
}

impl LengthRegressionHead {
    pub fn new(config: &RoiHeadsConfig, predictor: PredictorHead) -> Result<Self, RoiHeadError> {
        config.validate()?;
        if predictor.num_classes() != config.num_classes {
            return Err(RoiHeadError::InvalidConfig(format!(
                "predictor has {} classes, config expects {}",
                predictor.num_classes(),
                config.num_classes
            )));
        }
        Ok(LengthRegressionHead {
            predictor,
            selector: TrainingSampleSelector {
                matcher: config.matcher()?,
                sampler: config.sampler()?,
                box_coder: config.box_coder(),
            },
            postprocess: config.postprocess_params(),
            smooth_l1_beta: config.smooth_l1_beta,
        })
    }

    pub fn predictor(&self) -> &PredictorHead {
        &self.predictor
    }

    pub fn box_coder(&self) -> &BoxCoder {
        &self.selector.box_coder
    }

    pub fn num_classes(&self) -> usize {
        self.predictor.num_classes()
    }

    fn check_targets(&self, targets: &[Target]) -> Result<(), RoiHeadError> {
        for (image, target) in targets.iter().enumerate() {
            target.validate(image, self.num_classes())?;
        }
        Ok(())
    }
}

impl DetectionHead for LengthRegressionHead {
    fn compute_targets(
        &self,
        proposals: &[Array2<f32>],
        targets: &[Target],
        rng: &mut StdRng,
    ) -> Result<TrainingSamples, RoiHeadError> {
        self.check_targets(targets)?;
        self.selector.select(proposals, targets, rng)
    }

    fn predict(&self, box_features: ArrayViewD<f32>) -> Result<PredictorOutput, RoiHeadError> {
        self.predictor.forward(box_features)
    }

    fn compute_loss(
        &self,
        outputs: &PredictorOutput,
        samples: &TrainingSamples,
    ) -> Result<RoiLosses, RoiHeadError> {
        let labels: Array1<i64> = samples.flat_labels();
        let length_labels = samples.flat_length_labels();
        let regression_targets = samples.flat_regression_targets()?;

        let inputs = LossInputs {
            class_logits: outputs.class_logits.view(),
            box_regression: outputs.box_regression.view(),
            length_pred: outputs.length_pred.view(),
            labels: labels.view(),
            regression_targets: regression_targets.view(),
            length_labels: length_labels.view(),
        };
        roi_loss(&inputs, self.smooth_l1_beta)
    }

    fn postprocess(
        &self,
        outputs: &PredictorOutput,
        proposals: &[Array2<f32>],
        image_shapes: &[(usize, usize)],
    ) -> Result<Vec<ImageDetections>, RoiHeadError> {
        let predictions = RawPredictions {
            class_logits: outputs.class_logits.view(),
            box_regression: outputs.box_regression.view(),
            length_pred: outputs.length_pred.view(),
        };
        postprocess_detections(
            &predictions,
            proposals,
            image_shapes,
            self.box_coder(),
            &self.postprocess,
        )
    }
}
