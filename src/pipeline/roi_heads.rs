use std::collections::BTreeMap;
use anyhow::{bail, Error, Result};
use ndarray::{Array2, ArrayD};
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::SeedableRng;
use tracing::debug;
use crate::error::RoiHeadError;
use crate::pipeline::config::RoiHeadsConfig;
use crate::pipeline::detection_head::DetectionHead;
use crate::pipeline::targets::Target;
use crate::processing::loss::RoiLosses;
use crate::processing::postprocess::ImageDetections;

/// Backbone feature maps keyed by pyramid level.
pub type FeatureMaps = BTreeMap<String, ArrayD<f32>>;

/// Pools one feature row (or `1x1` map) per proposal, image after image.
pub trait BoxFeatureExtractor {
    fn extract(
        &self,
        features: &FeatureMaps,
        proposals: &[Array2<f32>],
        image_shapes: &[(usize, usize)],
    ) -> Result<ArrayD<f32>, Error>;
}

#[derive(Debug, Clone, Copy)]
pub enum Mode<'a> {
    Training(&'a [Target]),
    Inference,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingResult {
    pub losses: RoiLosses,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    pub detections: Vec<ImageDetections>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoiHeadsOutput {
    Training(TrainingResult),
    Inference(InferenceResult),
}

impl RoiHeadsOutput {
    pub fn into_training(self) -> Option<TrainingResult> {
        match self {
            RoiHeadsOutput::Training(result) => Some(result),
            RoiHeadsOutput::Inference(_) => None,
        }
    }

    pub fn into_inference(self) -> Option<InferenceResult> {
        match self {
            RoiHeadsOutput::Inference(result) => Some(result),
            RoiHeadsOutput::Training(_) => None,
        }
    }
}

/// Second stage of the detector: feature pooling, box head, and either losses or detections.
pub struct RoiHeads<E> {
    extractor: E,
    head: Box<dyn DetectionHead>,
    rng: StdRng,
}

impl<E: BoxFeatureExtractor> RoiHeads<E> {
    /// Without a seed the sampler draws from OS entropy.
    pub fn new(extractor: E, head: Box<dyn DetectionHead>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        RoiHeads { extractor, head, rng }
    }

    /// Seeds the sampler from `config.sampler_seed`.
    pub fn from_config(
        extractor: E,
        head: Box<dyn DetectionHead>,
        config: &RoiHeadsConfig,
    ) -> Self {
        Self::new(extractor, head, config.sampler_seed)
    }

    pub fn forward(
        &mut self,
        features: &FeatureMaps,
        proposals: &[Array2<f32>],
        image_shapes: &[(usize, usize)],
        mode: Mode,
    ) -> Result<RoiHeadsOutput, Error> {
        if proposals.len() != image_shapes.len() {
            bail!(RoiHeadError::shape("image shapes", proposals.len(), image_shapes.len()));
        }
        if let Some(p) = proposals.iter().find(|p| p.ncols() != 4) {
            bail!(RoiHeadError::shape("proposals", "[N, 4]", format!("{:?}", p.shape())));
        }

        match mode {
            Mode::Training(targets) => {
                let samples = self.head.compute_targets(proposals, targets, &mut self.rng)?;
                debug!(
                    "{} sampled proposals over {} images",
                    samples.num_samples(),
                    samples.num_images()
                );

                let box_features =
                    self.extractor.extract(features, &samples.proposals, image_shapes)?;
                let outputs = self.head.predict(box_features.view())?;
                let losses = self.head.compute_loss(&outputs, &samples)?;
                Ok(RoiHeadsOutput::Training(TrainingResult { losses }))
            }
            Mode::Inference => {
                let box_features = self.extractor.extract(features, proposals, image_shapes)?;
                let outputs = self.head.predict(box_features.view())?;
                let detections = self.head.postprocess(&outputs, proposals, image_shapes)?;
                Ok(RoiHeadsOutput::Inference(InferenceResult { detections }))
            }
        }
    }
}
