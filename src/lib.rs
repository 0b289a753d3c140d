//! ROI decision stage of a two-stage detector that, besides a class and a box,
//! regresses one continuous length per detected object.

pub mod error;
pub mod rcnn;
pub mod processing;
pub mod pipeline;
mod utils;

pub use error::RoiHeadError;
pub use pipeline::config::{BackboneKind, ModelConfig, RoiHeadsConfig};
pub use pipeline::detection_head::{DetectionHead, LengthRegressionHead};
pub use pipeline::input_adapter::InputAdapter;
pub use pipeline::predictor::{Linear, PredictorHead, PredictorOutput};
pub use pipeline::roi_heads::{
    BoxFeatureExtractor, FeatureMaps, InferenceResult, Mode, RoiHeads, RoiHeadsOutput,
    TrainingResult,
};
pub use pipeline::targets::{DynTensor, RawTarget, Target};
pub use processing::loss::RoiLosses;
pub use processing::postprocess::{Detection, ImageDetections};
pub use rcnn::box_coder::BoxCoder;
