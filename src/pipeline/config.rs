use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use anyhow::{Context, Error, Result};
use serde::{Deserialize, Serialize};
use crate::error::RoiHeadError;
use crate::pipeline::input_adapter::InputAdapter;
use crate::processing::postprocess::PostprocessParams;
use crate::rcnn::box_coder::BoxCoder;
use crate::rcnn::matcher::Matcher;
use crate::rcnn::sampler::BalancedPositiveNegativeSampler;

/// Numeric behaviour of the ROI heads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiHeadsConfig {
    /// Includes the background class.
    pub num_classes: usize,
    pub bbox_reg_weights: [f32; 4],
    pub bbox_xform_clip: f32,
    pub fg_iou_thresh: f32,
    pub bg_iou_thresh: f32,
    pub batch_size_per_image: usize,
    pub positive_fraction: f32,
    pub score_thresh: f32,
    pub nms_thresh: f32,
    pub min_size: f32,
    pub detections_per_img: usize,
    pub smooth_l1_beta: f32,
    pub sampler_seed: Option<u64>,
}

impl Default for RoiHeadsConfig {
    fn default() -> Self {
        RoiHeadsConfig {
            num_classes: 4,
            bbox_reg_weights: [10.0, 10.0, 5.0, 5.0],
            bbox_xform_clip: (1000_f32 / 16_f32).ln(),
            fg_iou_thresh: 0.5,
            bg_iou_thresh: 0.5,
            batch_size_per_image: 512,
            positive_fraction: 0.25,
            score_thresh: 0.05,
            nms_thresh: 0.5,
            min_size: 1e-2,
            detections_per_img: 100,
            smooth_l1_beta: 1.0 / 9.0,
            sampler_seed: None,
        }
    }
}

impl RoiHeadsConfig {
    pub fn validate(&self) -> Result<(), RoiHeadError> {
        if self.num_classes < 2 {
            return Err(RoiHeadError::InvalidConfig(format!(
                "num_classes must count background plus at least one class, got {}",
                self.num_classes
            )));
        }
        if self.bbox_reg_weights.iter().any(|w| !(*w > 0.0)) {
            return Err(RoiHeadError::InvalidConfig(format!(
                "bbox_reg_weights must be positive, got {:?}",
                self.bbox_reg_weights
            )));
        }
        for (name, value) in [
            ("fg_iou_thresh", self.fg_iou_thresh),
            ("bg_iou_thresh", self.bg_iou_thresh),
            ("score_thresh", self.score_thresh),
            ("nms_thresh", self.nms_thresh),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(RoiHeadError::InvalidConfig(format!(
                    "{} {} outside [0, 1]",
                    name, value
                )));
            }
        }
        if self.detections_per_img == 0 {
            return Err(RoiHeadError::InvalidConfig(
                "detections_per_img must be positive".to_string(),
            ));
        }
        if self.smooth_l1_beta < 0.0 || self.min_size < 0.0 {
            return Err(RoiHeadError::InvalidConfig(
                "smooth_l1_beta and min_size must be non-negative".to_string(),
            ));
        }
        self.matcher()?;
        self.sampler()?;
        Ok(())
    }

    pub fn box_coder(&self) -> BoxCoder {
        let [wx, wy, ww, wh] = self.bbox_reg_weights;
        BoxCoder::with_clip((wx, wy, ww, wh), self.bbox_xform_clip)
    }

    pub fn matcher(&self) -> Result<Matcher, RoiHeadError> {
        Matcher::new(self.fg_iou_thresh, self.bg_iou_thresh)
    }

    pub fn sampler(&self) -> Result<BalancedPositiveNegativeSampler, RoiHeadError> {
        BalancedPositiveNegativeSampler::new(self.batch_size_per_image, self.positive_fraction)
    }

    pub fn postprocess_params(&self) -> PostprocessParams {
        PostprocessParams {
            score_thresh: self.score_thresh,
            nms_thresh: self.nms_thresh,
            min_size: self.min_size,
            detections_per_img: self.detections_per_img,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let config: RoiHeadsConfig =
            serde_json::from_str(json).context("parsing ROI heads config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("loading {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackboneKind {
    Resnet50,
    Resnet101,
    Mobilenet320,
}

impl FromStr for BackboneKind {
    type Err = RoiHeadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "resnet50" => Ok(BackboneKind::Resnet50),
            "resnet101" => Ok(BackboneKind::Resnet101),
            "mobilenet-320" => Ok(BackboneKind::Mobilenet320),
            other => Err(RoiHeadError::UnknownBackbone(other.to_string())),
        }
    }
}

impl TryFrom<String> for BackboneKind {
    type Error = RoiHeadError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackboneKind> for String {
    fn from(kind: BackboneKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackboneKind::Resnet50 => "resnet50",
            BackboneKind::Resnet101 => "resnet101",
            BackboneKind::Mobilenet320 => "mobilenet-320",
        };
        f.write_str(name)
    }
}

/// Construction-time settings for the whole detector around the ROI heads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub backbone: BackboneKind,
    pub num_channels: usize,
    #[serde(default)]
    pub roi_heads: RoiHeadsConfig,
}

impl ModelConfig {
    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let config: ModelConfig = serde_json::from_str(json).context("parsing model config")?;
        config.input_adapter()?;
        config.roi_heads.validate()?;
        Ok(config)
    }

    pub fn input_adapter(&self) -> Result<InputAdapter, RoiHeadError> {
        InputAdapter::for_channels(self.num_channels)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::RoiHeadError;
    use crate::pipeline::config::{BackboneKind, ModelConfig, RoiHeadsConfig};
    use crate::pipeline::input_adapter::InputAdapter;

    #[test]
    fn test_defaults_are_valid() {
        let config = RoiHeadsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sampler().unwrap().positive_quota(), 128);
        assert_eq!(config.postprocess_params().detections_per_img, 100);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{"num_classes": 3, "sampler_seed": 17}"#;
        let config = RoiHeadsConfig::from_json_str(json).unwrap();
        assert_eq!(config.num_classes, 3);
        assert_eq!(config.sampler_seed, Some(17));
        assert_eq!(config.batch_size_per_image, 512);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(RoiHeadsConfig::from_json_str(r#"{"num_classes": 1}"#).is_err());
        let inverted = r#"{"fg_iou_thresh": 0.3, "bg_iou_thresh": 0.6}"#;
        assert!(RoiHeadsConfig::from_json_str(inverted).is_err());
        assert!(RoiHeadsConfig::from_json_str(r#"{"positive_fraction": 2.0}"#).is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roi_heads.json");
        std::fs::write(&path, r#"{"score_thresh": 0.2}"#).unwrap();

        let config = RoiHeadsConfig::from_json_file(&path).unwrap();

        assert_eq!(config.score_thresh, 0.2);
    }

    #[test]
    fn test_backbone_selection() {
        assert_eq!("mobilenet-320".parse::<BackboneKind>().unwrap(), BackboneKind::Mobilenet320);
        assert_eq!(
            "vgg16".parse::<BackboneKind>(),
            Err(RoiHeadError::UnknownBackbone("vgg16".to_string()))
        );

        let json = r#"{"backbone": "resnet101", "num_channels": 2}"#;
        let config = ModelConfig::from_json_str(json).unwrap();
        assert_eq!(config.backbone, BackboneKind::Resnet101);
        assert_eq!(config.roi_heads, RoiHeadsConfig::default());
        assert_eq!(
            config.input_adapter().unwrap(),
            InputAdapter::ReplicateFirstChannel { missing: 1 }
        );
        let no_channels = r#"{"backbone": "resnet50", "num_channels": 0}"#;
        assert!(ModelConfig::from_json_str(no_channels).is_err());

        let json = r#"{"backbone": "alexnet", "num_channels": 3}"#;
        let err = ModelConfig::from_json_str(json).unwrap_err();
        assert!(err.to_string().contains("model config"));
    }
}
