use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RoiHeadError {
    #[error("target {image}: `{field}` {reason}")]
    SchemaViolation {
        image: usize,
        field: &'static str,
        reason: String,
    },
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        actual: String,
    },
    #[error("label {label} out of range for {num_classes} classes")]
    LabelOutOfRange { label: i64, num_classes: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unknown backbone `{0}`, expected one of resnet50, resnet101, mobilenet-320")]
    UnknownBackbone(String),
    #[error("class and length matches disagree at proposal {proposal} of image {image}")]
    MatchDivergence { image: usize, proposal: usize },
    #[error("box features must be pooled to 1x1, got spatial size {0:?}")]
    SpatialNotFlat(Vec<usize>),
}

impl RoiHeadError {
    pub(crate) fn shape(
        what: &'static str,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        RoiHeadError::ShapeMismatch {
            what,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}
