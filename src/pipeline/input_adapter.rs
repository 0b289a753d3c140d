use ndarray::{concatenate, s, Array3, ArrayView3, Axis};
use crate::error::RoiHeadError;

/// How `[C, H, W]` images are fitted to a three-channel pretrained stem.
///
/// Picked once from the configured channel count when the detector is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAdapter {
    /// Appends `missing` copies of channel 0.
    ReplicateFirstChannel { missing: usize },
    Passthrough,
    /// The stem is rebuilt for `channels` inputs; images pass through unchanged.
    WideStem { channels: usize },
}

impl InputAdapter {
    pub fn for_channels(channels: usize) -> Result<Self, RoiHeadError> {
        match channels {
            0 => Err(RoiHeadError::InvalidConfig("num_channels must be at least 1".to_string())),
            1 | 2 => Ok(InputAdapter::ReplicateFirstChannel { missing: 3 - channels }),
            3 => Ok(InputAdapter::Passthrough),
            channels => Ok(InputAdapter::WideStem { channels }),
        }
    }

    /// Channel count the backbone stem has to accept.
    pub fn stem_channels(&self) -> usize {
        match self {
            InputAdapter::WideStem { channels } => *channels,
            _ => 3,
        }
    }

    pub fn expected_channels(&self) -> usize {
        match self {
            InputAdapter::ReplicateFirstChannel { missing } => 3 - missing,
            InputAdapter::Passthrough => 3,
            InputAdapter::WideStem { channels } => *channels,
        }
    }

    pub fn adapt(&self, image: ArrayView3<f32>) -> Result<Array3<f32>, RoiHeadError> {
        if image.shape()[0] != self.expected_channels() {
            return Err(RoiHeadError::shape(
                "image channels",
                self.expected_channels(),
                image.shape()[0],
            ));
        }
        match self {
            InputAdapter::ReplicateFirstChannel { missing } => {
                let first = image.clone().slice_move(s![0..1, .., ..]);
                let mut parts = vec![image];
                parts.extend(std::iter::repeat(first).take(*missing));
                concatenate(Axis(0), &parts)
                    .map_err(|e| RoiHeadError::shape("adapted image", "[3, H, W]", e))
            }
            _ => Ok(image.to_owned()),
        }
    }
}
