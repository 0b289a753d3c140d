use ndarray::ArrayView1;
use ndarray_rand::rand::seq::index;
use ndarray_rand::rand::Rng;
use crate::error::RoiHeadError;

/// Positive and negative proposal indices picked for one image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampledIndices {
    pub positive: Vec<usize>,
    pub negative: Vec<usize>,
}

impl SampledIndices {
    pub fn len(&self) -> usize {
        self.positive.len() + self.negative.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Union of both sets in ascending proposal order.
    pub fn merged(&self) -> Vec<usize> {
        let mut all: Vec<usize> = self.positive.iter().chain(&self.negative).copied().collect();
        all.sort_unstable();
        all
    }
}

/// Draws a fixed-size, class-balanced subset of proposals per image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalancedPositiveNegativeSampler {
    batch_size_per_image: usize,
    positive_fraction: f32,
}

impl BalancedPositiveNegativeSampler {
    pub fn new(batch_size_per_image: usize, positive_fraction: f32) -> Result<Self, RoiHeadError> {
        if batch_size_per_image == 0 {
            return Err(RoiHeadError::InvalidConfig(
                "sampler batch size must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&positive_fraction) {
            return Err(RoiHeadError::InvalidConfig(format!(
                "positive fraction {} outside [0, 1]",
                positive_fraction
            )));
        }
        Ok(BalancedPositiveNegativeSampler {
            batch_size_per_image,
            positive_fraction,
        })
    }

    /// Upper bound on positives drawn per image.
    pub fn positive_quota(&self) -> usize {
        (self.batch_size_per_image as f32 * self.positive_fraction) as usize
    }

    /// Samples from `labels` where `>= 1` is positive, `0` negative and anything else ignored.
    ///
    /// Positives never exceed the quota; negatives fill the rest of the batch as far as
    /// they are available.
    pub fn sample<R: Rng + ?Sized>(&self, labels: ArrayView1<i64>, rng: &mut R) -> SampledIndices {
        let positive: Vec<usize> =
            labels.iter().enumerate().filter(|&(_, &l)| l >= 1).map(|(i, _)| i).collect();
        let negative: Vec<usize> =
            labels.iter().enumerate().filter(|&(_, &l)| l == 0).map(|(i, _)| i).collect();

        let num_pos = self.positive_quota().min(positive.len());
        let num_neg = (self.batch_size_per_image - num_pos).min(negative.len());

        SampledIndices {
            positive: choose(&positive, num_pos, rng),
            negative: choose(&negative, num_neg, rng),
        }
    }
}

impl Default for BalancedPositiveNegativeSampler {
    fn default() -> Self {
        BalancedPositiveNegativeSampler {
            batch_size_per_image: 512,
            positive_fraction: 0.25,
        }
    }
}

fn choose<R: Rng + ?Sized>(candidates: &[usize], amount: usize, rng: &mut R) -> Vec<usize> {
    index::sample(rng, candidates.len(), amount)
        .into_iter()
        .map(|i| candidates[i])
        .collect()
}
