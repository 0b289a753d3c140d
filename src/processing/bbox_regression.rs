use ndarray::{concatenate, Array1, Array2, ArrayView2, Axis};
use ndarray_rand::rand::Rng;
use tracing::{debug, warn};
use crate::error::RoiHeadError;
use crate::pipeline::targets::Target;
use crate::rcnn::box_coder::BoxCoder;
use crate::rcnn::matcher::{ensure_matches_agree, Match, Matcher};
use crate::rcnn::sampler::BalancedPositiveNegativeSampler;

/// Supervision for the sampled proposals of every image in a batch.
///
/// All per-image arrays share the row order of `proposals[i]`.
#[derive(Debug, Clone, Default)]
pub struct TrainingSamples {
    pub proposals: Vec<Array2<f32>>,
    pub matched_idxs: Vec<Vec<Match>>,
    pub labels: Vec<Array1<i64>>,
    pub length_labels: Vec<Array1<f32>>,
    pub regression_targets: Vec<Array2<f32>>,
}

impl TrainingSamples {
    pub fn num_images(&self) -> usize {
        self.proposals.len()
    }

    pub fn num_samples(&self) -> usize {
        self.proposals.iter().map(|p| p.nrows()).sum()
    }

    pub fn flat_labels(&self) -> Array1<i64> {
        self.labels.iter().flat_map(|l| l.iter().copied()).collect()
    }

    pub fn flat_length_labels(&self) -> Array1<f32> {
        self.length_labels.iter().flat_map(|l| l.iter().copied()).collect()
    }

    pub fn flat_regression_targets(&self) -> Result<Array2<f32>, RoiHeadError> {
        stack_rows(&self.regression_targets, "regression targets")
    }
}

pub(crate) fn stack_rows(
    parts: &[Array2<f32>],
    what: &'static str,
) -> Result<Array2<f32>, RoiHeadError> {
    if parts.is_empty() {
        return Ok(Array2::zeros((0, 4)));
    }
    let views: Vec<ArrayView2<f32>> = parts.iter().map(|p| p.view()).collect();
    concatenate(Axis(0), &views).map_err(|e| RoiHeadError::shape(what, "equal column counts", e))
}

/// Appends the ground truth boxes after the proposals so every object can be sampled.
pub fn add_gt_proposals<'a>(
    proposals: ArrayView2<'a, f32>,
    gt_boxes: ArrayView2<'a, f32>,
) -> Result<Array2<f32>, RoiHeadError> {
    concatenate(Axis(0), &[proposals, gt_boxes]).map_err(|_| {
        RoiHeadError::shape(
            "proposals and ground truth boxes",
            "4 columns each",
            format!("{} and {}", proposals.ncols(), gt_boxes.ncols()),
        )
    })
}

/// Matches, samples and encodes regression targets for one batch of images.
#[derive(Debug, Clone, Copy)]
pub struct TrainingSampleSelector {
    pub matcher: Matcher,
    pub sampler: BalancedPositiveNegativeSampler,
    pub box_coder: BoxCoder,
}

impl TrainingSampleSelector {
    pub fn select<R: Rng + ?Sized>(
        &self,
        proposals: &[Array2<f32>],
        targets: &[Target],
        rng: &mut R,
    ) -> Result<TrainingSamples, RoiHeadError> {
        if proposals.len() != targets.len() {
            return Err(RoiHeadError::shape("targets", proposals.len(), targets.len()));
        }

        let mut samples = TrainingSamples::default();
        for (image, (proposals_in_image, target)) in proposals.iter().zip(targets).enumerate() {
            let proposals_in_image =
                add_gt_proposals(proposals_in_image.view(), target.boxes.view())?;

            let classes = self
                .matcher
                .assign(proposals_in_image.view(), target.boxes.view(), target.labels.view())?;
            let lengths = self.matcher.assign(
                proposals_in_image.view(),
                target.boxes.view(),
                target.length_labels.view(),
            )?;
            ensure_matches_agree(image, &classes.matches, &lengths.matches)?;

            let sampled = self.sampler.sample(classes.labels.view(), rng);
            debug!(
                "image {}: sampled {} positives and {} negatives from {} proposals",
                image,
                sampled.positive.len(),
                sampled.negative.len(),
                proposals_in_image.nrows()
            );
            let keep = sampled.merged();

            let sampled_proposals = proposals_in_image.select(Axis(0), &keep);
            let classes = classes.select(&keep);
            let lengths = lengths.select(&keep);

            let gt_boxes = if target.is_empty() {
                warn!("image {} has no ground truth, all proposals are background", image);
                Array2::<f32>::zeros((1, 4))
            } else {
                target.boxes.clone()
            };
            let gt_indices: Vec<usize> = classes.matches.iter().map(Match::clamped_index).collect();
            let matched_gt_boxes = gt_boxes.select(Axis(0), &gt_indices);

            samples
                .regression_targets
                .push(self.box_coder.encode(sampled_proposals.view(), matched_gt_boxes.view()));
            samples.proposals.push(sampled_proposals);
            samples.matched_idxs.push(classes.matches);
            samples.labels.push(classes.labels);
            samples.length_labels.push(lengths.labels);
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array1, Array2};
    use ndarray_rand::rand::rngs::StdRng;
    use ndarray_rand::rand::SeedableRng;
    use crate::pipeline::targets::Target;
    use crate::processing::bbox_regression::{add_gt_proposals, TrainingSampleSelector};
    use crate::rcnn::box_coder::BoxCoder;
    use crate::rcnn::matcher::{Match, Matcher};
    use crate::rcnn::sampler::BalancedPositiveNegativeSampler;

    fn selector() -> TrainingSampleSelector {
        TrainingSampleSelector {
            matcher: Matcher::default(),
            sampler: BalancedPositiveNegativeSampler::default(),
            box_coder: BoxCoder::default(),
        }
    }

    #[test]
    fn test_add_gt_proposals_from_separate_arrays() {
        let proposals = Array2::<f32>::zeros((3, 4));
        let target = Target::new(array![[1.0, 1.0, 2.0, 2.0]], array![1], None).unwrap();

        let all = add_gt_proposals(proposals.view(), target.boxes.view()).unwrap();

        assert_eq!(all.dim(), (4, 4));
        assert_eq!(all.row(3).to_vec(), vec![1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_add_gt_proposals() {
        let proposals = array![[0.0, 0.0, 1.0, 1.0]];
        let gt = array![[2.0, 2.0, 3.0, 3.0], [4.0, 4.0, 5.0, 5.0]];
        let all = add_gt_proposals(proposals.view(), gt.view()).unwrap();
        assert_eq!(all.nrows(), 3);
        assert_eq!(all.row(2).to_vec(), vec![4.0, 4.0, 5.0, 5.0]);
    }

    #[test]
    fn test_arrays_stay_aligned() {
        let proposals = vec![array![
            [0.0, 0.0, 10.0, 10.0],
            [1.0, 1.0, 11.0, 11.0],
            [60.0, 60.0, 70.0, 70.0],
            [100.0, 100.0, 110.0, 110.0]
        ]];
        let target = Target::new(
            array![[0.0, 0.0, 10.0, 10.0], [100.0, 100.0, 112.0, 112.0]],
            array![1, 2],
            Some(array![25.0, 0.0]),
        )
        .unwrap();

        let samples = selector()
            .select(&proposals, &[target], &mut StdRng::seed_from_u64(5))
            .unwrap();

        // 4 proposals + 2 appended ground truth boxes, all eligible
        assert_eq!(samples.num_samples(), 6);
        let labels = &samples.labels[0];
        let lengths = &samples.length_labels[0];
        assert_eq!(labels.len(), samples.regression_targets[0].nrows());
        assert_eq!(labels.len(), samples.matched_idxs[0].len());
        let rows = labels.iter().zip(lengths.iter()).zip(&samples.matched_idxs[0]);
        for ((label, length), m) in rows {
            match m {
                Match::Matched(0) => assert_eq!((*label, *length), (1, 25.0)),
                Match::Matched(1) => assert_eq!((*label, *length), (2, 0.0)),
                _ => assert_eq!((*label, *length), (0, 0.0)),
            }
        }
        // ground truth box 0 sits at sampled row 4 and encodes to zero
        assert!(samples.regression_targets[0].row(4).iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn test_image_without_ground_truth() {
        let proposals = vec![array![[0.0, 0.0, 10.0, 10.0], [5.0, 5.0, 20.0, 20.0]]];
        let target = Target::new(Array2::zeros((0, 4)), Array1::zeros(0), None).unwrap();

        let samples = selector()
            .select(&proposals, &[target], &mut StdRng::seed_from_u64(5))
            .unwrap();

        assert_eq!(samples.flat_labels().to_vec(), vec![0, 0]);
        assert_eq!(samples.regression_targets[0].nrows(), 2);
    }

    #[test]
    fn test_target_count_must_match() {
        let proposals = vec![Array2::<f32>::zeros((1, 4)), Array2::zeros((1, 4))];
        let target = Target::new(Array2::zeros((0, 4)), Array1::zeros(0), None).unwrap();
        assert!(selector().select(&proposals, &[target], &mut StdRng::seed_from_u64(0)).is_err());
    }
}
