use std::fmt::Debug;
use ndarray::{Array1, ArrayView1, ArrayView2};
use crate::error::RoiHeadError;
use crate::rcnn::bbox::box_iou;

/// A per-ground-truth value that can be copied onto matched proposals.
pub trait AssignableLabel: Copy + Debug + PartialEq {
    /// Written to proposals whose best IoU is below the low threshold.
    const BACKGROUND: Self;
    /// Written to proposals that fall between the two thresholds.
    const IGNORE: Self;
}

impl AssignableLabel for i64 {
    const BACKGROUND: Self = 0;
    const IGNORE: Self = -1;
}

impl AssignableLabel for f32 {
    const BACKGROUND: Self = 0.0;
    const IGNORE: Self = -1.0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    Matched(usize),
    BelowLowThreshold,
    BetweenThresholds,
}

impl Match {
    pub fn gt_index(&self) -> Option<usize> {
        match self {
            Match::Matched(idx) => Some(*idx),
            _ => None,
        }
    }

    /// Index usable for gathering ground truth boxes; unmatched entries point at 0.
    pub fn clamped_index(&self) -> usize {
        self.gt_index().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct MatchResult<L> {
    pub matches: Vec<Match>,
    pub labels: Array1<L>,
}

impl<L: AssignableLabel> MatchResult<L> {
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn select(&self, indices: &[usize]) -> Self {
        MatchResult {
            matches: indices.iter().map(|&i| self.matches[i]).collect(),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }
}

/// Two-threshold IoU matching policy.
///
/// `iou >= high` is positive, `iou < low` is background, anything else is ignored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matcher {
    high_threshold: f32,
    low_threshold: f32,
}

impl Matcher {
    pub fn new(high_threshold: f32, low_threshold: f32) -> Result<Self, RoiHeadError> {
        if low_threshold > high_threshold {
            return Err(RoiHeadError::InvalidConfig(format!(
                "matcher low threshold {} exceeds high threshold {}",
                low_threshold, high_threshold
            )));
        }
        Ok(Matcher {
            high_threshold,
            low_threshold,
        })
    }

    pub fn high_threshold(&self) -> f32 {
        self.high_threshold
    }

    pub fn low_threshold(&self) -> f32 {
        self.low_threshold
    }

    /// Classifies every row of a `[proposals, gt]` IoU matrix against its best column.
    pub fn match_proposals(&self, iou: ArrayView2<f32>) -> Vec<Match> {
        if iou.ncols() == 0 {
            return vec![Match::BelowLowThreshold; iou.nrows()];
        }

        iou.rows()
            .into_iter()
            .map(|row| {
                let (best_idx, best_iou) = row
                    .iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (idx, &v)| {
                        if v > best.1 {
                            (idx, v)
                        } else {
                            best
                        }
                    });
                if best_iou >= self.high_threshold {
                    Match::Matched(best_idx)
                } else if best_iou < self.low_threshold {
                    Match::BelowLowThreshold
                } else {
                    Match::BetweenThresholds
                }
            })
            .collect()
    }

    /// Matches `proposals` to `gt_boxes` and copies `gt_labels` onto positive matches.
    pub fn assign<L: AssignableLabel>(
        &self,
        proposals: ArrayView2<f32>,
        gt_boxes: ArrayView2<f32>,
        gt_labels: ArrayView1<L>,
    ) -> Result<MatchResult<L>, RoiHeadError> {
        if gt_labels.len() != gt_boxes.nrows() {
            return Err(RoiHeadError::shape(
                "ground truth labels",
                gt_boxes.nrows(),
                gt_labels.len(),
            ));
        }

        let matches = self.match_proposals(box_iou(proposals, gt_boxes).view());
        let labels = matches
            .iter()
            .map(|m| match m {
                Match::Matched(idx) => gt_labels[*idx],
                Match::BelowLowThreshold => L::BACKGROUND,
                Match::BetweenThresholds => L::IGNORE,
            })
            .collect();

        Ok(MatchResult { matches, labels })
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Matcher {
            high_threshold: 0.5,
            low_threshold: 0.5,
        }
    }
}

/// Fails with `MatchDivergence` at the first proposal whose two matches disagree.
pub fn ensure_matches_agree(
    image: usize,
    class_matches: &[Match],
    length_matches: &[Match],
) -> Result<(), RoiHeadError> {
    if class_matches.len() != length_matches.len() {
        return Err(RoiHeadError::shape(
            "length matches",
            class_matches.len(),
            length_matches.len(),
        ));
    }
    match class_matches.iter().zip(length_matches).position(|(a, b)| a != b) {
        Some(proposal) => Err(RoiHeadError::MatchDivergence { image, proposal }),
        None => Ok(()),
    }
}
