use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use tracing::debug;
use crate::error::RoiHeadError;
use crate::processing::nms::batched_nms;
use crate::rcnn::bbox::{clip_boxes_to_image, remove_small_boxes};
use crate::rcnn::box_coder::BoxCoder;
use crate::utils::numeric::softmax_rows;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostprocessParams {
    pub score_thresh: f32,
    pub nms_thresh: f32,
    pub min_size: f32,
    pub detections_per_img: usize,
}

impl Default for PostprocessParams {
    fn default() -> Self {
        PostprocessParams {
            score_thresh: 0.05,
            nms_thresh: 0.5,
            min_size: 1e-2,
            detections_per_img: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: [f32; 4],
    pub label: i64,
    pub score: f32,
    pub length: f32,
}

/// Final detections of one image as parallel arrays, best score first.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageDetections {
    pub boxes: Array2<f32>,
    pub labels: Array1<i64>,
    pub scores: Array1<f32>,
    pub lengths: Array1<f32>,
}

impl ImageDetections {
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Detection> + '_ {
        (0..self.len()).map(move |i| Detection {
            bbox: [self.boxes[(i, 0)], self.boxes[(i, 1)], self.boxes[(i, 2)], self.boxes[(i, 3)]],
            label: self.labels[i],
            score: self.scores[i],
            length: self.lengths[i],
        })
    }
}

/// Head outputs for every proposal of a batch, rows ordered image after image.
#[derive(Debug, Clone, Copy)]
pub struct RawPredictions<'a> {
    pub class_logits: ArrayView2<'a, f32>,
    pub box_regression: ArrayView2<'a, f32>,
    pub length_pred: ArrayView1<'a, f32>,
}

/// Turns head outputs into per-image, per-class suppressed detections.
pub fn postprocess_detections(
    predictions: &RawPredictions,
    proposals: &[Array2<f32>],
    image_shapes: &[(usize, usize)],
    box_coder: &BoxCoder,
    params: &PostprocessParams,
) -> Result<Vec<ImageDetections>, RoiHeadError> {
    if proposals.len() != image_shapes.len() {
        return Err(RoiHeadError::shape("image shapes", proposals.len(), image_shapes.len()));
    }
    let total: usize = proposals.iter().map(|p| p.nrows()).sum();
    let num_classes = predictions.class_logits.ncols();
    if predictions.class_logits.nrows() != total || predictions.length_pred.len() != total {
        return Err(RoiHeadError::shape(
            "head outputs",
            format!("{} rows", total),
            format!(
                "{} logits, {} lengths",
                predictions.class_logits.nrows(),
                predictions.length_pred.len()
            ),
        ));
    }
    if predictions.box_regression.dim() != (total, 4 * num_classes) {
        return Err(RoiHeadError::shape(
            "box regression",
            format!("({}, {})", total, 4 * num_classes),
            format!("{:?}", predictions.box_regression.dim()),
        ));
    }

    let mut results = Vec::with_capacity(proposals.len());
    let mut offset = 0;
    let per_image = proposals.iter().zip(image_shapes).enumerate();
    for (image, (proposals_in_image, &image_shape)) in per_image {
        let n = proposals_in_image.nrows();
        let (start, end) = (offset, offset + n);
        offset = end;

        let pred_boxes = box_coder.decode(
            predictions.box_regression.slice(s![start..end, ..]),
            proposals_in_image.view(),
        )?;
        let pred_scores = softmax_rows(predictions.class_logits.slice(s![start..end, ..]));
        let pred_lengths = predictions.length_pred.slice(s![start..end]);

        // every foreground class of every proposal becomes its own candidate
        let num_fg = num_classes.saturating_sub(1);
        let mut boxes = Array2::<f32>::zeros((n * num_fg, 4));
        let mut scores = Array1::<f32>::zeros(n * num_fg);
        let mut labels = Array1::<i64>::zeros(n * num_fg);
        let mut lengths = Array1::<f32>::zeros(n * num_fg);
        for i in 0..n {
            for c in 1..num_classes {
                let k = i * num_fg + (c - 1);
                boxes.row_mut(k).assign(&pred_boxes.slice(s![i, c, ..]));
                scores[k] = pred_scores[(i, c)];
                labels[k] = c as i64;
                lengths[k] = pred_lengths[i];
            }
        }
        clip_boxes_to_image(&mut boxes, image_shape);

        let keep: Vec<usize> =
            (0..scores.len()).filter(|&k| scores[k] > params.score_thresh).collect();
        let (boxes, scores, labels, lengths) =
            select_all(&boxes, &scores, &labels, &lengths, &keep);

        let keep = remove_small_boxes(boxes.view(), params.min_size);
        let (boxes, scores, labels, lengths) =
            select_all(&boxes, &scores, &labels, &lengths, &keep);

        let mut keep = batched_nms(boxes.view(), scores.view(), labels.view(), params.nms_thresh);
        keep.truncate(params.detections_per_img);
        let (boxes, scores, labels, lengths) =
            select_all(&boxes, &scores, &labels, &lengths, &keep);

        debug!("image {}: {} detections from {} proposals", image, scores.len(), n);
        results.push(ImageDetections {
            boxes,
            labels,
            scores,
            lengths,
        });
    }
    Ok(results)
}

fn select_all(
    boxes: &Array2<f32>,
    scores: &Array1<f32>,
    labels: &Array1<i64>,
    lengths: &Array1<f32>,
    keep: &[usize],
) -> (Array2<f32>, Array1<f32>, Array1<i64>, Array1<f32>) {
    (
        boxes.select(Axis(0), keep),
        scores.select(Axis(0), keep),
        labels.select(Axis(0), keep),
        lengths.select(Axis(0), keep),
    )
}
