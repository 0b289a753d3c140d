use std::fs::File;
use std::path::Path;
use anyhow::{Context, Error, Result};
use ndarray::{Array1, Array2, ArrayView2, ArrayViewD, Ix2};
use ndarray_npy::{NpzReader, NpzWriter};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use crate::error::RoiHeadError;

/// Dense layer stored the torch way: `weight` is `[out, in]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Linear {
    pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self, RoiHeadError> {
        if bias.len() != weight.nrows() {
            return Err(RoiHeadError::shape("linear bias", weight.nrows(), bias.len()));
        }
        Ok(Linear { weight, bias })
    }

    /// Uniform init in `±1/sqrt(in_features)`.
    pub fn random<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (in_features.max(1) as f32).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        Linear {
            weight: Array2::random_using((out_features, in_features), dist, rng),
            bias: Array1::random_using(out_features, dist, rng),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let mut out = x.dot(&self.weight.t());
        out += &self.bias;
        out
    }
}

/// Raw per-proposal head outputs, row-aligned with the proposals they were pooled from.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictorOutput {
    /// `[N, K + 1]`
    pub class_logits: Array2<f32>,
    /// `[N, 4 * (K + 1)]`
    pub box_regression: Array2<f32>,
    /// `[N]`
    pub length_pred: Array1<f32>,
}

/// Class, per-class box and vessel length projections over pooled box features.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictorHead {
    cls_score: Linear,
    bbox_pred: Linear,
    vessel_len: Linear,
}

const PARAMETER_NAMES: [&str; 6] = [
    "cls_score.weight",
    "cls_score.bias",
    "bbox_pred.weight",
    "bbox_pred.bias",
    "vessel_len.weight",
    "vessel_len.bias",
];

impl PredictorHead {
    pub fn new(
        cls_score: Linear,
        bbox_pred: Linear,
        vessel_len: Linear,
    ) -> Result<Self, RoiHeadError> {
        let in_features = cls_score.in_features();
        for (what, layer) in [("bbox_pred", &bbox_pred), ("vessel_len", &vessel_len)] {
            if layer.in_features() != in_features {
                return Err(RoiHeadError::shape(what, in_features, layer.in_features()));
            }
        }
        if bbox_pred.out_features() != 4 * cls_score.out_features() {
            return Err(RoiHeadError::shape(
                "bbox_pred outputs",
                4 * cls_score.out_features(),
                bbox_pred.out_features(),
            ));
        }
        if vessel_len.out_features() != 1 {
            return Err(RoiHeadError::shape("vessel_len outputs", 1, vessel_len.out_features()));
        }
        Ok(PredictorHead {
            cls_score,
            bbox_pred,
            vessel_len,
        })
    }

    /// `num_classes` counts the background class.
    pub fn new_random<R: Rng + ?Sized>(
        in_features: usize,
        num_classes: usize,
        rng: &mut R,
    ) -> Self {
        PredictorHead {
            cls_score: Linear::random(in_features, num_classes, rng),
            bbox_pred: Linear::random(in_features, num_classes * 4, rng),
            vessel_len: Linear::random(in_features, 1, rng),
        }
    }

    pub fn in_features(&self) -> usize {
        self.cls_score.in_features()
    }

    pub fn num_classes(&self) -> usize {
        self.cls_score.out_features()
    }

    /// Accepts `[N, D]` features or `[N, D, 1, 1]` pooled maps.
    pub fn forward(&self, x: ArrayViewD<f32>) -> Result<PredictorOutput, RoiHeadError> {
        let x = match x.ndim() {
            2 => x
                .into_dimensionality::<Ix2>()
                .map_err(|e| RoiHeadError::shape("box features", "[N, D]", e))?
                .to_owned(),
            4 => {
                if x.shape()[2..] != [1, 1] {
                    return Err(RoiHeadError::SpatialNotFlat(x.shape()[2..].to_vec()));
                }
                let (n, d) = (x.shape()[0], x.shape()[1]);
                Array2::from_shape_vec((n, d), x.iter().copied().collect())
                    .map_err(|e| RoiHeadError::shape("box features", "[N, D, 1, 1]", e))?
            }
            _ => {
                return Err(RoiHeadError::shape(
                    "box features",
                    "[N, D] or [N, D, 1, 1]",
                    format!("{:?}", x.shape()),
                ))
            }
        };
        if x.ncols() != self.in_features() {
            return Err(RoiHeadError::shape("box feature width", self.in_features(), x.ncols()));
        }

        let class_logits = self.cls_score.forward(x.view());
        let box_regression = self.bbox_pred.forward(x.view());
        let length_pred = self.vessel_len.forward(x.view()).column(0).to_owned();

        Ok(PredictorOutput {
            class_logits,
            box_regression,
            length_pred,
        })
    }

    pub fn from_npz<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let mut npz = NpzReader::new(file).with_context(|| format!("reading {}", path.display()))?;
        let names = npz.names()?;
        let resolve = |name: &str| -> Result<String, Error> {
            names
                .iter()
                .find(|n| n.as_str() == name || n.strip_suffix(".npy") == Some(name))
                .cloned()
                .with_context(|| format!("{} is missing `{}`", path.display(), name))
        };

        let mut layers = Vec::with_capacity(3);
        for pair in PARAMETER_NAMES.chunks(2) {
            let weight: Array2<f32> = npz
                .by_name(&resolve(pair[0])?)
                .with_context(|| format!("loading `{}`", pair[0]))?;
            let bias: Array1<f32> = npz
                .by_name(&resolve(pair[1])?)
                .with_context(|| format!("loading `{}`", pair[1]))?;
            layers.push(Linear::new(weight, bias)?);
        }
        let vessel_len = layers.pop().context("vessel_len parameters")?;
        let bbox_pred = layers.pop().context("bbox_pred parameters")?;
        let cls_score = layers.pop().context("cls_score parameters")?;
        Ok(PredictorHead::new(cls_score, bbox_pred, vessel_len)?)
    }

    pub fn save_npz<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let mut npz = NpzWriter::new(file);
        for (names, layer) in PARAMETER_NAMES
            .chunks(2)
            .zip([&self.cls_score, &self.bbox_pred, &self.vessel_len])
        {
            npz.add_array(names[0], &layer.weight)?;
            npz.add_array(names[1], &layer.bias)?;
        }
        npz.finish()?;
        Ok(())
    }
}
