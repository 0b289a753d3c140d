use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;
use anyhow::{Context, Error, Result};
use ndarray::{Array1, Array2, ArrayD, Ix1, Ix2};
use ndarray_npy::NpzReader;
use crate::error::RoiHeadError;

/// A tensor whose element type is only known at run time, as handed over by data loaders.
#[derive(Debug, Clone, PartialEq)]
pub enum DynTensor {
    Float32(ArrayD<f32>),
    Float64(ArrayD<f64>),
    Int32(ArrayD<i32>),
    Int64(ArrayD<i64>),
    Bool(ArrayD<bool>),
}

impl DynTensor {
    pub fn dtype_name(&self) -> &'static str {
        match self {
            DynTensor::Float32(_) => "float32",
            DynTensor::Float64(_) => "float64",
            DynTensor::Int32(_) => "int32",
            DynTensor::Int64(_) => "int64",
            DynTensor::Bool(_) => "bool",
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            DynTensor::Float32(a) => a.shape(),
            DynTensor::Float64(a) => a.shape(),
            DynTensor::Int32(a) => a.shape(),
            DynTensor::Int64(a) => a.shape(),
            DynTensor::Bool(a) => a.shape(),
        }
    }

    fn into_float(self, image: usize, field: &'static str) -> Result<ArrayD<f32>, RoiHeadError> {
        match self {
            DynTensor::Float32(a) => Ok(a),
            DynTensor::Float64(a) => Ok(a.mapv(|v| v as f32)),
            other => Err(RoiHeadError::SchemaViolation {
                image,
                field,
                reason: format!("must be floating point, got {}", other.dtype_name()),
            }),
        }
    }

    fn into_integral(self, image: usize, field: &'static str) -> Result<ArrayD<i64>, RoiHeadError> {
        match self {
            DynTensor::Int64(a) => Ok(a),
            DynTensor::Int32(a) => Ok(a.mapv(i64::from)),
            other => Err(RoiHeadError::SchemaViolation {
                image,
                field,
                reason: format!("must be integral, got {}", other.dtype_name()),
            }),
        }
    }
}

/// Ground truth for one image as delivered, before any type checks.
#[derive(Debug, Clone)]
pub struct RawTarget {
    pub boxes: DynTensor,
    pub labels: DynTensor,
    pub length_labels: Option<DynTensor>,
}

/// Validated ground truth for one image.
///
/// A length label of `0.0` means the object's length is unknown.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub boxes: Array2<f32>,
    pub labels: Array1<i64>,
    pub length_labels: Array1<f32>,
}

impl Target {
    pub fn new(
        boxes: Array2<f32>,
        labels: Array1<i64>,
        length_labels: Option<Array1<f32>>,
    ) -> Result<Self, RoiHeadError> {
        if boxes.ncols() != 4 {
            return Err(RoiHeadError::shape(
                "target boxes",
                "[N, 4]",
                format!("{:?}", boxes.shape()),
            ));
        }
        if labels.len() != boxes.nrows() {
            return Err(RoiHeadError::shape("target labels", boxes.nrows(), labels.len()));
        }
        let length_labels = length_labels.unwrap_or_else(|| Array1::zeros(boxes.nrows()));
        if length_labels.len() != boxes.nrows() {
            return Err(RoiHeadError::shape(
                "target length labels",
                boxes.nrows(),
                length_labels.len(),
            ));
        }
        Ok(Target {
            boxes,
            labels,
            length_labels,
        })
    }

    /// Checks element types before anything else; no silent coercion between float and integer.
    pub fn try_from_raw(image: usize, raw: RawTarget) -> Result<Self, RoiHeadError> {
        let boxes = raw.boxes.into_float(image, "boxes")?;
        let labels = raw.labels.into_integral(image, "labels")?;
        let length_labels = match raw.length_labels {
            Some(t) => Some(t.into_float(image, "length_labels")?),
            None => None,
        };

        let boxes = boxes.into_dimensionality::<Ix2>().map_err(|_| RoiHeadError::SchemaViolation {
            image,
            field: "boxes",
            reason: "must have shape [N, 4]".to_string(),
        })?;
        let labels = labels.into_dimensionality::<Ix1>().map_err(|_| RoiHeadError::SchemaViolation {
            image,
            field: "labels",
            reason: "must have shape [N]".to_string(),
        })?;
        let length_labels = match length_labels {
            Some(l) => Some(l.into_dimensionality::<Ix1>().map_err(|_| {
                RoiHeadError::SchemaViolation {
                    image,
                    field: "length_labels",
                    reason: "must have shape [N]".to_string(),
                }
            })?),
            None => None,
        };

        Target::new(boxes, labels, length_labels)
    }

    pub fn len(&self) -> usize {
        self.boxes.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.nrows() == 0
    }

    /// Value checks against the head's class count (background included).
    pub fn validate(&self, image: usize, num_classes: usize) -> Result<(), RoiHeadError> {
        if self.boxes.iter().any(|v| !v.is_finite()) {
            return Err(RoiHeadError::SchemaViolation {
                image,
                field: "boxes",
                reason: "contains non-finite coordinates".to_string(),
            });
        }
        if let Some(&label) = self.labels.iter().find(|&&l| l < 1 || l as usize >= num_classes) {
            return Err(RoiHeadError::SchemaViolation {
                image,
                field: "labels",
                reason: format!("label {} outside 1..{}", label, num_classes),
            });
        }
        if let Some(&length) = self.length_labels.iter().find(|&&l| !l.is_finite() || l < 0.0) {
            return Err(RoiHeadError::SchemaViolation {
                image,
                field: "length_labels",
                reason: format!("length {} must be finite and non-negative", length),
            });
        }
        Ok(())
    }

    /// Reads `boxes`, `labels` and optionally `length_labels` from an `.npz` archive.
    pub fn from_npz<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let mut npz = NpzReader::new(file).with_context(|| format!("reading {}", path.display()))?;

        let boxes = read_dyn(&mut npz, "boxes")?
            .with_context(|| format!("{} has no `boxes` array", path.display()))?;
        let labels = read_dyn(&mut npz, "labels")?
            .with_context(|| format!("{} has no `labels` array", path.display()))?;
        let length_labels = read_dyn(&mut npz, "length_labels")?;

        let raw = RawTarget {
            boxes,
            labels,
            length_labels,
        };
        Ok(Target::try_from_raw(0, raw)?)
    }
}

/// Converts a whole batch, failing on the first malformed record.
pub fn targets_from_raw(raw: Vec<RawTarget>) -> Result<Vec<Target>, RoiHeadError> {
    raw.into_iter()
        .enumerate()
        .map(|(image, t)| Target::try_from_raw(image, t))
        .collect()
}

fn read_dyn<R: Read + Seek>(
    npz: &mut NpzReader<R>,
    name: &str,
) -> Result<Option<DynTensor>, Error> {
    let names = npz.names()?;
    let found = names
        .iter()
        .find(|n| n.as_str() == name || n.strip_suffix(".npy") == Some(name));
    let entry = match found {
        Some(entry) => entry.clone(),
        None => return Ok(None),
    };

    if let Ok(a) = npz.by_name::<_, ndarray::IxDyn>(&entry) {
        return Ok(Some(DynTensor::Float32(a)));
    }
    if let Ok(a) = npz.by_name::<_, ndarray::IxDyn>(&entry) {
        return Ok(Some(DynTensor::Float64(a)));
    }
    if let Ok(a) = npz.by_name::<_, ndarray::IxDyn>(&entry) {
        return Ok(Some(DynTensor::Int64(a)));
    }
    if let Ok(a) = npz.by_name::<_, ndarray::IxDyn>(&entry) {
        return Ok(Some(DynTensor::Int32(a)));
    }
    let a = npz
        .by_name::<_, ndarray::IxDyn>(&entry)
        .with_context(|| format!("`{}` has an unsupported element type", name))?;
    Ok(Some(DynTensor::Bool(a)))
}
