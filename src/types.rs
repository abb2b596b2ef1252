//! Core types for shardeval

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Error, Result};

/// Position of an item in the global index space
pub type ItemIndex = usize;

/// One detected bounding box with its confidence
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
}

impl Detection {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            score,
        }
    }
}

/// All detections produced for a single image
pub type ItemDetections = Vec<Detection>;

/// Element storage for an [`Array`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ArrayData {
    Float(Vec<f32>),
    Int(Vec<i64>),
}

impl ArrayData {
    pub fn len(&self) -> usize {
        match self {
            ArrayData::Float(values) => values.len(),
            ArrayData::Int(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> &'static str {
        match self {
            ArrayData::Float(_) => "float",
            ArrayData::Int(_) => "int",
        }
    }
}

/// Dense row-major array holding one item's value for a feature stream
///
/// Rows line up with the item's detections, so a probability stream for an
/// image with 3 boxes over 500 identities has shape `[3, 500]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Array {
    pub shape: Vec<usize>,
    pub data: ArrayData,
}

impl Array {
    pub fn new(shape: Vec<usize>, data: ArrayData) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::InvalidArray(format!(
                "shape {:?} expects {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn float(shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        Self::new(shape, ArrayData::Float(values))
    }

    pub fn int(shape: Vec<usize>, values: Vec<i64>) -> Result<Self> {
        Self::new(shape, ArrayData::Int(values))
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of rows (the leading dimension)
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Elements per row
    pub fn row_width(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    pub fn as_float(&self) -> Option<&[f32]> {
        match &self.data {
            ArrayData::Float(values) => Some(values),
            ArrayData::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<&[i64]> {
        match &self.data {
            ArrayData::Int(values) => Some(values),
            ArrayData::Float(_) => None,
        }
    }
}

/// Named feature streams, each holding one [`Array`] per item
///
/// Ordered by name so that every worker walks the streams in the same order.
pub type FeatureSet = BTreeMap<String, Vec<Array>>;

/// A dataset entry handed to the detector
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetItem {
    pub index: ItemIndex,
    pub id: String,
    pub path: std::path::PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_shape_validation() {
        let array = Array::float(vec![2, 3], vec![0.0; 6]).unwrap();
        assert_eq!(array.rows(), 2);
        assert_eq!(array.row_width(), 3);
        assert_eq!(array.ndim(), 2);

        let err = Array::int(vec![2, 2], vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::InvalidArray(_)));
    }

    #[test]
    fn test_empty_rows() {
        let array = Array::float(vec![0, 5], vec![]).unwrap();
        assert_eq!(array.rows(), 0);
        assert_eq!(array.row_width(), 5);
        assert!(array.data.is_empty());
    }

    #[test]
    fn test_array_accessors() {
        let labels = Array::int(vec![2], vec![4, -1]).unwrap();
        assert_eq!(labels.as_int(), Some(&[4, -1][..]));
        assert!(labels.as_float().is_none());
        assert_eq!(labels.data.dtype(), "int");
    }
}
