//! Size reduction for probability streams
//!
//! A probability stream carries one score per identity for every detection,
//! which is far too large to ship across the gather. Before aggregation each
//! declared stream is replaced by the indices of its top-K scores.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::types::{Array, FeatureSet};
use crate::{Error, Result};

/// Default number of ranked indices kept per row
pub const DEFAULT_RANK_CAP: usize = 100;

/// Declares that `source` is a probability stream to be ranked into `target`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionRule {
    pub source: String,
    pub target: String,
    pub cap: usize,
}

impl ReductionRule {
    pub fn new(source: impl Into<String>, target: impl Into<String>, cap: usize) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            cap,
        }
    }

    /// Identity probabilities ranked into identity indices
    pub fn identity_ranks() -> Self {
        Self::new("pid_prob", "pid_rank", DEFAULT_RANK_CAP)
    }
}

/// Set of reduction rules applied to a worker's feature streams
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReductionPolicy {
    rules: Vec<ReductionRule>,
}

impl ReductionPolicy {
    pub fn new(rules: Vec<ReductionRule>) -> Result<Self> {
        let mut sources = HashSet::new();
        let mut targets = HashSet::new();

        for rule in &rules {
            if rule.cap == 0 {
                return Err(Error::config(format!(
                    "reduction rule '{}' has a zero cap",
                    rule.source
                )));
            }
            if rule.source == rule.target {
                return Err(Error::config(format!(
                    "reduction rule '{}' must rename its stream",
                    rule.source
                )));
            }
            if !sources.insert(rule.source.as_str()) {
                return Err(Error::config(format!(
                    "duplicate reduction source '{}'",
                    rule.source
                )));
            }
            if !targets.insert(rule.target.as_str()) {
                return Err(Error::config(format!(
                    "duplicate reduction target '{}'",
                    rule.target
                )));
            }
        }

        if let Some(chained) = rules.iter().find(|r| sources.contains(r.target.as_str())) {
            return Err(Error::config(format!(
                "reduction target '{}' is also a reduction source",
                chained.target
            )));
        }

        Ok(Self { rules })
    }

    /// Policy that leaves every stream untouched
    pub fn none() -> Self {
        Self::default()
    }

    pub fn rules(&self) -> &[ReductionRule] {
        &self.rules
    }

    pub fn rule_for(&self, source: &str) -> Option<&ReductionRule> {
        self.rules.iter().find(|r| r.source == source)
    }

    /// Stream names present after reducing a worker that produced `requested`
    pub fn output_streams(&self, requested: &[String]) -> Vec<String> {
        requested
            .iter()
            .map(|name| match self.rule_for(name) {
                Some(rule) => rule.target.clone(),
                None => name.clone(),
            })
            .collect()
    }

    /// Replace every declared source stream with its ranked form
    pub fn apply(&self, features: &mut FeatureSet) -> Result<()> {
        for rule in &self.rules {
            let Some(stream) = features.remove(&rule.source) else {
                continue;
            };
            if features.contains_key(&rule.target) {
                return Err(Error::config(format!(
                    "stream '{}' already present; cannot reduce '{}' into it",
                    rule.target, rule.source
                )));
            }

            let reduced = stream
                .iter()
                .map(|matrix| top_k_ranks(matrix, rule.cap))
                .collect::<Result<Vec<_>>>()?;

            tracing::debug!(
                source = %rule.source,
                target = %rule.target,
                cap = rule.cap,
                items = reduced.len(),
                "Reduced probability stream"
            );
            features.insert(rule.target.clone(), reduced);
        }
        Ok(())
    }
}

/// Indices of the `k` largest values of `row`, largest first
///
/// Equal values keep ascending index order.
pub fn rank_indices(row: &[f32], k: usize) -> Vec<usize> {
    let k = k.min(row.len());
    if k == 0 {
        return Vec::new();
    }

    let by_score = |a: &usize, b: &usize| -> Ordering {
        row[*b].total_cmp(&row[*a]).then_with(|| a.cmp(b))
    };

    let mut indices: Vec<usize> = (0..row.len()).collect();
    if k < indices.len() {
        indices.select_nth_unstable_by(k - 1, by_score);
        indices.truncate(k);
    }
    indices.sort_unstable_by(by_score);
    indices
}

/// Rank each row of a `[rows, width]` probability matrix
///
/// Produces an integer array of shape `[rows, min(cap, width)]`.
pub fn top_k_ranks(matrix: &Array, cap: usize) -> Result<Array> {
    if matrix.ndim() != 2 {
        return Err(Error::InvalidArray(format!(
            "probability matrix must be 2-D, got shape {:?}",
            matrix.shape
        )));
    }
    let values = matrix.as_float().ok_or_else(|| {
        Error::InvalidArray(format!(
            "probability matrix must hold float values, got {}",
            matrix.data.dtype()
        ))
    })?;

    let rows = matrix.rows();
    let width = matrix.row_width();
    let k = cap.min(width);

    let mut ranks = Vec::with_capacity(rows * k);
    if width > 0 {
        for row in values.chunks_exact(width) {
            ranks.extend(rank_indices(row, k).into_iter().map(|i| i as i64));
        }
    }

    Array::int(vec![rows, k], ranks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ArrayData;

    fn probs(rows: usize, width: usize, values: Vec<f32>) -> Array {
        Array::float(vec![rows, width], values).unwrap()
    }

    #[test]
    fn test_top_k_with_ties() {
        let matrix = probs(
            2,
            5,
            vec![0.1, 0.9, 0.2, 0.05, 0.15, 0.3, 0.3, 0.3, 0.1, 0.1],
        );

        let ranks = top_k_ranks(&matrix, 3).unwrap();
        assert_eq!(ranks.shape, vec![2, 3]);
        // 0.15 at index 4 outranks 0.1 at index 0; the tied row keeps index order
        assert_eq!(ranks.as_int().unwrap(), &[1, 2, 4, 0, 1, 2]);
    }

    #[test]
    fn test_cap_larger_than_width() {
        let matrix = probs(1, 3, vec![0.2, 0.5, 0.3]);
        let ranks = top_k_ranks(&matrix, DEFAULT_RANK_CAP).unwrap();
        assert_eq!(ranks.shape, vec![1, 3]);
        assert_eq!(ranks.as_int().unwrap(), &[1, 2, 0]);
    }

    #[test]
    fn test_rank_indices_matches_full_sort() {
        let row: Vec<f32> = (0..200).map(|i| ((i * 37) % 17) as f32).collect();

        let mut expected: Vec<usize> = (0..row.len()).collect();
        expected.sort_by(|a, b| row[*b].total_cmp(&row[*a]));

        for k in [1, 5, 17, 100, 200] {
            assert_eq!(rank_indices(&row, k), expected[..k].to_vec(), "k = {}", k);
        }
    }

    #[test]
    fn test_image_without_detections() {
        let matrix = probs(0, 10, vec![]);
        let ranks = top_k_ranks(&matrix, 3).unwrap();
        assert_eq!(ranks.shape, vec![0, 3]);
        assert!(ranks.data.is_empty());
    }

    #[test]
    fn test_rejects_non_matrix_input() {
        let vector = Array::float(vec![4], vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        assert!(top_k_ranks(&vector, 2).is_err());

        let ints = Array::int(vec![1, 2], vec![1, 2]).unwrap();
        let err = top_k_ranks(&ints, 2).unwrap_err();
        assert!(err.to_string().contains("got int"));
    }

    #[test]
    fn test_apply_renames_and_drops_source() {
        let policy = ReductionPolicy::new(vec![ReductionRule::identity_ranks()]).unwrap();

        let mut features = FeatureSet::new();
        features.insert(
            "pid_prob".to_string(),
            vec![probs(1, 4, vec![0.1, 0.4, 0.3, 0.2])],
        );
        features.insert(
            "pid_label".to_string(),
            vec![Array::int(vec![1], vec![7]).unwrap()],
        );

        policy.apply(&mut features).unwrap();

        assert!(!features.contains_key("pid_prob"));
        assert!(features.contains_key("pid_label"));
        let ranks = &features["pid_rank"][0];
        assert_eq!(ranks.data, ArrayData::Int(vec![1, 2, 3, 0]));
    }

    #[test]
    fn test_apply_skips_absent_source() {
        let policy = ReductionPolicy::new(vec![ReductionRule::identity_ranks()]).unwrap();
        let mut features = FeatureSet::new();
        features.insert("feat".to_string(), vec![]);

        policy.apply(&mut features).unwrap();
        assert_eq!(features.keys().collect::<Vec<_>>(), vec!["feat"]);
    }

    #[test]
    fn test_apply_refuses_to_overwrite_target() {
        let policy = ReductionPolicy::new(vec![ReductionRule::identity_ranks()]).unwrap();
        let mut features = FeatureSet::new();
        features.insert("pid_prob".to_string(), vec![]);
        features.insert("pid_rank".to_string(), vec![]);

        assert!(policy.apply(&mut features).is_err());
    }

    #[test]
    fn test_policy_validation() {
        assert!(ReductionPolicy::new(vec![ReductionRule::new("a", "b", 0)]).is_err());
        assert!(ReductionPolicy::new(vec![ReductionRule::new("a", "a", 5)]).is_err());
        assert!(ReductionPolicy::new(vec![
            ReductionRule::new("a", "b", 5),
            ReductionRule::new("a", "c", 5),
        ])
        .is_err());
        assert!(ReductionPolicy::new(vec![
            ReductionRule::new("a", "b", 5),
            ReductionRule::new("b", "c", 5),
        ])
        .is_err());
    }

    #[test]
    fn test_output_streams() {
        let policy = ReductionPolicy::new(vec![ReductionRule::identity_ranks()]).unwrap();
        let requested = vec![
            "feat".to_string(),
            "pid_label".to_string(),
            "pid_prob".to_string(),
        ];
        assert_eq!(
            policy.output_streams(&requested),
            vec!["feat", "pid_label", "pid_rank"]
        );
        assert_eq!(ReductionPolicy::none().output_streams(&requested), requested);
    }
}
