// src/fusion/weights.rs
// Declarative fusion weights, renormalization, and per-source score scaling

use crate::evidence::SourceKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Static weight per source kind. Values need not sum to 1; only the
/// renormalized weights over succeeding sources are used for blending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightTable {
    pub case: f64,
    pub code: f64,
    pub pattern: f64,
    pub trace: f64,
    pub config: f64,
}

impl Default for WeightTable {
    fn default() -> Self {
        Self {
            case: 0.35,
            code: 0.25,
            pattern: 0.15,
            trace: 0.10,
            config: 0.10,
        }
    }
}

impl WeightTable {
    pub fn weight(&self, kind: SourceKind) -> f64 {
        match kind {
            SourceKind::Case => self.case,
            SourceKind::Code => self.code,
            SourceKind::Pattern => self.pattern,
            SourceKind::Trace => self.trace,
            SourceKind::Config => self.config,
        }
    }

    /// Weights over the sources that succeeded, scaled proportionally so they
    /// sum to 1.0. If every surviving weight is zero the survivors share
    /// uniformly. Negative weights count as zero.
    pub fn renormalize(&self, available: &[SourceKind]) -> BTreeMap<SourceKind, f64> {
        let mut kinds: Vec<SourceKind> = available.to_vec();
        kinds.sort();
        kinds.dedup();
        if kinds.is_empty() {
            return BTreeMap::new();
        }

        let total: f64 = kinds.iter().map(|k| self.weight(*k).max(0.0)).sum();
        if total <= f64::EPSILON {
            let share = 1.0 / kinds.len() as f64;
            return kinds.into_iter().map(|k| (k, share)).collect();
        }
        kinds
            .into_iter()
            .map(|k| (k, self.weight(k).max(0.0) / total))
            .collect()
    }
}

/// Scale one source's raw scores into [0,1] by dividing by the source's
/// maximum. Order is preserved, so the ranking inside the source survives.
pub fn normalize_within_source(raw: &[f64]) -> Vec<f64> {
    let max = raw
        .iter()
        .copied()
        .filter(|s| s.is_finite())
        .fold(0.0_f64, f64::max);
    if max <= 0.0 {
        return vec![0.0; raw.len()];
    }
    raw.iter()
        .map(|s| if s.is_finite() { (s / max).clamp(0.0, 1.0) } else { 0.0 })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_default_weights() {
        let w = WeightTable::default();
        assert_eq!(w.weight(SourceKind::Case), 0.35);
        assert_eq!(w.weight(SourceKind::Code), 0.25);
        assert_eq!(w.weight(SourceKind::Pattern), 0.15);
        assert_eq!(w.weight(SourceKind::Trace), 0.10);
        assert_eq!(w.weight(SourceKind::Config), 0.10);
    }

    #[test]
    fn test_renormalized_weights_sum_to_one_for_every_subset() {
        let all: Vec<SourceKind> = SourceKind::iter().collect();
        let table = WeightTable::default();
        for mask in 1u32..(1 << all.len()) {
            let subset: Vec<SourceKind> = all
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, k)| *k)
                .collect();
            let weights = table.renormalize(&subset);
            assert_eq!(weights.len(), subset.len());
            let sum: f64 = weights.values().sum();
            assert!((sum - 1.0).abs() < EPS, "subset {:?} sums to {}", subset, sum);
        }
    }

    #[test]
    fn test_renormalization_is_proportional() {
        let weights = WeightTable::default().renormalize(&[SourceKind::Case, SourceKind::Code]);
        assert!((weights[&SourceKind::Case] - 0.35 / 0.60).abs() < EPS);
        assert!((weights[&SourceKind::Code] - 0.25 / 0.60).abs() < EPS);
    }

    #[test]
    fn test_zero_weights_fall_back_to_uniform() {
        let table = WeightTable {
            case: 0.0,
            code: 0.0,
            pattern: 0.0,
            trace: 0.0,
            config: 0.0,
        };
        let weights = table.renormalize(&[SourceKind::Case, SourceKind::Trace]);
        assert!((weights[&SourceKind::Case] - 0.5).abs() < EPS);
        assert!((weights[&SourceKind::Trace] - 0.5).abs() < EPS);
    }

    #[test]
    fn test_negative_weight_counts_as_zero() {
        let table = WeightTable {
            case: -1.0,
            ..Default::default()
        };
        let weights = table.renormalize(&[SourceKind::Case, SourceKind::Code]);
        assert_eq!(weights[&SourceKind::Case], 0.0);
        assert!((weights[&SourceKind::Code] - 1.0).abs() < EPS);
    }

    #[test]
    fn test_no_sources_no_weights() {
        assert!(WeightTable::default().renormalize(&[]).is_empty());
    }

    #[test]
    fn test_duplicate_kinds_are_collapsed() {
        let weights = WeightTable::default().renormalize(&[SourceKind::Code, SourceKind::Code]);
        assert_eq!(weights.len(), 1);
        assert!((weights[&SourceKind::Code] - 1.0).abs() < EPS);
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let table: WeightTable = toml::from_str("case = 0.5").unwrap();
        assert_eq!(table.case, 0.5);
        assert_eq!(table.code, 0.25);
    }

    #[test]
    fn test_normalize_within_source() {
        let scaled = normalize_within_source(&[0.2, 0.4, 0.1]);
        assert!((scaled[0] - 0.5).abs() < EPS);
        assert!((scaled[1] - 1.0).abs() < EPS);
        assert!((scaled[2] - 0.25).abs() < EPS);
    }

    #[test]
    fn test_normalize_all_zero_and_non_finite() {
        assert_eq!(normalize_within_source(&[0.0, 0.0]), vec![0.0, 0.0]);
        assert_eq!(normalize_within_source(&[f64::NAN, 0.5]), vec![0.0, 1.0]);
        assert!(normalize_within_source(&[]).is_empty());
    }
}
