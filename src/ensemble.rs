//! Blending of an externally supplied probability set into the scoreline model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::markets::{MarketProbs, ProbKey};

pub const DEFAULT_ENSEMBLE_WEIGHT: f64 = 0.35;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensemble_weight: Option<f64>,
}

impl WeightEntry {
    /// First finite value among `best_weight`, `weight`, `ensemble_weight`.
    pub fn value(&self) -> Option<f64> {
        [self.best_weight, self.weight, self.ensemble_weight]
            .into_iter()
            .flatten()
            .find(|w| w.is_finite())
    }
}

/// Fitted ensemble weights, global and keyed by league code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnsembleWeights {
    #[serde(flatten)]
    pub global: WeightEntry,
    #[serde(default)]
    pub by_league: BTreeMap<String, WeightEntry>,
}

impl EnsembleWeights {
    /// League entry, then the global entry, then `default`.
    pub fn weight_for(&self, league: Option<&str>, default: f64) -> f64 {
        league
            .and_then(|l| self.by_league.get(l))
            .and_then(WeightEntry::value)
            .or_else(|| self.global.value())
            .unwrap_or(default)
    }
}

/// `(1 - w) * base + w * extra` per supplied key, then every group renormalized.
///
/// `weight` is clamped to [0, 1]; non-finite or negative extra values are skipped.
pub fn blend_probs(base: &MarketProbs, extra: &BTreeMap<ProbKey, f64>, weight: f64) -> MarketProbs {
    let w = if weight.is_finite() { weight.clamp(0.0, 1.0) } else { 0.0 };
    let mut out = *base;
    for (key, p) in extra {
        if !p.is_finite() || *p < 0.0 {
            continue;
        }
        out.set(*key, (1.0 - w) * base.get(*key) + w * p);
    }
    out.renormalize();
    out
}
