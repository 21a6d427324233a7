use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::calibration_fit::{self, Outcome};
use crate::scoreline::{DEFAULT_GOAL_CAP, GoalRates, match_probs};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeagueDcParams {
    // Dixon-Coles rho (typically negative to increase low-score draws).
    #[serde(default)]
    pub rho: Option<f64>,
    #[serde(default)]
    pub sample_matches: usize,
}

/// Dixon-Coles parameters, either global (`rho`) or keyed by league code.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DcParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rho: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_league: Option<BTreeMap<String, LeagueDcParams>>,
}

impl DcParams {
    /// Rho for the league; 0 whenever nothing usable is recorded.
    pub fn rho_for(&self, league: Option<&str>) -> f64 {
        let rho = match (&self.by_league, league) {
            (Some(by_league), Some(league)) => by_league.get(league).and_then(|p| p.rho),
            _ => self.rho,
        };
        rho.filter(|r| r.is_finite()).unwrap_or(0.0)
    }

    pub fn insert(&mut self, league: &str, rho: f64, sample_matches: usize) {
        self.by_league.get_or_insert_with(BTreeMap::new).insert(
            league.to_string(),
            LeagueDcParams {
                rho: Some(rho),
                sample_matches,
            },
        );
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read dc params {}", path.display()))?;
        let params = serde_json::from_str::<Self>(&raw)
            .with_context(|| format!("parse dc params {}", path.display()))?;
        Ok(Some(params))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(self).context("serialize dc params")?;
        fs::write(&tmp, json).context("write dc params")?;
        fs::rename(&tmp, path).context("swap dc params")?;
        Ok(())
    }
}

/// Grid-searches rho in [-0.25, 0.05] for the lowest 1X2 Brier score.
pub fn fit_rho(matches: &[(f64, f64, Outcome)]) -> f64 {
    const FALLBACK_RHO: f64 = -0.10;
    if matches.is_empty() {
        return FALLBACK_RHO;
    }
    let outcomes: Vec<Outcome> = matches.iter().map(|(_, _, o)| *o).collect();

    (-25..=5)
        .into_par_iter()
        .map(|step| {
            let rho = step as f64 / 100.0;
            let preds: Vec<_> = matches
                .iter()
                .map(|(lh, la, _)| match_probs(GoalRates::new(*lh, *la, rho), DEFAULT_GOAL_CAP))
                .collect();
            (rho, calibration_fit::evaluate_1x2(&preds, &outcomes).brier)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.total_cmp(&b.0)))
        .map(|(rho, _)| rho)
        .unwrap_or(FALLBACK_RHO)
}
