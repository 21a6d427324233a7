use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, ensure};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::calibration::{
    self, CalibrationPayload, CalibrationPolicy, TableSource, TemperatureScales,
};
use crate::config::Settings;
use crate::engine::{self, Evaluation};
use crate::ensemble::{self, EnsembleWeights};
use crate::league_params::DcParams;
use crate::markets::{MarketProbs, ProbKey};
use crate::odds::{self, MarketBook, OddsQuote};
use crate::rules::{self, BettingGate, MarketRules};
use crate::scoreline::{DEFAULT_GOAL_CAP, GoalRates, ScorelineCell, ScorelineGrid};
use crate::simulation::{self, Intervals};
use crate::snapshot::{SnapshotCache, SnapshotError};

const TOP_SCORELINES: usize = 12;

/// Per-match inputs produced by the feature pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchInput {
    pub match_id: String,
    #[serde(default)]
    pub league: Option<String>,
    #[serde(default)]
    pub season: Option<String>,
    #[serde(default)]
    pub kickoff_utc: Option<DateTime<Utc>>,
    pub lambda_home: f64,
    pub lambda_away: f64,
    /// Probabilities from a second model, blended in with the league's ensemble weight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_probs: Option<BTreeMap<ProbKey, f64>>,
}

/// Read-only model artifacts for one or more evaluation calls.
#[derive(Debug, Clone)]
pub struct ModelSnapshot {
    pub calibration: Option<Arc<CalibrationPayload>>,
    pub policy: Option<Arc<CalibrationPolicy>>,
    pub temperatures: Option<Arc<TemperatureScales>>,
    pub dc_params: Option<Arc<DcParams>>,
    pub ensemble_weights: Option<Arc<EnsembleWeights>>,
    pub ensemble_weight: f64,
    pub betting_gate: BettingGate,
    pub sim_n: usize,
    pub sim_seed: u64,
}

impl Default for ModelSnapshot {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            calibration: None,
            policy: None,
            temperatures: None,
            dc_params: None,
            ensemble_weights: None,
            ensemble_weight: settings.ensemble_weight,
            betting_gate: BettingGate::missing(),
            sim_n: settings.sim_n,
            sim_seed: settings.sim_seed,
        }
    }
}

/// Owns the file caches behind a [`ModelSnapshot`]; refresh by calling `snapshot` again.
#[derive(Debug)]
pub struct ModelSources {
    calibration_by_season: SnapshotCache<CalibrationPayload>,
    calibration: SnapshotCache<CalibrationPayload>,
    policy: SnapshotCache<CalibrationPolicy>,
    temperatures: SnapshotCache<TemperatureScales>,
    dc_params: SnapshotCache<DcParams>,
    ensemble_weights: SnapshotCache<EnsembleWeights>,
    ensemble_weight: f64,
    market_rules_path: PathBuf,
    betting_gate_path: PathBuf,
    sim_n: usize,
    sim_seed: u64,
}

impl ModelSources {
    pub fn new(settings: &Settings) -> Self {
        Self {
            calibration_by_season: SnapshotCache::new(&settings.calibration_by_season_path),
            calibration: SnapshotCache::new(&settings.calibration_path),
            policy: SnapshotCache::new(&settings.calibration_policy_path),
            temperatures: SnapshotCache::new(&settings.temp_scale_path),
            dc_params: SnapshotCache::new(&settings.dc_params_path),
            ensemble_weights: SnapshotCache::new(&settings.ensemble_weights_path),
            ensemble_weight: settings.ensemble_weight,
            market_rules_path: settings.market_rules_path.clone(),
            betting_gate_path: settings.betting_gate_path.clone(),
            sim_n: settings.sim_n,
            sim_seed: settings.sim_seed,
        }
    }

    /// Unreadable artifacts are logged and treated as absent.
    pub fn snapshot(&mut self) -> ModelSnapshot {
        let calibration = or_absent(self.calibration_by_season.get())
            .or_else(|| or_absent(self.calibration.get()));
        ModelSnapshot {
            calibration,
            policy: or_absent(self.policy.get()),
            temperatures: or_absent(self.temperatures.get()),
            dc_params: or_absent(self.dc_params.get()),
            ensemble_weights: or_absent(self.ensemble_weights.get()),
            ensemble_weight: self.ensemble_weight,
            betting_gate: BettingGate::load(&self.betting_gate_path),
            sim_n: self.sim_n,
            sim_seed: self.sim_seed,
        }
    }

    pub fn market_rules(&self, overrides: Option<&Map<String, Value>>) -> MarketRules {
        rules::load_market_rules(Some(self.market_rules_path.as_path()), overrides)
    }
}

fn or_absent<T>(loaded: Result<Option<Arc<T>>, SnapshotError>) -> Option<Arc<T>> {
    loaded.unwrap_or_else(|err| {
        warn!(%err, "model artifact ignored");
        None
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    pub rho: f64,
    /// `ensemble` when external probabilities were blended in, else `dc_poisson`.
    pub prob_source: &'static str,
    pub ensemble_weight: Option<f64>,
    pub calibration_applied: bool,
    pub calibration_version: Option<String>,
    pub calibration_source: Option<String>,
    pub calibrate_1x2: bool,
    pub temp_scale_1x2: Option<f64>,
    pub mc_home_win: f64,
    pub convergence_delta: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub match_id: String,
    pub rates: GoalRates,
    pub raw_probs: MarketProbs,
    pub probs: MarketProbs,
    pub intervals: Intervals,
    pub scoreline_topk: Vec<ScorelineCell>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchReport {
    pub prediction: Prediction,
    pub evaluation: Evaluation,
    /// De-margined bookmaker consensus, for comparison only.
    pub market_implied: Option<MarketProbs>,
    /// Reported alongside the evaluation; it never changes the picks.
    pub betting_gate: BettingGate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlateEntry {
    #[serde(rename = "match")]
    pub input: MatchInput,
    #[serde(default)]
    pub odds: Vec<OddsQuote>,
}

#[derive(Debug, Clone)]
pub struct Predictor {
    snapshot: ModelSnapshot,
}

impl Predictor {
    pub fn new(snapshot: ModelSnapshot) -> Self {
        Self { snapshot }
    }

    pub fn snapshot(&self) -> &ModelSnapshot {
        &self.snapshot
    }

    /// Scoreline model, then ensemble blend, then 1X2 temperature, then calibration;
    /// intervals come from simulation.
    pub fn predict(&self, input: &MatchInput) -> Result<Prediction> {
        let (lh, la) = (input.lambda_home, input.lambda_away);
        ensure!(
            lh.is_finite() && la.is_finite() && lh > 0.0 && la > 0.0,
            "match {}: goal rates must be positive (home={lh}, away={la})",
            input.match_id
        );
        let league = input.league.as_deref();

        let rho = self
            .snapshot
            .dc_params
            .as_ref()
            .map(|p| p.rho_for(league))
            .unwrap_or(0.0);
        let rates = GoalRates::new(lh, la, rho);
        let grid = ScorelineGrid::new(rates, DEFAULT_GOAL_CAP);
        let raw_probs = grid.market_probs();

        let ensemble_weight = input
            .external_probs
            .as_ref()
            .filter(|extra| !extra.is_empty())
            .map(|extra| {
                let w = self
                    .snapshot
                    .ensemble_weights
                    .as_ref()
                    .map(|weights| weights.weight_for(league, self.snapshot.ensemble_weight))
                    .unwrap_or(self.snapshot.ensemble_weight)
                    .clamp(0.0, 1.0);
                (extra, w)
            });
        let blended = match ensemble_weight {
            Some((extra, w)) => ensemble::blend_probs(&raw_probs, extra, w),
            None => raw_probs,
        };

        let temp_scale_1x2 = self
            .snapshot
            .temperatures
            .as_ref()
            .and_then(|t| t.for_league(league));
        let mut probs = match temp_scale_1x2 {
            Some(temp) => calibration::apply_temperature_1x2(&blended, temp),
            None => blended,
        };

        let calibrate_1x2 = self
            .snapshot
            .policy
            .as_ref()
            .map(|p| p.calibrate_1x2(league, true))
            .unwrap_or(true);
        let selected = self.snapshot.calibration.as_ref().and_then(|payload| {
            calibration::select_table(payload, league, input.season.as_deref(), input.kickoff_utc)
        });
        let mut calibration_version = None;
        let mut calibration_source = None;
        if let Some(selected) = &selected {
            probs = calibration::calibrate(&probs, selected.table, calibrate_1x2);
            calibration_version = selected.table.version.clone().or_else(|| {
                self.snapshot
                    .calibration
                    .as_ref()
                    .and_then(|c| c.table.version.clone())
            });
            calibration_source = Some(source_label(selected.source));
        }

        let sim = simulation::simulate(lh, la, self.snapshot.sim_n, self.snapshot.sim_seed)?;
        let intervals = simulation::intervals_for(&probs, sim.n_sims);

        Ok(Prediction {
            match_id: input.match_id.clone(),
            rates,
            raw_probs,
            probs,
            intervals,
            scoreline_topk: grid.top_k(TOP_SCORELINES),
            diagnostics: Diagnostics {
                rho,
                prob_source: if ensemble_weight.is_some() { "ensemble" } else { "dc_poisson" },
                ensemble_weight: ensemble_weight.map(|(_, w)| w),
                calibration_applied: selected.is_some(),
                calibration_version,
                calibration_source,
                calibrate_1x2,
                temp_scale_1x2,
                mc_home_win: sim.probs.home_win,
                convergence_delta: sim.convergence_delta,
            },
        })
    }

    pub fn evaluate(
        &self,
        input: &MatchInput,
        quotes: &[OddsQuote],
        bankroll: f64,
        rules: &MarketRules,
        now: DateTime<Utc>,
    ) -> Result<MatchReport> {
        let prediction = self.predict(input)?;
        let (fresh, _) = odds::fresh_quotes(quotes, now, rules.max_odds_age_hours);
        let market_implied = MarketBook::from_quotes(fresh).implied_probs();
        let evaluation = engine::evaluate_markets(
            &prediction.probs,
            &prediction.intervals,
            quotes,
            bankroll,
            rules,
            now,
        );
        info!(
            match_id = %input.match_id,
            quotes = quotes.len(),
            picks = evaluation.recommendations.len(),
            gate_enabled = self.snapshot.betting_gate.enabled,
            "match evaluated"
        );
        Ok(MatchReport {
            prediction,
            evaluation,
            market_implied,
            betting_gate: self.snapshot.betting_gate.clone(),
        })
    }
}

/// Evaluates independent matches in parallel; output order follows `entries`.
pub fn evaluate_slate(
    predictor: &Predictor,
    entries: &[SlateEntry],
    bankroll: f64,
    rules: &MarketRules,
    now: DateTime<Utc>,
) -> Vec<(String, Result<MatchReport>)> {
    entries
        .par_iter()
        .map(|entry| {
            let report = predictor.evaluate(&entry.input, &entry.odds, bankroll, rules, now);
            (entry.input.match_id.clone(), report)
        })
        .collect()
}

fn source_label(source: TableSource) -> String {
    match source {
        TableSource::SeasonPhase(phase) => format!("season:{}", phase.as_str()),
        TableSource::SeasonFull => "season:full".to_string(),
        TableSource::SeasonDefault => "season:default".to_string(),
        TableSource::PayloadDefault => "default".to_string(),
        TableSource::Payload => "payload".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::calibration::{CalibrationBin, CalibrationTable, TemperatureEntry};
    use crate::scoreline::match_probs;

    fn input(league: Option<&str>) -> MatchInput {
        MatchInput {
            match_id: "m1".to_string(),
            league: league.map(str::to_string),
            season: Some("2024-2025".to_string()),
            kickoff_utc: Some(Utc.with_ymd_and_hms(2024, 9, 14, 15, 0, 0).unwrap()),
            lambda_home: 1.6,
            lambda_away: 1.1,
            external_probs: None,
        }
    }

    #[test]
    fn bare_snapshot_is_the_raw_scoreline_model() {
        let predictor = Predictor::new(ModelSnapshot::default());
        let out = predictor.predict(&input(None)).unwrap();
        let expected = match_probs(GoalRates::independent(1.6, 1.1), DEFAULT_GOAL_CAP);
        assert_eq!(out.probs, expected);
        assert_eq!(out.diagnostics.rho, 0.0);
        assert!(!out.diagnostics.calibration_applied);
        assert_eq!(out.intervals.len(), 7);
        assert_eq!(out.scoreline_topk.len(), TOP_SCORELINES);
        assert!((out.diagnostics.mc_home_win - out.probs.home_win).abs() < 0.02);
    }

    #[test]
    fn league_rho_and_temperature_are_applied() {
        let mut dc = DcParams::default();
        dc.insert("EPL", -0.08, 380);
        let mut temps = TemperatureScales::default();
        temps.by_league.insert(
            "EPL".to_string(),
            TemperatureEntry {
                enabled: true,
                temp: Some(0.8),
            },
        );
        let predictor = Predictor::new(ModelSnapshot {
            dc_params: Some(Arc::new(dc)),
            temperatures: Some(Arc::new(temps)),
            ..ModelSnapshot::default()
        });

        let out = predictor.predict(&input(Some("EPL"))).unwrap();
        assert_eq!(out.diagnostics.rho, -0.08);
        assert_eq!(out.diagnostics.temp_scale_1x2, Some(0.8));
        // Sharpening moves mass toward the favourite.
        assert!(out.probs.home_win > out.raw_probs.home_win);
        let sum = out.probs.home_win + out.probs.draw + out.probs.away_win;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn calibration_table_is_reported_in_diagnostics() {
        let mut markets = BTreeMap::new();
        markets.insert(
            "over_2_5".to_string(),
            vec![CalibrationBin {
                min: 0.0,
                max: 1.0,
                p: 0.4,
                count: 100,
            }],
        );
        let payload = CalibrationPayload {
            table: CalibrationTable {
                version: Some("v1".to_string()),
                markets,
            },
            ..CalibrationPayload::default()
        };
        let predictor = Predictor::new(ModelSnapshot {
            calibration: Some(Arc::new(payload)),
            ..ModelSnapshot::default()
        });

        let out = predictor.predict(&input(None)).unwrap();
        assert!(out.diagnostics.calibration_applied);
        assert_eq!(out.diagnostics.calibration_version.as_deref(), Some("v1"));
        assert_eq!(out.diagnostics.calibration_source.as_deref(), Some("payload"));
        assert!((out.probs.over_2_5 + out.probs.under_2_5 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn external_probs_are_blended_with_the_league_weight() {
        let weights: EnsembleWeights =
            serde_json::from_str(r#"{"by_league": {"EPL": {"best_weight": 0.5}}}"#).unwrap();
        let predictor = Predictor::new(ModelSnapshot {
            ensemble_weights: Some(Arc::new(weights)),
            ..ModelSnapshot::default()
        });
        let extra = BTreeMap::from([
            (ProbKey::HomeWin, 0.7),
            (ProbKey::Draw, 0.2),
            (ProbKey::AwayWin, 0.1),
        ]);
        let blended = MatchInput {
            external_probs: Some(extra),
            ..input(Some("EPL"))
        };

        let out = predictor.predict(&blended).unwrap();
        assert_eq!(out.diagnostics.prob_source, "ensemble");
        assert_eq!(out.diagnostics.ensemble_weight, Some(0.5));
        let raw = out.raw_probs;
        let sum = 0.5 * (raw.home_win + raw.draw + raw.away_win) + 0.5;
        assert!((out.probs.home_win - (0.5 * raw.home_win + 0.35) / sum).abs() < 1e-9);
        assert!((out.probs.over_2_5 - raw.over_2_5).abs() < 1e-9);

        // Unknown league falls back to the configured default weight.
        let other = predictor
            .predict(&MatchInput {
                league: Some("SA".to_string()),
                ..blended.clone()
            })
            .unwrap();
        assert_eq!(other.diagnostics.ensemble_weight, Some(0.35));

        let plain = predictor.predict(&input(Some("EPL"))).unwrap();
        assert_eq!(plain.diagnostics.prob_source, "dc_poisson");
        assert_eq!(plain.diagnostics.ensemble_weight, None);
        assert_eq!(plain.probs, plain.raw_probs);
    }

    #[test]
    fn report_carries_consensus_implied_probs() {
        let predictor = Predictor::new(ModelSnapshot::default());
        let now = Utc.with_ymd_and_hms(2024, 9, 14, 12, 0, 0).unwrap();
        let quotes = vec![
            OddsQuote::new("bk", "1X2", "HOME", 2.3).retrieved(now),
            OddsQuote::new("bk", "1X2", "DRAW", 3.4).retrieved(now),
            OddsQuote::new("bk", "1X2", "AWAY", 3.6).retrieved(now),
            OddsQuote::new("old", "OU_2.5", "OVER", 1.9).retrieved(now - chrono::Duration::hours(20)),
            OddsQuote::new("old", "OU_2.5", "UNDER", 1.9).retrieved(now - chrono::Duration::hours(20)),
        ];
        let report = predictor
            .evaluate(&input(None), &quotes, 1000.0, &MarketRules::default(), now)
            .unwrap();
        let implied = report.market_implied.unwrap();
        let expected = crate::markets::implied_probs_1x2(2.3, 3.4, 3.6);
        assert!((implied.home_win - expected.home_win).abs() < 1e-12);
        // Stale totals never feed the consensus.
        assert_eq!(implied.over_2_5, 0.0);

        let bare = predictor
            .evaluate(&input(None), &quotes[..1], 1000.0, &MarketRules::default(), now)
            .unwrap();
        assert!(bare.market_implied.is_none());
    }

    #[test]
    fn non_positive_rates_are_rejected() {
        let predictor = Predictor::new(ModelSnapshot::default());
        let mut bad = input(None);
        bad.lambda_away = 0.0;
        assert!(predictor.predict(&bad).is_err());
    }

    #[test]
    fn slate_keeps_entry_order() {
        let predictor = Predictor::new(ModelSnapshot::default());
        let now = Utc.with_ymd_and_hms(2024, 9, 14, 12, 0, 0).unwrap();
        let entries: Vec<SlateEntry> = ["a", "b", "c"]
            .into_iter()
            .map(|id| SlateEntry {
                input: MatchInput {
                    match_id: id.to_string(),
                    ..input(None)
                },
                odds: vec![OddsQuote::new("bk", "1X2", "HOME", 2.3).retrieved(now)],
            })
            .collect();

        let out = evaluate_slate(&predictor, &entries, 1000.0, &MarketRules::default(), now);
        let ids: Vec<&str> = out.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        for (_, report) in out {
            let report = report.unwrap();
            assert!(!report.betting_gate.enabled);
            assert_eq!(report.evaluation.evaluated.len(), 1);
        }
    }
}
