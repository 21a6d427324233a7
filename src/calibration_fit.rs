use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;

use crate::calibration::{CalibrationBin, CalibrationPayload, CalibrationTable, SeasonPhase};
use crate::markets::{MarketProbs, ProbKey};

pub const DEFAULT_BINS: usize = 20;
pub const DEFAULT_MIN_COUNT: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Home,
    Draw,
    Away,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Metrics {
    pub samples: usize,
    pub brier: f64,
    pub log_loss: f64,
    pub accuracy: f64,
}

/// One settled match with the model's pre-match probabilities.
#[derive(Debug, Clone, Copy)]
pub struct SettledPrediction {
    pub probs: MarketProbs,
    pub home_goals: u32,
    pub away_goals: u32,
}

impl SettledPrediction {
    pub fn outcome(&self) -> Outcome {
        classify_outcome(self.home_goals, self.away_goals)
    }

    /// Whether the event behind `key` happened.
    pub fn hit(&self, key: ProbKey) -> bool {
        let (h, a) = (self.home_goals, self.away_goals);
        match key {
            ProbKey::HomeWin => h > a,
            ProbKey::Draw => h == a,
            ProbKey::AwayWin => h < a,
            ProbKey::Over25 => h + a >= 3,
            ProbKey::Under25 => h + a <= 2,
            ProbKey::BttsYes => h > 0 && a > 0,
            ProbKey::BttsNo => h == 0 || a == 0,
        }
    }
}

pub fn classify_outcome(home_goals: u32, away_goals: u32) -> Outcome {
    if home_goals > away_goals {
        Outcome::Home
    } else if home_goals < away_goals {
        Outcome::Away
    } else {
        Outcome::Draw
    }
}

/// `"2024/25"` style label for the season a kickoff belongs to (seasons start in August).
pub fn season_label_for(kickoff: DateTime<Utc>) -> String {
    let start = if kickoff.month() >= 8 {
        kickoff.year()
    } else {
        kickoff.year() - 1
    };
    format!("{start}/{:02}", (start + 1).rem_euclid(100))
}

/// Equal-width bins over `[0, 1)`; sparse bins fall back to the overall hit rate.
pub fn build_bins(samples: &[(f64, bool)], bins: usize, min_count: usize) -> Vec<CalibrationBin> {
    if samples.is_empty() {
        return Vec::new();
    }
    let bins = bins.max(2);
    let overall = samples.iter().filter(|(_, hit)| *hit).count() as f64 / samples.len() as f64;

    (0..bins)
        .map(|i| {
            let min = i as f64 / bins as f64;
            let max = (i + 1) as f64 / bins as f64;
            let (count, hits) = samples
                .iter()
                .filter(|(p, _)| min <= *p && *p < max)
                .fold((0usize, 0usize), |(n, h), (_, hit)| (n + 1, h + usize::from(*hit)));
            let p = if count < min_count {
                overall
            } else {
                hits as f64 / count as f64
            };
            CalibrationBin { min, max, p, count }
        })
        .collect()
}

pub fn build_table(
    records: &[SettledPrediction],
    bins: usize,
    min_count: usize,
    version: Option<&str>,
) -> CalibrationTable {
    let markets = ProbKey::ALL
        .into_iter()
        .map(|key| {
            let samples: Vec<(f64, bool)> =
                records.iter().map(|r| (r.probs.get(key), r.hit(key))).collect();
            (key.as_str().to_string(), build_bins(&samples, bins, min_count))
        })
        .collect();
    CalibrationTable {
        version: version.map(str::to_string),
        markets,
    }
}

#[derive(Debug, Default)]
struct LeagueRecords {
    all: Vec<SettledPrediction>,
    // season -> segment ("full" or a phase label) -> records
    seasons: BTreeMap<String, BTreeMap<String, Vec<SettledPrediction>>>,
}

/// Collects settled predictions and emits a `by_league` calibration payload.
#[derive(Debug, Default)]
pub struct CalibrationBuilder {
    leagues: BTreeMap<String, LeagueRecords>,
}

impl CalibrationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, league: &str, season: &str, phase: SeasonPhase, record: SettledPrediction) {
        let entry = self.leagues.entry(league.to_string()).or_default();
        entry.all.push(record);
        let season = entry.seasons.entry(season.to_string()).or_default();
        season.entry("full".to_string()).or_default().push(record);
        season
            .entry(phase.as_str().to_string())
            .or_default()
            .push(record);
    }

    pub fn len(&self) -> usize {
        self.leagues.values().map(|l| l.all.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn build(&self, bins: usize, min_count: usize, version: &str) -> CalibrationPayload {
        let by_league = self
            .leagues
            .iter()
            .map(|(league, recs)| {
                let overall = build_table(&recs.all, bins, min_count, Some(version));
                let by_season = recs
                    .seasons
                    .iter()
                    .map(|(season, segments)| {
                        let tables = segments
                            .iter()
                            .map(|(seg, rows)| {
                                (seg.clone(), build_table(rows, bins, min_count, Some(version)))
                            })
                            .collect();
                        (season.clone(), tables)
                    })
                    .collect();
                let payload = CalibrationPayload {
                    table: overall.clone(),
                    default: Some(overall),
                    by_season: Some(by_season),
                    by_league: None,
                };
                (league.clone(), payload)
            })
            .collect();

        CalibrationPayload {
            table: CalibrationTable {
                version: Some(version.to_string()),
                markets: BTreeMap::new(),
            },
            default: None,
            by_season: None,
            by_league: Some(by_league),
        }
    }
}

/// Folds freshly fitted leagues into an existing payload; leagues not refitted keep their tables.
pub fn merge_by_league(existing: Option<CalibrationPayload>, fresh: CalibrationPayload) -> CalibrationPayload {
    let mut by_league = existing.and_then(|p| p.by_league).unwrap_or_default();
    by_league.extend(fresh.by_league.unwrap_or_default());
    CalibrationPayload {
        table: fresh.table,
        default: None,
        by_season: None,
        by_league: Some(by_league),
    }
}

/// Brier score, log loss and accuracy of 1X2 predictions.
pub fn evaluate_1x2(predictions: &[MarketProbs], outcomes: &[Outcome]) -> Metrics {
    if predictions.is_empty() || predictions.len() != outcomes.len() {
        return Metrics::default();
    }

    let mut brier_sum = 0.0_f64;
    let mut log_loss_sum = 0.0_f64;
    let mut correct = 0usize;

    for (p, outcome) in predictions.iter().zip(outcomes) {
        let (yh, yd, ya) = one_hot(*outcome);
        brier_sum +=
            (p.home_win - yh).powi(2) + (p.draw - yd).powi(2) + (p.away_win - ya).powi(2);

        let actual_prob = match outcome {
            Outcome::Home => p.home_win,
            Outcome::Draw => p.draw,
            Outcome::Away => p.away_win,
        }
        .clamp(1e-12, 1.0);
        log_loss_sum += -actual_prob.ln();

        if argmax(p) == *outcome {
            correct += 1;
        }
    }

    let n = predictions.len() as f64;
    Metrics {
        samples: predictions.len(),
        brier: brier_sum / n,
        log_loss: log_loss_sum / n,
        accuracy: correct as f64 / n,
    }
}

/// Count-weighted gap between mean prediction and hit rate across equal-width bins.
pub fn expected_calibration_error(samples: &[(f64, bool)], bins: usize) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let bins = bins.max(2);
    let mut counts = vec![0usize; bins];
    let mut pred_sum = vec![0.0_f64; bins];
    let mut hit_sum = vec![0.0_f64; bins];

    for (p, hit) in samples {
        let p = p.clamp(0.0, 1.0);
        let idx = ((p * bins as f64).floor() as usize).min(bins - 1);
        counts[idx] += 1;
        pred_sum[idx] += p;
        if *hit {
            hit_sum[idx] += 1.0;
        }
    }

    let n = samples.len() as f64;
    (0..bins)
        .filter(|i| counts[*i] > 0)
        .map(|i| {
            let c = counts[i] as f64;
            (c / n) * (pred_sum[i] / c - hit_sum[i] / c).abs()
        })
        .sum()
}

fn argmax(p: &MarketProbs) -> Outcome {
    if p.home_win >= p.draw && p.home_win >= p.away_win {
        Outcome::Home
    } else if p.draw >= p.away_win {
        Outcome::Draw
    } else {
        Outcome::Away
    }
}

fn one_hot(outcome: Outcome) -> (f64, f64, f64) {
    match outcome {
        Outcome::Home => (1.0, 0.0, 0.0),
        Outcome::Draw => (0.0, 1.0, 0.0),
        Outcome::Away => (0.0, 0.0, 1.0),
    }
}
