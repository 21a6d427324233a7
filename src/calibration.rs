use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::markets::{GROUP_1X2, MarketProbs, ProbKey};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBin {
    pub min: f64,
    pub max: f64,
    // Empirical outcome frequency for predictions landing in [min, max).
    pub p: f64,
    #[serde(default)]
    pub count: usize,
}

/// Per-key bins for one calibration context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub markets: BTreeMap<String, Vec<CalibrationBin>>,
}

impl CalibrationTable {
    pub fn bins(&self, key: ProbKey) -> Option<&[CalibrationBin]> {
        self.markets
            .get(key.as_str())
            .map(Vec::as_slice)
            .filter(|b| !b.is_empty())
    }
}

/// Season sub-tables keyed by phase label (`early`/`mid`/`late`) plus `full` and `default`.
pub type SeasonTables = BTreeMap<String, CalibrationTable>;

/// Calibration payload as stored on disk.
///
/// Either a global table, or a tree of `by_league` -> `by_season` -> phase
/// entries; every level may carry its own `markets` and `default`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPayload {
    #[serde(flatten)]
    pub table: CalibrationTable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<CalibrationTable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_season: Option<BTreeMap<String, SeasonTables>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_league: Option<BTreeMap<String, CalibrationPayload>>,
}

impl CalibrationPayload {
    /// Missing file means no calibration; a present but invalid file is an error.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read calibration {}", path.display()))?;
        let payload = serde_json::from_str::<Self>(&raw)
            .with_context(|| format!("parse calibration {}", path.display()))?;
        Ok(Some(payload))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeasonPhase {
    Early,
    Mid,
    Late,
}

impl SeasonPhase {
    pub fn from_month(month: u32) -> Self {
        match month {
            8..=10 => SeasonPhase::Early,
            11 | 12 | 1 | 2 => SeasonPhase::Mid,
            _ => SeasonPhase::Late,
        }
    }

    pub fn from_kickoff(kickoff: DateTime<Utc>) -> Self {
        Self::from_month(kickoff.month())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SeasonPhase::Early => "early",
            SeasonPhase::Mid => "mid",
            SeasonPhase::Late => "late",
        }
    }
}

/// Which level of the payload produced the selected table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableSource {
    SeasonPhase(SeasonPhase),
    SeasonFull,
    SeasonDefault,
    PayloadDefault,
    Payload,
}

#[derive(Debug, Clone, Copy)]
pub struct SelectedTable<'a> {
    pub table: &'a CalibrationTable,
    pub source: TableSource,
}

/// League axis: a payload with `by_league` only serves the leagues it lists.
pub fn select_league<'a>(
    payload: &'a CalibrationPayload,
    league: Option<&str>,
) -> Option<&'a CalibrationPayload> {
    match (&payload.by_league, league) {
        (Some(by_league), Some(league)) => by_league.get(league),
        _ => Some(payload),
    }
}

/// Season and phase axes, most specific first.
pub fn select_season_table<'a>(
    payload: &'a CalibrationPayload,
    season: Option<&str>,
    kickoff: Option<DateTime<Utc>>,
) -> SelectedTable<'a> {
    let Some(by_season) = &payload.by_season else {
        return SelectedTable {
            table: &payload.table,
            source: TableSource::Payload,
        };
    };

    let entry = season
        .and_then(|s| by_season.get(s))
        .filter(|e| !e.is_empty());
    let phase = kickoff.map(SeasonPhase::from_kickoff);

    let chain = [
        (
            entry.zip(phase).and_then(|(e, p)| e.get(p.as_str())),
            phase.map(TableSource::SeasonPhase),
        ),
        (entry.and_then(|e| e.get("full")), Some(TableSource::SeasonFull)),
        (
            entry.and_then(|e| e.get("default")),
            Some(TableSource::SeasonDefault),
        ),
        (payload.default.as_ref(), Some(TableSource::PayloadDefault)),
    ];

    chain
        .into_iter()
        .find_map(|(table, source)| Some(SelectedTable {
            table: table?,
            source: source?,
        }))
        .unwrap_or(SelectedTable {
            table: &payload.table,
            source: TableSource::Payload,
        })
}

pub fn select_table<'a>(
    payload: &'a CalibrationPayload,
    league: Option<&str>,
    season: Option<&str>,
    kickoff: Option<DateTime<Utc>>,
) -> Option<SelectedTable<'a>> {
    let Some(league_payload) = select_league(payload, league) else {
        debug!(?league, "no calibration entry for league");
        return None;
    };
    let selected = select_season_table(league_payload, season, kickoff);
    debug!(?league, ?season, source = ?selected.source, "calibration table selected");
    Some(selected)
}

/// Bin value for `p`, or `p` itself when no bin covers it.
pub fn map_prob(bins: &[CalibrationBin], p: f64) -> f64 {
    bins.iter()
        .find(|b| b.min <= p && p < b.max)
        .map(|b| b.p)
        .unwrap_or(p)
}

/// Remaps each key through its bins, then renormalizes each exclusive group.
pub fn apply_calibration(probs: &MarketProbs, table: &CalibrationTable) -> MarketProbs {
    let mut out = *probs;
    for key in ProbKey::ALL {
        if let Some(bins) = table.bins(key) {
            out.set(key, map_prob(bins, probs.get(key)));
        }
    }
    out.renormalize();
    out
}

/// Applies the table; with `calibrate_1x2 == false` the 1X2 keys keep their raw values.
pub fn calibrate(probs: &MarketProbs, table: &CalibrationTable, calibrate_1x2: bool) -> MarketProbs {
    let mut out = apply_calibration(probs, table);
    if !calibrate_1x2 {
        for key in GROUP_1X2 {
            out.set(key, probs.get(key));
        }
    }
    out
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeagueCalibrationPolicy {
    #[serde(default)]
    pub calibrate_1x2: Option<bool>,
}

/// Per-league switches for the calibration layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CalibrationPolicy {
    #[serde(default)]
    pub by_league: BTreeMap<String, LeagueCalibrationPolicy>,
}

impl CalibrationPolicy {
    pub fn calibrate_1x2(&self, league: Option<&str>, default: bool) -> bool {
        league
            .and_then(|l| self.by_league.get(l))
            .and_then(|entry| entry.calibrate_1x2)
            .unwrap_or(default)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemperatureEntry {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub temp: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemperatureScales {
    #[serde(default)]
    pub by_league: BTreeMap<String, TemperatureEntry>,
}

impl TemperatureScales {
    /// Temperature for the league, only when enabled and positive.
    pub fn for_league(&self, league: Option<&str>) -> Option<f64> {
        let entry = self.by_league.get(league?)?;
        if !entry.enabled {
            return None;
        }
        entry.temp.filter(|t| t.is_finite() && *t > 0.0)
    }
}

/// Sharpens (`temp < 1`) or flattens (`temp > 1`) the 1X2 group.
pub fn apply_temperature_1x2(probs: &MarketProbs, temp: f64) -> MarketProbs {
    if !(temp > 0.0) {
        return *probs;
    }
    let mut out = *probs;
    for key in GROUP_1X2 {
        out.set(key, probs.get(key).max(1e-12).powf(1.0 / temp));
    }
    out.renormalize_group(&GROUP_1X2);
    out
}
