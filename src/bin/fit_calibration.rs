use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use matchday_edge::calibration::{CalibrationPayload, SeasonPhase};
use matchday_edge::calibration_fit::{
    self, CalibrationBuilder, DEFAULT_BINS, DEFAULT_MIN_COUNT, Metrics, Outcome, SettledPrediction,
};
use matchday_edge::config::Settings;
use matchday_edge::league_params::{self, DcParams};
use matchday_edge::markets::ProbKey;
use matchday_edge::scoreline::{DEFAULT_GOAL_CAP, GoalRates, match_probs};

#[derive(Debug, Clone, Deserialize)]
struct HistoricalMatch {
    league: String,
    #[serde(default)]
    season: Option<String>,
    kickoff_utc: DateTime<Utc>,
    lambda_home: f64,
    lambda_away: f64,
    home_goals: u32,
    away_goals: u32,
}

impl HistoricalMatch {
    fn season_label(&self) -> String {
        self.season
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| calibration_fit::season_label_for(self.kickoff_utc))
    }

    fn outcome(&self) -> Outcome {
        calibration_fit::classify_outcome(self.home_goals, self.away_goals)
    }
}

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env();
    let history_path = parse_path_arg("--history")
        .unwrap_or_else(|| PathBuf::from("data/history/matches.json"));
    let out_path = parse_path_arg("--out").unwrap_or_else(|| settings.calibration_by_season_path.clone());
    let dc_path = parse_path_arg("--dc-out").unwrap_or_else(|| settings.dc_params_path.clone());
    let bins = parse_usize_arg("--bins").unwrap_or(DEFAULT_BINS);
    let min_count = parse_usize_arg("--min-count").unwrap_or(DEFAULT_MIN_COUNT);
    let version = parse_string_arg("--version")
        .unwrap_or_else(|| format!("by_season_{}", Utc::now().format("%Y%m%d")));

    let raw = fs::read_to_string(&history_path)
        .with_context(|| format!("read history {}", history_path.display()))?;
    let history: Vec<HistoricalMatch> = serde_json::from_str(&raw)
        .with_context(|| format!("parse history {}", history_path.display()))?;
    let (usable, skipped): (Vec<_>, Vec<_>) = history.into_iter().partition(|m| {
        m.lambda_home.is_finite() && m.lambda_away.is_finite() && m.lambda_home > 0.0 && m.lambda_away > 0.0
    });
    if !skipped.is_empty() {
        warn!(skipped = skipped.len(), "matches without usable goal rates ignored");
    }
    info!(matches = usable.len(), path = %history_path.display(), "history loaded");

    let dc = if has_flag("--fit-rho") {
        let dc = fit_league_rho(&usable);
        dc.save(&dc_path)?;
        println!("dc params written: {}", dc_path.display());
        dc
    } else {
        DcParams::load(&dc_path)?.unwrap_or_default()
    };

    let settled: Vec<SettledPrediction> = usable
        .par_iter()
        .map(|m| {
            let rho = dc.rho_for(Some(&m.league));
            SettledPrediction {
                probs: match_probs(GoalRates::new(m.lambda_home, m.lambda_away, rho), DEFAULT_GOAL_CAP),
                home_goals: m.home_goals,
                away_goals: m.away_goals,
            }
        })
        .collect();

    let mut builder = CalibrationBuilder::new();
    for (m, record) in usable.iter().zip(&settled) {
        builder.push(
            &m.league,
            &m.season_label(),
            SeasonPhase::from_kickoff(m.kickoff_utc),
            *record,
        );
    }
    let existing = CalibrationPayload::load(&out_path).unwrap_or_else(|err| {
        warn!(err = %format!("{err:#}"), "existing calibration unreadable; starting fresh");
        None
    });
    let payload = calibration_fit::merge_by_league(existing, builder.build(bins, min_count, &version));

    print_report(&usable, &settled);
    write_payload(&payload, &out_path)?;
    println!();
    println!("calibration written: {} ({} matches)", out_path.display(), builder.len());
    Ok(())
}

fn fit_league_rho(matches: &[HistoricalMatch]) -> DcParams {
    let mut by_league: BTreeMap<&str, Vec<(f64, f64, Outcome)>> = BTreeMap::new();
    for m in matches {
        by_league
            .entry(m.league.as_str())
            .or_default()
            .push((m.lambda_home, m.lambda_away, m.outcome()));
    }

    let mut dc = DcParams::default();
    for (league, rows) in by_league {
        let rho = league_params::fit_rho(&rows);
        info!(league, rho, samples = rows.len(), "rho fitted");
        dc.insert(league, rho, rows.len());
    }
    dc
}

fn print_report(matches: &[HistoricalMatch], settled: &[SettledPrediction]) {
    let mut by_league: BTreeMap<&str, Vec<&SettledPrediction>> = BTreeMap::new();
    for (m, s) in matches.iter().zip(settled) {
        by_league.entry(m.league.as_str()).or_default().push(s);
    }
    for (league, rows) in by_league {
        let probs: Vec<_> = rows.iter().map(|r| r.probs).collect();
        let outcomes: Vec<_> = rows.iter().map(|r| r.outcome()).collect();
        print_metrics(league, calibration_fit::evaluate_1x2(&probs, &outcomes));
        let over: Vec<(f64, bool)> = rows
            .iter()
            .map(|r| (r.probs.over_2_5, r.hit(ProbKey::Over25)))
            .collect();
        println!(
            "  ece(over_2_5)={:.4}",
            calibration_fit::expected_calibration_error(&over, DEFAULT_BINS)
        );
    }
}

fn print_metrics(label: &str, metrics: Metrics) {
    println!("{label}:");
    println!(
        "  samples={} brier={:.4} log_loss={:.4} accuracy={:.3}",
        metrics.samples, metrics.brier, metrics.log_loss, metrics.accuracy
    );
}

fn write_payload(payload: &CalibrationPayload, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(payload).context("serialize calibration")?;
    fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("swap {}", path.display()))?;
    Ok(())
}

fn parse_string_arg(name: &str) -> Option<String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(raw) = arg.strip_prefix(&format!("{name}="))
            && !raw.trim().is_empty()
        {
            return Some(raw.trim().to_string());
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
            && !next.trim().is_empty()
        {
            return Some(next.trim().to_string());
        }
    }
    None
}

fn parse_path_arg(name: &str) -> Option<PathBuf> {
    parse_string_arg(name).map(PathBuf::from)
}

fn parse_usize_arg(name: &str) -> Option<usize> {
    parse_string_arg(name).and_then(|raw| raw.parse::<usize>().ok())
}

fn has_flag(name: &str) -> bool {
    std::env::args().skip(1).any(|arg| arg == name)
}
