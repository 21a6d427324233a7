use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

use matchday_edge::config::Settings;
use matchday_edge::odds;
use matchday_edge::pipeline::{self, MatchReport, ModelSources, Predictor, SlateEntry};

const DEFAULT_BANKROLL: f64 = 1000.0;

#[derive(Debug, Serialize)]
struct SlateOutput {
    match_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<MatchReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let slate_path = positional_arg()
        .map(PathBuf::from)
        .context("usage: matchday_edge <slate.json> [--bankroll N] [--now RFC3339] [--rules FILE]")?;
    let raw = fs::read_to_string(&slate_path)
        .with_context(|| format!("read slate {}", slate_path.display()))?;
    let entries: Vec<SlateEntry> = serde_json::from_str(&raw)
        .with_context(|| format!("parse slate {}", slate_path.display()))?;

    let bankroll = parse_f64_arg("--bankroll").unwrap_or(DEFAULT_BANKROLL);
    let now = match parse_string_arg("--now") {
        Some(raw) => odds::parse_utc(&raw).with_context(|| format!("invalid --now {raw}"))?,
        None => Utc::now(),
    };
    let overrides = match parse_string_arg("--rules") {
        Some(path) => Some(read_overrides(Path::new(&path))?),
        None => None,
    };

    let settings = Settings::from_env();
    let mut sources = ModelSources::new(&settings);
    let rules = sources.market_rules(overrides.as_ref());
    let predictor = Predictor::new(sources.snapshot());

    let out: Vec<SlateOutput> = pipeline::evaluate_slate(&predictor, &entries, bankroll, &rules, now)
        .into_iter()
        .map(|(match_id, report)| match report {
            Ok(report) => SlateOutput {
                match_id,
                report: Some(report),
                error: None,
            },
            Err(err) => SlateOutput {
                match_id,
                report: None,
                error: Some(format!("{err:#}")),
            },
        })
        .collect();

    let json = serde_json::to_string_pretty(&out).context("serialize slate output")?;
    println!("{json}");
    Ok(())
}

fn read_overrides(path: &Path) -> Result<Map<String, Value>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read rule overrides {}", path.display()))?;
    match serde_json::from_str::<Value>(&raw)
        .with_context(|| format!("parse rule overrides {}", path.display()))?
    {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("rule overrides {} must be a JSON object", path.display()),
    }
}

fn positional_arg() -> Option<String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let mut skip_next = false;
    for arg in &args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg.starts_with("--") {
            skip_next = !arg.contains('=');
            continue;
        }
        return Some(arg.clone());
    }
    None
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

fn parse_f64_arg(name: &str) -> Option<f64> {
    parse_string_arg(name).and_then(|raw| raw.parse::<f64>().ok())
}
