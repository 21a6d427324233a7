use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

pub const SERVICE_MAX_ODDS: f64 = 6.0;
pub const SERVICE_MIN_BOOKS: usize = 2;

/// Risk rules for the market decision engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketRules {
    pub min_edge: f64,
    pub max_picks: usize,
    pub max_ci_width: f64,
    pub kelly_fraction: f64,
    pub stake_cap_fraction: f64,
    pub max_model_market_gap: f64,
    pub longshot_odds: f64,
    pub min_edge_longshot: f64,
    pub max_odds: Option<f64>,
    pub min_books: usize,
    pub max_odds_age_hours: f64,
}

impl Default for MarketRules {
    fn default() -> Self {
        Self {
            min_edge: 0.03,
            max_picks: 3,
            max_ci_width: 0.06,
            kelly_fraction: 0.25,
            stake_cap_fraction: 0.02,
            max_model_market_gap: 0.12,
            longshot_odds: 5.0,
            min_edge_longshot: 0.08,
            max_odds: None,
            min_books: 1,
            max_odds_age_hours: 12.0,
        }
    }
}

impl MarketRules {
    /// Engine defaults plus the odds cap and book depth the served loader applies.
    pub fn service_defaults() -> Self {
        Self {
            max_odds: Some(SERVICE_MAX_ODDS),
            min_books: SERVICE_MIN_BOOKS,
            ..Self::default()
        }
    }

    /// Reads recognized keys from a flat map; anything else (or unusable values) keeps the default.
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let mut rules = Self::default();
        rules.apply(map);
        rules
    }

    pub fn apply(&mut self, map: &Map<String, Value>) {
        for (key, value) in map {
            match key.as_str() {
                "min_edge" => set_f64(&mut self.min_edge, value),
                "max_picks" => set_usize(&mut self.max_picks, value),
                "max_ci_width" => set_f64(&mut self.max_ci_width, value),
                "kelly_fraction" => set_f64(&mut self.kelly_fraction, value),
                "stake_cap_fraction" => set_f64(&mut self.stake_cap_fraction, value),
                "max_model_market_gap" => set_f64(&mut self.max_model_market_gap, value),
                "longshot_odds" => set_f64(&mut self.longshot_odds, value),
                "min_edge_longshot" => set_f64(&mut self.min_edge_longshot, value),
                "max_odds" => {
                    if value.is_null() {
                        self.max_odds = None;
                    } else if let Some(v) = as_f64(value) {
                        self.max_odds = Some(v);
                    }
                }
                "min_books" => set_usize(&mut self.min_books, value),
                "max_odds_age_hours" => set_f64(&mut self.max_odds_age_hours, value),
                _ => {}
            }
        }
    }
}

/// Service defaults, then the rules file (when it holds a JSON object), then caller overrides.
pub fn load_market_rules(path: Option<&Path>, overrides: Option<&Map<String, Value>>) -> MarketRules {
    let mut rules = MarketRules::service_defaults();
    if let Some(path) = path
        && let Some(map) = read_json_object(path)
    {
        rules.apply(&map);
    }
    if let Some(overrides) = overrides {
        rules.apply(overrides);
    }
    rules
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BettingGate {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BettingGate {
    pub fn missing() -> Self {
        Self {
            enabled: false,
            reason: Some("MISSING_GATE_FILE".to_string()),
        }
    }

    /// Anything short of a readable gate file means betting is disabled.
    pub fn load(path: &Path) -> Self {
        read_json_object(path)
            .and_then(|map| serde_json::from_value::<Self>(Value::Object(map)).ok())
            .unwrap_or_else(Self::missing)
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    if !path.exists() {
        return None;
    }
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(path = %path.display(), %err, "unreadable config file ignored");
            return None;
        }
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => {
            warn!(path = %path.display(), "config file is not a JSON object; ignored");
            None
        }
        Err(err) => {
            warn!(path = %path.display(), %err, "invalid JSON config ignored");
            None
        }
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

fn set_f64(slot: &mut f64, value: &Value) {
    if let Some(v) = as_f64(value) {
        *slot = v;
    }
}

fn set_usize(slot: &mut usize, value: &Value) {
    if let Some(v) = as_f64(value).filter(|v| *v >= 0.0) {
        *slot = v as usize;
    }
}
