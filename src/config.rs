use std::env;
use std::path::PathBuf;

use crate::ensemble::DEFAULT_ENSEMBLE_WEIGHT;
use crate::simulation::MIN_SIMS;

const DEFAULT_SIM_N: usize = 20_000;
const DEFAULT_SIM_SEED: u64 = 42;

/// File locations and simulation knobs, read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub calibration_path: PathBuf,
    pub calibration_by_season_path: PathBuf,
    pub calibration_policy_path: PathBuf,
    pub dc_params_path: PathBuf,
    pub temp_scale_path: PathBuf,
    pub market_rules_path: PathBuf,
    pub betting_gate_path: PathBuf,
    pub ensemble_weights_path: PathBuf,
    /// Used when the weights file has no entry for the league.
    pub ensemble_weight: f64,
    pub sim_n: usize,
    pub sim_seed: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            calibration_path: PathBuf::from("data/calibration/calibration_v1.json"),
            calibration_by_season_path: PathBuf::from(
                "data/calibration/calibration_by_season.json",
            ),
            calibration_policy_path: PathBuf::from("data/calibration/calibration_policy.json"),
            dc_params_path: PathBuf::from("data/calibration/dc_params.json"),
            temp_scale_path: PathBuf::from("data/calibration/temp_scale_1x2.json"),
            market_rules_path: PathBuf::from("data/config/market_rules.json"),
            betting_gate_path: PathBuf::from("data/config/betting_gate.json"),
            ensemble_weights_path: PathBuf::from("data/calibration/ensemble_weights.json"),
            ensemble_weight: DEFAULT_ENSEMBLE_WEIGHT,
            sim_n: DEFAULT_SIM_N,
            sim_seed: DEFAULT_SIM_SEED,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let path = |key: &str, fallback: PathBuf| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(fallback)
        };

        Self {
            calibration_path: path("CALIBRATION_PATH", d.calibration_path),
            calibration_by_season_path: path(
                "CALIBRATION_BY_SEASON_PATH",
                d.calibration_by_season_path,
            ),
            calibration_policy_path: path("CALIBRATION_POLICY_PATH", d.calibration_policy_path),
            dc_params_path: path("DC_PARAMS_PATH", d.dc_params_path),
            temp_scale_path: path("TEMP_SCALE_PATH", d.temp_scale_path),
            market_rules_path: path("MARKET_RULES_PATH", d.market_rules_path),
            betting_gate_path: path("BETTING_GATE_PATH", d.betting_gate_path),
            ensemble_weights_path: path("ENSEMBLE_WEIGHTS_PATH", d.ensemble_weights_path),
            ensemble_weight: lookup("ENSEMBLE_WEIGHT")
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|w| w.is_finite())
                .map(|w| w.clamp(0.0, 1.0))
                .unwrap_or(d.ensemble_weight),
            sim_n: lookup("SIM_N")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(d.sim_n)
                .max(MIN_SIMS),
            sim_seed: lookup("SIM_SEED")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(d.sim_seed),
        }
    }
}
