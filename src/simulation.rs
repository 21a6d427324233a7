use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::markets::{MarketProbs, ProbKey};
use crate::scoreline::ScorelineCell;

pub const MIN_SIMS: usize = 1000;
const DISPLAY_GOAL_CAP: u32 = 8;
const TOP_K: usize = 12;

#[derive(Debug, Error, PartialEq)]
pub enum SimulationError {
    #[error("n_sims must be >= {MIN_SIMS}, got {0}")]
    TooFewSims(usize),
    #[error("goal rates must be positive (home={home}, away={away})")]
    InvalidRates { home: f64, away: f64 },
}

/// Normal-approximation 95% interval for a simulated proportion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub lo: f64,
    pub hi: f64,
    pub se: f64,
}

impl Interval {
    pub fn width(&self) -> f64 {
        self.hi - self.lo
    }
}

pub type Intervals = BTreeMap<ProbKey, Interval>;

#[derive(Debug, Clone, Serialize)]
pub struct SimulationOutput {
    pub n_sims: usize,
    pub seed: u64,
    pub probs: MarketProbs,
    pub scoreline_topk: Vec<ScorelineCell>,
    /// |home-win rate of first half of draws - second half|, when both halves are large enough.
    pub convergence_delta: Option<f64>,
}

pub fn ci95(p: f64, n: usize) -> Interval {
    let se = if n > 0 {
        (p * (1.0 - p) / n as f64).max(0.0).sqrt()
    } else {
        0.0
    };
    Interval {
        lo: (p - 1.96 * se).max(0.0),
        hi: (p + 1.96 * se).min(1.0),
        se,
    }
}

pub fn intervals_for(probs: &MarketProbs, n: usize) -> Intervals {
    probs.iter().map(|(k, p)| (k, ci95(p, n))).collect()
}

/// Seeded Monte Carlo draw of independent Poisson goal counts.
pub fn simulate(
    lambda_home: f64,
    lambda_away: f64,
    n_sims: usize,
    seed: u64,
) -> Result<SimulationOutput, SimulationError> {
    if n_sims < MIN_SIMS {
        return Err(SimulationError::TooFewSims(n_sims));
    }
    if !(lambda_home > 0.0 && lambda_away > 0.0) {
        return Err(SimulationError::InvalidRates {
            home: lambda_home,
            away: lambda_away,
        });
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let draws: Vec<(u32, u32)> = (0..n_sims)
        .map(|_| {
            (
                sample_poisson(&mut rng, lambda_home),
                sample_poisson(&mut rng, lambda_away),
            )
        })
        .collect();

    let side = DISPLAY_GOAL_CAP as usize + 1;
    let mut counts = vec![0usize; side * side];
    let (mut home, mut draw, mut away, mut over, mut btts) = (0usize, 0usize, 0usize, 0usize, 0usize);
    for (h, a) in &draws {
        if h > a {
            home += 1;
        } else if h == a {
            draw += 1;
        } else {
            away += 1;
        }
        if h + a >= 3 {
            over += 1;
        }
        if *h > 0 && *a > 0 {
            btts += 1;
        }
        let hc = (*h).min(DISPLAY_GOAL_CAP) as usize;
        let ac = (*a).min(DISPLAY_GOAL_CAP) as usize;
        counts[hc * side + ac] += 1;
    }

    let n = n_sims as f64;
    let probs = MarketProbs {
        home_win: home as f64 / n,
        draw: draw as f64 / n,
        away_win: away as f64 / n,
        over_2_5: over as f64 / n,
        under_2_5: (n_sims - over) as f64 / n,
        btts_yes: btts as f64 / n,
        btts_no: 1.0 - btts as f64 / n,
    };

    let mut topk: Vec<ScorelineCell> = counts
        .iter()
        .enumerate()
        .filter(|(_, c)| **c > 0)
        .map(|(idx, c)| ScorelineCell {
            home_goals: (idx / side) as u32,
            away_goals: (idx % side) as u32,
            p: *c as f64 / n,
        })
        .collect();
    topk.sort_by(|x, y| y.p.total_cmp(&x.p));
    topk.truncate(TOP_K);

    let half = n_sims / 2;
    let convergence_delta = (half >= MIN_SIMS).then(|| {
        let rate = |slice: &[(u32, u32)]| {
            slice.iter().filter(|(h, a)| h > a).count() as f64 / slice.len() as f64
        };
        (rate(&draws[..half]) - rate(&draws[half..])).abs()
    });

    Ok(SimulationOutput {
        n_sims,
        seed,
        probs,
        scoreline_topk: topk,
        convergence_delta,
    })
}

fn sample_poisson<R: Rng>(rng: &mut R, lambda: f64) -> u32 {
    let limit = (-lambda).exp();
    let mut k = 0u32;
    let mut p = 1.0_f64;
    loop {
        p *= rng.r#gen::<f64>();
        if p <= limit {
            return k;
        }
        k += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoreline::{DEFAULT_GOAL_CAP, GoalRates, match_probs};

    #[test]
    fn rejects_small_runs_and_bad_rates() {
        assert_eq!(
            simulate(1.2, 1.0, 999, 1).unwrap_err(),
            SimulationError::TooFewSims(999)
        );
        assert!(matches!(
            simulate(0.0, 1.0, 5000, 1),
            Err(SimulationError::InvalidRates { .. })
        ));
    }

    #[test]
    fn same_seed_same_output() {
        let a = simulate(1.5, 1.2, 4000, 7).unwrap();
        let b = simulate(1.5, 1.2, 4000, 7).unwrap();
        assert_eq!(a.probs, b.probs);
        assert_eq!(a.scoreline_topk, b.scoreline_topk);
    }

    #[test]
    fn tracks_analytic_model() {
        let sim = simulate(1.6, 1.1, 50_000, 42).unwrap();
        let exact = match_probs(GoalRates::independent(1.6, 1.1), DEFAULT_GOAL_CAP);
        assert!((sim.probs.home_win - exact.home_win).abs() < 0.02);
        assert!((sim.probs.over_2_5 - exact.over_2_5).abs() < 0.02);
        assert!(sim.convergence_delta.is_some());
        assert!(sim.scoreline_topk.len() <= 12);
    }

    #[test]
    fn ci_is_clamped() {
        let ci = ci95(0.0, 1000);
        assert_eq!(ci.lo, 0.0);
        assert_eq!(ci.width(), 0.0);
        let mid = ci95(0.5, 10_000);
        assert!((mid.se - 0.005).abs() < 1e-12);
        assert!(mid.hi <= 1.0);
    }
}
