use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::markets::MarketProbs;

pub const DEFAULT_GOAL_CAP: u32 = 8;
/// Largest grid side ever built; any cell beyond it carries no representable mass.
pub const MAX_GOAL_CAP: u32 = 30;

/// Expected-goal rates for one match plus the Dixon-Coles dependence term.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GoalRates {
    pub lambda_home: f64,
    pub lambda_away: f64,
    // Low-score dependence; 0 means independent Poisson legs.
    #[serde(default)]
    pub rho: f64,
}

impl GoalRates {
    pub fn new(lambda_home: f64, lambda_away: f64, rho: f64) -> Self {
        Self {
            lambda_home,
            lambda_away,
            rho,
        }
    }

    pub fn independent(lambda_home: f64, lambda_away: f64) -> Self {
        Self::new(lambda_home, lambda_away, 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScorelineCell {
    pub home_goals: u32,
    pub away_goals: u32,
    pub p: f64,
}

/// Normalized scoreline mass over `[0, cap] x [0, cap]`, with `cap` clamped to [`MAX_GOAL_CAP`].
///
/// A degenerate grid (non-positive or non-finite total mass before
/// normalization) holds zeros everywhere.
#[derive(Debug, Clone, PartialEq)]
pub struct ScorelineGrid {
    cap: u32,
    cells: Vec<f64>,
    degenerate: bool,
}

impl ScorelineGrid {
    pub fn new(rates: GoalRates, cap: u32) -> Self {
        let cap = cap.min(MAX_GOAL_CAP);
        let side = cap as usize + 1;
        let pmf_h: Vec<f64> = (0..=cap).map(|k| poisson_pmf(rates.lambda_home, k)).collect();
        let pmf_a: Vec<f64> = (0..=cap).map(|k| poisson_pmf(rates.lambda_away, k)).collect();

        let mut cells = vec![0.0_f64; side * side];
        let mut total = 0.0_f64;
        for (h, p_h) in pmf_h.iter().enumerate() {
            for (a, p_a) in pmf_a.iter().enumerate() {
                let tau = dc_tau(
                    h as u32,
                    a as u32,
                    rates.lambda_home,
                    rates.lambda_away,
                    rates.rho,
                );
                let p = p_h * p_a * tau.max(0.0);
                cells[h * side + a] = p;
                total += p;
            }
        }

        let degenerate = !total.is_finite() || total <= 0.0;
        if degenerate {
            cells.iter_mut().for_each(|c| *c = 0.0);
        } else {
            cells.iter_mut().for_each(|c| *c /= total);
        }

        Self {
            cap,
            cells,
            degenerate,
        }
    }

    pub fn cap(&self) -> u32 {
        self.cap
    }

    pub fn is_degenerate(&self) -> bool {
        self.degenerate
    }

    /// Mass of one cell; zero outside the grid.
    pub fn prob(&self, home_goals: u32, away_goals: u32) -> f64 {
        if home_goals > self.cap || away_goals > self.cap {
            return 0.0;
        }
        let side = self.cap as usize + 1;
        self.cells[home_goals as usize * side + away_goals as usize]
    }

    pub fn cells(&self) -> impl Iterator<Item = ScorelineCell> + '_ {
        let side = self.cap as usize + 1;
        self.cells.iter().enumerate().map(move |(idx, p)| ScorelineCell {
            home_goals: (idx / side) as u32,
            away_goals: (idx % side) as u32,
            p: *p,
        })
    }

    pub fn total_mass(&self) -> f64 {
        self.cells.iter().sum()
    }

    pub fn market_probs(&self) -> MarketProbs {
        if self.degenerate {
            return MarketProbs::zero();
        }

        let mut out = MarketProbs::zero();
        let mut over = 0.0_f64;
        let mut btts = 0.0_f64;
        for cell in self.cells() {
            let (h, a, p) = (cell.home_goals, cell.away_goals, cell.p);
            match h.cmp(&a) {
                Ordering::Greater => out.home_win += p,
                Ordering::Equal => out.draw += p,
                Ordering::Less => out.away_win += p,
            }
            if h + a >= 3 {
                over += p;
            }
            if h > 0 && a > 0 {
                btts += p;
            }
        }
        out.over_2_5 = over;
        out.under_2_5 = 1.0 - over;
        out.btts_yes = btts;
        out.btts_no = 1.0 - btts;
        out
    }

    /// The `k` most likely scorelines; ties go to fewer total goals, then fewer home goals.
    pub fn top_k(&self, k: usize) -> Vec<ScorelineCell> {
        let mut all: Vec<ScorelineCell> = self.cells().filter(|c| c.p > 0.0).collect();
        all.sort_by(|x, y| {
            y.p.partial_cmp(&x.p)
                .unwrap_or(Ordering::Equal)
                .then_with(|| (x.home_goals + x.away_goals).cmp(&(y.home_goals + y.away_goals)))
                .then_with(|| x.home_goals.cmp(&y.home_goals))
        });
        all.truncate(k);
        all
    }
}

pub fn match_probs(rates: GoalRates, cap: u32) -> MarketProbs {
    ScorelineGrid::new(rates, cap).market_probs()
}

/// Probability of one exact scoreline; the grid grows to contain the queried cell,
/// up to [`MAX_GOAL_CAP`]. Anything beyond that is zero.
pub fn scoreline_prob(rates: GoalRates, home_goals: u32, away_goals: u32, cap: u32) -> f64 {
    if home_goals > MAX_GOAL_CAP || away_goals > MAX_GOAL_CAP {
        return 0.0;
    }
    let cap = cap.max(home_goals).max(away_goals);
    ScorelineGrid::new(rates, cap).prob(home_goals, away_goals)
}

pub fn dc_tau(home_goals: u32, away_goals: u32, lambda_home: f64, lambda_away: f64, rho: f64) -> f64 {
    if rho == 0.0 {
        return 1.0;
    }
    match (home_goals, away_goals) {
        (0, 0) => 1.0 - lambda_home * lambda_away * rho,
        (0, 1) => 1.0 + lambda_home * rho,
        (1, 0) => 1.0 + lambda_away * rho,
        (1, 1) => 1.0 - rho,
        _ => 1.0,
    }
}

/// Product form avoids building `k!` explicitly.
pub fn poisson_pmf(lambda: f64, goals: u32) -> f64 {
    let numer = (1..=goals).fold(1.0_f64, |acc, n| acc * lambda / n as f64);
    numer * (-lambda).exp()
}
