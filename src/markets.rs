use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProbKey {
    #[serde(rename = "home_win")]
    HomeWin,
    #[serde(rename = "draw")]
    Draw,
    #[serde(rename = "away_win")]
    AwayWin,
    #[serde(rename = "over_2_5")]
    Over25,
    #[serde(rename = "under_2_5")]
    Under25,
    #[serde(rename = "btts_yes")]
    BttsYes,
    #[serde(rename = "btts_no")]
    BttsNo,
}

impl ProbKey {
    pub const ALL: [ProbKey; 7] = [
        ProbKey::HomeWin,
        ProbKey::Draw,
        ProbKey::AwayWin,
        ProbKey::Over25,
        ProbKey::Under25,
        ProbKey::BttsYes,
        ProbKey::BttsNo,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProbKey::HomeWin => "home_win",
            ProbKey::Draw => "draw",
            ProbKey::AwayWin => "away_win",
            ProbKey::Over25 => "over_2_5",
            ProbKey::Under25 => "under_2_5",
            ProbKey::BttsYes => "btts_yes",
            ProbKey::BttsNo => "btts_no",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL.into_iter().find(|k| k.as_str() == raw)
    }
}

/// Mutually exclusive outcome groups; each must sum to one.
pub const GROUP_1X2: [ProbKey; 3] = [ProbKey::HomeWin, ProbKey::Draw, ProbKey::AwayWin];
pub const GROUP_OU25: [ProbKey; 2] = [ProbKey::Over25, ProbKey::Under25];
pub const GROUP_BTTS: [ProbKey; 2] = [ProbKey::BttsYes, ProbKey::BttsNo];

/// Aggregate market probabilities for one match.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MarketProbs {
    pub home_win: f64,
    pub draw: f64,
    pub away_win: f64,
    pub over_2_5: f64,
    pub under_2_5: f64,
    pub btts_yes: f64,
    pub btts_no: f64,
}

impl MarketProbs {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn get(&self, key: ProbKey) -> f64 {
        match key {
            ProbKey::HomeWin => self.home_win,
            ProbKey::Draw => self.draw,
            ProbKey::AwayWin => self.away_win,
            ProbKey::Over25 => self.over_2_5,
            ProbKey::Under25 => self.under_2_5,
            ProbKey::BttsYes => self.btts_yes,
            ProbKey::BttsNo => self.btts_no,
        }
    }

    pub fn set(&mut self, key: ProbKey, value: f64) {
        let slot = match key {
            ProbKey::HomeWin => &mut self.home_win,
            ProbKey::Draw => &mut self.draw,
            ProbKey::AwayWin => &mut self.away_win,
            ProbKey::Over25 => &mut self.over_2_5,
            ProbKey::Under25 => &mut self.under_2_5,
            ProbKey::BttsYes => &mut self.btts_yes,
            ProbKey::BttsNo => &mut self.btts_no,
        };
        *slot = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProbKey, f64)> + '_ {
        ProbKey::ALL.into_iter().map(|k| (k, self.get(k)))
    }

    /// Divides each key of `group` by the group sum; no-op when the sum is not positive.
    pub fn renormalize_group(&mut self, group: &[ProbKey]) {
        let sum: f64 = group.iter().map(|k| self.get(*k)).sum();
        if sum <= 0.0 {
            return;
        }
        for key in group {
            let v = self.get(*key);
            self.set(*key, v / sum);
        }
    }

    pub fn renormalize(&mut self) {
        self.renormalize_group(&GROUP_1X2);
        self.renormalize_group(&GROUP_OU25);
        self.renormalize_group(&GROUP_BTTS);
    }
}

/// Maps a bookmaker `(market, selection)` pair onto a probability key.
pub fn prob_key_for(market: &str, selection: &str) -> Option<ProbKey> {
    let market = market.trim().to_ascii_uppercase();
    let selection = selection.trim().to_ascii_uppercase();
    match (market.as_str(), selection.as_str()) {
        ("1X2", "HOME") => Some(ProbKey::HomeWin),
        ("1X2", "DRAW") => Some(ProbKey::Draw),
        ("1X2", "AWAY") => Some(ProbKey::AwayWin),
        ("OU_2.5", "OVER") => Some(ProbKey::Over25),
        ("OU_2.5", "UNDER") => Some(ProbKey::Under25),
        ("BTTS", "YES") => Some(ProbKey::BttsYes),
        ("BTTS", "NO") => Some(ProbKey::BttsNo),
        _ => None,
    }
}

/// Correlation family used to keep at most one pick per family.
pub fn market_family(market: &str) -> String {
    let market = market.trim().to_ascii_uppercase();
    if market == "1X2" {
        "RESULT".to_string()
    } else if market.starts_with("OU_") {
        "TOTALS".to_string()
    } else if market == "BTTS" {
        "BTTS".to_string()
    } else {
        market
    }
}

/// Goal-based markets are treated as noisier than 1X2.
pub fn is_goal_market(market: &str) -> bool {
    matches!(
        market.trim().to_ascii_uppercase().as_str(),
        "OU_2.5" | "BTTS"
    )
}

/// Margin-free implied probabilities for a full 1X2 triple.
pub fn implied_probs_1x2(odds_home: f64, odds_draw: f64, odds_away: f64) -> MarketProbs {
    let mut out = MarketProbs::zero();
    let Some(p) = demargin(&[odds_home, odds_draw, odds_away]) else {
        return out;
    };
    out.home_win = p[0];
    out.draw = p[1];
    out.away_win = p[2];
    out
}

/// Margin-free implied probabilities for an over/under 2.5 pair.
pub fn implied_probs_ou25(odds_over: f64, odds_under: f64) -> MarketProbs {
    let mut out = MarketProbs::zero();
    let Some(p) = demargin(&[odds_over, odds_under]) else {
        return out;
    };
    out.over_2_5 = p[0];
    out.under_2_5 = p[1];
    out
}

fn demargin(odds: &[f64]) -> Option<Vec<f64>> {
    if odds.iter().any(|o| !o.is_finite() || *o <= 1.0) {
        return None;
    }
    let inv: Vec<f64> = odds.iter().map(|o| 1.0 / o).collect();
    let sum: f64 = inv.iter().sum();
    if sum <= 0.0 {
        return None;
    }
    Some(inv.into_iter().map(|v| v / sum).collect())
}
