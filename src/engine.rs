//! Market decision engine: prices each bookmaker quote against model
//! probabilities, gates it, sizes a capped fractional-Kelly stake and picks a
//! diversified set of recommendations (or a no-bet verdict).

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::markets::{self, MarketProbs, ProbKey};
use crate::odds::{self, MarketBook, OddsQuote};
use crate::rules::MarketRules;
use crate::simulation::Intervals;

/// Hard ceiling on any single stake, as a fraction of bankroll.
pub const MAX_STAKE_FRACTION: f64 = 0.05;
/// Stakes below this fraction are noise and get dropped.
pub const MIN_STAKE_FRACTION: f64 = 0.0025;
const BEST_LINE_EPS: f64 = 1e-6;

/// Per-quote audit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    NoMappingForMarket,
    ModelMarketDivergence,
    DivergenceHardBlock,
    HighUncertaintyCi,
    EdgeBelowThreshold,
    EdgeBelowLongshotThreshold,
    NotBestLine,
    OddsAboveCap,
    LowLiquidity,
    KellyNonPositive,
    StakeTooSmall,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::NoMappingForMarket => "NO_MAPPING_FOR_MARKET",
            ReasonCode::ModelMarketDivergence => "MODEL_MARKET_DIVERGENCE",
            ReasonCode::DivergenceHardBlock => "DIVERGENCE_HARD_BLOCK",
            ReasonCode::HighUncertaintyCi => "HIGH_UNCERTAINTY_CI",
            ReasonCode::EdgeBelowThreshold => "EDGE_BELOW_THRESHOLD",
            ReasonCode::EdgeBelowLongshotThreshold => "EDGE_BELOW_LONGSHOT_THRESHOLD",
            ReasonCode::NotBestLine => "NOT_BEST_LINE",
            ReasonCode::OddsAboveCap => "ODDS_ABOVE_CAP",
            ReasonCode::LowLiquidity => "LOW_LIQUIDITY",
            ReasonCode::KellyNonPositive => "KELLY_NON_POSITIVE",
            ReasonCode::StakeTooSmall => "STAKE_TOO_SMALL",
        }
    }
}

/// Any of these keeps a quote out of staking.
const BLOCKING: [ReasonCode; 8] = [
    ReasonCode::EdgeBelowThreshold,
    ReasonCode::EdgeBelowLongshotThreshold,
    ReasonCode::KellyNonPositive,
    ReasonCode::ModelMarketDivergence,
    ReasonCode::DivergenceHardBlock,
    ReasonCode::NotBestLine,
    ReasonCode::OddsAboveCap,
    ReasonCode::LowLiquidity,
];

/// Whole-evaluation verdict codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoBetReason {
    MissingOrStaleOdds,
    NoMappedMarkets,
    NoEdgeOrHighUncertainty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoBet {
    pub reason_codes: Vec<NoBetReason>,
    pub explanation: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MarketEvalItem {
    pub market: String,
    pub selection: String,
    pub bookmaker: String,
    pub odds_decimal: f64,
    pub prob_key: Option<ProbKey>,
    pub fair_prob: Option<f64>,
    pub fair_odds: Option<f64>,
    pub edge: Option<f64>,
    pub ev_per_unit: Option<f64>,
    pub implied_prob: Option<f64>,
    pub market_overround: Option<f64>,
    pub consensus_odds: Option<f64>,
    pub bookmakers_count: Option<usize>,
    pub line_value_pct: Option<f64>,
    pub ci_width: Option<f64>,
    pub kelly: Option<f64>,
    pub confidence: Option<f64>,
    pub uncertainty_flag: bool,
    pub reasons: Vec<ReasonCode>,
}

impl MarketEvalItem {
    fn from_quote(q: &OddsQuote) -> Self {
        Self {
            market: q.market_key(),
            selection: q.selection_key(),
            bookmaker: q.bookmaker.clone(),
            odds_decimal: q.odds_decimal,
            ..Self::default()
        }
    }

    pub fn has(&self, code: ReasonCode) -> bool {
        self.reasons.contains(&code)
    }

    fn flag(&mut self, code: ReasonCode) {
        self.reasons.push(code);
    }

    // Sticky within one pass: never cleared once raised.
    fn mark_uncertain(&mut self) {
        self.uncertainty_flag = true;
    }

    fn is_stakeable(&self) -> bool {
        !self.uncertainty_flag && !BLOCKING.iter().any(|c| self.has(*c))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub bet_id: String,
    pub market: String,
    pub selection: String,
    pub bookmaker: String,
    pub odds_decimal: f64,
    pub stake_fraction: f64,
    pub stake_amount: f64,
    pub expected_edge: f64,
    pub expected_ev_per_unit: f64,
    pub confidence: Option<f64>,
    pub line_value_pct: Option<f64>,
    pub consensus_odds: Option<f64>,
    pub rationale: Vec<String>,
}

/// Result of one evaluation pass; `no_bet` is set exactly when `recommendations` is empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub evaluated: Vec<MarketEvalItem>,
    pub recommendations: Vec<Recommendation>,
    pub no_bet: Option<NoBet>,
}

impl Evaluation {
    fn no_bet(evaluated: Vec<MarketEvalItem>, reason: NoBetReason, explanation: Vec<String>) -> Self {
        info!(?reason, evaluated = evaluated.len(), "no bet");
        Self {
            evaluated,
            recommendations: Vec::new(),
            no_bet: Some(NoBet {
                reason_codes: vec![reason],
                explanation,
            }),
        }
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    item_idx: usize,
    stake_fraction: f64,
    edge: f64,
}

pub fn kelly(p: f64, odds: f64) -> f64 {
    let b = odds - 1.0;
    if b <= 0.0 {
        return 0.0;
    }
    ((p * odds - 1.0) / b).max(0.0)
}

/// Lower prices get a lower stake ceiling.
pub fn dynamic_stake_cap(odds: f64) -> f64 {
    if odds < 1.60 {
        0.01
    } else if odds < 2.50 {
        0.02
    } else {
        0.03
    }
}

pub fn stake_fraction(rules: &MarketRules, p: f64, odds: f64) -> f64 {
    rules
        .stake_cap_fraction
        .min(dynamic_stake_cap(odds))
        .min(rules.kelly_fraction * kelly(p, odds))
        .clamp(0.0, MAX_STAKE_FRACTION)
}

/// Heuristic 0.1..=0.95 score, rounded to two decimals.
pub fn confidence_score(
    ci_width: Option<f64>,
    edge: f64,
    odds: f64,
    gap: Option<f64>,
    line_value_pct: Option<f64>,
    books: Option<usize>,
    rules: &MarketRules,
) -> f64 {
    let mut base = 0.5_f64;
    if let Some(width) = ci_width
        && rules.max_ci_width > 0.0
    {
        base = (1.0 - width / (rules.max_ci_width * 1.5)).clamp(0.1, 0.9);
    }

    if gap.is_some_and(|g| g > rules.max_model_market_gap) {
        base = base.min(0.2);
    }
    if odds >= rules.longshot_odds {
        base = base.min(0.25);
    }
    if edge < rules.min_edge {
        base = base.min(0.3);
    }

    match line_value_pct {
        Some(v) if v >= 0.02 => base = (base + 0.1).min(0.95),
        Some(v) if v <= -0.02 => base = (base - 0.1).max(0.1),
        _ => {}
    }
    match books {
        Some(n) if n >= 4 => base = (base + 0.05).min(0.95),
        Some(n) if n <= 1 => base = (base - 0.05).max(0.1),
        _ => {}
    }

    (base * 100.0).round() / 100.0
}

pub fn evaluate_markets(
    probs: &MarketProbs,
    intervals: &Intervals,
    quotes: &[OddsQuote],
    bankroll: f64,
    rules: &MarketRules,
    now: DateTime<Utc>,
) -> Evaluation {
    let (fresh, stale) = odds::fresh_quotes(quotes, now, rules.max_odds_age_hours);
    if fresh.is_empty() {
        return Evaluation::no_bet(
            Vec::new(),
            NoBetReason::MissingOrStaleOdds,
            vec![
                format!(
                    "No usable odds: {} quote(s) supplied, {stale} older than the freshness limit.",
                    quotes.len()
                ),
                format!("Rule: max_odds_age_hours={}", rules.max_odds_age_hours),
            ],
        );
    }

    let book = MarketBook::from_quotes(fresh.iter().copied());
    let mut evaluated = Vec::with_capacity(fresh.len());
    let mut candidates = Vec::new();

    for q in fresh {
        let mut item = evaluate_quote(q, probs, intervals, &book, rules);
        if item.is_stakeable() {
            let p = item.fair_prob.unwrap_or(0.0);
            let stake = stake_fraction(rules, p, item.odds_decimal);
            if stake < MIN_STAKE_FRACTION {
                item.flag(ReasonCode::StakeTooSmall);
            } else {
                candidates.push(Candidate {
                    item_idx: evaluated.len(),
                    stake_fraction: stake,
                    edge: item.edge.unwrap_or(0.0),
                });
            }
        }
        evaluated.push(item);
    }

    if candidates.is_empty() {
        if !evaluated.iter().any(|e| e.fair_prob.is_some()) {
            return Evaluation::no_bet(
                evaluated,
                NoBetReason::NoMappedMarkets,
                vec!["No quote belongs to a supported market (1X2, OU_2.5, BTTS).".to_string()],
            );
        }
        return Evaluation::no_bet(
            evaluated,
            NoBetReason::NoEdgeOrHighUncertainty,
            vec![
                format!(
                    "No selection passes the gates (min_edge={}, max_ci_width={}).",
                    rules.min_edge, rules.max_ci_width
                ),
                "No bet is the correct call when there is no real edge or uncertainty is high."
                    .to_string(),
            ],
        );
    }

    // EV per unit equals edge; stable sort keeps quote order on ties.
    candidates.sort_by(|a, b| b.edge.total_cmp(&a.edge));

    let mut used_families = HashSet::new();
    let mut recommendations = Vec::new();
    for c in candidates {
        if recommendations.len() >= rules.max_picks {
            break;
        }
        let item = &evaluated[c.item_idx];
        if !used_families.insert(markets::market_family(&item.market)) {
            continue;
        }
        debug!(market = %item.market, selection = %item.selection, edge = c.edge, stake = c.stake_fraction, "pick");
        recommendations.push(recommend(item, c.stake_fraction, bankroll));
    }

    if recommendations.is_empty() {
        return Evaluation::no_bet(
            evaluated,
            NoBetReason::NoEdgeOrHighUncertainty,
            vec![format!("Selection produced no pick (max_picks={}).", rules.max_picks)],
        );
    }

    Evaluation {
        evaluated,
        recommendations,
        no_bet: None,
    }
}

pub fn evaluate_markets_now(
    probs: &MarketProbs,
    intervals: &Intervals,
    quotes: &[OddsQuote],
    bankroll: f64,
    rules: &MarketRules,
) -> Evaluation {
    evaluate_markets(probs, intervals, quotes, bankroll, rules, Utc::now())
}

fn evaluate_quote(
    q: &OddsQuote,
    probs: &MarketProbs,
    intervals: &Intervals,
    book: &MarketBook,
    rules: &MarketRules,
) -> MarketEvalItem {
    let mut item = MarketEvalItem::from_quote(q);
    let Some(key) = markets::prob_key_for(&item.market, &item.selection) else {
        item.flag(ReasonCode::NoMappingForMarket);
        return item;
    };

    let odds = item.odds_decimal;
    let p = probs.get(key);
    let edge = p * odds - 1.0;
    item.prob_key = Some(key);
    item.fair_prob = Some(p);
    item.fair_odds = (p > 0.0).then(|| 1.0 / p);
    item.edge = Some(edge);
    item.ev_per_unit = Some(edge);

    let stats = book.selection(&item.market, &item.selection);
    item.implied_prob = stats.and_then(|s| s.implied_prob);
    item.market_overround = book.market(&item.market).map(|m| m.overround);
    item.consensus_odds = stats.map(|s| s.consensus_odds);
    item.bookmakers_count = stats.map(|s| s.bookmakers);
    item.line_value_pct = item.consensus_odds.map(|c| odds / c - 1.0);

    let gap = item.implied_prob.map(|implied| (p - implied).abs());
    if gap.is_some_and(|g| g > rules.max_model_market_gap) {
        item.flag(ReasonCode::ModelMarketDivergence);
        if markets::is_goal_market(&item.market) {
            item.flag(ReasonCode::DivergenceHardBlock);
        }
        item.mark_uncertain();
    }

    item.ci_width = intervals.get(&key).map(|ci| ci.width());
    if item.ci_width.is_some_and(|w| w > rules.max_ci_width) {
        item.mark_uncertain();
        item.flag(ReasonCode::HighUncertaintyCi);
    }

    if edge < rules.min_edge {
        item.flag(ReasonCode::EdgeBelowThreshold);
    }
    if odds >= rules.longshot_odds && edge < rules.min_edge_longshot {
        item.flag(ReasonCode::EdgeBelowLongshotThreshold);
    }
    if stats.is_some_and(|s| odds + BEST_LINE_EPS < s.best_odds) {
        item.flag(ReasonCode::NotBestLine);
    }
    if rules.max_odds.is_some_and(|cap| odds > cap) {
        item.flag(ReasonCode::OddsAboveCap);
    }
    if item.bookmakers_count.is_some_and(|n| n < rules.min_books) {
        item.flag(ReasonCode::LowLiquidity);
    }

    let k = kelly(p, odds);
    item.kelly = Some(k);
    if k <= 0.0 {
        item.flag(ReasonCode::KellyNonPositive);
    }

    item.confidence = Some(confidence_score(
        item.ci_width,
        edge,
        odds,
        gap,
        item.line_value_pct,
        item.bookmakers_count,
        rules,
    ));
    item
}

fn recommend(item: &MarketEvalItem, stake_fraction: f64, bankroll: f64) -> Recommendation {
    let edge = item.edge.unwrap_or(0.0);
    Recommendation {
        bet_id: format!("{}:{}:{}", item.market, item.selection, item.bookmaker),
        market: item.market.clone(),
        selection: item.selection.clone(),
        bookmaker: item.bookmaker.clone(),
        odds_decimal: item.odds_decimal,
        stake_fraction,
        stake_amount: stake_fraction * bankroll.max(0.0),
        expected_edge: edge,
        expected_ev_per_unit: item.ev_per_unit.unwrap_or(edge),
        confidence: item.confidence,
        line_value_pct: item.line_value_pct,
        consensus_odds: item.consensus_odds,
        rationale: vec![
            "fair probability taken from the scoreline model only".to_string(),
            "edge and EV computed from fair probability and quoted odds".to_string(),
            "stake sized by fractional Kelly under risk caps".to_string(),
            "line value measured against bookmaker consensus".to_string(),
        ],
    }
}
