use chrono::{DateTime, Duration, TimeZone, Utc};

use matchday_edge::engine::{
    self, MAX_STAKE_FRACTION, MIN_STAKE_FRACTION, NoBetReason, ReasonCode, evaluate_markets,
};
use matchday_edge::markets::{self, MarketProbs};
use matchday_edge::odds::OddsQuote;
use matchday_edge::rules::MarketRules;
use matchday_edge::scoreline::{DEFAULT_GOAL_CAP, GoalRates, match_probs};
use matchday_edge::simulation::{Intervals, intervals_for};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 8, 12, 0, 0).unwrap()
}

fn model() -> (MarketProbs, Intervals) {
    let probs = match_probs(GoalRates::independent(1.6, 1.1), DEFAULT_GOAL_CAP);
    let intervals = intervals_for(&probs, 20_000);
    (probs, intervals)
}

fn quote(book: &str, market: &str, selection: &str, odds: f64) -> OddsQuote {
    OddsQuote::new(book, market, selection, odds).retrieved(now() - Duration::hours(1))
}

fn full_1x2(book: &str) -> Vec<OddsQuote> {
    vec![
        quote(book, "1X2", "HOME", 2.3),
        quote(book, "1X2", "DRAW", 3.4),
        quote(book, "1X2", "AWAY", 3.6),
    ]
}

#[test]
fn home_quote_at_2_3_is_recommended() {
    let (probs, intervals) = model();
    let out = evaluate_markets(&probs, &intervals, &full_1x2("bk1"), 1000.0, &MarketRules::default(), now());

    assert!(out.no_bet.is_none());
    assert_eq!(out.recommendations.len(), 1);
    let rec = &out.recommendations[0];
    assert_eq!(rec.bet_id, "1X2:HOME:bk1");
    assert!((rec.expected_edge - (probs.home_win * 2.3 - 1.0)).abs() < 1e-12);
    assert!(rec.expected_edge > 0.03);
    // kelly_fraction * kelly exceeds the 0.02 caps at this price.
    assert!((rec.stake_fraction - 0.02).abs() < 1e-12);
    assert!((rec.stake_amount - 20.0).abs() < 1e-9);

    let draw = out.evaluated.iter().find(|e| e.selection == "DRAW").unwrap();
    assert!(draw.has(ReasonCode::EdgeBelowThreshold));
    assert!(draw.has(ReasonCode::KellyNonPositive));
}

#[test]
fn stale_odds_are_a_bare_no_bet() {
    let (probs, intervals) = model();
    let stale: Vec<OddsQuote> = full_1x2("bk1")
        .into_iter()
        .map(|q| q.retrieved(now() - Duration::hours(13)))
        .collect();
    let out = evaluate_markets(&probs, &intervals, &stale, 1000.0, &MarketRules::default(), now());

    assert!(out.evaluated.is_empty());
    assert!(out.recommendations.is_empty());
    let no_bet = out.no_bet.unwrap();
    assert_eq!(no_bet.reason_codes, vec![NoBetReason::MissingOrStaleOdds]);
}

#[test]
fn stale_quotes_never_reach_evaluated_items() {
    let (probs, intervals) = model();
    let mut quotes = full_1x2("fresh");
    quotes.push(quote("old", "1X2", "HOME", 2.5).retrieved(now() - Duration::hours(20)));
    let out = evaluate_markets(&probs, &intervals, &quotes, 1000.0, &MarketRules::default(), now());

    assert_eq!(out.evaluated.len(), 3);
    assert!(out.evaluated.iter().all(|e| e.bookmaker != "old"));
}

#[test]
fn picks_are_diversified_and_bounded() {
    let probs = MarketProbs {
        home_win: 0.55,
        draw: 0.25,
        away_win: 0.20,
        over_2_5: 0.60,
        under_2_5: 0.40,
        btts_yes: 0.58,
        btts_no: 0.42,
    };
    let intervals = intervals_for(&probs, 20_000);
    let mut quotes = Vec::new();
    for book in ["a", "b"] {
        quotes.extend([
            quote(book, "1X2", "HOME", 2.0),
            quote(book, "1X2", "DRAW", 4.2),
            quote(book, "1X2", "AWAY", 5.5),
            quote(book, "OU_2.5", "OVER", 1.85),
            quote(book, "OU_2.5", "UNDER", 2.15),
            quote(book, "BTTS", "YES", 1.9),
            quote(book, "BTTS", "NO", 2.0),
        ]);
    }

    for max_picks in 0..=4 {
        let rules = MarketRules {
            max_picks,
            ..MarketRules::default()
        };
        let out = evaluate_markets(&probs, &intervals, &quotes, 1000.0, &rules, now());
        assert!(out.recommendations.len() <= max_picks);
        let mut families: Vec<String> = out
            .recommendations
            .iter()
            .map(|r| markets::market_family(&r.market))
            .collect();
        let total = families.len();
        families.sort();
        families.dedup();
        assert_eq!(families.len(), total, "duplicate family with max_picks={max_picks}");
        assert_eq!(out.no_bet.is_some(), out.recommendations.is_empty());
    }
}

#[test]
fn stake_never_exceeds_its_caps() {
    let rules = MarketRules::default();
    let bound = rules
        .stake_cap_fraction
        .min(engine::dynamic_stake_cap(2.0))
        .min(rules.kelly_fraction * engine::kelly(0.55, 2.0));
    let stake = engine::stake_fraction(&rules, 0.55, 2.0);
    assert!(stake <= bound + 1e-12);
    assert!(stake <= MAX_STAKE_FRACTION);

    let loose = MarketRules {
        stake_cap_fraction: 0.5,
        kelly_fraction: 1.0,
        ..MarketRules::default()
    };
    for odds in [1.3, 1.8, 2.4, 3.5, 8.0] {
        let stake = engine::stake_fraction(&loose, 0.9, odds);
        assert!(stake <= engine::dynamic_stake_cap(odds) + 1e-12);
    }
}

#[test]
fn tiny_stakes_are_dropped() {
    let probs = MarketProbs {
        home_win: 0.505,
        draw: 0.25,
        away_win: 0.245,
        ..MarketProbs::zero()
    };
    let intervals = intervals_for(&probs, 100_000);
    let quotes = vec![
        quote("a", "1X2", "HOME", 2.1),
        quote("a", "1X2", "DRAW", 3.8),
        quote("a", "1X2", "AWAY", 4.0),
    ];
    let rules = MarketRules {
        kelly_fraction: 0.04,
        ..MarketRules::default()
    };
    let out = evaluate_markets(&probs, &intervals, &quotes, 1000.0, &rules, now());
    let home = out.evaluated.iter().find(|e| e.selection == "HOME").unwrap();
    assert!(engine::stake_fraction(&rules, 0.505, 2.1) < MIN_STAKE_FRACTION);
    assert!(home.has(ReasonCode::StakeTooSmall));
    assert_eq!(out.no_bet.unwrap().reason_codes, vec![NoBetReason::NoEdgeOrHighUncertainty]);
}

#[test]
fn goal_market_divergence_is_hard_blocked() {
    let (probs, intervals) = model();
    let quotes = vec![
        quote("a", "OU_2.5", "OVER", 3.0),
        quote("a", "OU_2.5", "UNDER", 1.4),
    ];
    let out = evaluate_markets(&probs, &intervals, &quotes, 1000.0, &MarketRules::default(), now());
    let over = out.evaluated.iter().find(|e| e.selection == "OVER").unwrap();
    assert!(over.uncertainty_flag);
    assert!(over.has(ReasonCode::ModelMarketDivergence));
    assert!(over.has(ReasonCode::DivergenceHardBlock));
    assert!(out.recommendations.is_empty());
}

#[test]
fn unmapped_markets_only() {
    let (probs, intervals) = model();
    let quotes = vec![quote("a", "ASIAN_HANDICAP", "HOME_-0.5", 1.9)];
    let out = evaluate_markets(&probs, &intervals, &quotes, 1000.0, &MarketRules::default(), now());
    assert!(out.evaluated[0].has(ReasonCode::NoMappingForMarket));
    assert_eq!(out.no_bet.unwrap().reason_codes, vec![NoBetReason::NoMappedMarkets]);
}

#[test]
fn match_result_divergence_is_soft_and_wide_intervals_stay_uncertain() {
    let probs = match_probs(GoalRates::independent(1.6, 1.1), DEFAULT_GOAL_CAP);
    let intervals = intervals_for(&probs, 100);
    let quotes = vec![
        quote("a", "1X2", "HOME", 1.4),
        quote("a", "1X2", "DRAW", 4.5),
        quote("a", "1X2", "AWAY", 7.0),
    ];
    let out = evaluate_markets(&probs, &intervals, &quotes, 1000.0, &MarketRules::default(), now());

    let home = out.evaluated.iter().find(|e| e.selection == "HOME").unwrap();
    assert!(home.has(ReasonCode::ModelMarketDivergence));
    assert!(!home.has(ReasonCode::DivergenceHardBlock));
    assert!(home.has(ReasonCode::HighUncertaintyCi));
    assert!(home.uncertainty_flag);

    // Positive edge, no divergence, but the interval alone keeps it out.
    let draw = out.evaluated.iter().find(|e| e.selection == "DRAW").unwrap();
    assert!(draw.edge.unwrap() > 0.03);
    assert!(!draw.has(ReasonCode::ModelMarketDivergence));
    assert!(draw.has(ReasonCode::HighUncertaintyCi));
    assert!(draw.uncertainty_flag);

    assert!(out.recommendations.is_empty());
    assert_eq!(out.no_bet.unwrap().reason_codes, vec![NoBetReason::NoEdgeOrHighUncertainty]);
}

#[test]
fn only_the_best_line_is_staked() {
    let (probs, intervals) = model();
    let mut quotes = full_1x2("low");
    quotes.extend([
        quote("high", "1X2", "HOME", 2.4),
        quote("high", "1X2", "DRAW", 3.4),
        quote("high", "1X2", "AWAY", 3.6),
    ]);
    let out = evaluate_markets(&probs, &intervals, &quotes, 1000.0, &MarketRules::default(), now());

    let low = out
        .evaluated
        .iter()
        .find(|e| e.selection == "HOME" && e.bookmaker == "low")
        .unwrap();
    assert!(low.has(ReasonCode::NotBestLine));
    let high = out
        .evaluated
        .iter()
        .find(|e| e.selection == "HOME" && e.bookmaker == "high")
        .unwrap();
    assert!(!high.has(ReasonCode::NotBestLine));
    assert_eq!(high.bookmakers_count, Some(2));
    assert!(out.evaluated.iter().filter(|e| e.selection == "DRAW").all(|e| !e.has(ReasonCode::NotBestLine)));

    assert_eq!(out.recommendations.len(), 1);
    assert_eq!(out.recommendations[0].bet_id, "1X2:HOME:high");
}

#[test]
fn odds_cap_blocks_prices_above_it() {
    let (probs, intervals) = model();
    let rules = MarketRules {
        max_odds: Some(3.5),
        ..MarketRules::default()
    };
    let out = evaluate_markets(&probs, &intervals, &full_1x2("bk1"), 1000.0, &rules, now());

    let away = out.evaluated.iter().find(|e| e.selection == "AWAY").unwrap();
    assert!(away.has(ReasonCode::OddsAboveCap));
    let home = out.evaluated.iter().find(|e| e.selection == "HOME").unwrap();
    assert!(!home.has(ReasonCode::OddsAboveCap));
    assert_eq!(out.recommendations[0].bet_id, "1X2:HOME:bk1");
}

#[test]
fn thin_markets_are_low_liquidity() {
    let (probs, intervals) = model();
    let rules = MarketRules {
        min_books: 2,
        ..MarketRules::default()
    };

    let single = evaluate_markets(&probs, &intervals, &full_1x2("bk1"), 1000.0, &rules, now());
    assert!(single.evaluated.iter().all(|e| e.has(ReasonCode::LowLiquidity)));
    assert!(single.recommendations.is_empty());

    let mut quotes = full_1x2("bk1");
    quotes.extend(full_1x2("bk2"));
    let deep = evaluate_markets(&probs, &intervals, &quotes, 1000.0, &rules, now());
    assert!(deep.evaluated.iter().all(|e| !e.has(ReasonCode::LowLiquidity)));
    assert_eq!(deep.recommendations.len(), 1);
    assert_eq!(deep.recommendations[0].market, "1X2");
}

#[test]
fn longshots_need_a_bigger_edge() {
    let probs = MarketProbs {
        home_win: 0.53,
        draw: 0.26,
        away_win: 0.21,
        ..MarketProbs::zero()
    };
    let intervals = intervals_for(&probs, 100_000);
    let quotes = vec![
        quote("a", "1X2", "HOME", 1.9),
        quote("a", "1X2", "DRAW", 3.9),
        quote("a", "1X2", "AWAY", 5.0),
    ];
    let out = evaluate_markets(&probs, &intervals, &quotes, 1000.0, &MarketRules::default(), now());

    let away = out.evaluated.iter().find(|e| e.selection == "AWAY").unwrap();
    let edge = away.edge.unwrap();
    assert!((0.03..0.08).contains(&edge));
    assert!(!away.has(ReasonCode::EdgeBelowThreshold));
    assert!(away.has(ReasonCode::EdgeBelowLongshotThreshold));
    assert!(!away.uncertainty_flag);
    assert!(out.recommendations.iter().all(|r| r.selection != "AWAY"));
}
