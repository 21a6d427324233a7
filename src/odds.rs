use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::markets::{self, MarketProbs};

/// One bookmaker price for one market selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsQuote {
    pub bookmaker: String,
    pub market: String,
    pub selection: String,
    pub odds_decimal: f64,
    // Raw timestamp as supplied; parsed lazily so bad values never reject the quote.
    #[serde(default, alias = "retrieved_at_utc")]
    pub retrieved_at: Option<String>,
}

impl OddsQuote {
    pub fn new(bookmaker: &str, market: &str, selection: &str, odds_decimal: f64) -> Self {
        Self {
            bookmaker: bookmaker.to_string(),
            market: market.to_string(),
            selection: selection.to_string(),
            odds_decimal,
            retrieved_at: None,
        }
    }

    pub fn retrieved(mut self, at: DateTime<Utc>) -> Self {
        self.retrieved_at = Some(at.to_rfc3339());
        self
    }

    pub fn retrieved_at_utc(&self) -> Option<DateTime<Utc>> {
        self.retrieved_at.as_deref().and_then(parse_utc)
    }

    pub fn market_key(&self) -> String {
        self.market.trim().to_ascii_uppercase()
    }

    pub fn selection_key(&self) -> String {
        self.selection.trim().to_ascii_uppercase()
    }
}

/// RFC 3339 first, then naive ISO forms read as UTC.
pub fn parse_utc(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Drops quotes older than `max_age_hours`; undated or unparseable quotes stay.
pub fn fresh_quotes<'a>(
    quotes: &'a [OddsQuote],
    now: DateTime<Utc>,
    max_age_hours: f64,
) -> (Vec<&'a OddsQuote>, usize) {
    let mut fresh = Vec::with_capacity(quotes.len());
    let mut stale = 0usize;
    for q in quotes {
        let Some(at) = q.retrieved_at_utc() else {
            fresh.push(q);
            continue;
        };
        let age_hours = (now - at).num_milliseconds() as f64 / 3_600_000.0;
        if age_hours > max_age_hours {
            stale += 1;
            debug!(bookmaker = %q.bookmaker, market = %q.market, age_hours, "stale quote dropped");
            continue;
        }
        fresh.push(q);
    }
    (fresh, stale)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionStats {
    pub consensus_odds: f64,
    pub best_odds: f64,
    pub bookmakers: usize,
    pub implied_prob: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MarketStats {
    pub overround: f64,
    pub selections: BTreeMap<String, SelectionStats>,
}

/// Cross-bookmaker consensus for every market in a quote batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MarketBook {
    markets: BTreeMap<String, MarketStats>,
}

impl MarketBook {
    pub fn from_quotes<'a>(quotes: impl IntoIterator<Item = &'a OddsQuote>) -> Self {
        let mut prices: BTreeMap<String, BTreeMap<String, Vec<f64>>> = BTreeMap::new();
        for q in quotes {
            if !(q.odds_decimal > 1.0) {
                continue;
            }
            prices
                .entry(q.market_key())
                .or_default()
                .entry(q.selection_key())
                .or_default()
                .push(q.odds_decimal);
        }

        let markets = prices
            .into_iter()
            .map(|(market, by_sel)| {
                let mut selections: BTreeMap<String, SelectionStats> = by_sel
                    .into_iter()
                    .map(|(sel, mut odds)| {
                        odds.sort_by(f64::total_cmp);
                        let stats = SelectionStats {
                            consensus_odds: median_sorted(&odds),
                            best_odds: odds[odds.len() - 1],
                            bookmakers: odds.len(),
                            implied_prob: None,
                        };
                        (sel, stats)
                    })
                    .collect();
                let overround: f64 = selections.values().map(|s| 1.0 / s.consensus_odds).sum();
                if overround > 0.0 {
                    for stats in selections.values_mut() {
                        stats.implied_prob = Some((1.0 / stats.consensus_odds) / overround);
                    }
                }
                (
                    market,
                    MarketStats {
                        overround,
                        selections,
                    },
                )
            })
            .collect();

        Self { markets }
    }

    pub fn market(&self, market: &str) -> Option<&MarketStats> {
        self.markets.get(&market.trim().to_ascii_uppercase())
    }

    pub fn selection(&self, market: &str, selection: &str) -> Option<&SelectionStats> {
        self.market(market)?
            .selections
            .get(&selection.trim().to_ascii_uppercase())
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }

    /// Margin-free consensus probabilities from complete 1X2 and OU_2.5 books; `None` when neither is complete.
    pub fn implied_probs(&self) -> Option<MarketProbs> {
        let consensus = |market: &str, selection: &str| {
            self.selection(market, selection).map(|s| s.consensus_odds)
        };
        let mut out = MarketProbs::zero();
        let mut complete = false;
        if let (Some(home), Some(draw), Some(away)) = (
            consensus("1X2", "HOME"),
            consensus("1X2", "DRAW"),
            consensus("1X2", "AWAY"),
        ) {
            let p = markets::implied_probs_1x2(home, draw, away);
            out.home_win = p.home_win;
            out.draw = p.draw;
            out.away_win = p.away_win;
            complete = true;
        }
        if let (Some(over), Some(under)) = (consensus("OU_2.5", "OVER"), consensus("OU_2.5", "UNDER")) {
            let p = markets::implied_probs_ou25(over, under);
            out.over_2_5 = p.over_2_5;
            out.under_2_5 = p.under_2_5;
            complete = true;
        }
        complete.then_some(out)
    }
}

fn median_sorted(values: &[f64]) -> f64 {
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    #[test]
    fn parses_common_timestamp_shapes() {
        let expected = Utc.with_ymd_and_hms(2025, 3, 1, 18, 30, 0).unwrap();
        assert_eq!(parse_utc("2025-03-01T18:30:00Z"), Some(expected));
        assert_eq!(parse_utc("2025-03-01T19:30:00+01:00"), Some(expected));
        assert_eq!(parse_utc("2025-03-01T18:30:00"), Some(expected));
        assert_eq!(parse_utc("2025-03-01 18:30:00"), Some(expected));
        assert_eq!(parse_utc("yesterday"), None);
    }

    #[test]
    fn freshness_keeps_undated_and_unparseable() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let mut bad = OddsQuote::new("b3", "1X2", "HOME", 2.1);
        bad.retrieved_at = Some("not a date".to_string());
        let quotes = vec![
            OddsQuote::new("b1", "1X2", "HOME", 2.0).retrieved(now - Duration::hours(13)),
            OddsQuote::new("b2", "1X2", "HOME", 2.0).retrieved(now - Duration::hours(2)),
            bad,
            OddsQuote::new("b4", "1X2", "HOME", 2.0),
        ];
        let (fresh, stale) = fresh_quotes(&quotes, now, 12.0);
        assert_eq!(stale, 1);
        let books: Vec<&str> = fresh.iter().map(|q| q.bookmaker.as_str()).collect();
        assert_eq!(books, vec!["b2", "b3", "b4"]);
    }

    #[test]
    fn book_uses_median_consensus_and_max_best() {
        let quotes = vec![
            OddsQuote::new("a", "1X2", "HOME", 2.0),
            OddsQuote::new("b", "1x2", "home", 2.2),
            OddsQuote::new("c", "1X2", "HOME", 2.1),
            OddsQuote::new("d", "1X2", "HOME", 2.4),
            OddsQuote::new("a", "1X2", "DRAW", 3.4),
            OddsQuote::new("a", "1X2", "AWAY", 3.6),
            OddsQuote::new("z", "1X2", "AWAY", 1.0),
        ];
        let book = MarketBook::from_quotes(&quotes);
        let home = book.selection("1X2", "HOME").unwrap();
        assert!((home.consensus_odds - 2.15).abs() < 1e-12);
        assert_eq!(home.best_odds, 2.4);
        assert_eq!(home.bookmakers, 4);
        assert_eq!(book.selection("1X2", "AWAY").unwrap().bookmakers, 1);

        let overround = 1.0 / 2.15 + 1.0 / 3.4 + 1.0 / 3.6;
        assert!((book.market("1X2").unwrap().overround - overround).abs() < 1e-12);
        let implied_sum: f64 = book
            .market("1X2")
            .unwrap()
            .selections
            .values()
            .filter_map(|s| s.implied_prob)
            .sum();
        assert!((implied_sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn implied_probs_need_a_complete_book() {
        let partial = MarketBook::from_quotes(&[
            OddsQuote::new("a", "1X2", "HOME", 2.0),
            OddsQuote::new("a", "1X2", "DRAW", 3.4),
            OddsQuote::new("a", "OU_2.5", "OVER", 1.9),
        ]);
        assert_eq!(partial.implied_probs(), None);

        let quotes = vec![
            OddsQuote::new("a", "1X2", "HOME", 2.0),
            OddsQuote::new("b", "1X2", "HOME", 2.2),
            OddsQuote::new("a", "1X2", "DRAW", 3.4),
            OddsQuote::new("a", "1X2", "AWAY", 3.8),
            OddsQuote::new("a", "OU_2.5", "OVER", 1.9),
            OddsQuote::new("a", "OU_2.5", "UNDER", 1.9),
        ];
        let p = MarketBook::from_quotes(&quotes).implied_probs().unwrap();
        let expected = markets::implied_probs_1x2(2.1, 3.4, 3.8);
        assert!((p.home_win - expected.home_win).abs() < 1e-12);
        assert!((p.home_win + p.draw + p.away_win - 1.0).abs() < 1e-12);
        assert!((p.over_2_5 - 0.5).abs() < 1e-12);
        assert_eq!(p.btts_yes, 0.0);
    }
}
