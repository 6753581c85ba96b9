//! Text polarity scoring
//!
//! A small generic polarity model plus a trading-domain lexicon. Domain hits
//! nudge the generic score by +/-0.1 each; the result stays in [-1, 1].

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;

lazy_static! {
    static ref TOKEN_RE: Regex = Regex::new(r"[a-z']+").expect("valid token regex");

    static ref POSITIVE: HashSet<&'static str> = [
        "good", "great", "strong", "beat", "beats", "up", "gain", "gains", "growth",
        "positive", "bullish", "buy", "upgrade", "upgraded", "outperform", "record",
        "surge", "rally", "win", "winner", "profit", "profitable", "soar", "soars",
        "jump", "jumps", "higher", "best", "love", "like", "excellent", "solid",
    ]
    .into_iter()
    .collect();

    static ref NEGATIVE: HashSet<&'static str> = [
        "bad", "weak", "miss", "missed", "down", "loss", "losses", "decline",
        "negative", "bearish", "sell", "downgrade", "downgraded", "underperform",
        "drop", "drops", "plunge", "plunges", "fall", "falls", "lower", "worst",
        "fear", "risk", "warning", "crash", "fail", "fails", "lawsuit", "fraud",
    ]
    .into_iter()
    .collect();

    /// Domain terms that lean bullish for a low-float momentum name
    static ref DOMAIN_BULLISH: HashSet<&'static str> = [
        "breakout", "squeeze", "moon", "rocket", "catalyst", "accumulation",
        "oversold", "undervalued", "momentum", "volume",
    ]
    .into_iter()
    .collect();

    /// Domain terms that lean bearish
    static ref DOMAIN_BEARISH: HashSet<&'static str> = [
        "dilution", "offering", "bankruptcy", "delisting", "halt", "halted",
        "overbought", "pump", "bagholder", "shorted",
    ]
    .into_iter()
    .collect();
}

/// Result of scoring a piece of text
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextScore {
    /// Polarity in [-1, 1]
    pub score: f64,
    /// Confidence in [0, 1], driven by how many scored tokens were found
    pub confidence: f64,
}

/// Score free-form text. Neutral zero-confidence when nothing matches.
pub fn score_text(text: &str) -> TextScore {
    let lowered = text.to_lowercase();
    let tokens: Vec<&str> = TOKEN_RE.find_iter(&lowered).map(|m| m.as_str()).collect();
    if tokens.is_empty() {
        return TextScore {
            score: 0.0,
            confidence: 0.0,
        };
    }

    let mut positive = 0usize;
    let mut negative = 0usize;
    let mut domain_adjust = 0.0;

    for token in &tokens {
        if POSITIVE.contains(token) {
            positive += 1;
        }
        if NEGATIVE.contains(token) {
            negative += 1;
        }
        if DOMAIN_BULLISH.contains(token) {
            domain_adjust += 0.1;
        }
        if DOMAIN_BEARISH.contains(token) {
            domain_adjust -= 0.1;
        }
    }

    let hits = positive + negative;
    let base = if hits > 0 {
        (positive as f64 - negative as f64) / hits as f64
    } else {
        0.0
    };
    let score = (base + domain_adjust).clamp(-1.0, 1.0);

    // Confidence grows with matched density, saturating quickly
    let matched = hits as f64 + (domain_adjust.abs() / 0.1);
    let confidence = (matched / 5.0).min(1.0);

    TextScore { score, confidence }
}
