//! Sentiment engine
//!
//! Fuses a lexicon polarity score with a score asked of the text-completion
//! service. The completion service is optional: any failure degrades to the
//! lexicon score and never blocks the caller.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::llm::TextCompletion;
use crate::types::Mood;

const LEXICON_WEIGHT: f64 = 0.7;
const LLM_WEIGHT: f64 = 0.3;

/// Headlines forwarded to the completion service
const LLM_HEADLINES: usize = 5;

/// Per-headline scores beyond this magnitude are amplified
const STRONG_POLARITY: f64 = 0.5;
const AMPLIFICATION: f64 = 1.2;

/// Normalization constant for summed valences
const NORMALIZATION_ALPHA: f64 = 15.0;

const NEGATION_SCALAR: f64 = -0.74;
const BOOSTER_INCREMENT: f64 = 0.293;

const SYSTEM_PROMPT: &str = "You are a crypto market sentiment analyst. \
Reply with a single number between -1.0 (extreme fear) and 1.0 (euphoria) and nothing else.";

/// Word valences on a -4..+4 scale
const LEXICON: &[(&str, f64)] = &[
    ("adoption", 1.6),
    ("all-time", 1.2),
    ("approval", 2.0),
    ("approved", 2.0),
    ("ban", -2.6),
    ("banned", -2.6),
    ("bankrupt", -3.2),
    ("bankruptcy", -3.2),
    ("bearish", -2.1),
    ("boom", 2.2),
    ("breakout", 1.8),
    ("bullish", 2.2),
    ("collapse", -3.0),
    ("collapses", -3.0),
    ("crackdown", -2.2),
    ("crash", -3.0),
    ("crashes", -3.0),
    ("decline", -1.5),
    ("declines", -1.5),
    ("default", -2.4),
    ("delist", -2.3),
    ("delisted", -2.3),
    ("dump", -2.2),
    ("dumps", -2.2),
    ("exploit", -2.6),
    ("exploited", -2.6),
    ("fear", -2.2),
    ("fears", -2.2),
    ("fraud", -3.0),
    ("gain", 1.8),
    ("gains", 1.8),
    ("good", 1.9),
    ("great", 3.1),
    ("growth", 1.6),
    ("hack", -2.5),
    ("hacked", -2.5),
    ("high", 0.8),
    ("inflow", 1.2),
    ("inflows", 1.2),
    ("investigation", -1.4),
    ("lawsuit", -1.8),
    ("liquidation", -2.0),
    ("liquidations", -2.0),
    ("loss", -2.0),
    ("losses", -2.0),
    ("outflow", -1.2),
    ("outflows", -1.2),
    ("panic", -2.8),
    ("partnership", 1.5),
    ("plunge", -2.6),
    ("plunges", -2.6),
    ("profit", 1.9),
    ("rally", 2.2),
    ("rallies", 2.2),
    ("record", 1.2),
    ("recovery", 1.7),
    ("rejected", -1.8),
    ("rise", 1.4),
    ("rises", 1.4),
    ("risk", -1.1),
    ("scam", -3.1),
    ("selloff", -2.3),
    ("slump", -2.1),
    ("soar", 2.5),
    ("soars", 2.5),
    ("strong", 2.1),
    ("success", 2.7),
    ("surge", 2.1),
    ("surges", 2.1),
    ("theft", -2.8),
    ("uncertainty", -1.4),
    ("upgrade", 1.6),
    ("weak", -1.9),
    ("win", 2.8),
    ("wins", 2.8),
    ("worst", -3.1),
];

const NEGATORS: &[&str] = &[
    "not", "no", "never", "without", "isn't", "aren't", "wasn't", "won't", "don't", "doesn't",
    "didn't", "can't", "cannot", "hardly",
];

const BOOSTERS: &[&str] = &[
    "very", "extremely", "massive", "massively", "huge", "hugely", "sharply", "major", "record",
    "significantly", "totally",
];

/// Result of one analysis, with the components kept for auditing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentReading {
    pub score: f64,
    pub lexicon_score: f64,
    pub llm_score: Option<f64>,
    /// Set when the completion path failed and the lexicon score stands alone
    pub degraded: Option<String>,
    pub headline_count: usize,
}

impl SentimentReading {
    pub fn neutral() -> Self {
        Self {
            score: 0.0,
            lexicon_score: 0.0,
            llm_score: None,
            degraded: None,
            headline_count: 0,
        }
    }

    pub fn mood(&self) -> Mood {
        mood_label(self.score)
    }
}

pub struct SentimentEngine {
    llm: Option<Arc<dyn TextCompletion>>,
}

impl SentimentEngine {
    pub fn new(llm: Option<Arc<dyn TextCompletion>>) -> Self {
        Self { llm }
    }

    /// Lexicon-only engine
    pub fn lexicon_only() -> Self {
        Self { llm: None }
    }

    /// Fused score in [-1, 1]; 0.0 for no headlines
    pub async fn score(&self, headlines: &[String]) -> f64 {
        self.analyze(headlines).await.score
    }

    pub async fn analyze(&self, headlines: &[String]) -> SentimentReading {
        if headlines.is_empty() {
            return SentimentReading::neutral();
        }

        let lexicon_score = lexicon_score(headlines);

        let Some(llm) = &self.llm else {
            return degrade_to_lexicon(lexicon_score, headlines.len(), "completion client disabled");
        };

        let prompt = build_prompt(headlines);
        let reply = match llm.generate(&prompt, SYSTEM_PROMPT).await {
            Ok(reply) => reply,
            Err(e) => return degrade_to_lexicon(lexicon_score, headlines.len(), &e.to_string()),
        };

        let Some(raw) = extract_first_float(&reply) else {
            return degrade_to_lexicon(
                lexicon_score,
                headlines.len(),
                &format!("unparsable completion reply: {:?}", reply),
            );
        };
        let llm_score = raw.clamp(-1.0, 1.0);
        let score = (LEXICON_WEIGHT * lexicon_score + LLM_WEIGHT * llm_score).clamp(-1.0, 1.0);

        debug!(
            "Sentiment: lexicon={:.3} llm={:.3} fused={:.3} over {} headlines",
            lexicon_score,
            llm_score,
            score,
            headlines.len()
        );

        SentimentReading {
            score,
            lexicon_score,
            llm_score: Some(llm_score),
            degraded: None,
            headline_count: headlines.len(),
        }
    }
}

/// Named fallback: the lexicon score stands in for the fused score
fn degrade_to_lexicon(lexicon_score: f64, headline_count: usize, reason: &str) -> SentimentReading {
    warn!("Sentiment degraded to lexicon score {:.3}: {}", lexicon_score, reason);
    SentimentReading {
        score: lexicon_score,
        lexicon_score,
        llm_score: None,
        degraded: Some(reason.to_string()),
        headline_count,
    }
}

fn build_prompt(headlines: &[String]) -> String {
    let mut prompt = String::from("Rate the overall market sentiment of these headlines:\n");
    for headline in headlines.iter().take(LLM_HEADLINES) {
        prompt.push_str("- ");
        prompt.push_str(headline);
        prompt.push('\n');
    }
    prompt
}

/// Mean of the amplified per-headline compound scores
pub fn lexicon_score(headlines: &[String]) -> f64 {
    if headlines.is_empty() {
        return 0.0;
    }
    let total: f64 = headlines
        .iter()
        .map(|h| {
            let compound = compound_polarity(h);
            if compound.abs() > STRONG_POLARITY {
                (compound * AMPLIFICATION).clamp(-1.0, 1.0)
            } else {
                compound
            }
        })
        .sum();
    total / headlines.len() as f64
}

/// Compound polarity of one text in [-1, 1]
pub fn compound_polarity(text: &str) -> f64 {
    let tokens: Vec<String> = text
        .split_whitespace()
        .map(|t| {
            t.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'' && c != '-')
                .to_lowercase()
        })
        .filter(|t| !t.is_empty())
        .collect();

    let mut sum = 0.0;
    for (i, token) in tokens.iter().enumerate() {
        let Some(mut score) = valence(token) else {
            continue;
        };

        // Modifiers within the three preceding tokens
        for back in 1..=3 {
            let Some(prev) = i.checked_sub(back).map(|j| tokens[j].as_str()) else {
                break;
            };
            if BOOSTERS.contains(&prev) && valence(prev).is_none() {
                score += BOOSTER_INCREMENT * score.signum();
            }
            if NEGATORS.contains(&prev) || prev.ends_with("n't") {
                score *= NEGATION_SCALAR;
            }
        }
        sum += score;
    }

    if sum == 0.0 {
        return 0.0;
    }
    (sum / (sum * sum + NORMALIZATION_ALPHA).sqrt()).clamp(-1.0, 1.0)
}

fn valence(token: &str) -> Option<f64> {
    LEXICON
        .iter()
        .find(|(word, _)| *word == token)
        .map(|(_, v)| *v)
}

/// Discrete label for a score
pub fn mood_label(score: f64) -> Mood {
    if score >= 0.5 {
        Mood::Euphoria
    } else if score >= 0.2 {
        Mood::Bullish
    } else if score >= -0.2 {
        Mood::Neutral
    } else if score >= -0.5 {
        Mood::Bearish
    } else {
        Mood::ExtremeFear
    }
}

/// First decimal literal in `text`, e.g. "Score: -0.35." gives -0.35
pub fn extract_first_float(text: &str) -> Option<f64> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let starts_number = bytes[i].is_ascii_digit()
            || (bytes[i] == b'.' && bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit()));
        if !starts_number {
            i += 1;
            continue;
        }

        let start = if i > 0 && (bytes[i - 1] == b'-' || bytes[i - 1] == b'+') {
            i - 1
        } else {
            i
        };
        let mut end = i;
        let mut seen_dot = false;
        while end < bytes.len() {
            match bytes[end] {
                b'0'..=b'9' => end += 1,
                b'.' if !seen_dot && bytes.get(end + 1).is_some_and(|b| b.is_ascii_digit()) => {
                    seen_dot = true;
                    end += 1;
                }
                _ => break,
            }
        }
        return text[start..end].parse().ok();
    }
    None
}
