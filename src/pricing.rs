//! Static per-model price table used to annotate `llm_usage` events.
//!
//! Prices are USD per 1K tokens. Matching is by longest model-name
//! prefix so dated variants ("gpt-5-2025-06") inherit their family rate.

/// (model prefix, prompt USD/1K, completion USD/1K)
const PRICE_TABLE: &[(&str, f64, f64)] = &[
    ("gpt-5", 0.00125, 0.01),
    ("gpt-4.1", 0.002, 0.008),
    ("gpt-4o", 0.0025, 0.01),
    ("o3", 0.002, 0.008),
    ("claude-opus", 0.015, 0.075),
    ("claude-sonnet", 0.003, 0.015),
    ("claude-haiku", 0.0008, 0.004),
    ("gemini-2.5-pro", 0.00125, 0.01),
    ("gemini-2.5-flash", 0.0003, 0.0025),
];

/// Cost in USD for a token count pair, or None for unpriced models.
pub fn cost_usd(model: &str, prompt_tokens: u64, completion_tokens: u64) -> Option<f64> {
    let model = model.trim().to_ascii_lowercase();
    let (_, prompt_rate, completion_rate) = PRICE_TABLE
        .iter()
        .filter(|(prefix, _, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _, _)| prefix.len())?;

    Some(
        (prompt_tokens as f64 / 1000.0) * prompt_rate
            + (completion_tokens as f64 / 1000.0) * completion_rate,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_model() {
        let cost = cost_usd("gpt-5", 1000, 1000).unwrap();
        assert!((cost - 0.01125).abs() < 1e-9);
    }

    #[test]
    fn test_prefix_match_dated_variant() {
        assert!(cost_usd("claude-sonnet-4-20250514", 1000, 0).is_some());
    }

    #[test]
    fn test_longest_prefix_wins() {
        // gemini-2.5-flash must not fall back to the pro rate.
        let flash = cost_usd("gemini-2.5-flash", 1000, 0).unwrap();
        assert!((flash - 0.0003).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model() {
        assert!(cost_usd("mystery-model", 1000, 1000).is_none());
    }

    #[test]
    fn test_case_insensitive() {
        assert!(cost_usd("GPT-5", 100, 100).is_some());
    }
}
