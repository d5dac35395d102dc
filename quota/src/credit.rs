use std::time::Duration;

/// Model-family credit weights, matched as case-insensitive substrings of
/// the declared model name. Longer patterns are checked first so that
/// `gpt-5-low` wins over `gpt-5` and `gpt-4o-mini` over `gpt-4o`.
const MODEL_COSTS: &[(&str, f64)] = &[
    ("claude-3-5-sonnet", 1.0),
    ("deepseek-reasoner", 1.0),
    ("gemini-2.5-flash", 0.5),
    ("claude-sonnet-4", 5.0),
    ("gemini-2.5-pro", 1.0),
    ("deepseek-chat", 0.5),
    ("claude-opus-4", 20.0),
    ("qwen3-coder", 0.5),
    ("gpt-4o-mini", 0.5),
    ("gpt-5-high", 1.5),
    ("gpt-5-low", 0.5),
    ("kimi-k2", 0.5),
    ("gpt-4o", 1.0),
    ("gpt-5", 1.5),
    ("gpt-4", 1.0),
    ("swe-1", 0.0),
];

const UNKNOWN_MODEL_COST: f64 = 1.0;

/// Credit cost of a request against the given model name.
pub fn estimate_cost(model: &str) -> f64 {
    let lowered = model.to_ascii_lowercase();
    for (pattern, cost) in MODEL_COSTS {
        if lowered.contains(pattern) {
            return *cost;
        }
    }
    UNKNOWN_MODEL_COST
}

/// Scan free-form text (e.g. a chat-message response body) for a known
/// model family. Returns the matched pattern.
pub fn detect_model(text: &str) -> Option<&'static str> {
    let lowered = text.to_ascii_lowercase();
    MODEL_COSTS
        .iter()
        .find(|(pattern, _)| lowered.contains(pattern))
        .map(|(pattern, _)| *pattern)
}

/// Model families the credit table knows about, for `/v1/models`.
pub fn known_models() -> impl Iterator<Item = &'static str> {
    MODEL_COSTS.iter().map(|(pattern, _)| *pattern)
}

const MIN_RECOVERY_TICK: Duration = Duration::from_secs(600);

/// Scheduler period for the recovery scanner: a sixth of the shortest
/// configured recovery interval, floored at ten minutes.
pub fn recovery_tick_period(interval_ms: impl Iterator<Item = u64>) -> Duration {
    let shortest = interval_ms.filter(|ms| *ms > 0).min();
    match shortest {
        Some(ms) => {
            let tick = Duration::from_millis(ms / 6);
            tick.max(MIN_RECOVERY_TICK)
        }
        None => MIN_RECOVERY_TICK,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_table_matches_model_families() {
        assert_eq!(estimate_cost("swe-1-lite"), 0.0);
        assert_eq!(estimate_cost("gpt-5-low"), 0.5);
        assert_eq!(estimate_cost("kimi-k2-instruct"), 0.5);
        assert_eq!(estimate_cost("qwen3-coder-480b"), 0.5);
        assert_eq!(estimate_cost("gemini-2.5-flash"), 0.5);
        assert_eq!(estimate_cost("gpt-4o-mini"), 0.5);
        assert_eq!(estimate_cost("deepseek-chat"), 0.5);
        assert_eq!(estimate_cost("gemini-2.5-pro"), 1.0);
        assert_eq!(estimate_cost("gpt-4o"), 1.0);
        assert_eq!(estimate_cost("gpt-4-turbo"), 1.0);
        assert_eq!(estimate_cost("claude-3-5-sonnet-20241022"), 1.0);
        assert_eq!(estimate_cost("deepseek-reasoner"), 1.0);
        assert_eq!(estimate_cost("gpt-5"), 1.5);
        assert_eq!(estimate_cost("gpt-5-high"), 1.5);
        assert_eq!(estimate_cost("claude-sonnet-4-20250514"), 5.0);
        assert_eq!(estimate_cost("claude-opus-4-1"), 20.0);
    }

    #[test]
    fn unknown_models_cost_one() {
        assert_eq!(estimate_cost("mystery-model-9000"), 1.0);
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(estimate_cost("Claude-Opus-4"), 20.0);
        assert_eq!(estimate_cost("GPT-4O-MINI"), 0.5);
    }

    #[test]
    fn detects_model_inside_noise() {
        let body = "x\u{1}\u{2}model:claude-sonnet-4-20250514\u{0}rest";
        assert_eq!(detect_model(body), Some("claude-sonnet-4"));
        assert_eq!(detect_model("nothing here"), None);
    }

    #[test]
    fn recovery_tick_respects_floor() {
        // 1 hour interval / 6 = 10 min, exactly the floor
        assert_eq!(
            recovery_tick_period([3_600_000u64].into_iter()),
            Duration::from_secs(600)
        );
        // 24 h / 6 = 4 h
        assert_eq!(
            recovery_tick_period([86_400_000u64, 18_000_000].into_iter()),
            Duration::from_secs(3_000)
        );
        // empty set falls back to the floor
        assert_eq!(
            recovery_tick_period(std::iter::empty()),
            Duration::from_secs(600)
        );
    }
}
