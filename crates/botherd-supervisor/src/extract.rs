use std::sync::OnceLock;

use regex::Regex;

/// Per-line metric deltas reported by an extractor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LineMetrics {
    pub xp_gained: u64,
    pub items_collected: u64,
    pub profit: u64,
    pub deaths: u64,
    pub trades_completed: u64,
}

impl LineMetrics {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Turns free-text stdout lines into metric deltas.
///
/// Extraction is advisory and best-effort: implementations must not block
/// and must return an empty delta rather than fail.
pub trait MetricsExtractor: Send + Sync {
    fn extract(&self, line: &str) -> LineMetrics;
}

/// Extractor that attributes nothing. Use when client log formats are
/// unknown and stuck detection must not be fed bogus zeros-vs-signal.
#[derive(Debug, Default)]
pub struct NullExtractor;

impl MetricsExtractor for NullExtractor {
    fn extract(&self, _line: &str) -> LineMetrics {
        LineMetrics::default()
    }
}

fn xp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d+)\s*(?:xp|experience)|(?:xp|experience)[:\s]+(\d+)|gained\s+(\d+)|\+(\d+)")
            .unwrap()
    })
}

fn profit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d[\d,]*)\s*(?:gp|gold|coins?)|(?:gp|gold|coins?|profit)[:\s]+(\d[\d,]*)")
            .unwrap()
    })
}

fn first_group<'a>(caps: &'a regex::Captures<'a>) -> Option<&'a str> {
    (1..caps.len()).find_map(|i| caps.get(i)).map(|m| m.as_str())
}

/// Default extractor for scripted game-client chatter.
///
/// The patterns mirror what the clients actually print ("Gained 25 xp",
/// "+100 experience", "Sold lobster for 1,200 gp", ...). They are heuristics,
/// not a protocol; misses are expected and harmless.
#[derive(Debug, Default)]
pub struct RegexExtractor;

impl MetricsExtractor for RegexExtractor {
    fn extract(&self, line: &str) -> LineMetrics {
        let lower = line.to_ascii_lowercase();
        let mut out = LineMetrics::default();

        let xp_mentioned = lower.contains("xp") || lower.contains("experience");
        if xp_mentioned
            && (lower.contains("gained") || line.contains('+') || lower.contains("experience"))
            && let Some(caps) = xp_re().captures(&lower)
            && let Some(raw) = first_group(&caps)
            && let Ok(n) = raw.parse::<u64>()
            && n > 0
        {
            out.xp_gained = n;
        }

        if ["collected", "picked up", "loot"]
            .iter()
            .any(|k| lower.contains(k))
        {
            out.items_collected = 1;
        }

        if ["coins", "gold", "gp", "profit"]
            .iter()
            .any(|k| lower.contains(k))
            && let Some(caps) = profit_re().captures(&lower)
            && let Some(raw) = first_group(&caps)
            && let Ok(n) = raw.replace(',', "").parse::<u64>()
            && n > 0
        {
            out.profit = n;
        }

        if ["you died", "you have died", "oh dear, you are dead"]
            .iter()
            .any(|k| lower.contains(k))
        {
            out.deaths = 1;
        }

        if ["trade completed", "trade successful"]
            .iter()
            .any(|k| lower.contains(k))
        {
            out.trades_completed = 1;
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xp_from_gained_phrase() {
        let m = RegexExtractor.extract("You gained 25 xp in Fishing");
        assert_eq!(m.xp_gained, 25);
    }

    #[test]
    fn xp_from_plus_notation() {
        let m = RegexExtractor.extract("+100 xp");
        assert_eq!(m.xp_gained, 100);
    }

    #[test]
    fn xp_from_trailing_amount() {
        // Amount after the keyword lands in a later capture group.
        let m = RegexExtractor.extract("Experience: 120");
        assert_eq!(m.xp_gained, 120);
    }

    #[test]
    fn xp_requires_context_keyword() {
        // Bare numbers without xp/experience context attribute nothing.
        let m = RegexExtractor.extract("Round 25 complete");
        assert_eq!(m.xp_gained, 0);
    }

    #[test]
    fn items_from_loot_keywords() {
        assert_eq!(RegexExtractor.extract("Picked up bones").items_collected, 1);
        assert_eq!(
            RegexExtractor.extract("Loot: raw lobster").items_collected,
            1
        );
    }

    #[test]
    fn profit_strips_thousands_separators() {
        let m = RegexExtractor.extract("Sold lobster for 1,200 gp");
        assert_eq!(m.profit, 1200);
    }

    #[test]
    fn deaths_and_trades() {
        assert_eq!(RegexExtractor.extract("Oh dear, you are dead!").deaths, 1);
        assert_eq!(
            RegexExtractor
                .extract("Trade completed with player_x")
                .trades_completed,
            1
        );
    }

    #[test]
    fn plain_chatter_attributes_nothing() {
        assert!(RegexExtractor.extract("Walking to the bank...").is_empty());
        assert!(RegexExtractor.extract("ERROR: disconnect").is_empty());
    }

    #[test]
    fn null_extractor_is_silent() {
        assert!(NullExtractor.extract("You gained 25 xp").is_empty());
    }
}
