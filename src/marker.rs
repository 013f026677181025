/// Marker extraction from harness log output.
///
/// A marker line announces the test unit that is about to run:
///
/// ```text
/// 1234 INFO TEST-START | /filepath/we/wish/to/capture.html
/// ```
///
/// Grammar: `<tag> | <value>`, where `<value>` is everything after the
/// separator up to the next whitespace. The last marker seen is used to
/// attribute timeouts and crashes to the unit that was running.
use regex::Regex;
use std::sync::LazyLock;

/// Tag used by the test harnesses to announce a test unit.
pub const DEFAULT_TAG: &str = "TEST-START";

static DEFAULT_PATTERN: LazyLock<Regex> = LazyLock::new(|| pattern_for(DEFAULT_TAG));

fn pattern_for(tag: &str) -> Regex {
    // The tag is escaped, so the pattern is always valid.
    Regex::new(&format!(r"{} \| (\S*)", regex::escape(tag))).unwrap()
}

/// Finds marker values in log text.
#[derive(Debug, Clone)]
pub struct MarkerScanner {
    pattern: Regex,
}

impl MarkerScanner {
    /// Scanner for a custom tag.
    pub fn new(tag: &str) -> Self {
        if tag == DEFAULT_TAG {
            return Self::default();
        }
        Self {
            pattern: pattern_for(tag),
        }
    }

    /// Value of the last marker line in `text`, if any.
    pub fn last_match<'a>(&self, text: &'a str) -> Option<&'a str> {
        self.pattern
            .captures_iter(text)
            .last()
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }
}

impl Default for MarkerScanner {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_PATTERN.clone(),
        }
    }
}

/// Trim a log segment the way it is handed to the caller: leading/trailing
/// newlines first, then any surrounding whitespace.
pub fn trim_log(text: &str) -> &str {
    text.trim_matches('\n').trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_match_single_line() {
        let scanner = MarkerScanner::default();
        assert_eq!(
            scanner.last_match("1234 INFO TEST-START | /tests/test_a.html\n"),
            Some("/tests/test_a.html")
        );
    }

    #[test]
    fn test_last_match_picks_most_recent() {
        let scanner = MarkerScanner::default();
        let log = "\
1 INFO TEST-START | /tests/test_a.html
2 INFO TEST-PASS | /tests/test_a.html | ok
3 INFO TEST-START | /tests/test_b.html
4 INFO TEST-END | /tests/test_b.html | finished in 12ms
";
        assert_eq!(scanner.last_match(log), Some("/tests/test_b.html"));
    }

    #[test]
    fn test_value_stops_at_whitespace() {
        let scanner = MarkerScanner::default();
        assert_eq!(
            scanner.last_match("TEST-START | testBookmark took 3ms"),
            Some("testBookmark")
        );
    }

    #[test]
    fn test_no_marker_returns_none() {
        let scanner = MarkerScanner::default();
        assert_eq!(scanner.last_match("INFO | runtest | Running register"), None);
        assert_eq!(scanner.last_match(""), None);
    }

    #[test]
    fn test_separator_must_match_exactly() {
        let scanner = MarkerScanner::default();
        assert_eq!(scanner.last_match("TEST-START|/tests/a.html"), None);
        assert_eq!(scanner.last_match("TEST-START - /tests/a.html"), None);
    }

    #[test]
    fn test_custom_tag_is_escaped() {
        let scanner = MarkerScanner::new("UNIT(1).START");
        assert_eq!(scanner.last_match("UNIT(1).START | alpha"), Some("alpha"));
        assert_eq!(scanner.last_match("UNITx1yxSTART | alpha"), None);
    }

    #[test]
    fn test_trim_log_strips_newlines_and_whitespace() {
        assert_eq!(trim_log("\n  line one\nline two \n\n"), "line one\nline two");
        assert_eq!(trim_log("\n\n"), "");
        assert_eq!(trim_log("plain"), "plain");
    }
}
