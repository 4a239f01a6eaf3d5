use std::sync::OnceLock;

use regex::Regex;

use crate::router::Route;

fn quoted_span_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"“([^”]+)”|"([^"]+)""#).expect("quoted span pattern"))
}

fn citation_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[(\d+)\]").expect("citation token pattern"))
}

/// Keep only lines whose quoted span is a verbatim substring of some
/// selected chunk's text. Returns `None` when no line survives.
pub fn verbatim_quote_filter(answer: &str, chunk_texts: &[String]) -> Option<String> {
    let kept: Vec<&str> = answer
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| line_is_verbatim(line, chunk_texts))
        .collect();

    if kept.is_empty() {
        None
    } else {
        Some(kept.join("\n"))
    }
}

fn line_is_verbatim(line: &str, chunk_texts: &[String]) -> bool {
    let span = quoted_span_pattern()
        .captures(line)
        .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map_or_else(|| strip_citation_tokens(line), |m| m.as_str().to_string());
    let span = span.trim();

    !span.is_empty() && chunk_texts.iter().any(|text| text.contains(span))
}

fn strip_citation_tokens(line: &str) -> String {
    citation_pattern().replace_all(line, "").trim().to_string()
}

/// Routes that must cite their sources get an advisory suffix when the
/// answer carries no `[N]` token at all.
pub fn cite_missing_nudge(route: Route, answer: &str) -> Option<&'static str> {
    let cite_critical = matches!(route, Route::GeneralQa | Route::FollowUp);
    if cite_critical && !citation_pattern().is_match(answer) {
        Some("\n\nIf you want more precise citations, please specify a narrower section or term.")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_fabricated_quotes() {
        let chunks = vec!["The cat sat on the mat.".to_string()];
        let answer = "\"The cat sat on the mat.\" [1]\n\"Dogs are loyal.\" [1]";

        let filtered = verbatim_quote_filter(answer, &chunks).expect("one line kept");
        assert_eq!(filtered, "\"The cat sat on the mat.\" [1]");
    }

    #[test]
    fn accepts_curly_quotes() {
        let chunks = vec!["Knowledge is power.".to_string()];
        let answer = "“Knowledge is power.” [1]";

        let filtered = verbatim_quote_filter(answer, &chunks).expect("kept");
        assert_eq!(filtered, answer);
    }

    #[test]
    fn all_fabricated_returns_none() {
        let chunks = vec!["Real content.".to_string()];
        let answer = "\"Invented one.\" [1]\n\"Invented two.\" [1]";

        assert!(verbatim_quote_filter(answer, &chunks).is_none());
    }

    #[test]
    fn unquoted_line_matches_on_full_text() {
        let chunks = vec!["Plain spoken truth. More context.".to_string()];
        let answer = "Plain spoken truth. [1]";

        assert!(verbatim_quote_filter(answer, &chunks).is_some());
    }

    #[test]
    fn nudges_uncited_general_answers() {
        assert!(cite_missing_nudge(Route::GeneralQa, "No citations here.").is_some());
        assert!(cite_missing_nudge(Route::GeneralQa, "Cited [1].").is_none());
        assert!(cite_missing_nudge(Route::QuoteFinding, "No citations.").is_none());
    }
}
