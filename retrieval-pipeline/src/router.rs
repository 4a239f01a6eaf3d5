use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Closed set of routing decisions; retrieval, prompt and generation
/// behavior is dispatched on the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    GeneralQa,
    FollowUp,
    QuoteFinding,
    GenerateStudyGuide,
    Summary,
}

impl Route {
    pub const ALL: [Route; 5] = [
        Route::FollowUp,
        Route::QuoteFinding,
        Route::GenerateStudyGuide,
        Route::Summary,
        Route::GeneralQa,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Route::GeneralQa => "general_qa",
            Route::FollowUp => "follow_up",
            Route::QuoteFinding => "quote_finding",
            Route::GenerateStudyGuide => "generate_study_guide",
            Route::Summary => "summary",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Route::ALL.into_iter().find(|route| route.name() == name)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Orthogonal classification affecting the high-level flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Specific,
    DocSummary,
    ClassSummary,
    StudyGuide,
}

/// Mode resolution outcome; a summary request without any scope needs the
/// user to pick one first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeDecision {
    Mode(QueryMode),
    SelectScope,
}

fn route_patterns() -> &'static [(Route, Regex)] {
    static PATTERNS: OnceLock<Vec<(Route, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        // Ordered by priority: cheap frequent gates first.
        vec![
            (
                Route::FollowUp,
                Regex::new(r"(?i)\b(elaborate|tell me more|expand on|what do you mean|go on|again)\b")
                    .expect("follow_up pattern"),
            ),
            (
                Route::QuoteFinding,
                Regex::new(r"(?i)\b(?:find|give|provide|need).{0,40}quote").expect("quote pattern"),
            ),
            (
                Route::GenerateStudyGuide,
                Regex::new(r"(?i)\bstudy[-\s]?guide\b|\bmake .* guide\b|\bgenerate .* guide\b")
                    .expect("study guide pattern"),
            ),
            (
                Route::Summary,
                Regex::new(r"(?i)\bsummary\b|\bsummar(?:ise|ize)\b|\btl;dr\b|\boverview\b")
                    .expect("summary pattern"),
            ),
        ]
    })
}

/// All routes whose gate matches, in priority order. Empty means the
/// general-QA fallback.
pub fn regex_hits(query: &str) -> Vec<Route> {
    route_patterns()
        .iter()
        .filter(|(_, pattern)| pattern.is_match(query))
        .map(|(route, _)| *route)
        .collect()
}

fn summary_mode_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\bsummar(?:y|ize|ise)\b").expect("summary mode pattern"))
}

fn study_guide_mode_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(study[-\s]?guide|make\s+me\s+a\s+guide)\b")
            .expect("study guide mode pattern")
    })
}

/// Resolve the query mode from the query text and the scope in play.
/// The literal "null" encodes a missing scope on the wire.
pub fn detect_query_mode(query: &str, doc_in_scope: bool, class_in_scope: bool) -> ModeDecision {
    if study_guide_mode_pattern().is_match(query) {
        return ModeDecision::Mode(QueryMode::StudyGuide);
    }
    if summary_mode_pattern().is_match(query) {
        if doc_in_scope {
            return ModeDecision::Mode(QueryMode::DocSummary);
        }
        if class_in_scope {
            return ModeDecision::Mode(QueryMode::ClassSummary);
        }
        return ModeDecision::SelectScope;
    }
    ModeDecision::Mode(QueryMode::Specific)
}

fn quote_phrase_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)\bfind(?:\s+me)?\s+(?:a\s+)?quote(?:s)?(?:\s+(?:on|about|for))?\b|\bgive(?:\s+me)?\s+(?:a\s+)?quote(?:s)?(?:\s+(?:on|about|for))?\b|\bquote(?:\s+(?:on|about|for))?\b",
        )
        .expect("quote phrase pattern")
    })
}

/// Remove boilerplate "find a quote about ..." phrasing.
pub fn strip_quote_phrases(query: &str) -> String {
    quote_phrase_pattern()
        .replace_all(query, "")
        .trim()
        .to_string()
}

/// At least 3 meaningful tokens must remain after stripping the filler.
pub fn has_sufficient_quote_context(cleaned_query: &str) -> bool {
    cleaned_query.split_whitespace().count() >= 3
}
