use crate::router::Route;

/// Literal sentinel the model is instructed to emit when the context
/// supports no answer.
pub const NO_HIT_MESSAGE: &str = "NO_HIT_MESSAGE";

/// Origin of the query, selecting the base prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuerySource {
    MainApp,
    ChromeExtension,
}

impl QuerySource {
    pub fn from_wire(value: &str) -> Self {
        if value.eq_ignore_ascii_case("chrome_extension") {
            Self::ChromeExtension
        } else {
            Self::MainApp
        }
    }
}

/// Double braces so chunk text cannot be mistaken for a template variable by
/// the downstream formatter.
pub fn escape_braces(text: &str) -> String {
    text.replace('{', "{{").replace('}', "}}")
}

/// Per-route task instructions filling the `route_rules` slot.
fn route_rules(route: Route) -> &'static str {
    match route {
        Route::GeneralQa => {
            "Answer the user's question using only the supplied context chunks. \
             Be direct and thorough, define key terms, and prefer the phrasing used in the \
             source material."
        }
        Route::FollowUp => {
            "The user is asking you to continue or elaborate on your previous answer. \
             Use the same context chunks as before and deepen the explanation without \
             repeating yourself verbatim."
        }
        Route::QuoteFinding => {
            "Return direct quotations from the context that match the user's request. \
             Each line must contain exactly one verbatim quote, enclosed in double quotation \
             marks, and nothing else besides its citation. Do not paraphrase."
        }
        Route::GenerateStudyGuide => {
            "Produce a structured study guide from the context: key concepts, important \
             definitions, essential formulas, and practice questions. Use markdown headings."
        }
        Route::Summary => {
            "Summarize the relevant context concisely, preserving key terms, definitions and \
             results. Follow any formatting instructions implicit in the user's request."
        }
    }
}

const CHROME_EXTENSION_RULES: &str =
    "You are assisting inside a browser extension side panel. Answer briefly using only the \
     supplied context chunks; prefer short paragraphs and bullet points over long prose.";

/// Citation instructions filling the `citing` slot.
fn citation_rules(route: Route) -> &'static str {
    match route {
        Route::QuoteFinding => {
            "After each quote, append a space followed by the chunk reference number(s) in \
             square brackets using the chunk list provided below (e.g., [1], [2]). If multiple \
             chunks support a single quote, include all consecutively like [1][3] with no \
             commas or punctuation. Do not invent citations; only use numbers corresponding to \
             the provided chunks.\n\n"
        }
        _ => {
            "Whenever you use content from a given chunk in your final answer, place a single \
             bracketed reference in the form [N] at the end of that sentence. If multiple \
             chunks support the same sentence, include each reference back-to-back with no \
             punctuation, e.g., [1][3][4]. Do NOT write lists like [1, 3, 4] or ranges like \
             [1-3]; only separate [N] tokens are allowed. Always use the numbering shown in \
             the chunk list below (starting from 1).\n\n\
             Please format your answer using Markdown. Write all mathematical expressions in \
             LaTeX using '$' for inline math and '$$' for display math. Ensure code is in \
             triple backticks.\n\n"
        }
    }
}

/// Assemble the system prompt: route rules, citation rules, numbered context
/// blocks, and the no-hit instruction.
pub fn build_system_prompt(route: Route, source: QuerySource, chunk_texts: &[String]) -> String {
    let route_rules = match source {
        QuerySource::ChromeExtension => CHROME_EXTENSION_RULES,
        QuerySource::MainApp => route_rules(route),
    };

    let context = if chunk_texts.is_empty() {
        "NULL".to_string()
    } else {
        chunk_texts
            .iter()
            .enumerate()
            .map(|(i, text)| format!("<chunk id='{}'>\n{}\n</chunk>", i + 1, escape_braces(text)))
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    format!(
        "### ROLE\n\
         You are an expert study assistant. Tasked with satisfying a user request based on the \
         supplied context.\n\n\
         ### TASK INSTRUCTIONS\n\
         {route_rules}\n\n\
         ### CITATION GUIDELINES\n\
         {citing}\n\
         ### CONTEXT CHUNKS\n\
         {context}\n\n\
         ### CLARIFY / NO-HIT LOGIC\n\
         If the context cannot fully answer but a single, precise follow-up question would \
         enable an answer, ask that question. If nothing is relevant, reply exactly with \
         {NO_HIT_MESSAGE}.\n\
         ### ANSWER REQUIREMENTS\n\
         Respond **only** with information that directly addresses the user question and is \
         derived from the context above. Do not introduce unrelated content.\n",
        citing = citation_rules(route),
    )
}
