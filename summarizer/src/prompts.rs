//! Prompt templates for the summarization paths. Slots are filled with
//! plain `format!`; chunk text never round-trips through a template engine.

pub fn document_summary(context: &str) -> String {
    format!(
        "You are an expert study assistant.\n\n\
         Document below delimited by <doc></doc> tags.\n\n\
         <doc>\n{context}\n</doc>\n\n\
         Write a concise yet comprehensive summary in markdown format capturing all key ideas, \
         definitions, and results. Use the following markdown formatting:\n\
         - Use ## for main section headings\n\
         - Use ### for subsection headings\n\
         - Use **bold** for key terms and important concepts\n\
         - Use bullet points (-) or numbered lists (1.) for listing items\n\
         - Use `code` formatting for technical terms or formulas\n\
         Limit to ~3-5 paragraphs or equivalent in structured markdown."
    )
}

pub fn combine_sections(context: &str) -> String {
    format!(
        "You are an expert study assistant.\n\n\
         Below are summaries of different sections of a document:\n\n\
         {context}\n\n\
         Write a comprehensive document summary in markdown format that:\n\
         - Captures the main themes and key ideas from all sections\n\
         - Uses ## for main headings and ### for subheadings\n\
         - Highlights **key terms** and important concepts\n\
         - Is well-organized and flows logically\n\
         - Is approximately 300-500 words"
    )
}

pub fn condense_summary(context: &str, user_query: &str) -> String {
    format!(
        "You are an expert study assistant.\n\n\
         Below is a detailed document summary delimited by <summary></summary> tags.\n\
         <summary>\n{context}\n</summary>\n\n\
         The user has asked: \"{user_query}\"\n\n\
         Rewrite the summary so it is concise **while following any formatting or stylistic \
         instructions implicit in the user's query**. Preserve key concepts, definitions, and \
         results. Keep all mathematical expressions in LaTeX format ($...$ for inline, \
         $$...$$ for display)."
    )
}

pub fn condense_class(context: &str, user_query: &str) -> String {
    format!(
        "You are an expert study assistant.\n\n\
         Below are multiple document summaries for one class, delimited by \
         <summary></summary> tags.\n<summary>\n{context}\n</summary>\n\n\
         The user asked: \"{user_query}\"\n\n\
         Write a single, coherent overview (about 200-250 words) that captures the key points, \
         concepts, and definitions across all documents, following any formatting instructions \
         in the user's query. Write all mathematical expressions in LaTeX format ($...$ for \
         inline, $$...$$ for display)."
    )
}

pub fn class_batch(context: &str) -> String {
    format!(
        "You are an expert study assistant.\n\n\
         Below are document summaries from a class:\n\n\
         {context}\n\n\
         Write a concise summary (150-200 words) capturing the key themes, concepts, and \
         important information across these documents. Write all mathematical expressions in \
         LaTeX format ($...$ for inline, $$...$$ for display)."
    )
}

pub fn study_guide(context: &str, user_query: &str) -> String {
    format!(
        "You are an expert tutor creating a clear, well-structured study guide.\n\n\
         <context>\n{context}\n</context>\n\n\
         User request: \"{user_query}\"\n\n\
         Return a markdown study guide with **exactly** these headings:\n\
         1. # Study Guide\n\
         2. ## Key Concepts\n\
         3. ## Important Definitions\n\
         4. ## Essential Formulas / Diagrams (omit if N/A)\n\
         5. ## Practice Questions\n\n\
         IMPORTANT: Write ALL mathematical expressions, equations, and formulas in LaTeX format:\n\
         - Use $...$ for inline math (e.g., $E = mc^2$)\n\
         - Use $$...$$ for display/block equations\n\
         - Never use plain text or backticks for formulas\n\n\
         Follow any extra formatting the user asked for and keep it under ~1200 words."
    )
}

/// Separator between concatenated summaries.
pub const SUMMARY_SEPARATOR: &str = "\n\n---\n\n";
