mod docx;
mod pdf;

pub use docx::DocxParser;
pub use pdf::PdfParser;

use common::{error::AppError, storage::types::chunk::SourceType};

/// One addressable unit of a parsed document: a PDF page or a DOCX
/// paragraph. Numbers are 1-based and stable for citations.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    pub text: String,
    pub number: u32,
}

#[derive(Debug, Clone)]
pub struct DocMetadata {
    pub title: String,
    pub author: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParseStats {
    pub units_total: usize,
    pub units_empty: usize,
    pub char_count: usize,
}

#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub units: Vec<SourceUnit>,
    pub metadata: DocMetadata,
    pub stats: ParseStats,
}

/// Format-specific extraction behind one capability set: units, metadata and
/// stats. Implementations stay at the parsing boundary; everything past the
/// returned `ParsedDocument` is format-agnostic.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> Result<ParsedDocument, AppError>;
    fn source_type(&self) -> SourceType;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Docx,
}

impl DocumentFormat {
    /// Detect the format from the trailing extension of the object key.
    pub fn from_key(key: &str) -> Result<Self, AppError> {
        let extension = key
            .rsplit('.')
            .next()
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "pdf" => Ok(Self::Pdf),
            "docx" => Ok(Self::Docx),
            other => Err(AppError::Validation(format!(
                "Unsupported document extension '{other}' for key '{key}'"
            ))),
        }
    }

    pub fn parser(self) -> Box<dyn DocumentParser> {
        match self {
            Self::Pdf => Box::new(PdfParser),
            Self::Docx => Box::new(DocxParser),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_format_by_extension() {
        assert_eq!(
            DocumentFormat::from_key("uploads/u1/notes.pdf").expect("pdf"),
            DocumentFormat::Pdf
        );
        assert_eq!(
            DocumentFormat::from_key("uploads/u1/Essay.DOCX").expect("docx"),
            DocumentFormat::Docx
        );
        assert!(DocumentFormat::from_key("uploads/u1/notes.txt").is_err());
        assert!(DocumentFormat::from_key("no-extension").is_err());
    }
}
