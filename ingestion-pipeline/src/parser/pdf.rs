use lopdf::{Document, Object};
use tracing::warn;

use common::{error::AppError, storage::types::chunk::SourceType};

use super::{DocMetadata, DocumentParser, ParseStats, ParsedDocument, SourceUnit};

/// PDF extraction via lopdf: one unit per page, 1-based page numbers.
/// A page that fails to extract is logged and yielded empty so numbering
/// stays aligned with the source document.
pub struct PdfParser;

impl DocumentParser for PdfParser {
    fn parse(&self, bytes: &[u8]) -> Result<ParsedDocument, AppError> {
        let document = Document::load_mem(bytes)
            .map_err(|err| AppError::Processing(format!("Failed to parse PDF: {err}")))?;

        let mut page_numbers: Vec<u32> = document.get_pages().keys().copied().collect();
        page_numbers.sort_unstable();

        let mut units = Vec::with_capacity(page_numbers.len());
        let mut stats = ParseStats::default();

        for page_number in page_numbers {
            let text = match document.extract_text(&[page_number]) {
                Ok(text) => text.trim().to_string(),
                Err(err) => {
                    warn!(page = page_number, error = %err, "failed to extract PDF page, skipping");
                    String::new()
                }
            };

            stats.units_total += 1;
            if text.is_empty() {
                stats.units_empty += 1;
            }
            stats.char_count += text.len();

            units.push(SourceUnit {
                text,
                number: page_number,
            });
        }

        Ok(ParsedDocument {
            units,
            metadata: DocMetadata {
                title: info_string(&document, b"Title").unwrap_or_else(|| "Unknown".to_string()),
                author: info_string(&document, b"Author").unwrap_or_else(|| "Unknown".to_string()),
            },
            stats,
        })
    }

    fn source_type(&self) -> SourceType {
        SourceType::Pdf
    }
}

/// Read a string entry from the PDF's Info dictionary, if present.
fn info_string(document: &Document, key: &[u8]) -> Option<String> {
    let info_ref = document.trailer.get(b"Info").ok()?;
    let info = match info_ref {
        Object::Reference(id) => document.get_dictionary(*id).ok()?,
        Object::Dictionary(dict) => dict,
        _ => return None,
    };

    match info.get(key).ok()? {
        Object::String(bytes, _) => {
            let value = String::from_utf8_lossy(bytes).trim().to_string();
            (!value.is_empty()).then_some(value)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_pdf_bytes() {
        let result = PdfParser.parse(b"definitely not a pdf");
        assert!(result.is_err());
    }

    #[test]
    fn reports_pdf_source_type() {
        assert_eq!(PdfParser.source_type(), SourceType::Pdf);
    }
}
