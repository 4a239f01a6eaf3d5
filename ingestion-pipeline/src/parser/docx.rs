use docx_rs::{
    DocumentChild, Paragraph, ParagraphChild, RunChild, Table, TableCellContent, TableChild,
    TableRowChild,
};

use common::{error::AppError, storage::types::chunk::SourceType};

use super::{DocMetadata, DocumentParser, ParseStats, ParsedDocument, SourceUnit};

/// DOCX extraction via docx-rs: one unit per non-empty paragraph, numbered
/// sequentially from 1 so citations work like PDF page numbers. Table cells
/// are flattened one cell per paragraph after the body text.
pub struct DocxParser;

impl DocumentParser for DocxParser {
    fn parse(&self, bytes: &[u8]) -> Result<ParsedDocument, AppError> {
        let docx = docx_rs::read_docx(bytes)
            .map_err(|err| AppError::Processing(format!("Failed to parse DOCX: {err:?}")))?;

        let mut units = Vec::new();
        let mut stats = ParseStats::default();
        let mut number = 0u32;

        let mut push_unit = |text: String, units: &mut Vec<SourceUnit>, stats: &mut ParseStats| {
            stats.units_total += 1;
            stats.char_count += text.len();
            number += 1;
            units.push(SourceUnit { text, number });
        };

        for child in &docx.document.children {
            match child {
                DocumentChild::Paragraph(paragraph) => {
                    let text = paragraph_text(paragraph);
                    if text.is_empty() {
                        continue;
                    }
                    push_unit(text, &mut units, &mut stats);
                }
                DocumentChild::Table(table) => {
                    for cell_text in table_cell_texts(table) {
                        push_unit(cell_text, &mut units, &mut stats);
                    }
                }
                _ => {}
            }
        }

        Ok(ParsedDocument {
            units,
            metadata: DocMetadata {
                title: "Unknown".to_string(),
                author: "Unknown".to_string(),
            },
            stats,
        })
    }

    fn source_type(&self) -> SourceType {
        SourceType::Docx
    }
}

/// Concatenated run text of one paragraph, trimmed.
fn paragraph_text(paragraph: &Paragraph) -> String {
    let mut text = String::new();
    for child in &paragraph.children {
        if let ParagraphChild::Run(run) = child {
            for run_child in &run.children {
                match run_child {
                    RunChild::Text(t) => text.push_str(&t.text),
                    RunChild::Tab(_) => text.push(' '),
                    RunChild::Break(_) => text.push('\n'),
                    _ => {}
                }
            }
        }
    }
    text.trim().to_string()
}

/// Every non-empty cell of a table, one flattened string per cell.
fn table_cell_texts(table: &Table) -> Vec<String> {
    let mut cells = Vec::new();
    for row in &table.rows {
        let TableChild::TableRow(row) = row;
        for cell in &row.cells {
            let TableRowChild::TableCell(cell) = cell;
            let mut cell_text = String::new();
            for content in &cell.children {
                if let TableCellContent::Paragraph(paragraph) = content {
                    let text = paragraph_text(paragraph);
                    if !text.is_empty() {
                        if !cell_text.is_empty() {
                            cell_text.push('\n');
                        }
                        cell_text.push_str(&text);
                    }
                }
            }
            if !cell_text.is_empty() {
                cells.push(cell_text);
            }
        }
    }
    cells
}

#[cfg(test)]
mod tests {
    use super::*;
    use docx_rs::{Docx, Paragraph, Run, Table, TableCell, TableRow};

    fn build_docx(docx: Docx) -> Vec<u8> {
        let mut buffer = std::io::Cursor::new(Vec::new());
        docx.build()
            .pack(&mut buffer)
            .expect("failed to build test docx");
        buffer.into_inner()
    }

    #[test]
    fn numbers_paragraphs_sequentially() {
        let docx = Docx::new()
            .add_paragraph(Paragraph::new().add_run(Run::new().add_text("First paragraph.")))
            .add_paragraph(Paragraph::new()) // empty, skipped
            .add_paragraph(Paragraph::new().add_run(Run::new().add_text("Second paragraph.")));
        let bytes = build_docx(docx);

        let parsed = DocxParser.parse(&bytes).expect("parse docx");

        assert_eq!(parsed.units.len(), 2);
        assert_eq!(parsed.units[0].text, "First paragraph.");
        assert_eq!(parsed.units[0].number, 1);
        assert_eq!(parsed.units[1].text, "Second paragraph.");
        assert_eq!(parsed.units[1].number, 2);
        assert_eq!(parsed.stats.units_total, 2);
    }

    #[test]
    fn flattens_table_cells_as_paragraphs() {
        let table = Table::new(vec![TableRow::new(vec![
            TableCell::new()
                .add_paragraph(Paragraph::new().add_run(Run::new().add_text("Cell one"))),
            TableCell::new()
                .add_paragraph(Paragraph::new().add_run(Run::new().add_text("Cell two"))),
        ])]);
        let docx = Docx::new()
            .add_paragraph(Paragraph::new().add_run(Run::new().add_text("Body text.")))
            .add_table(table);
        let bytes = build_docx(docx);

        let parsed = DocxParser.parse(&bytes).expect("parse docx");

        let texts: Vec<&str> = parsed.units.iter().map(|u| u.text.as_str()).collect();
        assert_eq!(texts, vec!["Body text.", "Cell one", "Cell two"]);
        assert_eq!(parsed.units[2].number, 3);
    }

    #[test]
    fn rejects_non_docx_bytes() {
        assert!(DocxParser.parse(b"not a zip archive").is_err());
    }
}
