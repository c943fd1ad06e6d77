//! Spreadsheet conversions: LibreOffice handles PDF (registered by the
//! office module); Markdown rendering reads the workbook directly and emits
//! one GitHub-style table per sheet.

use calamine::{open_workbook_auto, Data, Reader};
use serde_json::json;

use super::ensure_input_exists;
use crate::error::{KilnError, Result};
use crate::plugins::{ConversionInput, ConversionOutput, Plugin, PluginRegistry};

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        other => other.to_string().replace('|', "\\|"),
    }
}

fn rows_to_markdown(rows: &[Vec<String>]) -> String {
    let Some((header, body)) = rows.split_first() else {
        return String::new();
    };
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    let pad = |row: &[String]| {
        let mut cells: Vec<String> = row.to_vec();
        cells.resize(width, String::new());
        format!("| {} |", cells.join(" | "))
    };

    let mut lines = vec![pad(header)];
    lines.push(format!("|{}|", " --- |".repeat(width)));
    for row in body {
        lines.push(pad(row));
    }
    lines.join("\n")
}

fn sheet_to_markdown(title: &str, rows: &[Vec<String>]) -> String {
    if rows.is_empty() {
        return format!("### {title}\n\n(empty sheet)\n");
    }
    format!("### {title}\n\n{}\n", rows_to_markdown(rows))
}

async fn workbook_to_md(input: ConversionInput) -> Result<ConversionOutput> {
    ensure_input_exists(&input.input_path)?;
    let input_path = input.input_path.clone();

    // calamine is synchronous; workbook parsing runs off the async runtime.
    let sections = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
        let mut workbook = open_workbook_auto(&input_path).map_err(|e| {
            KilnError::ConversionFailed {
                message: format!("Failed to open workbook {}: {e}", input_path.display()),
            }
        })?;
        let mut sections = Vec::new();
        let names: Vec<String> = workbook.sheet_names().to_owned();
        for name in names {
            let range = workbook
                .worksheet_range(&name)
                .map_err(|e| KilnError::ConversionFailed {
                    message: format!("Failed to read sheet {name}: {e}"),
                })?;
            let rows: Vec<Vec<String>> = range
                .rows()
                .map(|row| row.iter().map(cell_text).collect())
                .collect();
            sections.push(sheet_to_markdown(&name, &rows));
        }
        Ok(sections)
    })
    .await
    .map_err(|e| KilnError::Other(format!("Workbook task failed: {e}")))??;

    let output_path = input.input_path.with_extension("md");
    tokio::fs::write(&output_path, sections.join("\n"))
        .await
        .map_err(|e| KilnError::io_with_path(e, &output_path))?;

    Ok(ConversionOutput {
        output_path: Some(output_path),
        object_key: None,
        metadata: json!({"note": "Rendered workbook sheets as Markdown tables"}),
    })
}

pub fn register(registry: &mut PluginRegistry) -> Result<()> {
    registry.register(Plugin::new("xlsx-to-md", "xlsx", "md", workbook_to_md))?;
    registry.register(Plugin::new("xls-to-md", "xls", "md", workbook_to_md))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_to_markdown_shape() {
        let rows = vec![
            vec!["name".to_string(), "qty".to_string()],
            vec!["bolts".to_string(), "40".to_string()],
        ];
        let md = rows_to_markdown(&rows);
        assert_eq!(md, "| name | qty |\n| --- | --- |\n| bolts | 40 |");
    }

    #[test]
    fn test_ragged_rows_are_padded() {
        let rows = vec![
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            vec!["1".to_string()],
        ];
        let md = rows_to_markdown(&rows);
        assert!(md.contains("| 1 |  |  |"));
    }

    #[test]
    fn test_empty_sheet_marker() {
        assert!(sheet_to_markdown("Sheet1", &[]).contains("(empty sheet)"));
    }

    #[test]
    fn test_pipe_cells_are_escaped() {
        assert_eq!(cell_text(&Data::String("a|b".into())), "a\\|b");
    }
}
