//! HTML conversions: wkhtmltopdf for PDF, pandoc for Markdown.

use std::ffi::OsString;

use serde_json::json;

use super::{ensure_input_exists, run_tool};
use crate::error::Result;
use crate::pdf::trim_pdf_pages;
use crate::plugins::{ConversionInput, ConversionOutput, Plugin, PluginRegistry};

async fn html_to_pdf(input: ConversionInput) -> Result<ConversionOutput> {
    ensure_input_exists(&input.input_path)?;
    let output_path = input.input_path.with_extension("pdf");

    let args: Vec<OsString> = vec![
        "--quiet".into(),
        "--enable-local-file-access".into(),
        input.input_path.as_path().into(),
        output_path.as_path().into(),
    ];
    run_tool("wkhtmltopdf", args).await?;

    if let Some(limit) = input.metadata.page_limit {
        trim_pdf_pages(&output_path, limit)?;
    }
    Ok(ConversionOutput {
        output_path: Some(output_path),
        object_key: None,
        metadata: json!({"note": "Converted via wkhtmltopdf"}),
    })
}

async fn html_to_md(input: ConversionInput) -> Result<ConversionOutput> {
    ensure_input_exists(&input.input_path)?;
    let output_path = input.input_path.with_extension("md");

    let args: Vec<OsString> = vec![
        "-f".into(),
        "html".into(),
        "-t".into(),
        "gfm".into(),
        "-o".into(),
        output_path.as_path().into(),
        input.input_path.as_path().into(),
    ];
    run_tool("pandoc", args).await?;

    Ok(ConversionOutput {
        output_path: Some(output_path),
        object_key: None,
        metadata: json!({"note": "Converted HTML to Markdown"}),
    })
}

pub fn register(registry: &mut PluginRegistry) -> Result<()> {
    registry.register(Plugin::new("html-to-pdf", "html", "pdf", html_to_pdf))?;
    registry.register(Plugin::new("html-to-md", "html", "md", html_to_md))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registers_expected_pairs() {
        let mut registry = PluginRegistry::new();
        register(&mut registry).unwrap();
        assert!(registry.contains("html", "pdf"));
        assert!(registry.contains("html", "md"));
    }
}
