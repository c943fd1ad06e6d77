//! Office document conversions via LibreOffice.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde_json::json;

use super::{ensure_input_exists, run_tool};
use crate::error::{KilnError, Result};
use crate::pdf::trim_pdf_pages;
use crate::plugins::{ConversionInput, ConversionOutput, Plugin, PluginRegistry};

/// Convert with `soffice --headless --convert-to` into a temp dir, then move
/// the artifact next to the input.
async fn soffice_convert(input_path: &Path, target_ext: &str) -> Result<PathBuf> {
    ensure_input_exists(input_path)?;
    let tmpdir = tempfile::tempdir()?;

    let args: Vec<OsString> = vec![
        "--headless".into(),
        "--convert-to".into(),
        target_ext.into(),
        "--outdir".into(),
        tmpdir.path().into(),
        input_path.into(),
    ];
    run_tool("soffice", args).await?;

    let stem = input_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let candidate = tmpdir.path().join(format!("{stem}.{target_ext}"));
    if !candidate.exists() {
        return Err(KilnError::ConversionFailed {
            message: format!(
                "LibreOffice produced no {target_ext} output for {}",
                input_path.display()
            ),
        });
    }

    let final_output = input_path.with_extension(target_ext);
    tokio::fs::copy(&candidate, &final_output)
        .await
        .map_err(|e| KilnError::io_with_path(e, &final_output))?;
    Ok(final_output)
}

async fn convert_to_pdf(input: ConversionInput) -> Result<ConversionOutput> {
    let output_path = soffice_convert(&input.input_path, "pdf").await?;
    if let Some(limit) = input.metadata.page_limit {
        trim_pdf_pages(&output_path, limit)?;
    }
    Ok(ConversionOutput {
        output_path: Some(output_path),
        object_key: None,
        metadata: json!({"note": "Converted via LibreOffice soffice"}),
    })
}

async fn convert_to_docx(input: ConversionInput) -> Result<ConversionOutput> {
    let output_path = soffice_convert(&input.input_path, "docx").await?;
    Ok(ConversionOutput {
        output_path: Some(output_path),
        object_key: None,
        metadata: json!({"note": "Converted via LibreOffice soffice"}),
    })
}

pub fn register(registry: &mut PluginRegistry) -> Result<()> {
    for source in ["doc", "docx", "ppt", "pptx", "xls", "xlsx"] {
        registry.register(Plugin::new(
            &format!("{source}-to-pdf"),
            source,
            "pdf",
            convert_to_pdf,
        ))?;
    }
    registry.register(Plugin::new("doc-to-docx", "doc", "docx", convert_to_docx))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registers_expected_pairs() {
        let mut registry = PluginRegistry::new();
        register(&mut registry).unwrap();
        assert!(registry.contains("ppt", "pdf"));
        assert!(registry.contains("doc", "docx"));
        assert!(!registry.contains("doc", "mp4"));
        assert_eq!(registry.len(), 7);
    }
}
