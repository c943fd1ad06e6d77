//! Plain-text and Markdown normalization into `.md` artifacts.

use serde_json::json;

use super::ensure_input_exists;
use crate::error::{KilnError, Result};
use crate::plugins::{ConversionInput, ConversionOutput, Plugin, PluginRegistry};

async fn text_to_md(input: ConversionInput) -> Result<ConversionOutput> {
    ensure_input_exists(&input.input_path)?;
    let bytes = tokio::fs::read(&input.input_path)
        .await
        .map_err(|e| KilnError::io_with_path(e, &input.input_path))?;
    let content = String::from_utf8_lossy(&bytes).replace("\r\n", "\n");

    let output_path = input.input_path.with_extension("md");
    tokio::fs::write(&output_path, content)
        .await
        .map_err(|e| KilnError::io_with_path(e, &output_path))?;

    Ok(ConversionOutput {
        output_path: Some(output_path),
        object_key: None,
        metadata: json!({"note": "Normalized text as Markdown"}),
    })
}

pub fn register(registry: &mut PluginRegistry) -> Result<()> {
    registry.register(Plugin::new("txt-to-md", "txt", "md", text_to_md))?;
    registry.register(Plugin::new("markdown-to-md", "markdown", "md", text_to_md))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::ConvertMetadata;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_normalizes_line_endings() {
        let tmp = TempDir::new().unwrap();
        let input_path = tmp.path().join("notes.txt");
        std::fs::write(&input_path, "one\r\ntwo\r\n").unwrap();

        let output = text_to_md(ConversionInput {
            source_format: "txt".into(),
            target_format: "md".into(),
            input_path: input_path.clone(),
            input_url: None,
            object_key: None,
            metadata: ConvertMetadata::default(),
        })
        .await
        .unwrap();

        let out_path = output.output_path.unwrap();
        assert_eq!(out_path.extension().unwrap(), "md");
        assert_eq!(std::fs::read_to_string(out_path).unwrap(), "one\ntwo\n");
    }
}
