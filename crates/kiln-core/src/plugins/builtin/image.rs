//! Image conversions: inkscape for SVG rasterization, ffmpeg for webp.

use std::ffi::OsString;

use serde_json::json;

use super::{ensure_input_exists, run_tool};
use crate::error::Result;
use crate::plugins::{ConversionInput, ConversionOutput, Plugin, PluginRegistry};

async fn svg_to_png(input: ConversionInput) -> Result<ConversionOutput> {
    ensure_input_exists(&input.input_path)?;
    let output_path = input.input_path.with_extension("png");

    let args: Vec<OsString> = vec![
        "--export-type=png".into(),
        {
            let mut arg = OsString::from("--export-filename=");
            arg.push(output_path.as_os_str());
            arg
        },
        input.input_path.as_path().into(),
    ];
    run_tool("inkscape", args).await?;

    Ok(ConversionOutput {
        output_path: Some(output_path),
        object_key: None,
        metadata: json!({"note": "Converted via Inkscape"}),
    })
}

async fn webp_to_png(input: ConversionInput) -> Result<ConversionOutput> {
    ensure_input_exists(&input.input_path)?;
    let output_path = input.input_path.with_extension("png");

    let args: Vec<OsString> = vec![
        "-y".into(),
        "-i".into(),
        input.input_path.as_path().into(),
        output_path.as_path().into(),
    ];
    run_tool("ffmpeg", args).await?;

    Ok(ConversionOutput {
        output_path: Some(output_path),
        object_key: None,
        metadata: json!({"note": "Converted via FFmpeg"}),
    })
}

pub fn register(registry: &mut PluginRegistry) -> Result<()> {
    registry.register(Plugin::new("svg-to-png", "svg", "png", svg_to_png))?;
    registry.register(Plugin::new("webp-to-png", "webp", "png", webp_to_png))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registers_expected_pairs() {
        let mut registry = PluginRegistry::new();
        register(&mut registry).unwrap();
        assert!(registry.contains("svg", "png"));
        assert!(registry.contains("webp", "png"));
    }
}
