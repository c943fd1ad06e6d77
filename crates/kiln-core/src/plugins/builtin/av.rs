//! Audio/video conversions via FFmpeg.
//!
//! `metadata.duration_seconds` becomes an encoder-level `-t` trim.

use std::ffi::OsString;

use serde_json::json;

use super::{ensure_input_exists, run_tool};
use crate::error::Result;
use crate::plugins::{ConversionInput, ConversionOutput, Plugin, PluginRegistry};

async fn gif_to_mp4(input: ConversionInput) -> Result<ConversionOutput> {
    ensure_input_exists(&input.input_path)?;
    let output_path = input.input_path.with_extension("mp4");

    let mut args: Vec<OsString> = vec![
        "-y".into(),
        "-i".into(),
        input.input_path.as_path().into(),
        // Encoders reject odd dimensions; round both up to even.
        "-vf".into(),
        "scale=ceil(iw/2)*2:ceil(ih/2)*2".into(),
        "-movflags".into(),
        "faststart".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
    ];
    if let Some(duration) = input.metadata.duration_seconds.filter(|d| *d > 0) {
        args.push("-t".into());
        args.push(duration.to_string().into());
    }
    args.push(output_path.as_path().into());
    run_tool("ffmpeg", args).await?;

    Ok(ConversionOutput {
        output_path: Some(output_path),
        object_key: None,
        metadata: json!({"note": "Converted via FFmpeg"}),
    })
}

async fn audio_to_mp3(input: ConversionInput) -> Result<ConversionOutput> {
    ensure_input_exists(&input.input_path)?;
    let output_path = input.input_path.with_extension("mp3");

    let mut args: Vec<OsString> = vec![
        "-y".into(),
        "-i".into(),
        input.input_path.as_path().into(),
        "-q:a".into(),
        "2".into(),
    ];
    if let Some(duration) = input.metadata.duration_seconds.filter(|d| *d > 0) {
        args.push("-t".into());
        args.push(duration.to_string().into());
    }
    args.push(output_path.as_path().into());
    run_tool("ffmpeg", args).await?;

    Ok(ConversionOutput {
        output_path: Some(output_path),
        object_key: None,
        metadata: json!({"note": format!("Converted {}->mp3 via FFmpeg", input.source_format)}),
    })
}

async fn video_to_mp4(input: ConversionInput) -> Result<ConversionOutput> {
    ensure_input_exists(&input.input_path)?;
    let output_path = input.input_path.with_extension("mp4");

    let mut args: Vec<OsString> = vec![
        "-y".into(),
        "-i".into(),
        input.input_path.as_path().into(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "fast".into(),
        "-crf".into(),
        "23".into(),
        "-c:a".into(),
        "aac".into(),
        "-movflags".into(),
        "faststart".into(),
    ];
    if let Some(duration) = input.metadata.duration_seconds.filter(|d| *d > 0) {
        args.push("-t".into());
        args.push(duration.to_string().into());
    }
    args.push(output_path.as_path().into());
    run_tool("ffmpeg", args).await?;

    Ok(ConversionOutput {
        output_path: Some(output_path),
        object_key: None,
        metadata: json!({"note": format!("Converted {}->mp4 via FFmpeg", input.source_format)}),
    })
}

pub fn register(registry: &mut PluginRegistry) -> Result<()> {
    registry.register(Plugin::new("gif-to-mp4", "gif", "mp4", gif_to_mp4))?;
    for source in ["wav", "flac", "ogg", "aac"] {
        registry.register(Plugin::new(
            &format!("{source}-to-mp3"),
            source,
            "mp3",
            audio_to_mp3,
        ))?;
    }
    for source in ["avi", "mov", "mkv", "flv", "wmv"] {
        registry.register(Plugin::new(
            &format!("{source}-to-mp4"),
            source,
            "mp4",
            video_to_mp4,
        ))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registers_expected_pairs() {
        let mut registry = PluginRegistry::new();
        register(&mut registry).unwrap();
        assert!(registry.contains("gif", "mp4"));
        assert!(registry.contains("flac", "mp3"));
        assert!(registry.contains("wmv", "mp4"));
        assert_eq!(registry.len(), 10);
    }
}
