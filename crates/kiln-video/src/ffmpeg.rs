//! FFmpeg/ffprobe drivers for the video pipeline.
//!
//! Slicing uses stream copy (no transcode); keyframes are sampled at a fixed
//! FPS; scene detection reads lavfi scene scores through ffprobe.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use kiln_core::plugins::builtin::{require_bin, run_tool};
use kiln_core::{KilnError, Result};

use crate::segment::Segment;

async fn ffprobe_stdout(args: Vec<OsString>) -> Result<String> {
    require_bin("ffprobe")?;
    let output = Command::new("ffprobe")
        .args(args)
        .output()
        .await
        .map_err(|e| KilnError::Subprocess {
            program: "ffprobe".into(),
            message: format!("Failed to start: {e}"),
        })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(KilnError::Subprocess {
            program: "ffprobe".into(),
            message: stderr.chars().take(500).collect(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Media duration in seconds; 0.0 when the container reports none.
pub async fn probe_duration(path: &Path) -> Result<f64> {
    let stdout = ffprobe_stdout(vec![
        "-v".into(),
        "error".into(),
        "-show_entries".into(),
        "format=duration".into(),
        "-of".into(),
        "default=nk=1:nw=1".into(),
        path.into(),
    ])
    .await?;
    Ok(stdout.trim().parse::<f64>().unwrap_or(0.0))
}

/// Scene-change timestamps with score above `threshold`. Detection failures
/// degrade to an empty list so the caller can fall back to fixed windows.
pub async fn scene_cut_timestamps(path: &Path, threshold: f64) -> Vec<f64> {
    let filter = format!("movie={},select=gt(scene\\,{threshold})", path.display());
    let result = ffprobe_stdout(vec![
        "-hide_banner".into(),
        "-show_frames".into(),
        "-of".into(),
        "json".into(),
        "-f".into(),
        "lavfi".into(),
        filter.into(),
    ])
    .await;

    let stdout = match result {
        Ok(stdout) => stdout,
        Err(err) => {
            warn!("Scene detection failed, falling back to fixed segments: {err}");
            return Vec::new();
        }
    };

    let data: Value = serde_json::from_str(&stdout).unwrap_or_default();
    let mut cuts: Vec<f64> = data["frames"]
        .as_array()
        .map(|frames| {
            frames
                .iter()
                .filter_map(|frame| {
                    let ts = frame
                        .get("pkt_pts_time")
                        .or_else(|| frame.get("pts_time"))?;
                    match ts {
                        Value::String(s) => s.parse::<f64>().ok(),
                        Value::Number(n) => n.as_f64(),
                        _ => None,
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    cuts.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    cuts.dedup();
    debug!("Scene detection found {} cuts", cuts.len());
    cuts
}

/// Extract the full audio track to an M4A next to the workdir.
pub async fn extract_audio(video_path: &Path, workdir: &Path) -> Result<PathBuf> {
    require_bin("ffmpeg")?;
    let out_path = workdir.join("audio_full.m4a");
    let args: Vec<OsString> = vec![
        "-y".into(),
        "-i".into(),
        video_path.into(),
        "-vn".into(),
        "-acodec".into(),
        "aac".into(),
        out_path.as_path().into(),
    ];
    run_tool("ffmpeg", args).await?;
    Ok(out_path)
}

/// Cut one segment with stream copy.
pub async fn slice_copy(
    input: &Path,
    segment: &Segment,
    out_path: &Path,
) -> Result<()> {
    require_bin("ffmpeg")?;
    let args: Vec<OsString> = vec![
        "-y".into(),
        "-ss".into(),
        segment.start.to_string().into(),
        "-i".into(),
        input.into(),
        "-t".into(),
        segment.duration().to_string().into(),
        "-c".into(),
        "copy".into(),
        out_path.into(),
    ];
    run_tool("ffmpeg", args).await
}

/// Extract keyframes at `fps` into `workdir/frames`, returning the ordered
/// frame paths with their timestamps (`idx / fps`).
pub async fn extract_frames(
    video_path: &Path,
    fps: f64,
    workdir: &Path,
) -> Result<Vec<(f64, PathBuf)>> {
    if fps <= 0.0 {
        return Ok(Vec::new());
    }
    require_bin("ffmpeg")?;
    let frame_dir = workdir.join("frames");
    tokio::fs::create_dir_all(&frame_dir)
        .await
        .map_err(|e| KilnError::io_with_path(e, &frame_dir))?;

    let args: Vec<OsString> = vec![
        "-y".into(),
        "-i".into(),
        video_path.into(),
        "-vf".into(),
        format!("fps={fps}").into(),
        frame_dir.join("frame_%06d.jpg").as_path().into(),
    ];
    run_tool("ffmpeg", args).await?;

    let mut names: Vec<PathBuf> = std::fs::read_dir(&frame_dir)
        .map_err(|e| KilnError::io_with_path(e, &frame_dir))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .map(|n| n.to_string_lossy().starts_with("frame_"))
                .unwrap_or(false)
        })
        .collect();
    names.sort();

    Ok(names
        .into_iter()
        .enumerate()
        .map(|(idx, path)| (idx as f64 / fps, path))
        .collect())
}
