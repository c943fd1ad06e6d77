//! Builtin conversion plugins. Each family wraps an external tool behind the
//! contract the rest of the engine relies on.

pub mod av;
pub mod html;
pub mod image;
pub mod office;
pub mod spreadsheet;
pub mod text;

use std::ffi::OsStr;
use std::path::Path;

use tokio::process::Command;

use crate::error::{KilnError, Result};

/// Fail fast when a required external binary is not on PATH.
pub fn require_bin(program: &str) -> Result<()> {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    let found = std::env::split_paths(&path_var).any(|dir| dir.join(program).is_file());
    if found {
        Ok(())
    } else {
        Err(KilnError::Subprocess {
            program: program.to_string(),
            message: "Required binary not found on PATH".into(),
        })
    }
}

/// Run an external tool, surfacing a trimmed stderr on failure.
pub async fn run_tool<I, S>(program: &str, args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| KilnError::Subprocess {
            program: program.to_string(),
            message: format!("Failed to start: {e}"),
        })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let trimmed: String = stderr.chars().take(500).collect();
        return Err(KilnError::Subprocess {
            program: program.to_string(),
            message: trimmed,
        });
    }
    Ok(())
}

pub(crate) fn ensure_input_exists(path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(KilnError::FileNotFound(path.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_bin_missing() {
        assert!(require_bin("definitely-not-a-real-binary-kiln").is_err());
    }

    #[tokio::test]
    async fn test_run_tool_missing_program() {
        let err = run_tool("definitely-not-a-real-binary-kiln", ["--version"]).await;
        assert!(matches!(err, Err(KilnError::Subprocess { .. })));
    }
}
