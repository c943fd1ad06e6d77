//! Plugin-modules file: YAML `{modules: [..]}`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{KilnError, Result};

#[derive(Debug, Default, Serialize, Deserialize)]
struct ModulesFile {
    #[serde(default)]
    modules: Vec<String>,
}

/// Read the module list; a missing file yields an empty list.
pub fn read_plugin_module_file(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content =
        std::fs::read_to_string(path).map_err(|e| KilnError::io_with_path(e, path))?;
    let parsed: ModulesFile = serde_yaml::from_str(&content).map_err(|e| KilnError::Config {
        message: format!("Invalid plugin modules file {}: {e}", path.display()),
    })?;
    Ok(parsed.modules)
}

/// Write the module list, de-duplicated with first-seen order preserved.
pub fn write_plugin_module_file<I, S>(path: impl AsRef<Path>, modules: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| KilnError::io_with_path(e, parent))?;
    }

    let mut ordered_unique: Vec<String> = Vec::new();
    for module in modules {
        let module = module.into();
        if !module.is_empty() && !ordered_unique.contains(&module) {
            ordered_unique.push(module);
        }
    }

    let payload = ModulesFile {
        modules: ordered_unique,
    };
    let yaml = serde_yaml::to_string(&payload).map_err(|e| KilnError::Config {
        message: format!("Failed to serialize plugin modules: {e}"),
    })?;
    std::fs::write(path, yaml).map_err(|e| KilnError::io_with_path(e, path))?;
    Ok(())
}
