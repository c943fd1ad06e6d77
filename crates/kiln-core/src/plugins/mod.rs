//! Conversion plugin registry.
//!
//! A plugin is a registration record: a [`PluginDescriptor`] plus a boxed
//! async convert function. The registry is keyed by lowercased
//! `(source_format, target_format)`, populated once at startup from the
//! plugin-modules file (or the builtin default list), and immutable after.

pub mod builtin;
mod modules_file;

pub use modules_file::{read_plugin_module_file, write_plugin_module_file};

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::config::ConverterSettings;
use crate::error::{KilnError, Result};

/// Builtin plugin module names, in registration order.
pub const DEFAULT_PLUGIN_MODULES: &[&str] =
    &["office", "html", "image", "av", "spreadsheet", "text"];

/// Identity of a registered converter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub slug: String,
    pub source_format: String,
    pub target_format: String,
}

/// Input handed to a converter. The file is already materialized locally.
#[derive(Debug, Clone)]
pub struct ConversionInput {
    pub source_format: String,
    pub target_format: String,
    pub input_path: PathBuf,
    pub input_url: Option<String>,
    pub object_key: Option<String>,
    pub metadata: ConvertMetadata,
}

/// Caller-provided conversion knobs.
#[derive(Debug, Clone, Default)]
pub struct ConvertMetadata {
    /// Cap paged PDF outputs to the first N pages (0 = no limit).
    pub page_limit: Option<u32>,
    /// Trim AV outputs at the encoder level.
    pub duration_seconds: Option<u32>,
}

/// What a converter produced.
#[derive(Debug, Clone, Default)]
pub struct ConversionOutput {
    pub output_path: Option<PathBuf>,
    /// Set when the plugin uploaded the artifact itself.
    pub object_key: Option<String>,
    pub metadata: Value,
}

type ConvertFuture = Pin<Box<dyn Future<Output = Result<ConversionOutput>> + Send>>;
type ConvertFn = Arc<dyn Fn(ConversionInput) -> ConvertFuture + Send + Sync>;

/// Registration record: descriptor plus convert capability.
#[derive(Clone)]
pub struct Plugin {
    pub descriptor: PluginDescriptor,
    convert: ConvertFn,
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl Plugin {
    pub fn new<F, Fut>(slug: &str, source_format: &str, target_format: &str, convert: F) -> Self
    where
        F: Fn(ConversionInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ConversionOutput>> + Send + 'static,
    {
        Self {
            descriptor: PluginDescriptor {
                slug: slug.to_string(),
                source_format: source_format.to_string(),
                target_format: target_format.to_string(),
            },
            convert: Arc::new(move |input| Box::pin(convert(input))),
        }
    }

    pub async fn convert(&self, input: ConversionInput) -> Result<ConversionOutput> {
        (self.convert)(input).await
    }
}

/// Registry of plugins keyed by `(source, target)`, both lowercased.
/// Entries keep registration order, which target defaulting relies on.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: IndexMap<(String, String), Plugin>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin; a duplicate `(source, target)` pair fails.
    pub fn register(&mut self, plugin: Plugin) -> Result<()> {
        let key = (
            plugin.descriptor.source_format.to_lowercase(),
            plugin.descriptor.target_format.to_lowercase(),
        );
        if self.plugins.contains_key(&key) {
            return Err(KilnError::PluginAlreadyRegistered {
                source_format: key.0,
                target_format: key.1,
            });
        }
        self.plugins.insert(key, plugin);
        Ok(())
    }

    /// Look up a converter. The `locator` is echoed in the miss error so an
    /// operator can tell which input hit the unsupported pair.
    pub fn get(&self, source: &str, target: &str, locator: &str) -> Result<&Plugin> {
        self.plugins
            .get(&(source.to_lowercase(), target.to_lowercase()))
            .ok_or_else(|| KilnError::UnsupportedFormat {
                source_format: source.to_string(),
                target_format: target.to_string(),
                locator: locator.to_string(),
            })
    }

    pub fn contains(&self, source: &str, target: &str) -> bool {
        self.plugins
            .contains_key(&(source.to_lowercase(), target.to_lowercase()))
    }

    /// First-registered target for a source format, used for target
    /// defaulting.
    pub fn first_target_for(&self, source: &str) -> Option<String> {
        let source = source.to_lowercase();
        self.plugins
            .keys()
            .find(|(s, _)| *s == source)
            .map(|(_, t)| t.clone())
    }

    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        self.plugins.values().map(|p| p.descriptor.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// Build a registry from a list of builtin module names.
pub fn build_registry(modules: &[String]) -> Result<PluginRegistry> {
    let mut registry = PluginRegistry::new();
    for module in modules {
        match module.as_str() {
            "office" => builtin::office::register(&mut registry)?,
            "html" => builtin::html::register(&mut registry)?,
            "image" => builtin::image::register(&mut registry)?,
            "av" => builtin::av::register(&mut registry)?,
            "spreadsheet" => builtin::spreadsheet::register(&mut registry)?,
            "text" => builtin::text::register(&mut registry)?,
            other => {
                return Err(KilnError::Config {
                    message: format!("Unknown plugin module: {other}"),
                })
            }
        }
    }
    info!("Registered {} conversion plugins from {} modules", registry.len(), modules.len());
    Ok(registry)
}

/// Resolve the module list from settings: explicit list, then the modules
/// file, then the builtin defaults.
pub fn registry_from_settings(settings: &ConverterSettings) -> Result<PluginRegistry> {
    let explicit: Vec<String> = settings
        .plugin_modules
        .iter()
        .filter(|m| !m.is_empty())
        .cloned()
        .collect();
    if !explicit.is_empty() {
        return build_registry(&explicit);
    }

    if let Some(file) = &settings.plugin_modules_file {
        let from_file = read_plugin_module_file(file)?;
        if !from_file.is_empty() {
            return build_registry(&from_file);
        }
    }

    let defaults: Vec<String> = DEFAULT_PLUGIN_MODULES.iter().map(|m| m.to_string()).collect();
    build_registry(&defaults)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_plugin(slug: &str, source: &str, target: &str) -> Plugin {
        Plugin::new(slug, source, target, |_input| async move {
            Ok(ConversionOutput {
                metadata: json!({"note": "noop"}),
                ..Default::default()
            })
        })
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = PluginRegistry::new();
        registry.register(noop_plugin("a", "doc", "pdf")).unwrap();
        let err = registry.register(noop_plugin("b", "DOC", "PDF"));
        assert!(matches!(err, Err(KilnError::PluginAlreadyRegistered { .. })));
    }

    #[test]
    fn test_lookup_miss_includes_locator() {
        let registry = PluginRegistry::new();
        let err = registry.get("doc", "mp4", "https://h/in.doc").unwrap_err();
        assert!(err.to_string().contains("https://h/in.doc"));
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut registry = PluginRegistry::new();
        registry.register(noop_plugin("a", "doc", "pdf")).unwrap();
        assert!(registry.get("DOC", "Pdf", "x").is_ok());
    }

    #[test]
    fn test_first_target_follows_registration_order() {
        let mut registry = PluginRegistry::new();
        // pdf registered first; alphabetical order would pick docx.
        registry.register(noop_plugin("a", "doc", "pdf")).unwrap();
        registry.register(noop_plugin("b", "doc", "docx")).unwrap();
        assert_eq!(registry.first_target_for("doc").as_deref(), Some("pdf"));
        assert_eq!(registry.first_target_for("gif"), None);
    }

    #[test]
    fn test_default_registry_doc_defaults_to_pdf() {
        // The office module registers doc->pdf before doc->docx, so an
        // absent target format for a doc input resolves to pdf.
        let modules: Vec<String> = DEFAULT_PLUGIN_MODULES.iter().map(|m| m.to_string()).collect();
        let registry = build_registry(&modules).unwrap();
        assert_eq!(registry.first_target_for("doc").as_deref(), Some("pdf"));
    }

    #[test]
    fn test_default_registry_exposes_expected_pairs() {
        let modules: Vec<String> = DEFAULT_PLUGIN_MODULES.iter().map(|m| m.to_string()).collect();
        let registry = build_registry(&modules).unwrap();
        for (source, target) in [
            ("doc", "pdf"),
            ("doc", "docx"),
            ("docx", "pdf"),
            ("ppt", "pdf"),
            ("pptx", "pdf"),
            ("html", "pdf"),
            ("html", "md"),
            ("svg", "png"),
            ("webp", "png"),
            ("gif", "mp4"),
            ("wav", "mp3"),
            ("flac", "mp3"),
            ("ogg", "mp3"),
            ("aac", "mp3"),
            ("avi", "mp4"),
            ("mov", "mp4"),
            ("mkv", "mp4"),
            ("xlsx", "pdf"),
            ("xls", "pdf"),
            ("xlsx", "md"),
            ("xls", "md"),
            ("txt", "md"),
            ("markdown", "md"),
        ] {
            assert!(registry.contains(source, target), "missing {source}->{target}");
        }
    }

    #[test]
    fn test_unknown_module_fails() {
        let err = build_registry(&["nope".to_string()]);
        assert!(matches!(err, Err(KilnError::Config { .. })));
    }
}
