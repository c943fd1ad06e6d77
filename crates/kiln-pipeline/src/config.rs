//! Settings for the pipeline orchestrator (`PIPELINE_`) and the probe
//! engine (`SLICE_`).

use serde::{Deserialize, Serialize};

use kiln_core::config::load_settings;
use kiln_core::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Queue for orchestration tasks.
    pub pipeline_queue: String,
    /// Queue for converter tasks.
    pub conversion_queue: String,
    /// Queue for probe/recommendation tasks.
    pub probe_queue: String,

    /// Fixed page count used as the sampling hint and `page_limit` default.
    pub sample_pages: usize,
    /// Ratio-based page sampling, capped at 10 pages.
    pub sample_page_ratio: f64,
    /// Cap on total sampled characters (0 disables the cap).
    pub sample_char_limit: usize,

    pub probe_timeout_sec: u64,
    pub conversion_timeout_sec: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            pipeline_queue: "pipeline".into(),
            conversion_queue: "conversion".into(),
            probe_queue: "probe".into(),
            sample_pages: 5,
            sample_page_ratio: 0.2,
            sample_char_limit: 5000,
            probe_timeout_sec: 60,
            conversion_timeout_sec: 180,
        }
    }
}

impl PipelineSettings {
    pub fn from_env() -> Result<Self> {
        load_settings("PIPELINE", None)
    }
}

/// Probe gating thresholds, overridable per deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    /// Table-ratio gate.
    pub table_threshold: f64,
    /// Code-ratio gate.
    pub code_threshold: f64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            table_threshold: 0.10,
            code_threshold: 0.05,
        }
    }
}

impl ProbeSettings {
    pub fn from_env() -> Result<Self> {
        load_settings("SLICE", None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = PipelineSettings::default();
        assert_eq!(settings.sample_pages, 5);
        assert!((settings.sample_page_ratio - 0.2).abs() < 1e-9);
        assert_eq!(settings.probe_queue, "probe");

        let probe = ProbeSettings::default();
        assert!((probe.table_threshold - 0.10).abs() < 1e-9);
    }
}
