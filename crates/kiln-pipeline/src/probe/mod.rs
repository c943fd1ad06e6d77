//! Probe engine: structural signal extraction and slicing-strategy
//! recommendation over sampled text.

mod recommend;
mod signals;

pub use recommend::{detect_delimiter_hits, recommend_strategy, CustomDelimiterConfig};
pub use signals::extract_signals;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The three canonical slicing modes. Every concrete strategy maps onto
/// exactly one mode, and `mode_id` is the numeric encoding of that mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    DirectDelimiter,
    SemanticSentence,
    HierarchicalHeading,
}

impl Mode {
    pub fn id(&self) -> u8 {
        match self {
            Mode::DirectDelimiter => 1,
            Mode::SemanticSentence => 2,
            Mode::HierarchicalHeading => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::DirectDelimiter => "direct_delimiter",
            Mode::SemanticSentence => "semantic_sentence",
            Mode::HierarchicalHeading => "hierarchical_heading",
        }
    }
}

/// Concrete slicing strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Strategy {
    CustomDelimiterSplit,
    HeadingBlockLengthSplit,
    SentenceSplitSliding,
    TableBatch,
    CodeLogBlock,
    SlideBlockTextboxMerge,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::CustomDelimiterSplit => "custom_delimiter_split",
            Strategy::HeadingBlockLengthSplit => "heading_block_length_split",
            Strategy::SentenceSplitSliding => "sentence_split_sliding",
            Strategy::TableBatch => "table_batch",
            Strategy::CodeLogBlock => "code_log_block",
            Strategy::SlideBlockTextboxMerge => "slide_block_textbox_merge",
        }
    }

    /// Canonical strategy → mode mapping, total over all strategies.
    pub fn mode(&self) -> Mode {
        match self {
            Strategy::CustomDelimiterSplit => Mode::DirectDelimiter,
            Strategy::SentenceSplitSliding => Mode::SemanticSentence,
            Strategy::HeadingBlockLengthSplit
            | Strategy::TableBatch
            | Strategy::CodeLogBlock
            | Strategy::SlideBlockTextboxMerge => Mode::HierarchicalHeading,
        }
    }
}

/// Structural signals extracted from text samples. Ratios are in `[0, 1]`;
/// paragraph lengths are character counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub heading_ratio: f64,
    pub list_ratio: f64,
    pub table_ratio: f64,
    pub code_ratio: f64,
    pub p50_para_len: u32,
    pub p90_para_len: u32,
    pub digit_symbol_ratio: f64,
}

impl Profile {
    /// Copy with every float rounded to 3 decimals, the precision promised
    /// to API consumers.
    pub fn rounded(&self) -> Profile {
        Profile {
            heading_ratio: round3(self.heading_ratio),
            list_ratio: round3(self.list_ratio),
            table_ratio: round3(self.table_ratio),
            code_ratio: round3(self.code_ratio),
            p50_para_len: self.p50_para_len,
            p90_para_len: self.p90_para_len,
            digit_symbol_ratio: round3(self.digit_symbol_ratio),
        }
    }
}

/// A strategy recommendation with its supporting evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub strategy_id: String,
    pub mode: Mode,
    pub mode_id: u8,
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<BTreeMap<String, f64>>,
    pub delimiter_hits: usize,
    pub profile: Profile,
    pub notes: String,
}

/// Round to 3 decimals.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
