//! Strategy recommendation: format hard-routing, gates, weighted scoring
//! with format-prior bias, and multi-page aggregation.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::signals::extract_signals;
use super::{round3, Profile, Recommendation, Strategy};
use crate::config::ProbeSettings;

const FORMAT_TABLE: [&str; 4] = ["xlsx", "xls", "csv", "tsv"];
const FORMAT_CODE: [&str; 12] = [
    "py", "c", "cpp", "java", "js", "ts", "go", "rs", "rb", "php", "sh", "log",
];
const FORMAT_SLIDE: [&str; 2] = ["ppt", "pptx"];
const FORMAT_TEXT_BIASED_HEADING: [&str; 5] = ["doc", "docx", "pdf", "html", "htm"];

// Score weights.
const W_TABLE: f64 = 0.8;
const W_CODE: f64 = 0.8;
const W_PARA: f64 = 0.3;

const DEFAULT_TARGET_LENGTH: u32 = 220;
const DEFAULT_OVERLAP_RATIO: f64 = 0.15;

/// Caller-supplied custom delimiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomDelimiterConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub delimiters: Vec<String>,
    #[serde(default = "default_min_segments")]
    pub min_segments: usize,
    #[serde(default = "default_min_segment_len")]
    pub min_segment_len: u32,
    #[serde(default = "default_max_segment_len")]
    pub max_segment_len: u32,
    #[serde(default)]
    pub overlap_ratio: Option<f64>,
}

fn default_min_segments() -> usize {
    5
}
fn default_min_segment_len() -> u32 {
    30
}
fn default_max_segment_len() -> u32 {
    800
}

impl Default for CustomDelimiterConfig {
    fn default() -> Self {
        Self {
            enable: false,
            delimiters: Vec::new(),
            min_segments: default_min_segments(),
            min_segment_len: default_min_segment_len(),
            max_segment_len: default_max_segment_len(),
            overlap_ratio: None,
        }
    }
}

fn normalize_fmt(fmt: Option<&str>) -> String {
    fmt.unwrap_or_default()
        .trim()
        .to_lowercase()
        .trim_start_matches('.')
        .to_string()
}

/// Format prior bias added to the weighted scores: format first, probe
/// fine-tunes.
fn format_prior_bias(fmt: &str) -> BTreeMap<Strategy, f64> {
    let mut bias: BTreeMap<Strategy, f64> = BTreeMap::new();
    for strategy in [
        Strategy::HeadingBlockLengthSplit,
        Strategy::SentenceSplitSliding,
        Strategy::TableBatch,
        Strategy::CodeLogBlock,
    ] {
        bias.insert(strategy, 0.0);
    }
    if fmt.is_empty() {
        return bias;
    }

    if FORMAT_TABLE.contains(&fmt) {
        *bias.entry(Strategy::TableBatch).or_default() += 0.35;
        *bias.entry(Strategy::HeadingBlockLengthSplit).or_default() -= 0.15;
        *bias.entry(Strategy::SentenceSplitSliding).or_default() -= 0.15;
    } else if FORMAT_CODE.contains(&fmt) {
        *bias.entry(Strategy::CodeLogBlock).or_default() += 0.35;
        *bias.entry(Strategy::HeadingBlockLengthSplit).or_default() -= 0.1;
        *bias.entry(Strategy::SentenceSplitSliding).or_default() -= 0.1;
        *bias.entry(Strategy::TableBatch).or_default() -= 0.1;
    } else if FORMAT_TEXT_BIASED_HEADING.contains(&fmt) {
        *bias.entry(Strategy::HeadingBlockLengthSplit).or_default() += 0.1;
        *bias.entry(Strategy::SentenceSplitSliding).or_default() += 0.05;
    }
    // Slides hard-route and carry no scoring bias.
    bias
}

/// Maximum number of segments any configured delimiter can split a sample
/// into. Invalid delimiter regexes are skipped.
pub fn detect_delimiter_hits(samples: &[String], delimiters: &[String]) -> usize {
    if samples.is_empty() || delimiters.is_empty() {
        return 0;
    }
    let mut max_segments = 0;
    for delim in delimiters {
        let Ok(pattern) = Regex::new(delim) else {
            continue;
        };
        for text in samples {
            if text.is_empty() {
                continue;
            }
            let segments = pattern.split(text).filter(|s| !s.trim().is_empty()).count();
            max_segments = max_segments.max(segments);
        }
    }
    max_segments
}

/// Estimate slicing parameters for the selected strategy.
fn estimate_params(profile: &Profile, strategy: Strategy, cfg: &CustomDelimiterConfig) -> Value {
    let hint = if profile.p50_para_len > 0 {
        profile.p50_para_len
    } else {
        DEFAULT_TARGET_LENGTH
    };
    let target_length = hint.clamp(150, 400);
    let overlap_ratio = cfg.overlap_ratio.unwrap_or(DEFAULT_OVERLAP_RATIO);

    let mut params = json!({
        "target_length": target_length,
        "overlap_ratio": overlap_ratio,
    });

    match strategy {
        Strategy::CustomDelimiterSplit => {
            params["delimiters"] = json!(cfg.delimiters);
            params["min_segment_len"] = json!(cfg.min_segment_len);
            params["max_segment_len"] = json!(cfg.max_segment_len);
        }
        Strategy::TableBatch => {
            params["preserve_tables"] = json!(true);
        }
        Strategy::CodeLogBlock => {
            params["no_overlap"] = json!(true);
        }
        Strategy::SlideBlockTextboxMerge => {
            params["merge_textboxes"] = json!(true);
        }
        _ => {}
    }
    params
}

struct PageScore {
    strategy: Strategy,
    scores: BTreeMap<Strategy, f64>,
    note: Option<&'static str>,
}

/// Score a single profile. Short-circuit order: custom delimiter gate, table
/// gate, long-paragraph override, code gate, then the weighted argmax.
fn score_profile(
    profile: &Profile,
    delimiter_hits: usize,
    cfg: &CustomDelimiterConfig,
    thresholds: &ProbeSettings,
    bias: &BTreeMap<Strategy, f64>,
) -> PageScore {
    let h = profile.heading_ratio;
    let l = profile.list_ratio;
    let t = profile.table_ratio;
    let c = profile.code_ratio;
    let p90 = profile.p90_para_len as f64;

    if cfg.enable && delimiter_hits >= cfg.min_segments {
        return PageScore {
            strategy: Strategy::CustomDelimiterSplit,
            scores: BTreeMap::from([(Strategy::CustomDelimiterSplit, 1.0)]),
            note: None,
        };
    }
    if t > thresholds.table_threshold {
        return PageScore {
            strategy: Strategy::TableBatch,
            scores: BTreeMap::from([(Strategy::TableBatch, t)]),
            note: Some("table_detected"),
        };
    }
    if p90 >= 800.0 || (p90 >= 600.0 && h > 0.01) {
        return PageScore {
            strategy: Strategy::HeadingBlockLengthSplit,
            scores: BTreeMap::from([(Strategy::HeadingBlockLengthSplit, 1.0)]),
            note: Some("forced_long_paragraph_override"),
        };
    }
    if c > thresholds.code_threshold {
        return PageScore {
            strategy: Strategy::CodeLogBlock,
            scores: BTreeMap::from([(Strategy::CodeLogBlock, c)]),
            note: Some("code_detected"),
        };
    }

    let ind = |cond: bool| if cond { 1.0 } else { 0.0 };
    let s_heading = 0.55
        + 1.5 * h
        + 1.0 * l
        + 0.35 * ind(h + l > 0.03)
        + 0.35 * ind(p90 > 500.0)
        + 0.4 * ind(h > 0.25 || l > 0.25);
    let s_sentence = 0.22 - 0.9 * h - 0.5 * l - 0.35 * t - 0.35 * c
        + W_PARA * (p90 / 400.0).min(1.0)
        - 0.95 * ((p90 - 500.0) / 400.0).max(0.0);
    let s_table = W_TABLE * t;
    let s_code = W_CODE * c;

    let mut scores = BTreeMap::from([
        (Strategy::HeadingBlockLengthSplit, s_heading),
        (Strategy::SentenceSplitSliding, s_sentence),
        (Strategy::TableBatch, s_table),
        (Strategy::CodeLogBlock, s_code),
    ]);
    for (strategy, score) in scores.iter_mut() {
        *score += bias.get(strategy).copied().unwrap_or(0.0);
    }

    let strategy = argmax(&scores);
    PageScore {
        strategy,
        scores,
        note: None,
    }
}

fn argmax(scores: &BTreeMap<Strategy, f64>) -> Strategy {
    scores
        .iter()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(strategy, _)| *strategy)
        .unwrap_or(Strategy::SentenceSplitSliding)
}

fn named_scores(scores: &BTreeMap<Strategy, f64>) -> BTreeMap<String, f64> {
    scores
        .iter()
        .map(|(strategy, score)| (strategy.as_str().to_string(), round3(*score)))
        .collect()
}

fn build_recommendation(
    strategy: Strategy,
    params: Value,
    candidates: Option<BTreeMap<String, f64>>,
    delimiter_hits: usize,
    profile: &Profile,
    notes: String,
) -> Recommendation {
    let mode = strategy.mode();
    Recommendation {
        strategy_id: strategy.as_str().to_string(),
        mode,
        mode_id: mode.id(),
        params,
        candidates,
        delimiter_hits,
        profile: profile.rounded(),
        notes,
    }
}

fn join_notes(base: &str, extra: Option<&str>) -> String {
    match extra {
        Some(extra) => format!("{base}|{extra}"),
        None => base.to_string(),
    }
}

/// Recommend a slicing strategy for the given profile and samples.
///
/// Decision order: declared-format hard routing (tabular, code/log, slides),
/// then the scoring gates, then the weighted argmax with format-prior bias.
/// With more than one sample, pages are scored independently, summed,
/// averaged and clamped to `[-1, 1]` before the argmax; a table-gate hit on
/// any page short-circuits to `table_batch`.
pub fn recommend_strategy(
    profile: &Profile,
    samples: &[String],
    custom: &CustomDelimiterConfig,
    emit_candidates: bool,
    source_format: Option<&str>,
    thresholds: &ProbeSettings,
) -> Recommendation {
    let fmt = normalize_fmt(source_format);
    let bias = format_prior_bias(&fmt);
    let delimiter_hits = detect_delimiter_hits(samples, &custom.delimiters);

    // Hard routing on the declared source format.
    let hard_routed = if FORMAT_TABLE.contains(&fmt.as_str()) {
        Some((Strategy::TableBatch, "format-priority: tabular source uses table slicing"))
    } else if FORMAT_CODE.contains(&fmt.as_str()) {
        Some((Strategy::CodeLogBlock, "format-priority: code/log source uses block slicing"))
    } else if FORMAT_SLIDE.contains(&fmt.as_str()) {
        Some((
            Strategy::SlideBlockTextboxMerge,
            "format-priority: slides merge textboxes",
        ))
    } else {
        None
    };
    if let Some((strategy, note)) = hard_routed {
        let params = estimate_params(profile, strategy, custom);
        let candidates = emit_candidates
            .then(|| BTreeMap::from([(strategy.as_str().to_string(), 1.0)]));
        return build_recommendation(
            strategy,
            params,
            candidates,
            delimiter_hits,
            profile,
            join_notes(note, Some("mapped_to_hierarchical")),
        );
    }

    // Multi-page: score each page, aggregate.
    if samples.len() > 1 {
        let page_profiles: Vec<(Profile, &String)> = samples
            .iter()
            .filter(|s| !s.is_empty())
            .filter_map(|s| {
                extract_signals(std::slice::from_ref(s))
                    .ok()
                    .map(|p| (p, s))
            })
            .collect();

        if !page_profiles.is_empty() {
            // A table hit on any page wins outright: header or title pages
            // must not drag the decision towards headings.
            let max_table_ratio = page_profiles
                .iter()
                .map(|(p, _)| p.table_ratio)
                .fold(0.0_f64, f64::max);
            if max_table_ratio > thresholds.table_threshold {
                let params = estimate_params(profile, Strategy::TableBatch, custom);
                let candidates = emit_candidates.then(|| {
                    BTreeMap::from([(
                        Strategy::TableBatch.as_str().to_string(),
                        round3(max_table_ratio),
                    )])
                });
                return build_recommendation(
                    Strategy::TableBatch,
                    params,
                    candidates,
                    delimiter_hits,
                    profile,
                    join_notes(
                        "advisory recommendation (aggregated page scoring)",
                        Some("table_detected|mapped_to_hierarchical"),
                    ),
                );
            }

            let mut aggregate: BTreeMap<Strategy, f64> = BTreeMap::new();
            let mut max_delim_hits = 0;
            let mut note: Option<&'static str> = None;
            for (page_profile, sample) in &page_profiles {
                let page_hits =
                    detect_delimiter_hits(std::slice::from_ref(*sample), &custom.delimiters);
                max_delim_hits = max_delim_hits.max(page_hits);
                let page = score_profile(page_profile, page_hits, custom, thresholds, &bias);
                if note.is_none() {
                    note = page.note;
                }
                for (strategy, score) in page.scores {
                    *aggregate.entry(strategy).or_default() += score;
                }
            }

            let pages = page_profiles.len() as f64;
            let compressed: BTreeMap<Strategy, f64> = aggregate
                .into_iter()
                .map(|(strategy, total)| (strategy, (total / pages).clamp(-1.0, 1.0)))
                .collect();
            let strategy = argmax(&compressed);
            let params = estimate_params(profile, strategy, custom);
            let candidates = emit_candidates.then(|| named_scores(&compressed));
            return build_recommendation(
                strategy,
                params,
                candidates,
                max_delim_hits,
                profile,
                join_notes("advisory recommendation (aggregated page scoring)", note),
            );
        }
    }

    // Single or pre-aggregated sample.
    let page = score_profile(profile, delimiter_hits, custom, thresholds, &bias);
    let params = estimate_params(profile, page.strategy, custom);
    let candidates = emit_candidates.then(|| named_scores(&page.scores));
    build_recommendation(
        page.strategy,
        params,
        candidates,
        delimiter_hits,
        profile,
        join_notes("advisory recommendation", page.note),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::Mode;

    fn settings() -> ProbeSettings {
        ProbeSettings::default()
    }

    fn recommend(
        profile: &Profile,
        samples: &[String],
        custom: &CustomDelimiterConfig,
        source_format: Option<&str>,
    ) -> Recommendation {
        recommend_strategy(profile, samples, custom, true, source_format, &settings())
    }

    #[test]
    fn test_custom_delimiter_gate() {
        let samples = vec!["---a---b---c---d---".to_string()];
        let profile = extract_signals(&samples).unwrap();
        let custom = CustomDelimiterConfig {
            enable: true,
            delimiters: vec!["---".into()],
            min_segments: 2,
            ..Default::default()
        };
        let rec = recommend(&profile, &samples, &custom, None);
        assert_eq!(rec.strategy_id, "custom_delimiter_split");
        assert_eq!(rec.mode, Mode::DirectDelimiter);
        assert_eq!(rec.mode_id, 1);
        assert!(rec.delimiter_hits >= 2);
        assert_eq!(rec.params["delimiters"][0], "---");
    }

    #[test]
    fn test_format_hard_routing_table() {
        let samples = vec!["plain text".to_string()];
        let profile = extract_signals(&samples).unwrap();
        let rec = recommend(&profile, &samples, &CustomDelimiterConfig::default(), Some("xlsx"));
        assert_eq!(rec.strategy_id, "table_batch");
        assert_eq!(rec.mode, Mode::HierarchicalHeading);
        assert_eq!(rec.mode_id, 3);
        assert_eq!(rec.params["preserve_tables"], true);
        assert!(rec.notes.contains("mapped_to_hierarchical"));
    }

    #[test]
    fn test_format_hard_routing_code_and_slides() {
        let samples = vec!["whatever".to_string()];
        let profile = extract_signals(&samples).unwrap();
        let code = recommend(&profile, &samples, &CustomDelimiterConfig::default(), Some(".py"));
        assert_eq!(code.strategy_id, "code_log_block");
        assert_eq!(code.mode_id, 3);

        let slides = recommend(&profile, &samples, &CustomDelimiterConfig::default(), Some("pptx"));
        assert_eq!(slides.strategy_id, "slide_block_textbox_merge");
        assert_eq!(slides.params["merge_textboxes"], true);
    }

    #[test]
    fn test_table_gate_on_content() {
        let samples = vec!["| a | b |\n| c | d |\n| e | f |".to_string()];
        let profile = extract_signals(&samples).unwrap();
        let rec = recommend(&profile, &samples, &CustomDelimiterConfig::default(), None);
        assert_eq!(rec.strategy_id, "table_batch");
        assert_eq!(rec.mode, Mode::HierarchicalHeading);
        assert!(rec.notes.contains("table_detected"));
    }

    #[test]
    fn test_long_paragraph_override() {
        let profile = Profile {
            p90_para_len: 900,
            ..Default::default()
        };
        let rec = recommend(&profile, &["x".to_string()], &CustomDelimiterConfig::default(), None);
        assert_eq!(rec.strategy_id, "heading_block_length_split");
        assert!(rec.notes.contains("forced_long_paragraph_override"));
    }

    #[test]
    fn test_code_gate_on_content() {
        let profile = Profile {
            code_ratio: 0.2,
            ..Default::default()
        };
        let rec = recommend(&profile, &["x".to_string()], &CustomDelimiterConfig::default(), None);
        assert_eq!(rec.strategy_id, "code_log_block");
        assert_eq!(rec.params["no_overlap"], true);
    }

    #[test]
    fn test_weighted_default_leans_heading() {
        // Weak signals everywhere: the heading base weight dominates.
        let profile = Profile {
            p50_para_len: 80,
            p90_para_len: 150,
            ..Default::default()
        };
        let rec = recommend(&profile, &["plain".to_string()], &CustomDelimiterConfig::default(), None);
        assert_eq!(rec.strategy_id, "heading_block_length_split");
        let candidates = rec.candidates.unwrap();
        assert!(candidates.contains_key("sentence_split_sliding"));
        assert_eq!(candidates.len(), 4);
    }

    #[test]
    fn test_multi_page_table_short_circuit() {
        let samples = vec![
            "# Heading page\nprose here".to_string(),
            "| a | b |\n| c | d |".to_string(),
            "more plain prose".to_string(),
        ];
        let profile = extract_signals(&samples).unwrap();
        let rec = recommend(&profile, &samples, &CustomDelimiterConfig::default(), None);
        assert_eq!(rec.strategy_id, "table_batch");
        assert!(rec.notes.contains("table_detected"));
    }

    #[test]
    fn test_multi_page_scores_clamped() {
        let samples = vec![
            "# One\n- a\n- b".to_string(),
            "# Two\n- c\n- d".to_string(),
        ];
        let profile = extract_signals(&samples).unwrap();
        let rec = recommend(&profile, &samples, &CustomDelimiterConfig::default(), None);
        let candidates = rec.candidates.unwrap();
        for score in candidates.values() {
            assert!(*score >= -1.0 && *score <= 1.0, "score {score} out of unit range");
        }
    }

    #[test]
    fn test_candidates_omitted_unless_requested() {
        let samples = vec!["plain".to_string()];
        let profile = extract_signals(&samples).unwrap();
        let rec = recommend_strategy(
            &profile,
            &samples,
            &CustomDelimiterConfig::default(),
            false,
            None,
            &settings(),
        );
        assert!(rec.candidates.is_none());
    }

    #[test]
    fn test_target_length_clamped() {
        let profile = Profile {
            p50_para_len: 1200,
            ..Default::default()
        };
        let params = estimate_params(&profile, Strategy::SentenceSplitSliding, &CustomDelimiterConfig::default());
        assert_eq!(params["target_length"], 400);

        let short = Profile {
            p50_para_len: 40,
            ..Default::default()
        };
        let params = estimate_params(&short, Strategy::SentenceSplitSliding, &CustomDelimiterConfig::default());
        assert_eq!(params["target_length"], 150);

        let unset = Profile::default();
        let params = estimate_params(&unset, Strategy::SentenceSplitSliding, &CustomDelimiterConfig::default());
        assert_eq!(params["target_length"], 220);
    }

    #[test]
    fn test_invalid_delimiter_regex_skipped() {
        let samples = vec!["a--b--c".to_string()];
        let hits = detect_delimiter_hits(&samples, &["([".to_string(), "--".to_string()]);
        assert_eq!(hits, 3);
    }

    #[test]
    fn test_mode_bijection_across_paths() {
        let samples = vec!["plain".to_string()];
        let profile = extract_signals(&samples).unwrap();
        for fmt in [None, Some("xlsx"), Some("py"), Some("pptx"), Some("pdf")] {
            let rec = recommend(&profile, &samples, &CustomDelimiterConfig::default(), fmt);
            let expected = match rec.mode {
                Mode::DirectDelimiter => 1,
                Mode::SemanticSentence => 2,
                Mode::HierarchicalHeading => 3,
            };
            assert_eq!(rec.mode_id, expected);
        }
    }
}
