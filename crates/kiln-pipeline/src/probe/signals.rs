//! Line-level signal extraction from text samples.

use std::sync::LazyLock;

use regex::Regex;

use kiln_core::{KilnError, Result};

use super::Profile;

/// ATX headings, `N.N.N` numerators, `N.[..]` markers, Chinese ordinals.
static HEADING_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(#{1,6}\s+|\d+(?:\.\d+)*[.)]?\s*|\d+\.\[[^\]]*\]\s*|[一二三四五六七八九十]+、\s*)")
        .expect("heading pattern")
});

static LIST_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*+•]\s+|\d+\.\s+)").expect("list pattern"));

static CODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(```|\bclass\b|\bdef\b|\bfunction\b|;\s*$)").expect("code pattern")
});

/// Non-empty trimmed lines across all samples.
fn lines(samples: &[String]) -> Vec<&str> {
    samples
        .iter()
        .flat_map(|text| text.lines())
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect()
}

/// Paragraph lengths in characters, split on blank-line runs.
fn paragraph_lengths(samples: &[String]) -> Vec<usize> {
    static PARA_SPLIT: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n\s*\n").expect("paragraph split pattern"));
    let mut lengths = Vec::new();
    for text in samples {
        if text.is_empty() {
            continue;
        }
        for part in PARA_SPLIT.split(text) {
            let clean = part.trim();
            if !clean.is_empty() {
                lengths.push(clean.chars().count());
            }
        }
    }
    lengths
}

/// Linear-interpolated quantile; empty input yields 0.
fn quantile(values: &[usize], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<usize> = values.to_vec();
    sorted.sort_unstable();
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let pos = (sorted.len() - 1) as f64 * q;
    let low = pos.floor() as usize;
    let high = (low + 1).min(sorted.len() - 1);
    if low == high {
        return sorted[low] as f64;
    }
    let frac = pos - low as f64;
    sorted[low] as f64 * (1.0 - frac) + sorted[high] as f64 * frac
}

/// Extract a [`Profile`] from text samples. At least one sample is required.
pub fn extract_signals(samples: &[String]) -> Result<Profile> {
    if samples.is_empty() {
        return Err(KilnError::Validation {
            field: "samples".into(),
            message: "At least one text sample is required for probing".into(),
        });
    }

    let lines = lines(samples);
    let total_lines = lines.len().max(1);

    let heading_hits = lines.iter().filter(|l| HEADING_PATTERN.is_match(l)).count();
    let list_hits = lines.iter().filter(|l| LIST_PATTERN.is_match(l)).count();
    let table_hits = lines
        .iter()
        .filter(|l| l.matches('|').count() >= 2 || l.matches(',').count() >= 3)
        .count();
    let code_hits = lines.iter().filter(|l| CODE_PATTERN.is_match(l)).count();

    let joined: String = lines.concat();
    let total_chars = joined.chars().count().max(1);
    let digit_symbol_count = joined.chars().filter(|ch| !ch.is_alphabetic()).count();

    let para_lengths = paragraph_lengths(samples);
    let p90 = quantile(&para_lengths, 0.9) as u32;
    let p50 = quantile(&para_lengths, 0.5) as u32;

    Ok(Profile {
        heading_ratio: heading_hits as f64 / total_lines as f64,
        list_ratio: list_hits as f64 / total_lines as f64,
        table_ratio: table_hits as f64 / total_lines as f64,
        code_ratio: code_hits as f64 / total_lines as f64,
        p50_para_len: p50,
        p90_para_len: p90,
        digit_symbol_ratio: digit_symbol_count as f64 / total_chars as f64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_empty_samples_rejected() {
        assert!(extract_signals(&[]).is_err());
    }

    #[test]
    fn test_heading_lines_counted() {
        let profile =
            extract_signals(&samples(&["# Title\nplain prose line\n## Sub\nmore prose"])).unwrap();
        assert!((profile.heading_ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_numbered_and_chinese_headings() {
        let profile = extract_signals(&samples(&["1.2.3 Scope\n一、总则\nplain"])).unwrap();
        assert!(profile.heading_ratio > 0.6);
    }

    #[test]
    fn test_list_lines_counted() {
        let profile = extract_signals(&samples(&["- a\n* b\n+ c\n1. d\nprose"])).unwrap();
        assert!((profile.list_ratio - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_table_lines_by_pipes_or_commas() {
        let profile =
            extract_signals(&samples(&["| a | b |\nx,y,z,w\nplain line here"])).unwrap();
        assert!((profile.table_ratio - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_code_lines_counted() {
        let profile = extract_signals(&samples(&[
            "```\nfn main() {}\nlet x = 1;\ndef foo\nprose",
        ]))
        .unwrap();
        // ``` line, trailing-; line and `def ` line hit; `fn main() {}` does not.
        assert!((profile.code_ratio - 3.0 / 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_paragraph_quantiles() {
        let long = "x".repeat(900);
        let text = format!("short one\n\n{long}\n\nmedium paragraph here");
        let profile = extract_signals(&samples(&[&text])).unwrap();
        assert_eq!(profile.p90_para_len > profile.p50_para_len, true);
        assert!(profile.p90_para_len >= 700);
    }

    #[test]
    fn test_quantile_interpolation() {
        assert_eq!(quantile(&[10], 0.9), 10.0);
        assert_eq!(quantile(&[], 0.5), 0.0);
        assert_eq!(quantile(&[0, 10], 0.5), 5.0);
    }

    #[test]
    fn test_digit_symbol_ratio() {
        let profile = extract_signals(&samples(&["abc123"])).unwrap();
        assert!((profile.digit_symbol_ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_multibyte_paragraph_lengths_are_code_points() {
        let profile = extract_signals(&samples(&["中文内容四个字符"])).unwrap();
        assert_eq!(profile.p50_para_len, 8);
    }
}
