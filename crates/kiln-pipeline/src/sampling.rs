//! Page and paragraph sampling for probe input.
//!
//! PDF sampling starts at the middle page and random-walks outward so the
//! sample covers different regions of the document; Markdown sampling takes
//! leading non-empty paragraphs. Both honor a total character cap.

use std::collections::BTreeSet;
use std::path::Path;

use rand::Rng;
use tracing::info;

use kiln_core::pdf::{extract_page_text, page_count};
use kiln_core::{KilnError, Result};

/// Cap total characters across sampled pages by truncating trailing pages.
fn cap_chars(mut texts: Vec<String>, char_limit: usize) -> Vec<String> {
    if char_limit == 0 {
        return texts;
    }
    let total: usize = texts.iter().map(|t| t.chars().count()).sum();
    if total <= char_limit {
        return texts;
    }
    let mut capped = Vec::new();
    let mut remaining = char_limit;
    for text in texts.drain(..) {
        if remaining == 0 {
            break;
        }
        let piece: String = text.chars().take(remaining).collect();
        remaining -= piece.chars().count();
        capped.push(piece);
    }
    capped
}

/// Choose which 0-based page indices to sample from an `total_pages`-page
/// document.
pub fn select_pages(total_pages: usize, page_limit_hint: usize, ratio: f64) -> Vec<usize> {
    if total_pages == 0 {
        return Vec::new();
    }

    let ratio_count = ((total_pages as f64 * ratio).round() as usize).max(1);
    let limit = ratio_count.max(page_limit_hint.min(total_pages)).min(10);

    if limit >= total_pages {
        return (0..total_pages).collect();
    }

    let mut rng = rand::rng();
    let mid = total_pages / 2;
    let mut selected: BTreeSet<usize> = BTreeSet::from([mid]);
    let mut left_cursor = mid;
    let mut right_cursor = mid;
    let max_step = total_pages.min(3).max(1);

    while selected.len() < limit && (left_cursor > 0 || right_cursor < total_pages - 1) {
        let can_left = left_cursor > 0;
        let can_right = right_cursor < total_pages - 1;
        let go_left = match (can_left, can_right) {
            (true, true) => rng.random_bool(0.5),
            (true, false) => true,
            (false, true) => false,
            (false, false) => break,
        };
        let step = rng.random_range(1..=max_step);
        if go_left {
            left_cursor = left_cursor.saturating_sub(step);
            selected.insert(left_cursor);
        } else {
            right_cursor = (right_cursor + step).min(total_pages - 1);
            selected.insert(right_cursor);
        }
    }

    selected.into_iter().collect()
}

/// Sample a PDF: pick pages, extract their text, cap total characters.
/// Returns the samples and the selected 0-based page indices.
pub fn sample_pdf(
    path: &Path,
    page_limit_hint: usize,
    ratio: f64,
    char_limit: usize,
) -> Result<(Vec<String>, Vec<usize>)> {
    let total_pages = page_count(path)?;
    if total_pages == 0 {
        return Ok((Vec::new(), Vec::new()));
    }

    let selected = select_pages(total_pages, page_limit_hint, ratio);
    let texts = extract_page_text(path, &selected)?;
    let texts = cap_chars(texts, char_limit);

    info!(
        total = total_pages,
        sampled = selected.len(),
        pages = ?selected,
        "Sampled PDF pages for probing"
    );
    Ok((texts, selected))
}

/// Sample a Markdown artifact: cap characters, split on blank lines, take up
/// to `sample_pages` non-empty paragraphs.
pub fn sample_markdown(content: &str, sample_pages: usize, char_limit: usize) -> (Vec<String>, Vec<usize>) {
    if content.is_empty() {
        return (vec![String::new()], vec![0]);
    }

    let trimmed: String = if char_limit > 0 && content.chars().count() > char_limit {
        content.chars().take(char_limit).collect()
    } else {
        content.to_string()
    };

    let mut paragraphs: Vec<String> = trimmed
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if paragraphs.is_empty() {
        paragraphs = vec![trimmed.trim().to_string()];
    }

    let take = sample_pages.max(1).min(paragraphs.len());
    let samples: Vec<String> = paragraphs.into_iter().take(take).collect();
    let indices: Vec<usize> = (0..samples.len()).collect();
    (samples, indices)
}

/// Markdown detection for probe routing: markdown target formats or a `.md`
/// artifact extension.
pub fn is_markdown_artifact(target_format: Option<&str>, path: &Path) -> bool {
    let target = target_format.unwrap_or_default().trim().to_lowercase();
    matches!(target.as_str(), "md" | "markdown" | "text/markdown")
        || path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("md"))
            .unwrap_or(false)
}
