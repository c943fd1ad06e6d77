//! PDF page helpers: counting, first-N trimming, and per-page text
//! extraction for probe sampling.

use std::path::Path;

use lopdf::Document;

use crate::error::{KilnError, Result};

fn load(path: &Path) -> Result<Document> {
    Document::load(path).map_err(|e| KilnError::Other(format!(
        "Failed to load PDF {}: {e}",
        path.display()
    )))
}

/// Number of pages in the document.
pub fn page_count(path: &Path) -> Result<usize> {
    Ok(load(path)?.get_pages().len())
}

/// Keep only the first `max_pages` pages, rewriting the file in place.
///
/// `max_pages == 0` means no limit; a limit at or above the page count is a
/// no-op rather than an error.
pub fn trim_pdf_pages(path: &Path, max_pages: u32) -> Result<()> {
    if max_pages == 0 {
        return Ok(());
    }
    let mut doc = load(path)?;
    let total = doc.get_pages().len() as u32;
    if total <= max_pages {
        return Ok(());
    }
    let excess: Vec<u32> = (max_pages + 1..=total).collect();
    doc.delete_pages(&excess);
    doc.save(path).map_err(|e| KilnError::Other(format!(
        "Failed to save trimmed PDF {}: {e}",
        path.display()
    )))?;
    Ok(())
}

/// Extract text for the given 0-based page indices, one string per page.
/// Pages that fail extraction yield an empty string.
pub fn extract_page_text(path: &Path, page_indices: &[usize]) -> Result<Vec<String>> {
    let doc = load(path)?;
    let total = doc.get_pages().len();
    let mut texts = Vec::with_capacity(page_indices.len());
    for &idx in page_indices {
        if idx >= total {
            texts.push(String::new());
            continue;
        }
        let page_number = (idx + 1) as u32;
        texts.push(doc.extract_text(&[page_number]).unwrap_or_default());
    }
    Ok(texts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::dictionary;
    use lopdf::{Object, Stream};
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Build a minimal PDF with `n` blank pages.
    fn blank_pdf(dir: &Path, n: usize) -> PathBuf {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let mut kids = Vec::new();
        for _ in 0..n {
            let content = Stream::new(dictionary! {}, Vec::new());
            let content_id = doc.add_object(content);
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(Object::Reference(page_id));
        }
        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
                "MediaBox" => vec![0.into(), 0.into(), 300.into(), 300.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        let path = dir.join(format!("blank_{n}.pdf"));
        doc.save(&path).unwrap();
        path
    }

    #[test]
    fn test_page_count() {
        let tmp = TempDir::new().unwrap();
        let path = blank_pdf(tmp.path(), 4);
        assert_eq!(page_count(&path).unwrap(), 4);
    }

    #[test]
    fn test_trim_keeps_first_pages() {
        let tmp = TempDir::new().unwrap();
        let path = blank_pdf(tmp.path(), 5);
        trim_pdf_pages(&path, 2).unwrap();
        assert_eq!(page_count(&path).unwrap(), 2);
    }

    #[test]
    fn test_trim_zero_means_no_limit() {
        let tmp = TempDir::new().unwrap();
        let path = blank_pdf(tmp.path(), 3);
        trim_pdf_pages(&path, 0).unwrap();
        assert_eq!(page_count(&path).unwrap(), 3);
    }

    #[test]
    fn test_trim_beyond_page_count_is_noop() {
        let tmp = TempDir::new().unwrap();
        let path = blank_pdf(tmp.path(), 3);
        trim_pdf_pages(&path, 10).unwrap();
        assert_eq!(page_count(&path).unwrap(), 3);
    }

    #[test]
    fn test_extract_out_of_range_pages_are_empty() {
        let tmp = TempDir::new().unwrap();
        let path = blank_pdf(tmp.path(), 2);
        let texts = extract_page_text(&path, &[0, 5]).unwrap();
        assert_eq!(texts.len(), 2);
        assert_eq!(texts[1], "");
    }
}
