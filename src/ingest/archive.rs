//! Archive recursor (§4.B): unpacks nested ZIPs with hard depth/file/size
//! guards, delegating each non-archive entry to the format extractors.
//!
//! Output format (including the conditional footer) is ported verbatim
//! from the original `test_zip_recursive.py` suite rather than guessed
//! from spec.md's prose description.

use super::extractors;
use crate::error::{AppError, Result};
use std::io::{Cursor, Read};
use zip::ZipArchive;

#[derive(Debug, Clone)]
pub struct ArchiveLimits {
    pub max_depth: u32,
    pub max_files: usize,
    pub max_entry_bytes: u64,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_depth: 5,
            max_files: 1000,
            max_entry_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ArchiveStats {
    pub files_processed: usize,
    pub nested_zips_found: usize,
    pub max_depth_reached: u32,
}

struct State {
    limits: ArchiveLimits,
    stats: ArchiveStats,
}

/// Unpack a ZIP, recursing into nested ZIPs subject to `limits`. Returns
/// the concatenated, provenance-tagged text plus a trailing summary
/// footer (§4.B); `GLOBAL STATISTICS:` is appended only when at least
/// one nested ZIP was encountered, matching `test_backward_compatibility`
/// vs. every nested-archive test.
pub fn extract_zip_archive(bytes: &[u8], name: &str, limits: ArchiveLimits) -> Result<(String, ArchiveStats)> {
    let mut state = State { limits, stats: ArchiveStats::default() };
    let body = extract_recursive(&mut state, bytes, name, 0)?;

    let mut out = String::new();
    out.push_str(&body);
    out.push_str("\nSUMMARY:\n");
    out.push_str(&format!("Processed: {} files\n", state.stats.files_processed));

    if state.stats.nested_zips_found > 0 {
        out.push_str("\nGLOBAL STATISTICS:\n");
        out.push_str(&format!("Total files processed: {}\n", state.stats.files_processed));
        out.push_str(&format!("Nested ZIPs found: {}\n", state.stats.nested_zips_found));
        out.push_str(&format!("Max depth reached: {}\n", state.stats.max_depth_reached));
    }

    Ok((out, state.stats))
}

fn extract_recursive(state: &mut State, bytes: &[u8], name: &str, depth: u32) -> Result<String> {
    if depth > state.limits.max_depth {
        return Err(AppError::Extraction(format!(
            "recursion depth limit exceeded while extracting '{name}': possible zip bomb (max depth {})",
            state.limits.max_depth
        )));
    }
    state.stats.max_depth_reached = state.stats.max_depth_reached.max(depth);

    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| AppError::Extraction(format!("invalid zip archive '{name}': {e}")))?;

    let mut out = String::new();
    if depth == 0 {
        out.push_str(&format!("ZIP ARCHIVE: {name}\n\n"));
    } else {
        out.push_str(&format!(
            "ZIP ARCHIVE: {name} (Depth: {depth}/{})\n\n",
            state.limits.max_depth
        ));
    }

    for i in 0..archive.len() {
        if state.stats.files_processed >= state.limits.max_files {
            out.push_str(&format!(
                "... remaining entries skipped (file limit of {} reached)\n",
                state.limits.max_files
            ));
            break;
        }

        let mut entry = archive
            .by_index(i)
            .map_err(|e| AppError::Extraction(format!("corrupt zip entry in '{name}': {e}")))?;
        if entry.is_dir() {
            continue;
        }

        let entry_name = entry.name().to_string();
        let size = entry.size();

        if entry_name.to_ascii_lowercase().ends_with(".zip") {
            out.push_str(&format!("{entry_name} (NESTED ZIP)\n"));
            out.push_str(&format!("Files processed so far: {}\n\n", state.stats.files_processed));

            let mut nested_bytes = Vec::with_capacity(size as usize);
            entry
                .read_to_end(&mut nested_bytes)
                .map_err(|e| AppError::Extraction(format!("failed reading '{entry_name}': {e}")))?;
            drop(entry);

            state.stats.nested_zips_found += 1;
            let nested_text = extract_recursive(state, &nested_bytes, &entry_name, depth + 1)?;
            out.push_str(&nested_text);
            out.push('\n');
            continue;
        }

        if size > state.limits.max_entry_bytes {
            out.push_str(&format!("=== {entry_name} ===\n"));
            out.push_str(&format!(
                "SKIPPED (too large): {size} bytes exceeds the {}-byte limit\n",
                state.limits.max_entry_bytes
            ));
            out.push_str(&"-".repeat(60));
            out.push('\n');
            state.stats.files_processed += 1;
            continue;
        }

        let mut content_bytes = Vec::with_capacity(size as usize);
        entry
            .read_to_end(&mut content_bytes)
            .map_err(|e| AppError::Extraction(format!("failed reading '{entry_name}': {e}")))?;
        drop(entry);
        state.stats.files_processed += 1;

        let extracted = match extractors::extract(&content_bytes, &entry_name) {
            Ok(text) => text.content,
            Err(e) => format!("[extraction error: {e}]"),
        };

        out.push_str(&format!("=== {entry_name} ===\n{extracted}\n"));
        out.push_str(&"-".repeat(60));
        out.push('\n');
    }

    Ok(out)
}

/// AI-ready companion view: strips separators, archive/entry headers,
/// skip-annotations, and the trailing statistics block, leaving only
/// concatenated document content for concept extraction (§4.B).
pub fn clean_for_concepts(archive_text: &str) -> String {
    let is_noise = |line: &str| {
        let t = line.trim();
        t.is_empty()
            || t.starts_with("ZIP ARCHIVE:")
            || t.starts_with("=== ")
            || t.ends_with(" ===")
            || t.starts_with("SUMMARY:")
            || t.starts_with("GLOBAL STATISTICS:")
            || t.starts_with("Processed:")
            || t.starts_with("Total files processed:")
            || t.starts_with("Nested ZIPs found:")
            || t.starts_with("Max depth reached:")
            || t.starts_with("Files processed so far:")
            || t.starts_with("SKIPPED (too large)")
            || t.starts_with("... remaining entries skipped")
            || t.ends_with("(NESTED ZIP)")
            || t.chars().all(|c| c == '-')
    };

    archive_text
        .lines()
        .filter(|line| !is_noise(line))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn make_zip(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = SimpleFileOptions::default();
            for (name, content) in files {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content).unwrap();
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn nested_zip_two_levels() {
        let inner = make_zip(&[
            ("document.txt", b"This is a document inside the inner ZIP"),
            ("readme.md", b"# Inner README\nThis is nested content"),
        ]);
        let outer = make_zip(&[("outer_file.txt", b"This is an outer file"), ("nested.zip", &inner)]);

        let (result, stats) = extract_zip_archive(&outer, "test.zip", ArchiveLimits::default()).unwrap();

        assert!(result.contains("ZIP ARCHIVE: test.zip"));
        assert!(result.contains("outer_file.txt"));
        assert!(result.contains("This is an outer file"));
        assert!(result.contains("nested.zip (NESTED ZIP)"));
        assert!(result.contains("ZIP ARCHIVE: nested.zip (Depth: 1/5)"));
        assert!(result.contains("document.txt"));
        assert!(result.contains("This is a document inside the inner ZIP"));
        assert!(result.contains("GLOBAL STATISTICS:"));
        assert!(result.contains("Nested ZIPs found: 1"));
        assert_eq!(stats.nested_zips_found, 1);
    }

    #[test]
    fn depth_limit_exceeded_mentions_zip_bomb() {
        let mut current = make_zip(&[("deepest.txt", b"Level 7")]);
        for level in (1..=7).rev() {
            let entry_name = format!("level{level}.txt");
            current = make_zip(&[
                (&entry_name, format!("Content at level {level}").as_bytes()),
                ("nested.zip", &current),
            ]);
        }

        let err = extract_zip_archive(&current, "too_deep.zip", ArchiveLimits::default()).unwrap_err();
        let msg = err.to_string().to_lowercase();
        assert!(msg.contains("recursion depth limit exceeded"));
        assert!(msg.contains("zip bomb"));
    }

    #[test]
    fn large_entry_is_skipped_not_fatal() {
        let large = vec![b'X'; 11 * 1024 * 1024];
        let inner = make_zip(&[("huge_file.txt", &large), ("small_file.txt", b"small")]);
        let outer = make_zip(&[("normal.txt", b"normal content"), ("nested.zip", &inner)]);

        let (result, _stats) = extract_zip_archive(&outer, "test.zip", ArchiveLimits::default()).unwrap();
        assert!(result.contains("SKIPPED (too large)"));
        assert!(result.contains("huge_file.txt"));
        assert!(result.contains("small_file.txt"));
    }

    #[test]
    fn backward_compatible_flat_zip_has_plain_summary() {
        let files = make_zip(&[
            ("doc1.txt", b"Document 1"),
            ("doc2.txt", b"Document 2"),
            ("notes.md", b"# Notes\nSome notes here"),
        ]);

        let (result, stats) = extract_zip_archive(&files, "simple.zip", ArchiveLimits::default()).unwrap();
        assert!(result.contains("ZIP ARCHIVE: simple.zip"));
        assert!(result.contains("SUMMARY:"));
        assert!(result.contains("Processed: 3 files"));
        assert!(!result.contains("GLOBAL STATISTICS:"));
        assert_eq!(stats.nested_zips_found, 0);
    }

    #[test]
    fn clean_for_concepts_strips_structural_noise() {
        let files = make_zip(&[("a.txt", b"hello world")]);
        let (result, _) = extract_zip_archive(&files, "t.zip", ArchiveLimits::default()).unwrap();
        let cleaned = clean_for_concepts(&result);
        assert!(cleaned.contains("hello world"));
        assert!(!cleaned.contains("ZIP ARCHIVE:"));
        assert!(!cleaned.contains("SUMMARY:"));
        assert!(!cleaned.contains("==="));
    }
}
