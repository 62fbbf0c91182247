//! Format extractors (§4.A): decode the bytes of one format into
//! normalized UTF-8 text plus structural hints. One handler per format
//! family, dispatched by filename extension through `ExtractorRegistry`.
//! Handlers are total over their declared inputs: malformed bytes
//! produce a typed `AppError::Extraction`, never a panic.

use crate::error::{AppError, Result};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::collections::HashMap;
use std::io::Read;
use std::sync::OnceLock;
use std::time::Duration;

/// Normalized text plus structural hints a downstream chunker can use
/// to prefer section boundaries over mid-paragraph splits (§4.D).
#[derive(Debug, Clone, Default)]
pub struct ExtractedText {
    pub content: String,
    /// Byte offsets into `content` that mark natural section
    /// boundaries: markdown/doc headings, slide/sheet/chapter starts.
    pub section_breaks: Vec<usize>,
}

impl ExtractedText {
    fn plain(content: String) -> Self {
        Self { content, section_breaks: Vec::new() }
    }
}

pub trait Extractor: Send + Sync {
    fn supports(&self, filename: &str) -> bool;
    fn extract(&self, bytes: &[u8], filename: &str) -> Result<ExtractedText>;
}

fn ext_of(filename: &str) -> String {
    filename
        .rsplit('.')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase()
}

pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self {
            extractors: vec![
                Box::new(NotebookExtractor),
                Box::new(EpubExtractor),
                Box::new(DocxExtractor),
                Box::new(XlsxExtractor),
                Box::new(PptxExtractor),
                Box::new(PdfExtractor),
                Box::new(SubtitleExtractor),
                Box::new(SourceCodeExtractor),
                Box::new(ZipExtractor),
                Box::new(TextExtractor),
            ],
        }
    }

    pub fn extract(&self, bytes: &[u8], filename: &str) -> Result<ExtractedText> {
        for extractor in &self.extractors {
            if extractor.supports(filename) {
                return extractor.extract(bytes, filename);
            }
        }
        // Total over declared inputs: anything unrecognized falls back
        // to the plain-text handler rather than failing the ingest.
        TextExtractor.extract(bytes, filename)
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn registry() -> &'static ExtractorRegistry {
    static REGISTRY: OnceLock<ExtractorRegistry> = OnceLock::new();
    REGISTRY.get_or_init(ExtractorRegistry::new)
}

/// Dispatch by filename extension through the default registry.
pub fn extract(bytes: &[u8], filename: &str) -> Result<ExtractedText> {
    registry().extract(bytes, filename)
}

// ---------------------------------------------------------------------
// text / markdown / txt
// ---------------------------------------------------------------------

struct TextExtractor;

impl Extractor for TextExtractor {
    fn supports(&self, filename: &str) -> bool {
        matches!(ext_of(filename).as_str(), "txt" | "md" | "markdown" | "")
    }

    fn extract(&self, bytes: &[u8], _filename: &str) -> Result<ExtractedText> {
        let content = match std::str::from_utf8(bytes) {
            Ok(s) => s.to_string(),
            // Decode failure falls back to Latin-1 rather than raising,
            // per §4.A: every byte maps to one Unicode scalar value 1:1.
            Err(_) => bytes.iter().map(|&b| b as char).collect(),
        };

        let mut breaks = Vec::new();
        let mut offset = 0;
        for line in content.split_inclusive('\n') {
            let trimmed = line.trim_start();
            if trimmed.starts_with('#') {
                breaks.push(offset);
            }
            offset += line.len();
        }

        Ok(ExtractedText { content, section_breaks: breaks })
    }
}

// ---------------------------------------------------------------------
// source code
// ---------------------------------------------------------------------

struct SourceCodeExtractor;

fn language_for_extension(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "py" => "Python",
        "js" | "mjs" | "cjs" => "JavaScript",
        "ts" | "tsx" => "TypeScript",
        "jsx" => "JavaScript (JSX)",
        "go" => "Go",
        "rs" => "Rust",
        "java" => "Java",
        "c" | "h" => "C",
        "cpp" | "cc" | "cxx" | "hpp" => "C++",
        "cs" => "C#",
        "rb" => "Ruby",
        "php" => "PHP",
        "sql" => "SQL",
        "yaml" | "yml" => "YAML",
        "html" | "htm" => "HTML",
        "css" => "CSS",
        "sh" | "bash" => "Shell",
        "kt" | "kts" => "Kotlin",
        "swift" => "Swift",
        _ => return None,
    })
}

fn is_comment_line(line: &str, language: &str) -> bool {
    let t = line.trim();
    match language {
        "Python" | "Ruby" | "Shell" | "YAML" => t.starts_with('#'),
        "SQL" => t.starts_with("--"),
        "HTML" => t.starts_with("<!--"),
        _ => t.starts_with("//") || t.starts_with('*') || t.starts_with("/*"),
    }
}

fn count_functions_and_classes(content: &str, language: &str) -> (usize, usize) {
    let mut functions = 0;
    let mut classes = 0;
    for line in content.lines() {
        let t = line.trim_start();
        match language {
            "Python" => {
                if t.starts_with("def ") || t.starts_with("async def ") {
                    functions += 1;
                }
                if t.starts_with("class ") {
                    classes += 1;
                }
            }
            "Rust" => {
                if t.starts_with("fn ") || t.starts_with("pub fn ") || t.contains(" fn ") {
                    functions += 1;
                }
                if t.starts_with("struct ") || t.starts_with("pub struct ") || t.starts_with("enum ") {
                    classes += 1;
                }
            }
            "Go" => {
                if t.starts_with("func ") {
                    functions += 1;
                }
                if t.starts_with("type ") && t.contains("struct") {
                    classes += 1;
                }
            }
            "Java" | "C#" | "Kotlin" => {
                if t.contains("class ") {
                    classes += 1;
                }
                if (t.contains('(') && t.contains(')') && t.ends_with('{'))
                    && !t.starts_with("if ")
                    && !t.starts_with("for ")
                    && !t.starts_with("while ")
                {
                    functions += 1;
                }
            }
            _ => {
                if t.starts_with("function ") || t.contains("=> {") || t.contains("function(") {
                    functions += 1;
                }
                if t.starts_with("class ") {
                    classes += 1;
                }
            }
        }
    }
    (functions, classes)
}

impl Extractor for SourceCodeExtractor {
    fn supports(&self, filename: &str) -> bool {
        language_for_extension(&ext_of(filename)).is_some()
    }

    fn extract(&self, bytes: &[u8], filename: &str) -> Result<ExtractedText> {
        let source = String::from_utf8_lossy(bytes).to_string();
        let language = language_for_extension(&ext_of(filename)).unwrap_or("Unknown");

        let total_lines = source.lines().count();
        let code_lines = source
            .lines()
            .filter(|l| !l.trim().is_empty() && !is_comment_line(l, language))
            .count();
        let (functions, classes) = count_functions_and_classes(&source, language);

        let mut content = String::new();
        content.push_str(&format!("SOURCE CODE FILE: {filename}\n"));
        content.push_str(&format!("Language: {language}\n"));
        content.push_str(&format!("Total lines: {total_lines}\n"));
        content.push_str(&format!("Code lines: {code_lines}\n"));
        content.push_str(&format!("Functions: {functions}\n"));
        content.push_str(&format!("Classes: {classes}\n"));
        content.push_str("\n");
        content.push_str(&source);

        Ok(ExtractedText::plain(content))
    }
}

// ---------------------------------------------------------------------
// Jupyter notebooks
// ---------------------------------------------------------------------

struct NotebookExtractor;

impl Extractor for NotebookExtractor {
    fn supports(&self, filename: &str) -> bool {
        ext_of(filename) == "ipynb"
    }

    fn extract(&self, bytes: &[u8], filename: &str) -> Result<ExtractedText> {
        let notebook: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| AppError::Extraction(format!("invalid notebook JSON in '{filename}': {e}")))?;

        let kernel_name = notebook
            .pointer("/metadata/kernelspec/display_name")
            .and_then(|v| v.as_str())
            .or_else(|| notebook.pointer("/metadata/kernelspec/name").and_then(|v| v.as_str()))
            .unwrap_or("unknown");

        let cells = notebook
            .get("cells")
            .and_then(|v| v.as_array())
            .ok_or_else(|| AppError::Extraction(format!("notebook '{filename}' has no cells array")))?;

        let mut content = String::new();
        content.push_str(&format!("NOTEBOOK: {filename}\nKernel: {kernel_name}\n\n"));

        let mut code_idx = 0;
        let mut md_idx = 0;
        for cell in cells {
            let cell_type = cell.get("cell_type").and_then(|v| v.as_str()).unwrap_or("");
            let source = join_source(cell.get("source"));

            match cell_type {
                "code" => {
                    code_idx += 1;
                    content.push_str(&format!("[Code Cell {code_idx}]\n{source}\n"));
                    if let Some(outputs) = cell.get("outputs").and_then(|v| v.as_array()) {
                        let text_outputs: Vec<String> = outputs
                            .iter()
                            .filter_map(|o| {
                                o.pointer("/data/text/plain")
                                    .map(join_source)
                                    .or_else(|| o.get("text").map(join_source))
                            })
                            .filter(|s| !s.is_empty())
                            .collect();
                        if !text_outputs.is_empty() {
                            content.push_str("[Output]\n");
                            content.push_str(&text_outputs.join("\n"));
                            content.push('\n');
                        }
                    }
                    content.push('\n');
                }
                "markdown" => {
                    md_idx += 1;
                    content.push_str(&format!("[Markdown {md_idx}]\n{source}\n\n"));
                }
                _ => {}
            }
        }

        Ok(ExtractedText::plain(content))
    }
}

fn join_source(value: Option<&serde_json::Value>) -> String {
    match value {
        Some(serde_json::Value::Array(lines)) => lines
            .iter()
            .map(|v| v.as_str().unwrap_or_default())
            .collect::<Vec<_>>()
            .join(""),
        Some(serde_json::Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

// ---------------------------------------------------------------------
// subtitles: srt / vtt
// ---------------------------------------------------------------------

struct SubtitleExtractor;

fn looks_like_timestamp(line: &str) -> bool {
    line.contains("-->")
}

fn looks_like_cue_number(line: &str) -> bool {
    !line.is_empty() && line.chars().all(|c| c.is_ascii_digit())
}

impl Extractor for SubtitleExtractor {
    fn supports(&self, filename: &str) -> bool {
        matches!(ext_of(filename).as_str(), "srt" | "vtt")
    }

    fn extract(&self, bytes: &[u8], _filename: &str) -> Result<ExtractedText> {
        let raw = String::from_utf8_lossy(bytes);
        let mut lines_out = Vec::new();
        for line in raw.lines() {
            let t = line.trim();
            if t.is_empty()
                || t == "WEBVTT"
                || t.starts_with("NOTE")
                || looks_like_timestamp(t)
                || looks_like_cue_number(t)
            {
                continue;
            }
            lines_out.push(t.to_string());
        }
        Ok(ExtractedText::plain(lines_out.join(" ")))
    }
}

// ---------------------------------------------------------------------
// PDF
// ---------------------------------------------------------------------

struct PdfExtractor;

impl Extractor for PdfExtractor {
    fn supports(&self, filename: &str) -> bool {
        ext_of(filename) == "pdf"
    }

    fn extract(&self, bytes: &[u8], filename: &str) -> Result<ExtractedText> {
        let text = pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| AppError::Extraction(format!("failed to parse PDF '{filename}': {e}")))?;

        let mut breaks = Vec::new();
        let mut offset = 0;
        for page in text.split('\u{c}') {
            breaks.push(offset);
            offset += page.len() + 1;
        }

        Ok(ExtractedText { content: text, section_breaks: breaks })
    }
}

// ---------------------------------------------------------------------
// EPUB
// ---------------------------------------------------------------------

struct EpubExtractor;

impl Extractor for EpubExtractor {
    fn supports(&self, filename: &str) -> bool {
        ext_of(filename) == "epub"
    }

    fn extract(&self, bytes: &[u8], filename: &str) -> Result<ExtractedText> {
        let cursor = std::io::Cursor::new(bytes.to_vec());
        let mut doc = epub::doc::EpubDoc::from_reader(cursor)
            .map_err(|e| AppError::Extraction(format!("failed to parse EPUB '{filename}': {e}")))?;

        let title = doc.mdata("title").unwrap_or_else(|| "Unknown".to_string());
        let author = doc.mdata("creator").unwrap_or_else(|| "Unknown".to_string());
        let language = doc.mdata("language").unwrap_or_else(|| "unknown".to_string());

        let mut content = String::new();
        content.push_str(&format!("EPUB: {title}\nAuthor: {author}\nLanguage: {language}\n\n"));

        let mut breaks = Vec::new();
        let spine_len = doc.spine.len();
        for idx in 0..spine_len {
            if let Some((page_content, _mime)) = doc.get_current_str() {
                breaks.push(content.len());
                content.push_str(&format!("--- Chapter {} ---\n", idx + 1));
                content.push_str(&strip_html_tags(&page_content));
                content.push_str("\n\n");
            }
            doc.go_next();
        }

        Ok(ExtractedText { content, section_breaks: breaks })
    }
}

fn strip_html_tags(html: &str) -> String {
    let fragment = scraper::Html::parse_fragment(html);
    fragment.root_element().text().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------
// ZIP (delegates to the archive recursor)
// ---------------------------------------------------------------------

struct ZipExtractor;

impl Extractor for ZipExtractor {
    fn supports(&self, filename: &str) -> bool {
        ext_of(filename) == "zip"
    }

    fn extract(&self, bytes: &[u8], filename: &str) -> Result<ExtractedText> {
        let (text, _stats) =
            super::archive::extract_zip_archive(bytes, filename, super::archive::ArchiveLimits::default())?;
        Ok(ExtractedText::plain(text))
    }
}

// ---------------------------------------------------------------------
// OOXML containers: docx / xlsx / pptx (ZIP + XML)
// ---------------------------------------------------------------------

fn read_zip_entry(bytes: &[u8], path: &str) -> Option<Vec<u8>> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).ok()?;
    let mut entry = archive.by_name(path).ok()?;
    let mut buf = Vec::new();
    entry.read_to_end(&mut buf).ok()?;
    Some(buf)
}

fn zip_entry_names(bytes: &[u8]) -> Vec<String> {
    match zip::ZipArchive::new(std::io::Cursor::new(bytes)) {
        Ok(archive) => archive.file_names().map(|s| s.to_string()).collect(),
        Err(_) => Vec::new(),
    }
}

fn xml_all_text(xml: &[u8], text_tag: &str) -> String {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_text = false;
    let mut out = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == text_tag.as_bytes() => in_text = true,
            Ok(Event::End(e)) if e.local_name().as_ref() == text_tag.as_bytes() => in_text = false,
            Ok(Event::Text(t)) if in_text => {
                if let Ok(unescaped) = t.unescape() {
                    out.push_str(&unescaped);
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    out
}

struct DocxExtractor;

impl Extractor for DocxExtractor {
    fn supports(&self, filename: &str) -> bool {
        ext_of(filename) == "docx"
    }

    fn extract(&self, bytes: &[u8], filename: &str) -> Result<ExtractedText> {
        let document_xml = read_zip_entry(bytes, "word/document.xml")
            .ok_or_else(|| AppError::Extraction(format!("'{filename}' is not a valid DOCX container")))?;

        let mut reader = Reader::from_reader(document_xml.as_slice());
        reader.config_mut().trim_text(false);
        let mut buf = Vec::new();
        let mut content = String::new();
        let mut breaks = Vec::new();
        let mut current_paragraph = String::new();
        let mut in_text = false;
        let mut paragraph_style_heading = false;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => {
                    let local = e.local_name();
                    if local.as_ref() == b"p" {
                        current_paragraph.clear();
                        paragraph_style_heading = false;
                    } else if local.as_ref() == b"t" {
                        in_text = true;
                    } else if local.as_ref() == b"pStyle" {
                        for attr in e.attributes().flatten() {
                            let value = String::from_utf8_lossy(&attr.value);
                            if value.to_ascii_lowercase().contains("heading") {
                                paragraph_style_heading = true;
                            }
                        }
                    }
                }
                Ok(Event::Empty(e)) if e.local_name().as_ref() == b"pStyle" => {
                    for attr in e.attributes().flatten() {
                        let value = String::from_utf8_lossy(&attr.value);
                        if value.to_ascii_lowercase().contains("heading") {
                            paragraph_style_heading = true;
                        }
                    }
                }
                Ok(Event::Text(t)) if in_text => {
                    if let Ok(unescaped) = t.unescape() {
                        current_paragraph.push_str(&unescaped);
                    }
                }
                Ok(Event::End(e)) => {
                    let local = e.local_name();
                    if local.as_ref() == b"t" {
                        in_text = false;
                    } else if local.as_ref() == b"p" {
                        if paragraph_style_heading {
                            breaks.push(content.len());
                        }
                        content.push_str(&current_paragraph);
                        content.push('\n');
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(AppError::Extraction(format!("malformed DOCX XML in '{filename}': {e}"))),
                _ => {}
            }
            buf.clear();
        }

        Ok(ExtractedText { content, section_breaks: breaks })
    }
}

struct XlsxExtractor;

fn column_letters_to_index(cell_ref: &str) -> usize {
    let mut idx = 0usize;
    for c in cell_ref.chars().take_while(|c| c.is_ascii_alphabetic()) {
        idx = idx * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1);
    }
    idx.saturating_sub(1)
}

fn parse_shared_strings(bytes: &[u8]) -> Vec<String> {
    let Some(xml) = read_zip_entry(bytes, "xl/sharedStrings.xml") else {
        return Vec::new();
    };
    let mut reader = Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_si = false;
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let local = e.local_name();
                if local.as_ref() == b"si" {
                    in_si = true;
                    current.clear();
                } else if local.as_ref() == b"t" && in_si {
                    in_text = true;
                }
            }
            Ok(Event::Text(t)) if in_text => {
                if let Ok(unescaped) = t.unescape() {
                    current.push_str(&unescaped);
                }
            }
            Ok(Event::End(e)) => {
                let local = e.local_name();
                if local.as_ref() == b"t" {
                    in_text = false;
                } else if local.as_ref() == b"si" {
                    strings.push(current.clone());
                    in_si = false;
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    strings
}

fn parse_sheet_names(bytes: &[u8]) -> Vec<String> {
    let Some(xml) = read_zip_entry(bytes, "xl/workbook.xml") else {
        return Vec::new();
    };
    let mut reader = Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut names = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"name" {
                        names.push(String::from_utf8_lossy(&attr.value).to_string());
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    names
}

fn parse_sheet_rows(xml: &[u8], shared: &[String]) -> Vec<Vec<String>> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut current_row: HashMap<usize, String> = HashMap::new();
    let mut max_col = 0usize;
    let mut cell_type = String::new();
    let mut cell_col = 0usize;
    let mut in_value = false;
    let mut value_buf = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"row" => {
                let _ = e;
                current_row.clear();
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"row" => {
                let width = max_col.max(current_row.keys().copied().max().map(|m| m + 1).unwrap_or(0));
                let mut row_out = vec![String::new(); width];
                for (col, val) in current_row.drain() {
                    if col < row_out.len() {
                        row_out[col] = val;
                    }
                }
                rows.push(row_out);
            }
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"c" => {
                cell_type.clear();
                cell_col = 0;
                for attr in e.attributes().flatten() {
                    match attr.key.as_ref() {
                        b"t" => cell_type = String::from_utf8_lossy(&attr.value).to_string(),
                        b"r" => {
                            let r = String::from_utf8_lossy(&attr.value);
                            cell_col = column_letters_to_index(&r);
                            max_col = max_col.max(cell_col + 1);
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"v" => {
                let _ = e;
                in_value = true;
                value_buf.clear();
            }
            Ok(Event::Text(t)) if in_value => {
                if let Ok(unescaped) = t.unescape() {
                    value_buf.push_str(&unescaped);
                }
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"v" => {
                in_value = false;
                let resolved = if cell_type == "s" {
                    value_buf
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared.get(i).cloned())
                        .unwrap_or_default()
                } else {
                    value_buf.clone()
                };
                current_row.insert(cell_col, resolved);
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    rows
}

impl Extractor for XlsxExtractor {
    fn supports(&self, filename: &str) -> bool {
        ext_of(filename) == "xlsx"
    }

    fn extract(&self, bytes: &[u8], filename: &str) -> Result<ExtractedText> {
        let names = zip_entry_names(bytes);
        let mut sheet_paths: Vec<String> = names
            .into_iter()
            .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
            .collect();
        if sheet_paths.is_empty() {
            return Err(AppError::Extraction(format!("'{filename}' is not a valid XLSX container")));
        }
        sheet_paths.sort_by_key(|p| {
            p.trim_start_matches("xl/worksheets/sheet")
                .trim_end_matches(".xml")
                .parse::<usize>()
                .unwrap_or(usize::MAX)
        });

        let shared = parse_shared_strings(bytes);
        let sheet_names = parse_sheet_names(bytes);

        let mut content = String::new();
        let mut breaks = Vec::new();

        for (idx, path) in sheet_paths.iter().enumerate() {
            let name = sheet_names.get(idx).cloned().unwrap_or_else(|| format!("Sheet{}", idx + 1));
            breaks.push(content.len());
            content.push_str(&format!("=== Sheet: {name} ===\n"));

            if let Some(xml) = read_zip_entry(bytes, path) {
                for row in parse_sheet_rows(&xml, &shared) {
                    content.push_str(&row.join(" | "));
                    content.push('\n');
                }
            }
            content.push('\n');
        }

        Ok(ExtractedText { content, section_breaks: breaks })
    }
}

struct PptxExtractor;

fn parse_slide_text(xml: &[u8]) -> (String, Vec<String>) {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();

    let mut shape_text = String::new();
    let mut table_rows: Vec<String> = Vec::new();
    let mut in_tbl = 0i32;
    let mut current_cell = String::new();
    let mut current_row: Vec<String> = Vec::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let local = e.local_name();
                match local.as_ref() {
                    b"tbl" => in_tbl += 1,
                    b"tr" if in_tbl > 0 => current_row.clear(),
                    b"tc" if in_tbl > 0 => current_cell.clear(),
                    b"t" => in_text = true,
                    _ => {}
                }
            }
            Ok(Event::Text(t)) if in_text => {
                if let Ok(unescaped) = t.unescape() {
                    if in_tbl > 0 {
                        current_cell.push_str(&unescaped);
                    } else {
                        shape_text.push_str(&unescaped);
                    }
                }
            }
            Ok(Event::End(e)) => {
                let local = e.local_name();
                match local.as_ref() {
                    b"t" => in_text = false,
                    b"tc" if in_tbl > 0 => current_row.push(std::mem::take(&mut current_cell)),
                    b"tr" if in_tbl > 0 => table_rows.push(current_row.join(" | ")),
                    b"tbl" => in_tbl -= 1,
                    b"p" if in_tbl == 0 => shape_text.push('\n'),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    (shape_text, table_rows)
}

impl Extractor for PptxExtractor {
    fn supports(&self, filename: &str) -> bool {
        ext_of(filename) == "pptx"
    }

    fn extract(&self, bytes: &[u8], filename: &str) -> Result<ExtractedText> {
        let names = zip_entry_names(bytes);
        let mut slide_paths: Vec<String> = names
            .into_iter()
            .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
            .collect();
        if slide_paths.is_empty() {
            return Err(AppError::Extraction(format!("'{filename}' is not a valid PPTX container")));
        }
        slide_paths.sort_by_key(|p| {
            p.trim_start_matches("ppt/slides/slide")
                .trim_end_matches(".xml")
                .parse::<usize>()
                .unwrap_or(usize::MAX)
        });

        let mut content = String::new();
        let mut breaks = Vec::new();

        for (idx, path) in slide_paths.iter().enumerate() {
            let slide_no = idx + 1;
            breaks.push(content.len());
            content.push_str(&format!("--- Slide {slide_no} ---\n"));

            if let Some(xml) = read_zip_entry(bytes, path) {
                let (shape_text, table_rows) = parse_slide_text(&xml);
                content.push_str(shape_text.trim());
                content.push('\n');
                for row in &table_rows {
                    content.push_str(row);
                    content.push('\n');
                }
            }

            let notes_path = format!("ppt/notesSlides/notesSlide{slide_no}.xml");
            if let Some(notes_xml) = read_zip_entry(bytes, &notes_path) {
                let notes = xml_all_text(&notes_xml, "t");
                if !notes.trim().is_empty() {
                    content.push_str("[Speaker Notes]\n");
                    content.push_str(notes.trim());
                    content.push('\n');
                }
            }
            content.push('\n');
        }

        Ok(ExtractedText { content, section_breaks: breaks })
    }
}

// ---------------------------------------------------------------------
// URL (HTML main-content extraction) — async, not byte-dispatched
// ---------------------------------------------------------------------

/// Fetch a validated URL and extract its main textual content,
/// discarding navigation/script/style. Bounded by connect and read
/// timeouts (§5); validated again right before connecting to guard
/// against DNS rebinding (§6).
pub async fn extract_url(url: &str, connect_timeout: Duration, read_timeout: Duration) -> Result<ExtractedText> {
    let validated = super::url::validate_url_resolving(url).await?;

    let client = reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(read_timeout)
        .build()
        .map_err(|e| AppError::Extraction(format!("failed to build HTTP client: {e}")))?;

    let response = client
        .get(&validated)
        .send()
        .await
        .map_err(|e| AppError::Extraction(format!("failed to fetch '{validated}': {e}")))?;

    if !response.status().is_success() {
        return Err(AppError::Extraction(format!(
            "fetching '{validated}' returned status {}",
            response.status()
        )));
    }

    let body = response
        .text()
        .await
        .map_err(|e| AppError::Extraction(format!("failed to read response body: {e}")))?;

    let document = scraper::Html::parse_document(&body);
    let drop_selector = scraper::Selector::parse("script, style, nav, header, footer, noscript").unwrap();
    let mut dropped: std::collections::HashSet<_> = Default::default();
    for el in document.select(&drop_selector) {
        dropped.insert(el.id());
    }

    let main_selector = scraper::Selector::parse("main, article, body").unwrap();
    let root = document
        .select(&main_selector)
        .next()
        .unwrap_or_else(|| document.root_element());

    let text: String = root
        .text()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    Ok(ExtractedText::plain(text))
}

// ---------------------------------------------------------------------
// images (OCR hook)
// ---------------------------------------------------------------------

/// OCR is out of scope as a bundled heavy model dependency (Non-goals);
/// this trait is the pluggable seam a caller wires a real OCR engine
/// into. `NoopOcr` records only that no text was recognized.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, image_bytes: &[u8], filename: &str) -> Result<String>;
}

pub struct NoopOcr;

impl OcrEngine for NoopOcr {
    fn recognize(&self, _image_bytes: &[u8], _filename: &str) -> Result<String> {
        Ok(String::new())
    }
}

pub fn extract_image(bytes: &[u8], filename: &str, ocr: &dyn OcrEngine) -> Result<ExtractedText> {
    if !matches!(ext_of(filename).as_str(), "png" | "jpg" | "jpeg") {
        return Err(AppError::Extraction(format!(
            "unsupported image format for '{filename}': only PNG/JPEG are accepted"
        )));
    }
    let text = ocr.recognize(bytes, filename)?;
    Ok(ExtractedText::plain(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_decodes_utf8() {
        let extracted = TextExtractor.extract("hello world".as_bytes(), "a.txt").unwrap();
        assert_eq!(extracted.content, "hello world");
    }

    #[test]
    fn plain_text_falls_back_to_latin1_on_bad_utf8() {
        let bytes = vec![0xE9, 0x20, 0x61]; // 'é' in Latin-1, not valid UTF-8 alone
        let extracted = TextExtractor.extract(&bytes, "a.txt").unwrap();
        assert!(!extracted.content.is_empty());
    }

    #[test]
    fn markdown_headings_recorded_as_section_breaks() {
        let md = "# Title\nsome text\n## Section\nmore text\n";
        let extracted = TextExtractor.extract(md.as_bytes(), "doc.md").unwrap();
        assert_eq!(extracted.section_breaks.len(), 2);
    }

    #[test]
    fn source_code_emits_preface() {
        let code = "def helper():\n    return 1\n\nclass Foo:\n    pass\n";
        let extracted = SourceCodeExtractor.extract(code.as_bytes(), "util.py").unwrap();
        assert!(extracted.content.starts_with("SOURCE CODE FILE: util.py"));
        assert!(extracted.content.contains("Language: Python"));
        assert!(extracted.content.contains("Functions: 1"));
        assert!(extracted.content.contains("Classes: 1"));
    }

    #[test]
    fn notebook_extracts_cells_in_order() {
        let nb = serde_json::json!({
            "metadata": {"kernelspec": {"display_name": "Python 3"}},
            "cells": [
                {"cell_type": "markdown", "source": ["# Title\n"]},
                {"cell_type": "code", "source": ["print(1)"], "outputs": [{"data": {"text/plain": ["1"]}}]}
            ]
        });
        let bytes = serde_json::to_vec(&nb).unwrap();
        let extracted = NotebookExtractor.extract(&bytes, "nb.ipynb").unwrap();
        assert!(extracted.content.contains("Kernel: Python 3"));
        assert!(extracted.content.contains("[Markdown 1]"));
        assert!(extracted.content.contains("[Code Cell 1]"));
        assert!(extracted.content.contains("[Output]"));
        assert!(extracted.content.contains("print(1)"));
    }

    #[test]
    fn subtitles_strip_timestamps_and_cue_numbers() {
        let srt = "1\n00:00:01,000 --> 00:00:02,000\nHello there\n\n2\n00:00:03,000 --> 00:00:04,000\nGeneral Kenobi\n";
        let extracted = SubtitleExtractor.extract(srt.as_bytes(), "a.srt").unwrap();
        assert_eq!(extracted.content, "Hello there General Kenobi");
    }

    #[test]
    fn vtt_strips_note_blocks() {
        let vtt = "WEBVTT\n\nNOTE This is a comment\n\n1\n00:00:00.000 --> 00:00:01.000\nHi\n";
        let extracted = SubtitleExtractor.extract(vtt.as_bytes(), "a.vtt").unwrap();
        assert_eq!(extracted.content, "Hi");
    }

    #[test]
    fn registry_falls_back_to_text_for_unknown_extension() {
        let extracted = registry().extract(b"hello", "mystery.xyz123").unwrap();
        assert_eq!(extracted.content, "hello");
    }

    #[test]
    fn image_rejects_unsupported_formats() {
        let err = extract_image(b"\x00\x01", "scan.gif", &NoopOcr).unwrap_err();
        assert_eq!(err.category(), "extraction");
    }

    #[test]
    fn noop_ocr_returns_empty_text() {
        let extracted = extract_image(b"\x89PNG", "scan.png", &NoopOcr).unwrap();
        assert_eq!(extracted.content, "");
    }
}
