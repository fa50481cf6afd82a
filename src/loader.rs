//! File loaders: one downloaded file in, documents out.
//!
//! [`AutoLoader`] picks a strategy from the file's type (extension or MIME
//! fragment recorded by the source):
//!
//! | Type | Behaviour |
//! |------|-----------|
//! | `csv` | one document per row; content is `"column: value"` lines; metadata carries the row values |
//! | `pdf` | one document per page |
//! | `html` | single document, tags stripped |
//! | `md`, `txt`, unknown | single document, whole file |
//! | `json` | one document per top-level record |
//!
//! Every emitted document inherits the file's metadata and adds a `source`
//! field, plus `row` / `page` / `record` where applicable. CSV and HTML are
//! parsed with minimal built-in readers (no extra deps); PDFs go through
//! `pdf-extract`.

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::models::{LocalFile, Metadata, RagDocument};

/// Extension/MIME-dispatched loader.
pub struct AutoLoader;

impl AutoLoader {
    /// Load a downloaded file into documents.
    pub fn load(file: &LocalFile) -> Result<Vec<RagDocument>> {
        let kind = file.file_type.to_lowercase();
        if kind.contains("csv") {
            load_csv(file)
        } else if kind.contains("pdf") {
            load_pdf(file)
        } else if kind.contains("html") {
            load_html(file)
        } else if kind.contains("json") {
            load_json(file)
        } else {
            // md, txt, and anything unrecognized: the whole file as one
            // document.
            load_text(file)
        }
    }
}

/// Base metadata for a document emitted from `file`.
fn base_metadata(file: &LocalFile) -> Metadata {
    let mut metadata = file.metadata.clone();
    metadata.insert("source".to_string(), json!(file.id));
    metadata
}

fn read_to_string(file: &LocalFile) -> Result<String> {
    let bytes = std::fs::read(&file.file_path)
        .with_context(|| format!("failed to read {}", file.file_path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn load_text(file: &LocalFile) -> Result<Vec<RagDocument>> {
    let content = read_to_string(file)?;
    Ok(vec![RagDocument::new(
        file.id.clone(),
        content,
        base_metadata(file),
    )])
}

fn load_pdf(file: &LocalFile) -> Result<Vec<RagDocument>> {
    let bytes = std::fs::read(&file.file_path)
        .with_context(|| format!("failed to read {}", file.file_path.display()))?;
    let pages = pdf_extract::extract_text_from_mem_by_pages(&bytes)
        .with_context(|| format!("PDF extraction failed for {}", file.id))?;

    Ok(pages
        .into_iter()
        .enumerate()
        .map(|(i, text)| {
            let mut metadata = base_metadata(file);
            metadata.insert("page".to_string(), json!(i));
            RagDocument::new(format!("{}_page_{}", file.id, i), text, metadata)
        })
        .collect())
}

fn load_html(file: &LocalFile) -> Result<Vec<RagDocument>> {
    let raw = read_to_string(file)?;
    Ok(vec![RagDocument::new(
        file.id.clone(),
        strip_html(&raw),
        base_metadata(file),
    )])
}

fn load_json(file: &LocalFile) -> Result<Vec<RagDocument>> {
    let raw = read_to_string(file)?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("invalid JSON in {}", file.id))?;

    let records: Vec<Value> = match value {
        Value::Array(items) => items,
        other => vec![other],
    };

    Ok(records
        .into_iter()
        .enumerate()
        .map(|(i, record)| {
            let content = match &record {
                Value::String(s) => s.clone(),
                other => serde_json::to_string_pretty(other).unwrap_or_default(),
            };
            let mut metadata = base_metadata(file);
            metadata.insert("record".to_string(), json!(i));
            RagDocument::new(format!("{}_record_{}", file.id, i), content, metadata)
        })
        .collect())
}

fn load_csv(file: &LocalFile) -> Result<Vec<RagDocument>> {
    let raw = read_to_string(file)?;
    let rows = parse_csv(&raw);

    let Some((header, data_rows)) = rows.split_first() else {
        return Ok(Vec::new());
    };

    Ok(data_rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut lines = Vec::with_capacity(header.len());
            let mut metadata = base_metadata(file);
            metadata.insert("row".to_string(), json!(i));
            for (col, value) in header.iter().zip(row.iter()) {
                lines.push(format!("{}: {}", col, value));
                metadata.insert(col.clone(), json!(value));
            }
            RagDocument::new(format!("{}_row_{}", file.id, i), lines.join("\n"), metadata)
        })
        .collect())
}

// ============ CSV parsing (minimal, no extra deps) ============

/// Parse CSV text into rows of fields. Handles double-quoted fields with
/// embedded commas, newlines, and `""` escapes. Empty lines are skipped.
fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => {
                row.push(std::mem::take(&mut field));
            }
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                if !(row.len() == 1 && row[0].is_empty()) {
                    rows.push(std::mem::take(&mut row));
                } else {
                    row.clear();
                }
            }
            _ => field.push(c),
        }
    }

    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}

// ============ HTML stripping (minimal, no extra deps) ============

/// Drop tags, `<script>`/`<style>` bodies, and collapse whitespace.
fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut rest = html;

    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        rest = &rest[open..];

        let lower = rest.to_lowercase();
        let skip_to = if lower.starts_with("<script") {
            lower.find("</script>").map(|i| i + "</script>".len())
        } else if lower.starts_with("<style") {
            lower.find("</style>").map(|i| i + "</style>".len())
        } else if lower.starts_with("<!--") {
            lower.find("-->").map(|i| i + "-->".len())
        } else {
            rest.find('>').map(|i| i + 1)
        };

        // Indexing with positions found on the lowercased copy; fall back to
        // dropping the rest if the offset is not a char boundary.
        match skip_to {
            Some(end) => rest = rest.get(end..).unwrap_or(""),
            None => rest = "",
        }
        // Tags are word boundaries in rendered text.
        out.push(' ');
    }
    out.push_str(rest);

    decode_entities(&out)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metadata;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn local_file(dir: &TempDir, name: &str, contents: &str) -> LocalFile {
        let path: PathBuf = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        LocalFile::unmanaged(name.to_string(), path, Metadata::new())
    }

    #[test]
    fn test_txt_whole_file() {
        let dir = TempDir::new().unwrap();
        let file = local_file(&dir, "notes.txt", "hello world");
        let docs = AutoLoader::load(&file).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "notes.txt");
        assert_eq!(docs[0].content, "hello world");
        assert_eq!(docs[0].metadata["source"], serde_json::json!("notes.txt"));
    }

    #[test]
    fn test_unknown_extension_falls_back_to_text() {
        let dir = TempDir::new().unwrap();
        let file = local_file(&dir, "README", "plain contents");
        let docs = AutoLoader::load(&file).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].content, "plain contents");
    }

    #[test]
    fn test_csv_row_documents() {
        let dir = TempDir::new().unwrap();
        let file = local_file(
            &dir,
            "people.csv",
            "name,city\nAda,London\n\"Grace, Rear Admiral\",Arlington\n",
        );
        let docs = AutoLoader::load(&file).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "people.csv_row_0");
        assert_eq!(docs[0].content, "name: Ada\ncity: London");
        assert_eq!(docs[0].metadata["name"], serde_json::json!("Ada"));
        assert_eq!(docs[0].metadata["row"], serde_json::json!(0));
        assert_eq!(
            docs[1].metadata["name"],
            serde_json::json!("Grace, Rear Admiral")
        );
    }

    #[test]
    fn test_csv_quoted_newline_and_escape() {
        let rows = parse_csv("a,b\n\"line\nbreak\",\"say \"\"hi\"\"\"\n");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][0], "line\nbreak");
        assert_eq!(rows[1][1], "say \"hi\"");
    }

    #[test]
    fn test_json_array_records() {
        let dir = TempDir::new().unwrap();
        let file = local_file(
            &dir,
            "items.json",
            r#"[{"title": "first"}, "plain entry"]"#,
        );
        let docs = AutoLoader::load(&file).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "items.json_record_0");
        assert!(docs[0].content.contains("first"));
        assert_eq!(docs[1].content, "plain entry");
        assert_eq!(docs[1].metadata["record"], serde_json::json!(1));
    }

    #[test]
    fn test_json_object_is_single_record() {
        let dir = TempDir::new().unwrap();
        let file = local_file(&dir, "one.json", r#"{"k": "v"}"#);
        let docs = AutoLoader::load(&file).unwrap();
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn test_invalid_json_errors() {
        let dir = TempDir::new().unwrap();
        let file = local_file(&dir, "bad.json", "{nope");
        assert!(AutoLoader::load(&file).is_err());
    }

    #[test]
    fn test_html_stripped() {
        let dir = TempDir::new().unwrap();
        let file = local_file(
            &dir,
            "page.html",
            "<html><head><style>p{color:red}</style></head>\
             <body><h1>Title</h1><p>Some &amp; text</p><script>var x=1;</script></body></html>",
        );
        let docs = AutoLoader::load(&file).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].content, "Title Some & text");
    }

    #[test]
    fn test_strip_html_unterminated_tag() {
        assert_eq!(strip_html("before <unclosed"), "before");
    }
}
