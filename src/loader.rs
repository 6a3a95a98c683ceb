//! Document loading.
//!
//! Walks a folder and turns every supported file into plain-text records.
//! A file that cannot be read or parsed is logged and reported in
//! [`LoadReport::failures`]; it never stops the rest of the scan.

use lazy_static::lazy_static;
use regex::Regex;
use scraper::{Html, Selector};
use std::fs;
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("The provided folder path {0} does not exist.")]
    NotADirectory(String),
}

/// Per-file extraction failure. Never propagated past the loader.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
    #[error("{kind} parse error: {message}")]
    Parse { kind: &'static str, message: String },
}

/// Raw text pulled out of one file (or one page/row of it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRecord {
    pub content: String,
    pub source_path: String,
    /// Location inside the file, e.g. `page 2` or `row 5`.
    pub section: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoadFailure {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub records: Vec<TextRecord>,
    pub failures: Vec<LoadFailure>,
    pub files_loaded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentFormat {
    Pdf,
    Docx,
    PlainText,
    Csv,
    Html,
}

impl DocumentFormat {
    fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "pdf" => Some(Self::Pdf),
            "doc" | "docx" => Some(Self::Docx),
            "txt" => Some(Self::PlainText),
            "csv" => Some(Self::Csv),
            "html" => Some(Self::Html),
            _ => None,
        }
    }
}

/// Loads every supported document below `dir`.
///
/// This is blocking; async callers should run it on a blocking thread.
pub fn load_directory(dir: impl AsRef<Path>) -> Result<LoadReport, LoaderError> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(LoaderError::NotADirectory(dir.display().to_string()));
    }

    let mut report = LoadReport::default();

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
                warn!(path = %path.display(), error = %e, "Error walking directory");
                report.failures.push(LoadFailure {
                    path,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        // Symlinked files count; symlinked directories are not descended into.
        let is_file = entry.file_type().is_file() || (entry.path_is_symlink() && entry.path().is_file());
        if !is_file {
            continue;
        }

        let path = entry.path();
        let Some(format) = DocumentFormat::from_path(path) else {
            continue;
        };

        match extract_file(path, format) {
            Ok(records) => {
                debug!(path = %path.display(), records = records.len(), "Loaded file");
                report.files_loaded += 1;
                report.records.extend(records);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Error loading file");
                report.failures.push(LoadFailure {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(report)
}

fn extract_file(path: &Path, format: DocumentFormat) -> Result<Vec<TextRecord>, ExtractError> {
    let source_path = path.to_string_lossy().to_string();
    let sections: Vec<(Option<String>, String)> = match format {
        DocumentFormat::Pdf => extract_pdf(&fs::read(path)?)?,
        DocumentFormat::Docx => vec![(None, extract_docx(path)?)],
        DocumentFormat::PlainText => vec![(None, String::from_utf8(fs::read(path)?)?)],
        DocumentFormat::Csv => extract_csv(&String::from_utf8(fs::read(path)?)?)?,
        DocumentFormat::Html => vec![(None, extract_html(&String::from_utf8_lossy(&fs::read(path)?)))],
    };

    Ok(sections
        .into_iter()
        .filter(|(_, text)| !text.trim().is_empty())
        .map(|(section, text)| TextRecord {
            content: text.nfc().collect(),
            source_path: source_path.clone(),
            section,
        })
        .collect())
}

/// One entry per page. pdf-extract separates pages with form feeds.
fn extract_pdf(bytes: &[u8]) -> Result<Vec<(Option<String>, String)>, ExtractError> {
    // pdf-extract can panic on malformed input; keep that inside this file.
    let text = panic::catch_unwind(AssertUnwindSafe(|| pdf_extract::extract_text_from_mem(bytes)))
        .map_err(|_| ExtractError::Parse {
            kind: "pdf",
            message: "parser panicked on malformed document".to_string(),
        })?
        .map_err(|e| ExtractError::Parse {
            kind: "pdf",
            message: e.to_string(),
        })?;

    Ok(split_pages(&text))
}

/// Without a form feed there is no page structure to report.
fn split_pages(text: &str) -> Vec<(Option<String>, String)> {
    if !text.contains('\x0C') {
        return vec![(None, text.to_string())];
    }
    text.split('\x0C')
        .enumerate()
        .map(|(i, page)| (Some(format!("page {}", i + 1)), page.to_string()))
        .collect()
}

lazy_static! {
    static ref XML_TAG: Regex = Regex::new(r"<[^>]+>").unwrap();
    static ref BLANK_RUNS: Regex = Regex::new(r"\n{3,}").unwrap();
}

/// Pulls the body text out of `word/document.xml`.
fn extract_docx(path: &Path) -> Result<String, ExtractError> {
    let parse_err = |e: zip::result::ZipError| ExtractError::Parse {
        kind: "docx",
        message: e.to_string(),
    };

    let file = fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(parse_err)?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(parse_err)?
        .read_to_string(&mut xml)?;

    Ok(docx_xml_to_text(&xml))
}

fn docx_xml_to_text(xml: &str) -> String {
    let marked = xml
        .replace("</w:p>", "\n")
        .replace("<w:tab/>", "\t")
        .replace("<w:br/>", "\n");
    let stripped = XML_TAG.replace_all(&marked, "");
    let text = stripped
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&");
    BLANK_RUNS.replace_all(text.trim(), "\n\n").into_owned()
}

/// One entry per data record, rendered as `header: value` lines. Quoted
/// fields may span lines.
fn extract_csv(content: &str) -> Result<Vec<(Option<String>, String)>, ExtractError> {
    let parse_err = |e: csv::Error| ExtractError::Parse {
        kind: "csv",
        message: e.to_string(),
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());
    let headers = reader.headers().map_err(parse_err)?.clone();

    let mut rows = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(parse_err)?;
        let text = headers
            .iter()
            .enumerate()
            .map(|(i, header)| format!("{}: {}", header, record.get(i).unwrap_or("")))
            .collect::<Vec<_>>()
            .join("\n");
        rows.push((Some(format!("row {row}")), text));
    }
    Ok(rows)
}

/// Visible text of the document body, one line per text node.
fn extract_html(source: &str) -> String {
    let document = Html::parse_document(source);
    let root = Selector::parse("body")
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .unwrap_or_else(|| document.root_element());

    let mut lines = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element().map(|el| el.name().to_string()))
            .is_some_and(|name| matches!(name.as_str(), "script" | "style" | "noscript" | "template"));
        if hidden {
            continue;
        }
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !collapsed.is_empty() {
            lines.push(collapsed);
        }
    }
    lines.join("\n")
}
