use crate::loader::TextRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 150;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChunkerError {
    #[error("invalid chunk configuration: chunk_size={chunk_size}, overlap={overlap}")]
    InvalidConfig { chunk_size: usize, overlap: usize },
}

/// A bounded slice of a document; the unit that gets embedded and searched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSegment {
    pub content: String,
    pub source_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

/// Splits every record into windows of `chunk_size` characters, each window
/// starting `chunk_size - overlap` characters after the previous one.
///
/// Lengths are counted in `char`s so multi-byte text never splits inside a
/// code point. Records keep their order and their segments stay contiguous.
pub fn split(
    records: &[TextRecord],
    chunk_size: usize,
    overlap: usize,
) -> Result<Vec<TextSegment>, ChunkerError> {
    if chunk_size == 0 || overlap >= chunk_size {
        return Err(ChunkerError::InvalidConfig { chunk_size, overlap });
    }

    let mut segments = Vec::new();
    for record in records {
        for content in split_text(&record.content, chunk_size, overlap) {
            segments.push(TextSegment {
                content,
                source_path: record.source_path.clone(),
                section: record.section.clone(),
            });
        }
    }
    Ok(segments)
}

fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let step = chunk_size - overlap;

    let mut windows = Vec::new();
    let mut start = 0;
    while start < total {
        let end = (start + chunk_size).min(total);
        windows.push(chars[start..end].iter().collect());
        if end == total {
            break;
        }
        start += step;
    }
    windows
}
