use crate::core::hash::PerceptualHash;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::io::BufRead;

const UNKNOWN: &str = "unknown";

/// Exact-content digest of an image file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "String")]
pub enum ContentHash {
    Known(String),
    #[default]
    Unknown,
}

impl ContentHash {
    pub fn is_known(&self) -> bool {
        matches!(self, ContentHash::Known(_))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentHash::Known(hex) => write!(f, "{}", hex),
            ContentHash::Unknown => write!(f, "{}", UNKNOWN),
        }
    }
}

impl From<String> for ContentHash {
    fn from(s: String) -> Self {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(UNKNOWN) {
            ContentHash::Unknown
        } else {
            ContentHash::Known(trimmed.to_ascii_lowercase())
        }
    }
}

impl From<Option<String>> for ContentHash {
    fn from(s: Option<String>) -> Self {
        s.map_or(ContentHash::Unknown, ContentHash::from)
    }
}

impl From<&str> for ContentHash {
    fn from(s: &str) -> Self {
        ContentHash::from(s.to_string())
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_string()
    }
}

/// Per-image metadata handed to the engine by the scanning collaborator.
///
/// Hashes are computed once upstream and never touched here. Any fields the
/// engine does not understand are kept in `extra` and written back out
/// unchanged. A missing or `null` hash reads as unknown rather than
/// rejecting the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub path: String,
    pub canonical_class: String,
    pub dataset_source: String,
    #[serde(default)]
    pub content_hash: ContentHash,
    #[serde(default)]
    pub perceptual_hash: PerceptualHash,
    #[serde(default)]
    pub quality_score: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ImageRecord {
    pub fn new(
        path: impl Into<String>,
        canonical_class: impl Into<String>,
        dataset_source: impl Into<String>,
        content_hash: ContentHash,
        perceptual_hash: PerceptualHash,
        quality_score: f64,
    ) -> Self {
        Self {
            path: path.into(),
            canonical_class: canonical_class.into(),
            dataset_source: dataset_source.into(),
            content_hash,
            perceptual_hash,
            quality_score,
            extra: Map::new(),
        }
    }

    /// Combine scanner output with an analysis result. A failed analysis
    /// still yields a record, carrying the unknown-hash sentinels.
    pub fn from_analysis(
        path: impl Into<String>,
        canonical_class: impl Into<String>,
        dataset_source: impl Into<String>,
        outcome: &AnalysisOutcome,
    ) -> Self {
        match outcome {
            AnalysisOutcome::Analyzed(analysis) => {
                let mut record = Self::new(
                    path,
                    canonical_class,
                    dataset_source,
                    analysis.content_hash.clone(),
                    analysis.perceptual_hash.clone(),
                    analysis.quality_score,
                );
                record.extra = analysis.attributes.clone();
                record
            }
            AnalysisOutcome::Failed { reason } => {
                let mut record = Self::new(
                    path,
                    canonical_class,
                    dataset_source,
                    ContentHash::Unknown,
                    PerceptualHash::Unknown,
                    0.0,
                );
                record
                    .extra
                    .insert("analysis_error".to_string(), Value::String(reason.clone()));
                record
            }
        }
    }
}

/// Read one record per line. Blank lines are ignored and malformed lines
/// are skipped with a warning so one bad row cannot sink a batch.
pub fn read_jsonl<R: BufRead>(reader: R) -> Result<Vec<ImageRecord>> {
    let mut records = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ImageRecord>(&line) {
            Ok(record) => records.push(record),
            Err(err) => log::warn!("Skipping malformed record on line {}: {}", i + 1, err),
        }
    }
    Ok(records)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAnalysis {
    pub content_hash: ContentHash,
    pub perceptual_hash: PerceptualHash,
    pub quality_score: f64,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

/// Result of analysing one image file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisOutcome {
    Analyzed(ImageAnalysis),
    Failed { reason: String },
}

/// Memoizes analysis results by path for the duration of one pipeline run.
#[derive(Debug, Default)]
pub struct AnalysisCache {
    entries: HashMap<String, AnalysisOutcome>,
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&AnalysisOutcome> {
        self.entries.get(path)
    }

    /// Return the cached outcome for `path`, running `analyze` on a miss.
    pub fn get_or_analyze<F>(&mut self, path: &str, analyze: F) -> &AnalysisOutcome
    where
        F: FnOnce(&str) -> AnalysisOutcome,
    {
        self.entries
            .entry(path.to_string())
            .or_insert_with(|| analyze(path))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
