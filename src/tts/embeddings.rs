//! Speaker embedding table: loading, validation and lookup.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::TtsError;

/// Number of f32 values in one speaker embedding vector.
pub const EMBEDDING_DIM: usize = 512;

/// A resolved voice: the table index actually used and its embedding vector.
#[derive(Debug, Clone, Copy)]
pub struct Speaker<'a> {
    pub index: usize,
    pub embedding: &'a [f32],
}

/// Validated table of fixed-length voice vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingTable {
    vectors: Vec<Vec<f32>>,
}

impl EmbeddingTable {
    /// Parse a flat little-endian f32 buffer.
    ///
    /// Trailing bytes that do not form a whole f32 are dropped along with any
    /// incomplete final vector.
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, TtsError> {
        if bytes.len() % 4 != 0 {
            warn!("Speaker embeddings: dropping {} trailing byte(s)", bytes.len() % 4);
        }
        let values: Vec<f32> = bytes.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect();
        Self::from_values(&values)
    }

    /// Build a table from raw values, validating every complete vector.
    ///
    /// # Errors
    /// - [`TtsError::EmbeddingsTooSmall`] if fewer than [`EMBEDDING_DIM`] values are given
    /// - [`TtsError::InvalidEmbeddingValue`] if any kept value is NaN or infinite
    pub fn from_values(values: &[f32]) -> Result<Self, TtsError> {
        if values.len() < EMBEDDING_DIM {
            return Err(TtsError::EmbeddingsTooSmall(values.len()));
        }

        let remainder = values.len() % EMBEDDING_DIM;
        if remainder != 0 {
            warn!("Speaker embeddings length {} is not a multiple of {}, dropping {} trailing values", values.len(), EMBEDDING_DIM, remainder);
        }

        let mut vectors = Vec::with_capacity(values.len() / EMBEDDING_DIM);
        for (i, chunk) in values.chunks_exact(EMBEDDING_DIM).enumerate() {
            if let Some(pos) = chunk.iter().position(|v| !v.is_finite()) {
                return Err(TtsError::InvalidEmbeddingValue(i * EMBEDDING_DIM + pos));
            }
            vectors.push(chunk.to_vec());
        }

        Ok(Self { vectors })
    }

    /// Number of voices in the table (always at least 1).
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Look up a voice by index, falling back to voice 0 when out of range.
    ///
    /// # Errors
    /// Returns [`TtsError::EmbeddingLength`] if the stored vector is not exactly
    /// [`EMBEDDING_DIM`] values long.
    pub fn speaker(&self, index: usize) -> Result<Speaker<'_>, TtsError> {
        let resolved = if index < self.vectors.len() {
            index
        } else {
            debug!("Speaker index {} out of range ({} voices), using voice 0", index, self.vectors.len());
            0
        };

        let embedding = self.vectors.get(resolved).ok_or(TtsError::EmbeddingLength { expected: EMBEDDING_DIM, actual: 0 })?;
        if embedding.len() != EMBEDDING_DIM {
            return Err(TtsError::EmbeddingLength { expected: EMBEDDING_DIM, actual: embedding.len() });
        }

        Ok(Speaker { index: resolved, embedding })
    }
}

/// Where the embedding table is fetched from.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddingSource {
    File(PathBuf),
    Url(String),
    Memory(Arc<[u8]>),
}

impl EmbeddingSource {
    /// Interpret a CLI value: `http(s)://` prefixes select a download, anything else a file.
    pub fn parse(value: &str) -> Self {
        if value.starts_with("http://") || value.starts_with("https://") {
            EmbeddingSource::Url(value.to_string())
        } else {
            EmbeddingSource::File(PathBuf::from(value))
        }
    }

    /// Fetch the raw bytes.
    ///
    /// # Errors
    /// Returns [`TtsError::Load`] if the file cannot be read or the download fails.
    pub async fn fetch(&self) -> Result<Vec<u8>, TtsError> {
        match self {
            EmbeddingSource::File(path) => {
                debug!("Reading speaker embeddings from {}", path.display());
                tokio::fs::read(path).await.map_err(|e| TtsError::load("speaker embeddings", format!("{}: {}", path.display(), e)))
            }
            EmbeddingSource::Url(url) => {
                info!("Downloading speaker embeddings from {}", url);
                let response = reqwest::get(url.as_str()).await.map_err(|e| TtsError::load("speaker embeddings", e))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(TtsError::load("speaker embeddings", format!("Failed to fetch embeddings: {}", status)));
                }
                let bytes = response.bytes().await.map_err(|e| TtsError::load("speaker embeddings", e))?;
                Ok(bytes.to_vec())
            }
            EmbeddingSource::Memory(bytes) => Ok(bytes.to_vec()),
        }
    }

    /// Fetch and validate the table.
    pub async fn load(&self) -> Result<EmbeddingTable, TtsError> {
        let bytes = self.fetch().await?;
        let table = EmbeddingTable::from_le_bytes(&bytes)?;
        info!("Loaded {} speaker embedding(s)", table.len());
        Ok(table)
    }
}

/// Serialize vectors as the flat little-endian layout [`EmbeddingTable::from_le_bytes`] reads.
pub fn to_le_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}
