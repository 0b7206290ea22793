//! Transcript source

use crate::error::TranscriptError;
use async_trait::async_trait;
use autonomic_model::{Transcript, TranscriptRef};
use dashmap::DashMap;

/// Read-only access to captured conversations
#[async_trait]
pub trait TranscriptSource: Send + Sync {
    async fn fetch(&self, reference: &TranscriptRef) -> Result<Transcript, TranscriptError>;
}

/// Transcripts held in memory
#[derive(Debug, Default)]
pub struct InMemoryTranscripts {
    transcripts: DashMap<TranscriptRef, Transcript>,
}

impl InMemoryTranscripts {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a captured transcript under its reference
    pub fn insert(&self, transcript: Transcript) {
        self.transcripts
            .insert(transcript.reference.clone(), transcript);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.transcripts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transcripts.is_empty()
    }
}

#[async_trait]
impl TranscriptSource for InMemoryTranscripts {
    async fn fetch(&self, reference: &TranscriptRef) -> Result<Transcript, TranscriptError> {
        self.transcripts
            .get(reference)
            .map(|t| t.clone())
            .ok_or_else(|| TranscriptError::NotFound(reference.clone()))
    }
}
