use std::sync::Arc;

use scamper_notes_core::{
    InMemoryStore, NewNote, Note, NoteId, NotePatch, NoteStore, NoteWithScamper, ParseIdError,
    ScamperData, ScamperField, ScamperPatch, StoreError, ValidationIssue,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const API_CONTRACT_VERSION: &str = "api.v1";

const NOTE_NOT_FOUND: &str = "Note not found";
const SCAMPER_NOT_FOUND: &str = "SCAMPER data not found";
const INVALID_NOTE_DATA: &str = "Invalid note data";
const INVALID_SCAMPER_DATA: &str = "Invalid SCAMPER data";
const SAVE_SCAMPER_FAILED: &str = "Failed to save SCAMPER data";

/// Failures a caller can observe. Messages are safe to show to end users;
/// backend detail stays in the `source` of [`ApiError::Unexpected`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("Invalid note ID")]
    InvalidId(#[source] ParseIdError),
    #[error("{message}")]
    Validation { message: &'static str, issues: Vec<ValidationIssue> },
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{message}")]
    Unexpected {
        message: &'static str,
        #[source]
        source: StoreError,
    },
}

impl ApiError {
    /// Validation failure for a note body the transport could not decode.
    #[must_use]
    pub fn unreadable_note_body(detail: impl Into<String>) -> Self {
        Self::Validation {
            message: INVALID_NOTE_DATA,
            issues: vec![ValidationIssue::invalid_json(detail)],
        }
    }

    /// Validation failure for a worksheet body the transport could not decode.
    #[must_use]
    pub fn unreadable_scamper_body(detail: impl Into<String>) -> Self {
        Self::Validation {
            message: INVALID_SCAMPER_DATA,
            issues: vec![ValidationIssue::invalid_json(detail)],
        }
    }

    #[must_use]
    pub fn issues(&self) -> &[ValidationIssue] {
        match self {
            Self::Validation { issues, .. } => issues,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteConfirmation {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScamperFieldDescriptor {
    pub key: String,
    pub label: String,
    pub prompt: String,
}

/// Worksheet prompts in display order, for clients that render the editor.
#[must_use]
pub fn scamper_field_descriptors() -> Vec<ScamperFieldDescriptor> {
    ScamperField::ALL
        .into_iter()
        .map(|field| ScamperFieldDescriptor {
            key: field.key().to_string(),
            label: field.label().to_string(),
            prompt: field.prompt().to_string(),
        })
        .collect()
}

/// Transport-agnostic entry point. Takes path ids and bodies exactly as a
/// transport receives them and returns typed results or an [`ApiError`].
#[derive(Clone)]
pub struct NotesApi {
    store: Arc<dyn NoteStore>,
}

impl std::fmt::Debug for NotesApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotesApi").finish_non_exhaustive()
    }
}

fn parse_note_id(raw: &str) -> Result<NoteId, ApiError> {
    raw.parse::<NoteId>().map_err(ApiError::InvalidId)
}

fn unexpected(message: &'static str) -> impl FnOnce(StoreError) -> ApiError {
    move |source| {
        tracing::error!(error = %source, "{message}");
        ApiError::Unexpected { message, source }
    }
}

impl NotesApi {
    #[must_use]
    pub fn new(store: Arc<dyn NoteStore>) -> Self {
        Self { store }
    }

    /// API over a fresh process-local store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }

    /// All notes with worksheet progress, newest first.
    ///
    /// # Errors
    /// Returns [`ApiError::Unexpected`] when the store fails.
    pub fn list_notes(&self) -> Result<Vec<NoteWithScamper>, ApiError> {
        self.store.list_notes().map_err(unexpected("Failed to fetch notes"))
    }

    /// # Errors
    /// Returns [`ApiError::InvalidId`], [`ApiError::NotFound`], or
    /// [`ApiError::Unexpected`] when the store fails.
    pub fn get_note(&self, raw_id: &str) -> Result<NoteWithScamper, ApiError> {
        let id = parse_note_id(raw_id)?;
        self.store
            .get_note(id)
            .map_err(unexpected("Failed to fetch note"))?
            .ok_or(ApiError::NotFound(NOTE_NOT_FOUND))
    }

    /// # Errors
    /// Returns [`ApiError::Validation`] for a malformed body, or
    /// [`ApiError::Unexpected`] when the store fails.
    pub fn create_note(&self, body: &Value) -> Result<Note, ApiError> {
        let fields = NewNote::from_json(body)
            .map_err(|issues| ApiError::Validation { message: INVALID_NOTE_DATA, issues })?;
        let note = self.store.create_note(fields).map_err(unexpected("Failed to create note"))?;
        tracing::info!(note_id = %note.id, "note created");
        Ok(note)
    }

    /// Merge the present fields of `body` into the note.
    ///
    /// # Errors
    /// Returns [`ApiError::InvalidId`], [`ApiError::Validation`],
    /// [`ApiError::NotFound`], or [`ApiError::Unexpected`] when the store fails.
    pub fn update_note(&self, raw_id: &str, body: &Value) -> Result<Note, ApiError> {
        let id = parse_note_id(raw_id)?;
        let patch = NotePatch::from_json(body)
            .map_err(|issues| ApiError::Validation { message: INVALID_NOTE_DATA, issues })?;
        match self.store.update_note(id, patch).map_err(unexpected("Failed to update note"))? {
            Some(note) => {
                tracing::info!(note_id = %id, "note updated");
                Ok(note)
            }
            None => {
                tracing::warn!(note_id = %id, "update for unknown note");
                Err(ApiError::NotFound(NOTE_NOT_FOUND))
            }
        }
    }

    /// Delete a note together with its worksheet.
    ///
    /// # Errors
    /// Returns [`ApiError::InvalidId`], [`ApiError::NotFound`], or
    /// [`ApiError::Unexpected`] when the store fails.
    pub fn delete_note(&self, raw_id: &str) -> Result<DeleteConfirmation, ApiError> {
        let id = parse_note_id(raw_id)?;
        if !self.store.delete_note(id).map_err(unexpected("Failed to delete note"))? {
            tracing::warn!(note_id = %id, "delete for unknown note");
            return Err(ApiError::NotFound(NOTE_NOT_FOUND));
        }
        tracing::info!(note_id = %id, "note deleted");
        Ok(DeleteConfirmation { message: "Note deleted successfully".to_string() })
    }

    /// # Errors
    /// Returns [`ApiError::InvalidId`], [`ApiError::NotFound`] when the note has
    /// no worksheet yet, or [`ApiError::Unexpected`] when the store fails.
    pub fn get_scamper(&self, raw_id: &str) -> Result<ScamperData, ApiError> {
        let note_id = parse_note_id(raw_id)?;
        self.store
            .get_scamper_data(note_id)
            .map_err(unexpected("Failed to fetch SCAMPER data"))?
            .ok_or(ApiError::NotFound(SCAMPER_NOT_FOUND))
    }

    /// Resolve the path id of a worksheet write to a note that exists.
    /// Transports call this before reporting an unreadable body so the
    /// not-found answer keeps precedence over the validation answer.
    ///
    /// # Errors
    /// Returns [`ApiError::InvalidId`], [`ApiError::NotFound`], or
    /// [`ApiError::Unexpected`] when the store fails.
    pub fn existing_note_for_scamper(&self, raw_id: &str) -> Result<NoteId, ApiError> {
        let note_id = parse_note_id(raw_id)?;
        if self.store.get_note(note_id).map_err(unexpected(SAVE_SCAMPER_FAILED))?.is_none() {
            return Err(ApiError::NotFound(NOTE_NOT_FOUND));
        }
        Ok(note_id)
    }

    /// Create or merge the worksheet of a note. The note is checked before the
    /// body, so a missing note wins over a malformed body.
    ///
    /// # Errors
    /// Returns [`ApiError::InvalidId`], [`ApiError::NotFound`],
    /// [`ApiError::Validation`], or [`ApiError::Unexpected`] when the store fails.
    pub fn save_scamper(&self, raw_id: &str, body: &Value) -> Result<ScamperData, ApiError> {
        let note_id = self.existing_note_for_scamper(raw_id)?;
        let patch = ScamperPatch::from_json(body)
            .map_err(|issues| ApiError::Validation { message: INVALID_SCAMPER_DATA, issues })?;

        // The store re-checks the note inside its own critical section, which
        // covers a delete racing in between.
        let data = self
            .store
            .upsert_scamper_data(note_id, patch)
            .map_err(unexpected(SAVE_SCAMPER_FAILED))?
            .ok_or(ApiError::NotFound(NOTE_NOT_FOUND))?;
        tracing::info!(
            note_id = %note_id,
            progress = data.fields.completed_count(),
            complete = data.fields.is_complete(),
            "worksheet saved"
        );
        Ok(data)
    }
}
