use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// Number of prompts on a SCAMPER worksheet.
pub const SCAMPER_FIELD_COUNT: u8 = 7;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("store lock poisoned by a panicked operation")]
    Poisoned,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("invalid identifier `{0}`: expected a non-negative decimal integer")]
pub struct ParseIdError(pub String);

fn parse_decimal_id(raw: &str) -> Result<u64, ParseIdError> {
    if raw.is_empty() || !raw.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(ParseIdError(raw.to_string()));
    }
    raw.parse::<u64>().map_err(|_| ParseIdError(raw.to_string()))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NoteId(pub u64);

impl Display for NoteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NoteId {
    type Err = ParseIdError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        parse_decimal_id(raw).map(Self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ScamperId(pub u64);

impl Display for ScamperId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: NoteId,
    pub title: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Fields accepted when a note is created. Missing values are empty strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NewNote {
    pub title: String,
    pub content: String,
}

/// Partial note update. Only present fields are written.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl NotePatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.content.is_none()
    }

    /// Merge the present fields into `note`. `id` and `created_at` are never touched.
    pub fn merge_into(self, note: &mut Note) {
        if let Some(title) = self.title {
            note.title = title;
        }
        if let Some(content) = self.content {
            note.content = content;
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ScamperField {
    Substitute,
    Combine,
    Adapt,
    Modify,
    PutToOtherUse,
    Eliminate,
    Reverse,
}

impl ScamperField {
    pub const ALL: [Self; 7] = [
        Self::Substitute,
        Self::Combine,
        Self::Adapt,
        Self::Modify,
        Self::PutToOtherUse,
        Self::Eliminate,
        Self::Reverse,
    ];

    /// JSON key used on the wire.
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Self::Substitute => "substitute",
            Self::Combine => "combine",
            Self::Adapt => "adapt",
            Self::Modify => "modify",
            Self::PutToOtherUse => "putToOtherUse",
            Self::Eliminate => "eliminate",
            Self::Reverse => "reverse",
        }
    }

    /// Column name in relational backends.
    #[must_use]
    pub fn column(self) -> &'static str {
        match self {
            Self::PutToOtherUse => "put_to_other_use",
            other => other.key(),
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Substitute => "Substitute",
            Self::Combine => "Combine",
            Self::Adapt => "Adapt",
            Self::Modify => "Modify",
            Self::PutToOtherUse => "Put to Other Use",
            Self::Eliminate => "Eliminate",
            Self::Reverse => "Reverse",
        }
    }

    /// Question shown to the user while they fill in the worksheet.
    #[must_use]
    pub fn prompt(self) -> &'static str {
        match self {
            Self::Substitute => "What could be replaced with something else?",
            Self::Combine => "What could be combined with what?",
            Self::Adapt => "What could be adapted from another field?",
            Self::Modify => "What could be changed or modified?",
            Self::PutToOtherUse => "Could it be put to another use?",
            Self::Eliminate => "What could be removed?",
            Self::Reverse => "Could the order be reversed or the roles swapped?",
        }
    }
}

/// The seven worksheet answers. Never null once persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ScamperFields {
    pub substitute: String,
    pub combine: String,
    pub adapt: String,
    pub modify: String,
    pub put_to_other_use: String,
    pub eliminate: String,
    pub reverse: String,
}

impl ScamperFields {
    #[must_use]
    pub fn get(&self, field: ScamperField) -> &str {
        match field {
            ScamperField::Substitute => &self.substitute,
            ScamperField::Combine => &self.combine,
            ScamperField::Adapt => &self.adapt,
            ScamperField::Modify => &self.modify,
            ScamperField::PutToOtherUse => &self.put_to_other_use,
            ScamperField::Eliminate => &self.eliminate,
            ScamperField::Reverse => &self.reverse,
        }
    }

    pub fn set(&mut self, field: ScamperField, value: String) {
        let slot = match field {
            ScamperField::Substitute => &mut self.substitute,
            ScamperField::Combine => &mut self.combine,
            ScamperField::Adapt => &mut self.adapt,
            ScamperField::Modify => &mut self.modify,
            ScamperField::PutToOtherUse => &mut self.put_to_other_use,
            ScamperField::Eliminate => &mut self.eliminate,
            ScamperField::Reverse => &mut self.reverse,
        };
        *slot = value;
    }

    /// Count of answers with non-whitespace content. Editors call this on
    /// unsaved drafts; stored records go through [`scamper_progress`].
    #[must_use]
    pub fn completed_count(&self) -> u8 {
        let mut completed = 0;
        for field in ScamperField::ALL {
            if !is_blank(self.get(field)) {
                completed += 1;
            }
        }
        completed
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed_count() == SCAMPER_FIELD_COUNT
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScamperData {
    pub id: ScamperId,
    pub note_id: NoteId,
    #[serde(flatten)]
    pub fields: ScamperFields,
}

/// Partial worksheet write, merged over whatever is already stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScamperPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substitute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modify: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub put_to_other_use: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eliminate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse: Option<String>,
}

impl ScamperPatch {
    fn slot_mut(&mut self, field: ScamperField) -> &mut Option<String> {
        match field {
            ScamperField::Substitute => &mut self.substitute,
            ScamperField::Combine => &mut self.combine,
            ScamperField::Adapt => &mut self.adapt,
            ScamperField::Modify => &mut self.modify,
            ScamperField::PutToOtherUse => &mut self.put_to_other_use,
            ScamperField::Eliminate => &mut self.eliminate,
            ScamperField::Reverse => &mut self.reverse,
        }
    }

    #[must_use]
    pub fn get(&self, field: ScamperField) -> Option<&str> {
        match field {
            ScamperField::Substitute => self.substitute.as_deref(),
            ScamperField::Combine => self.combine.as_deref(),
            ScamperField::Adapt => self.adapt.as_deref(),
            ScamperField::Modify => self.modify.as_deref(),
            ScamperField::PutToOtherUse => self.put_to_other_use.as_deref(),
            ScamperField::Eliminate => self.eliminate.as_deref(),
            ScamperField::Reverse => self.reverse.as_deref(),
        }
    }

    pub fn set(&mut self, field: ScamperField, value: Option<String>) {
        *self.slot_mut(field) = value;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        ScamperField::ALL.into_iter().all(|field| self.get(field).is_none())
    }

    /// Merge the present answers into `fields`; absent answers keep their prior value.
    pub fn merge_into(mut self, fields: &mut ScamperFields) {
        for field in ScamperField::ALL {
            if let Some(value) = self.slot_mut(field).take() {
                fields.set(field, value);
            }
        }
    }

    /// Materialize a fresh worksheet, filling absent answers with empty strings.
    #[must_use]
    pub fn into_fields(self) -> ScamperFields {
        let mut fields = ScamperFields::default();
        self.merge_into(&mut fields);
        fields
    }
}

/// Whitespace as web clients trim it: ECMAScript `WhiteSpace` plus
/// `LineTerminator`. U+FEFF is blank here; U+0085 is not.
#[must_use]
pub fn is_blank(answer: &str) -> bool {
    answer.chars().all(|c| {
        matches!(
            c,
            '\u{0009}'
                | '\u{000A}'
                | '\u{000B}'
                | '\u{000C}'
                | '\u{000D}'
                | '\u{0020}'
                | '\u{00A0}'
                | '\u{1680}'
                | '\u{2000}'..='\u{200A}'
                | '\u{2028}'
                | '\u{2029}'
                | '\u{202F}'
                | '\u{205F}'
                | '\u{3000}'
                | '\u{FEFF}'
        )
    })
}

/// Progress of a stored worksheet: how many of the seven answers are filled.
/// A note without a worksheet has progress 0.
#[must_use]
pub fn scamper_progress(scamper: Option<&ScamperData>) -> u8 {
    scamper.map_or(0, |data| data.fields.completed_count())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NoteWithScamper {
    #[serde(flatten)]
    pub note: Note,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scamper: Option<ScamperData>,
    pub scamper_progress: u8,
}

impl NoteWithScamper {
    #[must_use]
    pub fn compose(note: Note, scamper: Option<ScamperData>) -> Self {
        let scamper_progress = scamper_progress(scamper.as_ref());
        Self { note, scamper, scamper_progress }
    }
}

/// Newest first. Notes stamped in the same instant fall back to id, higher first.
pub fn sort_newest_first(notes: &mut [NoteWithScamper]) {
    notes.sort_by(|a, b| {
        b.note
            .created_at
            .cmp(&a.note.created_at)
            .then_with(|| b.note.id.cmp(&a.note.id))
    });
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationIssue {
    pub code: String,
    pub path: Vec<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<String>,
}

impl ValidationIssue {
    /// Issue for a body that could not be read as JSON at all.
    #[must_use]
    pub fn invalid_json(detail: impl Into<String>) -> Self {
        Self {
            code: "invalid_json".to_string(),
            path: Vec::new(),
            message: detail.into(),
            expected: None,
            received: None,
        }
    }

    fn invalid_type(path: &[&str], expected: &str, received: &Value) -> Self {
        let received = json_type_name(received);
        Self {
            code: "invalid_type".to_string(),
            path: path.iter().map(|segment| (*segment).to_string()).collect(),
            message: format!("Expected {expected}, received {received}"),
            expected: Some(expected.to_string()),
            received: Some(received.to_string()),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn body_object(body: &Value) -> Result<&Map<String, Value>, Vec<ValidationIssue>> {
    body.as_object().ok_or_else(|| vec![ValidationIssue::invalid_type(&[], "object", body)])
}

fn optional_string(
    body: &Map<String, Value>,
    key: &str,
    nullable: bool,
    issues: &mut Vec<ValidationIssue>,
) -> Option<String> {
    match body.get(key) {
        None => None,
        Some(Value::Null) if nullable => None,
        Some(Value::String(value)) => Some(value.clone()),
        Some(other) => {
            issues.push(ValidationIssue::invalid_type(&[key], "string", other));
            None
        }
    }
}

fn note_fields(body: &Value) -> Result<NotePatch, Vec<ValidationIssue>> {
    let body = body_object(body)?;
    let mut issues = Vec::new();
    let title = optional_string(body, "title", false, &mut issues);
    let content = optional_string(body, "content", false, &mut issues);
    if issues.is_empty() {
        Ok(NotePatch { title, content })
    } else {
        Err(issues)
    }
}

impl NewNote {
    /// Validate a raw create body.
    ///
    /// # Errors
    /// Returns every field-level issue when the body is not an object or a
    /// known field is not a string.
    pub fn from_json(body: &Value) -> Result<Self, Vec<ValidationIssue>> {
        let patch = note_fields(body)?;
        Ok(Self { title: patch.title.unwrap_or_default(), content: patch.content.unwrap_or_default() })
    }
}

impl NotePatch {
    /// Validate a raw partial-update body.
    ///
    /// # Errors
    /// Returns every field-level issue when the body is not an object or a
    /// known field is not a string.
    pub fn from_json(body: &Value) -> Result<Self, Vec<ValidationIssue>> {
        note_fields(body)
    }
}

impl ScamperPatch {
    /// Validate a raw worksheet body. `null` answers count as absent and
    /// `noteId`/`id` keys are ignored.
    ///
    /// # Errors
    /// Returns every field-level issue when the body is not an object or an
    /// answer is neither a string nor `null`.
    pub fn from_json(body: &Value) -> Result<Self, Vec<ValidationIssue>> {
        let body = body_object(body)?;
        let mut issues = Vec::new();
        let mut patch = Self::default();
        for field in ScamperField::ALL {
            patch.set(field, optional_string(body, field.key(), true, &mut issues));
        }
        if issues.is_empty() {
            Ok(patch)
        } else {
            Err(issues)
        }
    }
}

/// Source of `created_at` stamps.
pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

#[must_use]
pub fn system_clock() -> Clock {
    Arc::new(OffsetDateTime::now_utc)
}

/// Persistence contract shared by every backend.
///
/// Lookups that miss return `Ok(None)` or `Ok(false)`; `Err` is reserved for
/// backend failures, which are never retried.
pub trait NoteStore: Send + Sync {
    /// All notes joined with their worksheet, newest first.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be read.
    fn list_notes(&self) -> Result<Vec<NoteWithScamper>, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be read.
    fn get_note(&self, id: NoteId) -> Result<Option<NoteWithScamper>, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be written.
    fn create_note(&self, fields: NewNote) -> Result<Note, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be written.
    fn update_note(&self, id: NoteId, patch: NotePatch) -> Result<Option<Note>, StoreError>;

    /// Delete a note and its worksheet together. Returns whether a note existed.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be written.
    fn delete_note(&self, id: NoteId) -> Result<bool, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be read.
    fn get_scamper_data(&self, note_id: NoteId) -> Result<Option<ScamperData>, StoreError>;

    /// Create the worksheet for `note_id` or merge into the existing one.
    /// Returns `Ok(None)` without writing when the note does not exist.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be written.
    fn upsert_scamper_data(
        &self,
        note_id: NoteId,
        patch: ScamperPatch,
    ) -> Result<Option<ScamperData>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    notes: BTreeMap<NoteId, Note>,
    scamper: BTreeMap<ScamperId, ScamperData>,
    scamper_by_note: BTreeMap<NoteId, ScamperId>,
    last_note_id: u64,
    last_scamper_id: u64,
}

impl MemoryState {
    fn next_note_id(&mut self) -> Result<NoteId, StoreError> {
        self.last_note_id = self
            .last_note_id
            .checked_add(1)
            .ok_or_else(|| StoreError::Backend("note id space exhausted".to_string()))?;
        Ok(NoteId(self.last_note_id))
    }

    fn next_scamper_id(&mut self) -> Result<ScamperId, StoreError> {
        self.last_scamper_id = self
            .last_scamper_id
            .checked_add(1)
            .ok_or_else(|| StoreError::Backend("scamper id space exhausted".to_string()))?;
        Ok(ScamperId(self.last_scamper_id))
    }

    fn scamper_for(&self, note_id: NoteId) -> Option<&ScamperData> {
        self.scamper_by_note.get(&note_id).and_then(|scamper_id| self.scamper.get(scamper_id))
    }

    fn joined(&self, note: &Note) -> NoteWithScamper {
        NoteWithScamper::compose(note.clone(), self.scamper_for(note.id).cloned())
    }
}

/// Process-local backend. One mutex covers both collections, so every
/// operation is a single critical section.
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    clock: Clock,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish_non_exhaustive()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    #[must_use]
    pub fn with_clock(clock: Clock) -> Self {
        Self { state: Mutex::new(MemoryState::default()), clock }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl NoteStore for InMemoryStore {
    fn list_notes(&self) -> Result<Vec<NoteWithScamper>, StoreError> {
        let state = self.lock()?;
        let mut notes = state.notes.values().map(|note| state.joined(note)).collect::<Vec<_>>();
        sort_newest_first(&mut notes);
        Ok(notes)
    }

    fn get_note(&self, id: NoteId) -> Result<Option<NoteWithScamper>, StoreError> {
        let state = self.lock()?;
        Ok(state.notes.get(&id).map(|note| state.joined(note)))
    }

    fn create_note(&self, fields: NewNote) -> Result<Note, StoreError> {
        let mut state = self.lock()?;
        let note = Note {
            id: state.next_note_id()?,
            title: fields.title,
            content: fields.content,
            created_at: (self.clock)(),
        };
        state.notes.insert(note.id, note.clone());
        tracing::debug!(note_id = %note.id, "created note");
        Ok(note)
    }

    fn update_note(&self, id: NoteId, patch: NotePatch) -> Result<Option<Note>, StoreError> {
        let mut state = self.lock()?;
        let Some(note) = state.notes.get_mut(&id) else {
            return Ok(None);
        };
        patch.merge_into(note);
        Ok(Some(note.clone()))
    }

    fn delete_note(&self, id: NoteId) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        if state.notes.remove(&id).is_none() {
            return Ok(false);
        }
        if let Some(scamper_id) = state.scamper_by_note.remove(&id) {
            state.scamper.remove(&scamper_id);
        }
        tracing::debug!(note_id = %id, "deleted note and its worksheet");
        Ok(true)
    }

    fn get_scamper_data(&self, note_id: NoteId) -> Result<Option<ScamperData>, StoreError> {
        let state = self.lock()?;
        Ok(state.scamper_for(note_id).cloned())
    }

    fn upsert_scamper_data(
        &self,
        note_id: NoteId,
        patch: ScamperPatch,
    ) -> Result<Option<ScamperData>, StoreError> {
        let mut state = self.lock()?;
        if !state.notes.contains_key(&note_id) {
            return Ok(None);
        }

        if let Some(scamper_id) = state.scamper_by_note.get(&note_id).copied() {
            if let Some(existing) = state.scamper.get_mut(&scamper_id) {
                patch.merge_into(&mut existing.fields);
                return Ok(Some(existing.clone()));
            }
        }

        let data = ScamperData { id: state.next_scamper_id()?, note_id, fields: patch.into_fields() };
        state.scamper_by_note.insert(note_id, data.id);
        state.scamper.insert(data.id, data.clone());
        Ok(Some(data))
    }
}
