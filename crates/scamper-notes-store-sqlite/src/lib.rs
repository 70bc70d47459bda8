use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use scamper_notes_core::{
    sort_newest_first, system_clock, Clock, NewNote, Note, NoteId, NotePatch, NoteStore,
    NoteWithScamper, ScamperData, ScamperField, ScamperFields, ScamperId, ScamperPatch,
    StoreError,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS notes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  title TEXT NOT NULL DEFAULT '',
  content TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS scamper_data (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  note_id INTEGER NOT NULL,
  substitute TEXT NOT NULL DEFAULT '',
  combine TEXT NOT NULL DEFAULT '',
  adapt TEXT NOT NULL DEFAULT '',
  modify TEXT NOT NULL DEFAULT '',
  put_to_other_use TEXT NOT NULL DEFAULT '',
  eliminate TEXT NOT NULL DEFAULT '',
  reverse TEXT NOT NULL DEFAULT '',
  FOREIGN KEY (note_id) REFERENCES notes(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_notes_created_at ON notes(created_at);
CREATE INDEX IF NOT EXISTS idx_scamper_data_note_id ON scamper_data(note_id);
";

// v1 allowed several worksheets per note. Keep the oldest one, which is the
// row every lookup already returned, then make the rule a constraint.
const MIGRATION_002_SQL: &str = r"
DELETE FROM scamper_data
WHERE note_id NOT IN (SELECT id FROM notes);

DELETE FROM scamper_data
WHERE id NOT IN (SELECT MIN(id) FROM scamper_data GROUP BY note_id);

DROP INDEX IF EXISTS idx_scamper_data_note_id;
CREATE UNIQUE INDEX IF NOT EXISTS idx_scamper_data_note_id ON scamper_data(note_id);
";

const SCAMPER_COLUMNS: &str =
    "substitute, combine, adapt, modify, put_to_other_use, eliminate, reverse";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// `SQLite` backend. All statements run on one connection behind a mutex and
/// every write is a single transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    clock: Clock,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

struct JoinedRow {
    note_id: i64,
    title: String,
    content: String,
    created_at: String,
    scamper_id: Option<i64>,
    fields: ScamperFields,
}

impl SqliteStore {
    /// Open a SQLite-backed note store and configure required runtime pragmas.
    /// The schema is left as found; call [`SqliteStore::migrate`] before use.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::configure(conn)
    }

    /// Open a database file and bring its schema up to date.
    ///
    /// # Errors
    /// Returns an error when opening or migrating fails.
    pub fn open_migrated(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Private, migrated in-memory database.
    ///
    /// # Errors
    /// Returns an error when the database cannot be created or migrated.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        let store = Self::configure(conn)?;
        store.migrate()?;
        Ok(store)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Mutex::new(conn), clock: system_clock() })
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }

    fn with_conn<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        op(&mut conn).map_err(|err| StoreError::Backend(format!("{err:#}")))
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let conn = self.lock()?;
        schema_status(&conn)
    }

    /// Apply all forward migrations up to the latest supported schema version.
    /// Returns the versions that were applied.
    ///
    /// # Errors
    /// Returns an error when any migration step fails; the failing step is rolled back.
    pub fn migrate(&self) -> Result<Vec<i64>> {
        let mut conn = self.lock()?;
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut applied = Vec::new();
        let mut version = current_schema_version(&conn)?;

        if version < 1 {
            apply_migration(&mut conn, 1, MIGRATION_001_SQL)?;
            applied.push(1);
            version = 1;
        }

        if version < 2 {
            apply_migration(&mut conn, 2, MIGRATION_002_SQL)?;
            applied.push(2);
            version = 2;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        if !applied.is_empty() {
            tracing::info!(?applied, "applied sqlite migrations");
        }
        Ok(applied)
    }

    /// Run `SQLite` integrity probes, including orphaned worksheet rows.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let conn = self.lock()?;
        let quick_check_message: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }
        drop(stmt);

        let schema_status = schema_status(&conn)?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

impl NoteStore for SqliteStore {
    fn list_notes(&self) -> Result<Vec<NoteWithScamper>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT n.id, n.title, n.content, n.created_at, s.id, {}
                 FROM notes n LEFT JOIN scamper_data s ON s.note_id = n.id",
                prefixed_scamper_columns("s")
            ))?;
            let rows = stmt.query_map([], read_joined_row)?;

            let mut notes = Vec::new();
            for row in rows {
                notes.push(joined_from_row(row?)?);
            }
            sort_newest_first(&mut notes);
            Ok(notes)
        })
    }

    fn get_note(&self, id: NoteId) -> Result<Option<NoteWithScamper>, StoreError> {
        if !storable(id.0) {
            return Ok(None);
        }
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT n.id, n.title, n.content, n.created_at, s.id, {}
                         FROM notes n LEFT JOIN scamper_data s ON s.note_id = n.id
                         WHERE n.id = ?1",
                        prefixed_scamper_columns("s")
                    ),
                    params![to_sql_id(id.0)?],
                    read_joined_row,
                )
                .optional()
                .context("failed to load note")?;
            row.map(joined_from_row).transpose()
        })
    }

    fn create_note(&self, fields: NewNote) -> Result<Note, StoreError> {
        let created_at = (self.clock)();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notes(title, content, created_at) VALUES (?1, ?2, ?3)",
                params![fields.title, fields.content, rfc3339(created_at)?],
            )
            .context("failed to insert note")?;
            let id = NoteId(from_sql_id(conn.last_insert_rowid())?);
            tracing::debug!(note_id = %id, "created note");
            Ok(Note { id, title: fields.title, content: fields.content, created_at })
        })
    }

    fn update_note(&self, id: NoteId, patch: NotePatch) -> Result<Option<Note>, StoreError> {
        if !storable(id.0) {
            return Ok(None);
        }
        self.with_conn(|conn| {
            let tx = conn.transaction().context("failed to start transaction")?;
            let Some(mut note) = load_note(&tx, id)? else {
                return Ok(None);
            };
            if patch.is_empty() {
                return Ok(Some(note));
            }
            patch.merge_into(&mut note);
            tx.execute(
                "UPDATE notes SET title = ?1, content = ?2 WHERE id = ?3",
                params![note.title, note.content, to_sql_id(id.0)?],
            )
            .context("failed to update note")?;
            tx.commit().context("failed to commit note update")?;
            Ok(Some(note))
        })
    }

    fn delete_note(&self, id: NoteId) -> Result<bool, StoreError> {
        if !storable(id.0) {
            return Ok(false);
        }
        self.with_conn(|conn| {
            let sql_id = to_sql_id(id.0)?;
            let tx = conn.transaction().context("failed to start transaction")?;
            tx.execute("DELETE FROM scamper_data WHERE note_id = ?1", params![sql_id])
                .context("failed to delete scamper data")?;
            let deleted = tx
                .execute("DELETE FROM notes WHERE id = ?1", params![sql_id])
                .context("failed to delete note")?;
            tx.commit().context("failed to commit note deletion")?;
            if deleted > 0 {
                tracing::debug!(note_id = %id, "deleted note and its worksheet");
            }
            Ok(deleted > 0)
        })
    }

    fn get_scamper_data(&self, note_id: NoteId) -> Result<Option<ScamperData>, StoreError> {
        if !storable(note_id.0) {
            return Ok(None);
        }
        self.with_conn(|conn| load_scamper(conn, note_id))
    }

    fn upsert_scamper_data(
        &self,
        note_id: NoteId,
        patch: ScamperPatch,
    ) -> Result<Option<ScamperData>, StoreError> {
        if !storable(note_id.0) {
            return Ok(None);
        }
        self.with_conn(|conn| {
            let sql_note_id = to_sql_id(note_id.0)?;
            let tx = conn.transaction().context("failed to start transaction")?;
            let note_exists = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM notes WHERE id = ?1)",
                    params![sql_note_id],
                    |row| row.get::<_, i64>(0),
                )
                .context("failed to check note existence")?;
            if note_exists == 0 {
                return Ok(None);
            }

            let data = if let Some(mut existing) = load_scamper(&tx, note_id)? {
                if patch.is_empty() {
                    return Ok(Some(existing));
                }
                patch.merge_into(&mut existing.fields);
                let f = &existing.fields;
                tx.execute(
                    "UPDATE scamper_data SET
                        substitute = ?1, combine = ?2, adapt = ?3, modify = ?4,
                        put_to_other_use = ?5, eliminate = ?6, reverse = ?7
                     WHERE id = ?8",
                    params![
                        f.substitute,
                        f.combine,
                        f.adapt,
                        f.modify,
                        f.put_to_other_use,
                        f.eliminate,
                        f.reverse,
                        to_sql_id(existing.id.0)?,
                    ],
                )
                .context("failed to update scamper data")?;
                existing
            } else {
                let fields = patch.into_fields();
                tx.execute(
                    &format!(
                        "INSERT INTO scamper_data(note_id, {SCAMPER_COLUMNS})
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                    ),
                    params![
                        sql_note_id,
                        fields.substitute,
                        fields.combine,
                        fields.adapt,
                        fields.modify,
                        fields.put_to_other_use,
                        fields.eliminate,
                        fields.reverse,
                    ],
                )
                .context("failed to insert scamper data")?;
                let id = ScamperId(from_sql_id(tx.last_insert_rowid())?);
                ScamperData { id, note_id, fields }
            };

            tx.commit().context("failed to commit scamper upsert")?;
            Ok(Some(data))
        })
    }
}

fn apply_migration(conn: &mut Connection, version: i64, sql: &str) -> Result<()> {
    let tx = conn
        .transaction()
        .with_context(|| format!("failed to start migration v{version} transaction"))?;
    tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
    record_schema_version(&tx, version)?;
    tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
    Ok(())
}

fn prefixed_scamper_columns(alias: &str) -> String {
    ScamperField::ALL
        .into_iter()
        .map(|field| format!("{alias}.{}", field.column()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn read_fields(row: &Row<'_>, offset: usize) -> rusqlite::Result<ScamperFields> {
    let mut fields = ScamperFields::default();
    for (index, field) in ScamperField::ALL.into_iter().enumerate() {
        let value: Option<String> = row.get(offset + index)?;
        fields.set(field, value.unwrap_or_default());
    }
    Ok(fields)
}

fn read_joined_row(row: &Row<'_>) -> rusqlite::Result<JoinedRow> {
    Ok(JoinedRow {
        note_id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        created_at: row.get(3)?,
        scamper_id: row.get(4)?,
        fields: read_fields(row, 5)?,
    })
}

fn joined_from_row(row: JoinedRow) -> Result<NoteWithScamper> {
    let note = Note {
        id: NoteId(from_sql_id(row.note_id)?),
        title: row.title,
        content: row.content,
        created_at: parse_rfc3339(&row.created_at)?,
    };
    let scamper = row
        .scamper_id
        .map(|raw| -> Result<ScamperData> {
            Ok(ScamperData { id: ScamperId(from_sql_id(raw)?), note_id: note.id, fields: row.fields })
        })
        .transpose()?;
    Ok(NoteWithScamper::compose(note, scamper))
}

fn load_note(tx: &Transaction<'_>, id: NoteId) -> Result<Option<Note>> {
    let row = tx
        .query_row(
            "SELECT title, content, created_at FROM notes WHERE id = ?1",
            params![to_sql_id(id.0)?],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
        )
        .optional()
        .context("failed to load note")?;

    row.map(|(title, content, created_at)| {
        Ok(Note { id, title, content, created_at: parse_rfc3339(&created_at)? })
    })
    .transpose()
}

fn load_scamper(conn: &Connection, note_id: NoteId) -> Result<Option<ScamperData>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT id, {SCAMPER_COLUMNS} FROM scamper_data
                 WHERE note_id = ?1 ORDER BY id ASC LIMIT 1"
            ),
            params![to_sql_id(note_id.0)?],
            |row| Ok((row.get::<_, i64>(0)?, read_fields(row, 1)?)),
        )
        .optional()
        .context("failed to load scamper data")?;

    row.map(|(id, fields)| Ok(ScamperData { id: ScamperId(from_sql_id(id)?), note_id, fields }))
        .transpose()
}

fn schema_status(conn: &Connection) -> Result<SchemaStatus> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;
    let current_version = current_schema_version(conn)?;
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

/// Ids beyond the `SQLite` integer range can never have been assigned.
fn storable(id: u64) -> bool {
    i64::try_from(id).is_ok()
}

fn to_sql_id(id: u64) -> Result<i64> {
    i64::try_from(id).map_err(|_| anyhow!("identifier {id} exceeds sqlite integer range"))
}

fn from_sql_id(id: i64) -> Result<u64> {
    u64::try_from(id).map_err(|_| anyhow!("negative identifier {id} in sqlite row"))
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
