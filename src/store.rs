use crate::statement::{ImpressionStatement, SubjectRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create store parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
    #[error("invalid params payload in row {id}: {source}")]
    ParamsDecode {
        id: i64,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode params for insert: {source}")]
    ParamsEncode {
        #[source]
        source: serde_json::Error,
    },
}

/// A persisted impression. Immutable once created; this subsystem has
/// no update or delete operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedImpression {
    pub id: i64,
    pub recorded_at: i64,
    pub statement: ImpressionStatement,
}

/// Exact-match conjunction over named columns. A `None` value matches
/// SQL NULL.
pub type FieldFilter = [(&'static str, Option<String>)];

/// Synchronous, queryable persistence backend. One implementation is
/// selected at process start; the uniqueness lookup only ever runs
/// against this interface.
pub trait DurableStore {
    fn insert(&self, statement: &ImpressionStatement) -> Result<RecordedImpression, StoreError>;

    /// All recorded impressions matching the filter, oldest first.
    fn find_matching(&self, filter: &FieldFilter) -> Result<Vec<RecordedImpression>, StoreError>;

    /// Existence check restricted to one subject's own recordings.
    fn exists_for_subject(
        &self,
        subject: &SubjectRef,
        filter: &FieldFilter,
    ) -> Result<bool, StoreError>;

    fn count(&self) -> Result<u64, StoreError>;
}

const SELECT_COLUMNS: &str = "id, subject_type, subject_id, actor_context, actor_id, \
     request_fingerprint, session_fingerprint, source_address, referrer, message, params, \
     recorded_at";

pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let store = Self {
            db_path: db_path.to_path_buf(),
        };

        // Fail fast if the database cannot be opened.
        let _ = store.connect()?;
        Ok(store)
    }

    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS impressions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    subject_type TEXT,
                    subject_id TEXT,
                    actor_context TEXT NOT NULL,
                    actor_id TEXT,
                    request_fingerprint TEXT NOT NULL,
                    session_fingerprint TEXT NOT NULL,
                    source_address TEXT NOT NULL,
                    referrer TEXT,
                    message TEXT,
                    params TEXT NOT NULL,
                    recorded_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_impressions_subject
                    ON impressions(subject_type, subject_id);
                CREATE INDEX IF NOT EXISTS idx_impressions_request
                    ON impressions(request_fingerprint);
                CREATE INDEX IF NOT EXISTS idx_impressions_session
                    ON impressions(session_fingerprint);
                ",
            )
            .map_err(|source| StoreError::Sql { source })?;
        Ok(())
    }

    pub fn table_names(&self) -> Result<Vec<String>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare(
                "
                SELECT name FROM sqlite_master
                WHERE type = 'table'
                ORDER BY name ASC
                ",
            )
            .map_err(|source| StoreError::Sql { source })?;

        let rows = statement
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|source| StoreError::Sql { source })?;

        let mut names = Vec::new();
        for row in rows {
            names.push(row.map_err(|source| StoreError::Sql { source })?);
        }
        Ok(names)
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let connection =
            Connection::open(&self.db_path).map_err(|source| StoreError::Open {
                path: self.db_path.display().to_string(),
                source,
            })?;
        connection
            .execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|source| StoreError::Sql { source })?;
        Ok(connection)
    }
}

fn compile_filter(filter: &FieldFilter) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut values = Vec::new();
    for (column, value) in filter {
        match value {
            Some(value) => {
                clauses.push(format!("{column} = ?"));
                values.push(value.clone());
            }
            None => clauses.push(format!("{column} IS NULL")),
        }
    }
    (clauses.join(" AND "), values)
}

fn row_to_recorded(row: &rusqlite::Row<'_>) -> Result<(RecordedImpression, String), rusqlite::Error> {
    let subject_type: Option<String> = row.get(1)?;
    let subject_id: Option<String> = row.get(2)?;
    let subject = match (subject_type, subject_id) {
        (Some(subject_type), Some(subject_id)) => Some(SubjectRef {
            subject_type,
            subject_id,
        }),
        _ => None,
    };
    let raw_params: String = row.get(10)?;
    let recorded = RecordedImpression {
        id: row.get(0)?,
        recorded_at: row.get(11)?,
        statement: ImpressionStatement {
            subject,
            actor_context: row.get(3)?,
            actor_id: row.get(4)?,
            request_fingerprint: row.get(5)?,
            session_fingerprint: row.get(6)?,
            source_address: row.get(7)?,
            referrer: row.get(8)?,
            message: row.get(9)?,
            params: BTreeMap::new(),
        },
    };
    Ok((recorded, raw_params))
}

impl DurableStore for SqliteStore {
    fn insert(&self, statement: &ImpressionStatement) -> Result<RecordedImpression, StoreError> {
        let connection = self.connect()?;
        // BTreeMap keys are sorted, so the stored JSON is canonical.
        let raw_params = serde_json::to_string(&statement.params)
            .map_err(|source| StoreError::ParamsEncode { source })?;
        let recorded_at = chrono::Utc::now().timestamp();

        connection
            .execute(
                "
                INSERT INTO impressions (
                    subject_type, subject_id, actor_context, actor_id,
                    request_fingerprint, session_fingerprint, source_address,
                    referrer, message, params, recorded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ",
                params![
                    statement.subject.as_ref().map(|s| s.subject_type.as_str()),
                    statement.subject.as_ref().map(|s| s.subject_id.as_str()),
                    statement.actor_context,
                    statement.actor_id,
                    statement.request_fingerprint,
                    statement.session_fingerprint,
                    statement.source_address,
                    statement.referrer,
                    statement.message,
                    raw_params,
                    recorded_at,
                ],
            )
            .map_err(|source| StoreError::Sql { source })?;

        let id = connection.last_insert_rowid();
        Ok(RecordedImpression {
            id,
            recorded_at,
            statement: statement.clone(),
        })
    }

    fn find_matching(&self, filter: &FieldFilter) -> Result<Vec<RecordedImpression>, StoreError> {
        let connection = self.connect()?;
        let (clause, values) = compile_filter(filter);
        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM impressions");
        if !clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }
        sql.push_str(" ORDER BY id ASC");

        let mut statement = connection
            .prepare(&sql)
            .map_err(|source| StoreError::Sql { source })?;
        let rows = statement
            .query_map(params_from_iter(values.iter()), row_to_recorded)
            .map_err(|source| StoreError::Sql { source })?;

        let mut out = Vec::new();
        for row in rows {
            let (mut recorded, raw_params) =
                row.map_err(|source| StoreError::Sql { source })?;
            recorded.statement.params = serde_json::from_str(&raw_params).map_err(|source| {
                StoreError::ParamsDecode {
                    id: recorded.id,
                    source,
                }
            })?;
            out.push(recorded);
        }
        Ok(out)
    }

    fn exists_for_subject(
        &self,
        subject: &SubjectRef,
        filter: &FieldFilter,
    ) -> Result<bool, StoreError> {
        let connection = self.connect()?;
        let (clause, values) = compile_filter(filter);
        let mut sql = String::from(
            "SELECT 1 FROM impressions WHERE subject_type = ? AND subject_id = ?",
        );
        if !clause.is_empty() {
            sql.push_str(" AND ");
            sql.push_str(&clause);
        }
        sql.push_str(" LIMIT 1");

        let mut all_values = vec![subject.subject_type.clone(), subject.subject_id.clone()];
        all_values.extend(values);

        let exists = connection
            .query_row(&sql, params_from_iter(all_values.iter()), |row| {
                row.get::<_, i64>(0)
            })
            .optional()
            .map_err(|source| StoreError::Sql { source })?
            .is_some();
        Ok(exists)
    }

    fn count(&self) -> Result<u64, StoreError> {
        let connection = self.connect()?;
        let count: i64 = connection
            .query_row("SELECT COUNT(*) FROM impressions", [], |row| row.get(0))
            .map_err(|source| StoreError::Sql { source })?;
        Ok(count as u64)
    }
}
