//! SQLite-backed event index.
//!
//! One table per event type holds the JSON document next to the columns the
//! queries filter on. Debug runs write to a parallel `test_` namespace so
//! they never touch production tables.

use std::path::{Path, PathBuf};

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::error::TransportError;
use crate::event::Event;
use crate::index::{EventIndex, EventQuery, IndexConnector};
use crate::record::{EventId, EventType};

/// Default per-document size limit.
pub const DEFAULT_MAX_DOCUMENT_BYTES: usize = 100 * 1024 * 1024;

/// Table namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexNamespace {
    #[default]
    Production,
    /// `test_events_*` tables used by debug runs.
    Test,
}

impl IndexNamespace {
    #[must_use]
    pub fn from_debug(debug: bool) -> Self {
        if debug { Self::Test } else { Self::Production }
    }

    #[must_use]
    pub fn table(self, event_type: EventType) -> String {
        match self {
            Self::Production => format!("events_{event_type}"),
            Self::Test => format!("test_events_{event_type}"),
        }
    }
}

fn schema_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id TEXT PRIMARY KEY,
            view_ts INTEGER NOT NULL,
            insert_ts INTEGER NOT NULL,
            last_modified_ts INTEGER NOT NULL,
            finished INTEGER NOT NULL,
            has_inference INTEGER NOT NULL,
            doc TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS {table}_view_ts ON {table}(view_ts);
        CREATE INDEX IF NOT EXISTS {table}_modified ON {table}(last_modified_ts);"
    )
}

/// Timestamps are stored as signed integers; clamp instead of wrapping.
fn sql_ts(ts: u64) -> i64 {
    i64::try_from(ts).unwrap_or(i64::MAX)
}

fn decode(doc: &str) -> Result<Event, TransportError> {
    serde_json::from_str(doc).map_err(|e| TransportError::Backend(format!("corrupt document: {e}")))
}

pub struct SqliteEventIndex {
    conn: Connection,
    namespace: IndexNamespace,
    max_document_bytes: usize,
}

impl SqliteEventIndex {
    /// Open or create the index at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        namespace: IndexNamespace,
        max_document_bytes: usize,
    ) -> Result<Self, TransportError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| TransportError::Source {
                    file: parent.display().to_string(),
                    source,
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        for event_type in EventType::ALL {
            conn.execute_batch(&schema_sql(&namespace.table(event_type)))?;
        }
        Ok(Self {
            conn,
            namespace,
            max_document_bytes,
        })
    }

    #[must_use]
    pub fn namespace(&self) -> IndexNamespace {
        self.namespace
    }

    /// Number of stored events of one type.
    pub fn count(&self, event_type: EventType) -> Result<u64, TransportError> {
        let table = self.namespace.table(event_type);
        let n: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

impl EventIndex for SqliteEventIndex {
    fn get(&self, id: EventId) -> Result<Option<Event>, TransportError> {
        let table = self.namespace.table(id.event_type);
        let doc: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT doc FROM {table} WHERE id = ?1"),
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        doc.as_deref().map(decode).transpose()
    }

    fn upsert(&self, event: &Event) -> Result<(), TransportError> {
        let id = event.event_id();
        let doc = serde_json::to_string(event).map_err(|e| TransportError::Backend(e.to_string()))?;
        if doc.len() > self.max_document_bytes {
            return Err(TransportError::Oversize {
                event_id: id.to_string(),
                size: doc.len(),
                limit: self.max_document_bytes,
            });
        }

        let table = self.namespace.table(event.event_type());
        self.conn.execute(
            &format!(
                "INSERT INTO {table} (id, view_ts, insert_ts, last_modified_ts, finished, has_inference, doc)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    view_ts = excluded.view_ts,
                    insert_ts = excluded.insert_ts,
                    last_modified_ts = excluded.last_modified_ts,
                    finished = excluded.finished,
                    has_inference = excluded.has_inference,
                    doc = excluded.doc"
            ),
            params![
                id.to_string(),
                sql_ts(event.view_ts()),
                sql_ts(event.insert_ts()),
                sql_ts(event.last_modified_ts()),
                event.is_finished(),
                event.summary.has_inference(),
                doc
            ],
        )?;
        Ok(())
    }

    fn delete(&self, id: EventId) -> Result<bool, TransportError> {
        let table = self.namespace.table(id.event_type);
        let n = self.conn.execute(
            &format!("DELETE FROM {table} WHERE id = ?1"),
            params![id.to_string()],
        )?;
        Ok(n > 0)
    }

    /// Rows whose document no longer decodes are logged and skipped; the
    /// page is refilled from later rows so a short page still means the
    /// result set is exhausted.
    fn search(
        &self,
        query: &EventQuery,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Event>, TransportError> {
        let table = self.namespace.table(query.event_type);
        // The cursor is always the first bound parameter.
        let mut clauses = vec![
            "view_ts > ?".to_string(),
            "view_ts >= ?".to_string(),
            "view_ts <= ?".to_string(),
        ];
        let mut values = vec![
            Value::Integer(after.map_or(-1, sql_ts)),
            Value::Integer(sql_ts(query.start_ts)),
            Value::Integer(sql_ts(query.end_ts)),
        ];
        let mut push = |clause: &str, value: Value| {
            clauses.push(clause.to_string());
            values.push(value);
        };

        if let Some(t) = query.inserted_before {
            push("insert_ts < ?", Value::Integer(sql_ts(t)));
        }
        if let Some(t) = query.inserted_after {
            push("insert_ts > ?", Value::Integer(sql_ts(t)));
        }
        if let Some(t) = query.modified_before {
            push("last_modified_ts < ?", Value::Integer(sql_ts(t)));
        }
        if let Some(t) = query.modified_after {
            push("last_modified_ts > ?", Value::Integer(sql_ts(t)));
        }
        if let Some(f) = query.finished {
            push("finished = ?", Value::Integer(i64::from(f)));
        }
        if query.missing_inference {
            push("has_inference = ?", Value::Integer(0));
        }

        let tag_set = |n: usize| vec!["?"; n].join(", ");
        if !query.must_tags.is_empty() {
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM json_each(doc, '$.summary.tags') WHERE value IN ({}))",
                tag_set(query.must_tags.len())
            ));
            values.extend(query.must_tags.iter().cloned().map(Value::Text));
        }
        if !query.must_not_tags.is_empty() {
            clauses.push(format!(
                "NOT EXISTS (SELECT 1 FROM json_each(doc, '$.summary.tags') WHERE value IN ({}))",
                tag_set(query.must_not_tags.len())
            ));
            values.extend(query.must_not_tags.iter().cloned().map(Value::Text));
        }

        let sql = format!(
            "SELECT view_ts, id, doc FROM {table} WHERE {} ORDER BY view_ts ASC, id ASC LIMIT ?",
            clauses.join(" AND ")
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut events = Vec::with_capacity(limit.min(1024));
        while events.len() < limit {
            let want = limit - events.len();
            values.push(Value::Integer(i64::try_from(want).unwrap_or(i64::MAX)));
            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            values.pop();

            let fetched = rows.len();
            for (view_ts, id, doc) in rows {
                values[0] = Value::Integer(view_ts);
                match decode(&doc) {
                    Ok(event) => events.push(event),
                    Err(err) => {
                        tracing::warn!(table = %table, event_id = %id, error = %err, "undecodable document skipped");
                    }
                }
            }
            if fetched < want {
                break;
            }
        }
        Ok(events)
    }
}

/// Opens one [`SqliteEventIndex`] per call against the same database file.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    pub path: PathBuf,
    pub namespace: IndexNamespace,
    pub max_document_bytes: usize,
}

impl IndexConnector for SqliteConnector {
    type Index = SqliteEventIndex;

    fn connect(&self) -> Result<Self::Index, TransportError> {
        SqliteEventIndex::open(&self.path, self.namespace, self.max_document_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TAG_RECURRING;
    use crate::record::{Position, PrefixEventRecord, RecordDetails};

    fn event(view_ts: u64, finished: bool) -> Event {
        let record = |position| PrefixEventRecord {
            view_ts,
            position,
            details: RecordDetails::Moas {
                prefix: "192.0.2.0/24".to_string(),
                origins: [64500, 64501].into_iter().collect(),
                old_origins: [64500].into_iter().collect(),
                aspaths: vec![vec![1, 64500], vec![2, 64501]],
            },
        };
        let mut event = Event::from_record(record(Position::New));
        if finished {
            event.push_record(record(Position::Finished)).unwrap();
        }
        event
    }

    fn open_index(dir: &tempfile::TempDir, ns: IndexNamespace) -> SqliteEventIndex {
        SqliteEventIndex::open(dir.path().join("events.db"), ns, DEFAULT_MAX_DOCUMENT_BYTES)
            .unwrap()
    }

    #[test]
    fn upsert_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(&dir, IndexNamespace::Production);
        let e = event(100, true);
        index.upsert(&e).unwrap();
        index.upsert(&e).unwrap();
        assert_eq!(index.count(EventType::Moas).unwrap(), 1);
        assert_eq!(index.get(e.event_id()).unwrap().unwrap(), e);
        assert!(index.delete(e.event_id()).unwrap());
        assert!(index.get(e.event_id()).unwrap().is_none());
    }

    #[test]
    fn search_pages_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(&dir, IndexNamespace::Production);
        for ts in 1..=5u64 {
            let mut e = event(ts * 100, ts % 2 == 1);
            if ts == 3 {
                e.summary.add_tag(TAG_RECURRING);
            }
            index.upsert(&e).unwrap();
        }

        let all = EventQuery::range(EventType::Moas, 0, u64::MAX);
        let page = index.search(&all, None, 2).unwrap();
        assert_eq!(page.iter().map(Event::view_ts).collect::<Vec<_>>(), vec![100, 200]);
        let page = index.search(&all, Some(200), 2).unwrap();
        assert_eq!(page.iter().map(Event::view_ts).collect::<Vec<_>>(), vec![300, 400]);

        let open = all.clone().unfinished();
        let tses: Vec<u64> = index.search(&open, None, 10).unwrap().iter().map(Event::view_ts).collect();
        assert_eq!(tses, vec![200, 400]);

        let mut not_recurring = all.clone();
        not_recurring.must_not_tags = vec![TAG_RECURRING.to_string()];
        assert_eq!(index.search(&not_recurring, None, 10).unwrap().len(), 4);

        let mut recurring = all;
        recurring.must_tags = vec![TAG_RECURRING.to_string(), "other".to_string()];
        let hits = index.search(&recurring, None, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].view_ts(), 300);
    }

    fn insert_raw(index: &SqliteEventIndex, view_ts: i64, doc: &str) {
        index
            .conn
            .execute(
                "INSERT INTO events_moas (id, view_ts, insert_ts, last_modified_ts, finished, has_inference, doc)
                 VALUES (?1, ?2, 0, 0, 0, 0, ?3)",
                params![format!("moas-{view_ts}"), view_ts, doc],
            )
            .unwrap();
    }

    #[test]
    fn search_skips_undecodable_rows_and_keeps_paging() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(&dir, IndexNamespace::Production);
        for ts in [100u64, 300, 400] {
            index.upsert(&event(ts, false)).unwrap();
        }
        insert_raw(&index, 200, "{broken");

        let all = EventQuery::range(EventType::Moas, 0, u64::MAX);
        let page = index.search(&all, None, 2).unwrap();
        assert_eq!(page.iter().map(Event::view_ts).collect::<Vec<_>>(), vec![100, 300]);
        let page = index.search(&all, Some(300), 2).unwrap();
        assert_eq!(page.iter().map(Event::view_ts).collect::<Vec<_>>(), vec![400]);

        let open = index.search(&all.unfinished(), None, 10).unwrap();
        assert_eq!(open.len(), 3);
    }

    #[test]
    fn oversize_documents_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let index = SqliteEventIndex::open(dir.path().join("e.db"), IndexNamespace::Production, 32)
            .unwrap();
        let err = index.upsert(&event(1, false)).unwrap_err();
        assert!(matches!(err, TransportError::Oversize { limit: 32, .. }));
        assert_eq!(index.count(EventType::Moas).unwrap(), 0);
    }

    #[test]
    fn debug_namespace_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let prod = open_index(&dir, IndexNamespace::Production);
        let test = open_index(&dir, IndexNamespace::from_debug(true));
        test.upsert(&event(1, false)).unwrap();
        assert_eq!(test.count(EventType::Moas).unwrap(), 1);
        assert_eq!(prod.count(EventType::Moas).unwrap(), 0);
        assert_eq!(IndexNamespace::Test.table(EventType::Edges), "test_events_edges");
    }

    #[test]
    fn connector_opens_shared_database() {
        let dir = tempfile::tempdir().unwrap();
        let connector = SqliteConnector {
            path: dir.path().join("nested/events.db"),
            namespace: IndexNamespace::Production,
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
        };
        let a = connector.connect().unwrap();
        let b = connector.connect().unwrap();
        a.upsert(&event(7, false)).unwrap();
        assert!(b.get(event(7, false).event_id()).unwrap().is_some());
    }
}
