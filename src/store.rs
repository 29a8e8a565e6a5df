use rusqlite::{params, Connection, OpenFlags, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{KeyError, StoreError};
use crate::models::{AnnotationPatch, Event, SequencePatch};

const BUSY_TIMEOUT: Duration = Duration::from_secs(60);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS event (
    id INTEGER PRIMARY KEY,
    root_event_id INTEGER,
    user_identifier TEXT NOT NULL,
    creation_date TEXT NOT NULL,
    diff_seconds INTEGER,
    event_source TEXT NOT NULL DEFAULT '',
    event_target TEXT NOT NULL DEFAULT '',
    referrer TEXT NOT NULL DEFAULT '',
    url TEXT NOT NULL DEFAULT '',
    query TEXT,
    fragment_identifier TEXT,
    normalized_referrer TEXT,
    normalized_url TEXT,
    bot_traffic INTEGER NOT NULL DEFAULT 0,
    gap_in_sequence INTEGER NOT NULL DEFAULT 0,
    page_refresh INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_event_user_identifier ON event (user_identifier, creation_date);
CREATE INDEX IF NOT EXISTS idx_event_root_event_id ON event (root_event_id, creation_date);
CREATE TABLE IF NOT EXISTS linear_non_bot_sequences (
    root_event_id INTEGER PRIMARY KEY
);
";

const EVENT_COLUMNS: &str = "id, root_event_id, user_identifier, creation_date, diff_seconds, \
     event_source, event_target, referrer, url, query, fragment_identifier, \
     normalized_referrer, normalized_url, bot_traffic, gap_in_sequence, page_refresh";

/// Where pass 2 takes its root event ids from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceSource {
    /// Every distinct root event id in the event table
    All,
    /// Curated `linear_non_bot_sequences` table
    #[default]
    LinearNonBot,
}

/// Connection descriptor handed to every worker; each opens its own connection
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn open(&self) -> Result<SqliteStore, StoreError> {
        SqliteStore::open(&self.path)
    }
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens an existing database
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if !path.is_file() {
            return Err(StoreError::MissingDatabase(path.to_path_buf()));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::configure(conn)
    }

    /// Opens the database, creating the file if needed
    #[cfg(test)]
    pub fn create(path: &Path) -> Result<Self, StoreError> {
        let store = Self::configure(Connection::open(path)?)?;
        store.ensure_schema()?;
        Ok(store)
    }

    fn configure(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Ok(Self { conn })
    }

    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Users with more than one event; lone events can never form a session
    pub fn user_identifiers_with_multiple_events(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT user_identifier FROM event
             GROUP BY user_identifier HAVING COUNT(*) > 1
             ORDER BY user_identifier",
        )?;
        let users = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(users)
    }

    pub fn root_event_ids(&self, source: SequenceSource) -> Result<Vec<i64>, StoreError> {
        let sql = match source {
            SequenceSource::All => {
                "SELECT DISTINCT root_event_id FROM event
                 WHERE root_event_id IS NOT NULL ORDER BY root_event_id"
            }
            SequenceSource::LinearNonBot => {
                "SELECT root_event_id FROM linear_non_bot_sequences ORDER BY root_event_id"
            }
        };
        let mut stmt = self.conn.prepare(sql)?;
        let roots = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(roots)
    }

    /// Runs `work` inside one transaction.
    ///
    /// The write lock is taken when the transaction begins, so concurrent
    /// workers wait on the busy timeout instead of failing a read-to-write
    /// upgrade against a newer snapshot. Commits when `work` succeeds; any
    /// error drops the transaction, which rolls back every write made for
    /// this key.
    pub fn unit_of_work<T>(
        &mut self,
        work: impl FnOnce(&Connection) -> Result<T, KeyError>,
    ) -> Result<T, KeyError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = work(&*tx)?;
        tx.commit()?;
        Ok(value)
    }

    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn event_from_row(row: &Row) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        root_event_id: row.get(1)?,
        user_identifier: row.get(2)?,
        creation_date: row.get(3)?,
        diff_seconds: row.get(4)?,
        event_source: row.get(5)?,
        event_target: row.get(6)?,
        referrer: row.get(7)?,
        url: row.get(8)?,
        query: row.get(9)?,
        fragment_identifier: row.get(10)?,
        normalized_referrer: row.get(11)?,
        normalized_url: row.get(12)?,
        bot_traffic: row.get(13)?,
        gap_in_sequence: row.get(14)?,
        page_refresh: row.get(15)?,
    })
}

/// All events of one user, oldest first.
///
/// Timestamps are compared as instants, not as text, so differing fractional
/// precision or offsets still sort chronologically.
pub fn fetch_events_by_user(conn: &Connection, user: &str) -> Result<Vec<Event>, StoreError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {EVENT_COLUMNS} FROM event WHERE user_identifier = ?1
         ORDER BY julianday(creation_date) ASC, id ASC"
    ))?;
    let events = stmt
        .query_map(params![user], event_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(events)
}

/// All events of one session, oldest first
pub fn fetch_events_by_root(conn: &Connection, root_event_id: i64) -> Result<Vec<Event>, StoreError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {EVENT_COLUMNS} FROM event WHERE root_event_id = ?1
         ORDER BY julianday(creation_date) ASC, id ASC"
    ))?;
    let events = stmt
        .query_map(params![root_event_id], event_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(events)
}

pub fn apply_sequence_patch(conn: &Connection, patch: &SequencePatch) -> Result<(), StoreError> {
    let changed = conn
        .prepare_cached(
            "UPDATE event SET root_event_id = ?1, diff_seconds = ?2,
             bot_traffic = ?3, gap_in_sequence = ?4 WHERE id = ?5",
        )?
        .execute(params![
            patch.root_event_id,
            patch.diff_seconds,
            patch.bot_traffic,
            patch.gap_in_sequence,
            patch.event_id,
        ])?;
    if changed != 1 {
        return Err(StoreError::MissingEvent(patch.event_id));
    }
    Ok(())
}

pub fn apply_annotation_patch(conn: &Connection, patch: &AnnotationPatch) -> Result<(), StoreError> {
    let changed = conn
        .prepare_cached(
            "UPDATE event SET normalized_url = ?1, normalized_referrer = ?2, page_refresh = ?3,
             query = ?4, fragment_identifier = ?5 WHERE id = ?6",
        )?
        .execute(params![
            patch.normalized_url,
            patch.normalized_referrer,
            patch.page_refresh,
            patch.query,
            patch.fragment_identifier,
            patch.event_id,
        ])?;
    if changed != 1 {
        return Err(StoreError::MissingEvent(patch.event_id));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn insert_event(conn: &Connection, event: &Event) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO event ({EVENT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        ),
        params![
            event.id,
            event.root_event_id,
            event.user_identifier,
            event.creation_date,
            event.diff_seconds,
            event.event_source,
            event.event_target,
            event.referrer,
            event.url,
            event.query,
            event.fragment_identifier,
            event.normalized_referrer,
            event.normalized_url,
            event.bot_traffic,
            event.gap_in_sequence,
            event.page_refresh,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn fetch_event(conn: &Connection, id: i64) -> rusqlite::Result<Event> {
    conn.query_row(
        &format!("SELECT {EVENT_COLUMNS} FROM event WHERE id = ?1"),
        params![id],
        event_from_row,
    )
}
