//! Ledger Store keeping every ledger in one local SQLite file.
//!
//! The connection is owned by a dedicated thread and all operations
//! are messages to it, processed one at a time in arrival order. That
//! gives append ordering for free and means append callbacks run on
//! that thread, never on the caller's.

use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use super::*;
use crate::config::SqliteStoreConfig;

type Reply<T> = oneshot::Sender<Result<T, LedgerError>>;

enum Request {
    Create {
        options: LedgerOptions,
        reply: Reply<LedgerHandle>,
    },
    Open {
        id: LedgerId,
        digest: DigestType,
        password: String,
        reply: Reply<LedgerHandle>,
    },
    Append {
        ledger: LedgerHandle,
        payload: Vec<u8>,
        callback: AppendCallback,
    },
    LastConfirmed {
        ledger: LedgerId,
        reply: Reply<Option<EntryId>>,
    },
    Read {
        ledger: LedgerHandle,
        from: EntryId,
        to: EntryId,
        reply: Reply<Vec<Vec<u8>>>,
    },
    Close {
        ledger: LedgerId,
        reply: Reply<()>,
    },
}

/// Ledger Store backed by [SQLite](https://sqlite.org/index.html).
///
/// The DB file and tables are created if there is no previous data.
/// Ledger ids are never reused, even across restarts.
#[derive(Debug, Clone)]
pub struct SqliteLedgerStore {
    tx: mpsc::UnboundedSender<Request>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Create { .. } => "Create",
            Self::Open { .. } => "Open",
            Self::Append { .. } => "Append",
            Self::LastConfirmed { .. } => "LastConfirmed",
            Self::Read { .. } => "Read",
            Self::Close { .. } => "Close",
        };
        f.write_str(name)
    }
}

// The `'static` lifetime within [`Migrations`] is saying that the
// [`str`]s composing the migrations are `'static`.
fn get_migrations() -> &'static Migrations<'static> {
    static MIGRATIONS: OnceLock<Migrations<'static>> = OnceLock::new();
    MIGRATIONS.get_or_init(|| {
        Migrations::new(vec![
            M::up(
                "CREATE TABLE ledgers ( \
                 created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 ledger_id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 ensemble_size INTEGER NOT NULL CHECK (ensemble_size > 0), \
                 quorum_size INTEGER NOT NULL CHECK (quorum_size > 0), \
                 password_hash INTEGER NOT NULL, \
                 closed INTEGER NOT NULL DEFAULT 0, \
                 CHECK (quorum_size <= ensemble_size) \
                 ) STRICT",
            ),
            M::up(
                "CREATE TABLE entries ( \
                 created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 ledger_id INTEGER NOT NULL REFERENCES ledgers (ledger_id), \
                 entry_id INTEGER NOT NULL CHECK (entry_id >= 0), \
                 payload BLOB NOT NULL, \
                 digest INTEGER, \
                 PRIMARY KEY (ledger_id, entry_id) \
                 ) STRICT",
            ),
        ])
    })
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// Setup our connection-level pragmas.
fn setup_conn(conn: &mut Connection) -> Result<(), LedgerError> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // These are recommended by Litestream.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    get_migrations().to_latest(conn)?;
    Ok(())
}

impl SqliteLedgerStore {
    pub fn new(config: &SqliteStoreConfig) -> Result<Self, LedgerError> {
        Self::open(&config.db_file)
    }

    pub fn open(db_file: &Path) -> Result<Self, LedgerError> {
        tracing::debug!("Opening SQLite ledger store at {db_file:?}");
        let mut conn = Connection::open_with_flags(
            db_file,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        setup_conn(&mut conn)?;

        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name(String::from("ledgerlog-sqlite"))
            .spawn(move || serve(conn, rx))?;

        Ok(Self { tx })
    }

    async fn call<T>(
        &self,
        request: Request,
        rx: oneshot::Receiver<Result<T, LedgerError>>,
    ) -> Result<T, LedgerError> {
        self.tx.send(request).map_err(|_| LedgerError::Shutdown)?;
        rx.await.map_err(|_| LedgerError::Shutdown)?
    }
}

fn serve(mut conn: Connection, mut rx: mpsc::UnboundedReceiver<Request>) {
    while let Some(request) = rx.blocking_recv() {
        tracing::trace!("SQLite ledger store handling {request:?}");
        match request {
            Request::Create { options, reply } => {
                let _ = reply.send(create(&conn, &options));
            }
            Request::Open {
                id,
                digest,
                password,
                reply,
            } => {
                let _ = reply.send(open(&conn, id, digest, &password));
            }
            Request::Append {
                ledger,
                payload,
                callback,
            } => callback(append(&mut conn, &ledger, payload)),
            Request::LastConfirmed { ledger, reply } => {
                let _ = reply.send(last_confirmed(&conn, ledger));
            }
            Request::Read {
                ledger,
                from,
                to,
                reply,
            } => {
                let _ = reply.send(read(&conn, &ledger, from, to));
            }
            Request::Close { ledger, reply } => {
                let _ = reply.send(close(&conn, ledger));
            }
        }
    }
    tracing::debug!("SQLite ledger store shut down");
}

fn create(conn: &Connection, options: &LedgerOptions) -> Result<LedgerHandle, LedgerError> {
    conn.execute(
        "INSERT INTO ledgers (ensemble_size, quorum_size, password_hash) \
         VALUES (?1, ?2, ?3)",
        (
            options.ensemble_size,
            options.quorum_size,
            password_hash(&options.password) as i64,
        ),
    )?;
    let id = LedgerId(conn.last_insert_rowid() as u64);
    Ok(LedgerHandle::new(
        id,
        true,
        options.digest,
        &options.password,
    ))
}

/// `(password_hash, closed)` of a ledger.
fn ledger_row(conn: &Connection, id: LedgerId) -> Result<(u64, bool), LedgerError> {
    conn.query_row(
        "SELECT password_hash, closed FROM ledgers WHERE ledger_id = ?1",
        (id.0 as i64,),
        |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? != 0)),
    )
    .optional()?
    .ok_or(LedgerError::NoSuchLedger(id))
}

fn open(
    conn: &Connection,
    id: LedgerId,
    digest: DigestType,
    password: &str,
) -> Result<LedgerHandle, LedgerError> {
    let (stored_hash, _closed) = ledger_row(conn, id)?;
    if stored_hash != password_hash(password) {
        return Err(LedgerError::Unauthorized(id));
    }
    Ok(LedgerHandle::new(id, false, digest, password))
}

fn append(
    conn: &mut Connection,
    ledger: &LedgerHandle,
    payload: Vec<u8>,
) -> Result<EntryId, LedgerError> {
    let id = ledger.id();
    if !ledger.is_writable() {
        return Err(LedgerError::ReadOnly(id));
    }

    let txn = conn.transaction()?;
    let (_hash, closed) = ledger_row(&txn, id)?;
    if closed {
        return Err(LedgerError::Closed(id));
    }
    let next: i64 = txn.query_row(
        "SELECT COALESCE(MAX(entry_id) + 1, 0) FROM entries WHERE ledger_id = ?1",
        (id.0 as i64,),
        |row| row.get(0),
    )?;
    let entry = EntryId(next as u64);
    let digest = ledger.digest_of(entry, &payload).map(|digest| digest as i64);
    txn.execute(
        "INSERT INTO entries (ledger_id, entry_id, payload, digest) \
         VALUES (?1, ?2, ?3, ?4)",
        (id.0 as i64, next, payload, digest),
    )?;
    txn.commit()?;
    Ok(entry)
}

fn last_confirmed(conn: &Connection, id: LedgerId) -> Result<Option<EntryId>, LedgerError> {
    ledger_row(conn, id)?;
    let last: Option<i64> = conn.query_row(
        "SELECT MAX(entry_id) FROM entries WHERE ledger_id = ?1",
        (id.0 as i64,),
        |row| row.get(0),
    )?;
    Ok(last.map(|last| EntryId(last as u64)))
}

fn read(
    conn: &Connection,
    ledger: &LedgerHandle,
    from: EntryId,
    to: EntryId,
) -> Result<Vec<Vec<u8>>, LedgerError> {
    let id = ledger.id();
    check_range(id, from, to, last_confirmed(conn, id)?)?;

    let mut stmt = conn.prepare(
        "SELECT entry_id, payload, digest \
         FROM entries \
         WHERE ledger_id = ?1 AND entry_id BETWEEN ?2 AND ?3 \
         ORDER BY entry_id ASC",
    )?;
    let rows = stmt.query_map((id.0 as i64, from.0 as i64, to.0 as i64), |row| {
        Ok((
            EntryId(row.get::<_, i64>(0)? as u64),
            row.get::<_, Vec<u8>>(1)?,
            row.get::<_, Option<i64>>(2)?.map(|digest| digest as u64),
        ))
    })?;

    let mut payloads = Vec::new();
    for row in rows {
        let (entry, payload, digest) = row?;
        ledger.verify(entry, &payload, digest)?;
        payloads.push(payload);
    }
    Ok(payloads)
}

fn close(conn: &Connection, id: LedgerId) -> Result<(), LedgerError> {
    let updated = conn.execute(
        "UPDATE ledgers SET closed = 1 WHERE ledger_id = ?1",
        (id.0 as i64,),
    )?;
    if updated == 0 {
        return Err(LedgerError::NoSuchLedger(id));
    }
    Ok(())
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn create_ledger(&self, options: &LedgerOptions) -> Result<LedgerHandle, LedgerError> {
        let (reply, rx) = oneshot::channel();
        let options = options.clone();
        self.call(Request::Create { options, reply }, rx).await
    }

    async fn open_ledger(
        &self,
        id: LedgerId,
        digest: DigestType,
        password: &str,
    ) -> Result<LedgerHandle, LedgerError> {
        let (reply, rx) = oneshot::channel();
        let password = password.to_owned();
        self.call(
            Request::Open {
                id,
                digest,
                password,
                reply,
            },
            rx,
        )
        .await
    }

    fn async_append(&self, ledger: &LedgerHandle, payload: Vec<u8>, callback: AppendCallback) {
        let request = Request::Append {
            ledger: ledger.clone(),
            payload,
            callback,
        };
        if let Err(mpsc::error::SendError(Request::Append { callback, .. })) = self.tx.send(request)
        {
            callback(Err(LedgerError::Shutdown));
        }
    }

    async fn last_confirmed(&self, ledger: &LedgerHandle) -> Result<Option<EntryId>, LedgerError> {
        let (reply, rx) = oneshot::channel();
        let ledger = ledger.id();
        self.call(Request::LastConfirmed { ledger, reply }, rx).await
    }

    async fn read_entries(
        &self,
        ledger: &LedgerHandle,
        from: EntryId,
        to: EntryId,
    ) -> Result<Vec<Vec<u8>>, LedgerError> {
        let (reply, rx) = oneshot::channel();
        let ledger = ledger.clone();
        self.call(
            Request::Read {
                ledger,
                from,
                to,
                reply,
            },
            rx,
        )
        .await
    }

    async fn close_ledger(&self, ledger: &LedgerHandle) -> Result<(), LedgerError> {
        let (reply, rx) = oneshot::channel();
        let ledger = ledger.id();
        self.call(Request::Close { ledger, reply }, rx).await
    }
}
