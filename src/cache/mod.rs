use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::oneshot;

mod migrations;
pub mod snapshot;

pub use snapshot::{
    restore, CacheDiscard, CacheWindows, Restored, Snapshot, SNAPSHOT_SCHEMA_VERSION,
};

use migrations::run_migrations;

const SNAPSHOT_KEY: &str = "scan";

type CacheTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum CacheCommand {
    Execute(CacheTask),
    Shutdown,
}

struct CacheInner {
    sender: mpsc::Sender<CacheCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(CacheCommand::Shutdown) {
                error!("Failed to send shutdown to cache thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join cache thread: {join_err:?}");
            }
        }
    }
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid datetime '{value}': {err}"))
}

/// SQLite-backed snapshot store. All access goes through one worker thread
/// that owns the connection.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<CacheInner>,
    path: Arc<PathBuf>,
}

impl CacheStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create cache directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<CacheCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = path.clone();

        let worker = thread::Builder::new()
            .name("nearcast-cache".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open cache database")));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run cache migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("Cache initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        CacheCommand::Execute(task) => task(&mut conn),
                        CacheCommand::Shutdown => break,
                    }
                }

                info!("Cache thread shutting down");
            })
            .context("failed to spawn cache worker thread")?;

        ready_rx
            .recv()
            .context("cache worker exited before signaling readiness")??;

        info!("Cache opened at {}", path.display());

        Ok(Self {
            inner: Arc::new(CacheInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            path: Arc::new(path),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = CacheCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("Cache caller dropped before receiving result");
            }
        }));

        self.inner
            .sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to cache thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("cache thread terminated unexpectedly"))?
    }

    pub async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO cache_snapshot (key, schema_version, scan_start_ms, records, saved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(key) DO UPDATE SET
                     schema_version = excluded.schema_version,
                     scan_start_ms = excluded.scan_start_ms,
                     records = excluded.records,
                     saved_at = excluded.saved_at",
                params![
                    SNAPSHOT_KEY,
                    snapshot.schema_version,
                    snapshot.scan_start_ms,
                    snapshot.records,
                    snapshot.saved_at.to_rfc3339(),
                ],
            )
            .context("failed to save cache snapshot")?;
            Ok(())
        })
        .await
    }

    pub async fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        self.execute(|conn| {
            let row = conn
                .query_row(
                    "SELECT schema_version, scan_start_ms, records, saved_at
                     FROM cache_snapshot
                     WHERE key = ?1",
                    params![SNAPSHOT_KEY],
                    |row| {
                        Ok((
                            row.get::<_, u32>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()
                .context("failed to read cache snapshot")?;

            row.map(|(schema_version, scan_start_ms, records, saved_at)| {
                Ok(Snapshot {
                    schema_version,
                    scan_start_ms,
                    records,
                    saved_at: parse_datetime(&saved_at)?,
                })
            })
            .transpose()
        })
        .await
    }

    pub async fn clear(&self) -> Result<()> {
        self.execute(|conn| {
            conn.execute("DELETE FROM cache_snapshot", [])
                .context("failed to clear cache")?;
            Ok(())
        })
        .await
    }
}
