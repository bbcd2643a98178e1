use std::path::{Path, PathBuf};

use color_eyre::{
    Result,
    eyre::{WrapErr, eyre},
};
use diesel::{Connection, SqliteConnection};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use tokio::{
    runtime::Builder,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::LocalSet,
};
use tracing::{debug, error, info};

mod handle;
pub mod model;
mod schema;

use crate::{
    errors::ShiftError,
    ledger::{Ledger, TaskKey},
};
use model::Command;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Client handle to the session store.
///
/// All reads and writes are forwarded to a dedicated store thread that owns
/// the sqlite connection, so every mutation is serialized no matter how many
/// clones of this handle exist. Constructed once at startup and injected
/// into whatever needs persistence.
#[derive(Clone)]
pub struct SessionStore {
    cmd_tx: UnboundedSender<Command>,
}

impl SessionStore {
    /// Spawns the store thread for the database at `db_path` and returns a
    /// handle to it. The thread shuts down once every handle is dropped.
    pub fn launch(db_path: &Path) -> Result<(Self, std::thread::JoinHandle<()>)> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let worker = StoreWorker {
            conn: prepare_connection(db_path)?,
            cmd_rx,
        };
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime to build in store thread");
        let join = std::thread::Builder::new()
            .name("store".into())
            .spawn(move || {
                let local = LocalSet::new();
                local.spawn_local(worker.run());
                runtime.block_on(local);
            })?;
        Ok((Self { cmd_tx }, join))
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, ShiftError> {
        self.request(|reply| Command::Get {
            key: key.to_string(),
            reply,
        })
        .await
    }

    pub async fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<String>>, ShiftError> {
        self.request(|reply| Command::GetMany {
            keys: keys.iter().map(|k| (*k).to_string()).collect(),
            reply,
        })
        .await
    }

    pub async fn set(&self, key: &str, value: impl Into<String>) -> Result<(), ShiftError> {
        self.request(|reply| Command::Set {
            key: key.to_string(),
            value: value.into(),
            reply,
        })
        .await
    }

    pub async fn set_many(&self, pairs: Vec<(String, String)>) -> Result<(), ShiftError> {
        self.request(|reply| Command::SetMany { pairs, reply }).await
    }

    pub async fn remove(&self, keys: &[&str]) -> Result<(), ShiftError> {
        self.request(|reply| Command::Remove {
            keys: keys.iter().map(|k| (*k).to_string()).collect(),
            reply,
        })
        .await
    }

    pub async fn clear(&self) -> Result<(), ShiftError> {
        self.request(|reply| Command::Clear { reply }).await
    }

    /// Applies a batch of task deltas atomically and returns the new count
    /// per input key, in order.
    pub async fn apply_deltas(
        &self,
        deltas: Vec<(TaskKey, i64)>,
    ) -> Result<Vec<i64>, ShiftError> {
        self.request(|reply| Command::ApplyDeltas { deltas, reply })
            .await
    }

    pub async fn apply_delta(&self, key: TaskKey, delta: i64) -> Result<i64, ShiftError> {
        let counts = self.apply_deltas(vec![(key, delta)]).await?;
        counts
            .into_iter()
            .next()
            .ok_or_else(|| ShiftError::storage("empty reply for single delta"))
    }

    pub async fn load_ledger(&self) -> Result<Ledger, ShiftError> {
        self.request(|reply| Command::LoadLedger { reply }).await
    }

    pub async fn clear_ledger(&self) -> Result<(), ShiftError> {
        self.request(|reply| Command::ClearLedger { reply }).await
    }

    async fn request<T>(
        &self,
        make_cmd: impl FnOnce(model::Reply<T>) -> Command,
    ) -> Result<T, ShiftError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make_cmd(reply_tx))
            .map_err(|_| ShiftError::storage("store thread is gone"))?;
        reply_rx
            .await
            .map_err(|_| ShiftError::storage("store thread dropped the request"))?
    }
}

fn prepare_connection(db_path: &Path) -> Result<SqliteConnection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("creating data dir {}", parent.display()))?;
    }
    let db_url: PathBuf = db_path.to_path_buf();
    let db_url = db_url.to_str().expect("path to convert to string");
    let mut conn = SqliteConnection::establish(db_url)
        .wrap_err_with(|| format!("connecting to sqlite {db_url}"))?;

    debug!("Running any pending migrations now.");
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(migrations_run) => {
            for migration in migrations_run {
                info!("Schema migration run: {}", migration);
            }
        }
        Err(e) => Err(eyre!(e)).wrap_err_with(|| "running sqlite migrations")?,
    }
    Ok(conn)
}

struct StoreWorker {
    conn: SqliteConnection,
    cmd_rx: UnboundedReceiver<Command>,
}

impl StoreWorker {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            debug!("Store command: {cmd:?}");
            self.handle(cmd);
        }
        debug!("All store handles dropped, store thread shutting down.");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Get { key, reply } => {
                Self::respond(reply, handle::get(&mut self.conn, &key));
            }
            Command::GetMany { keys, reply } => {
                Self::respond(reply, handle::get_many(&mut self.conn, &keys));
            }
            Command::Set { key, value, reply } => {
                Self::respond(reply, handle::set(&mut self.conn, &key, &value));
            }
            Command::SetMany { pairs, reply } => {
                Self::respond(reply, handle::set_many(&mut self.conn, &pairs));
            }
            Command::Remove { keys, reply } => {
                Self::respond(reply, handle::remove(&mut self.conn, &keys));
            }
            Command::Clear { reply } => {
                Self::respond(reply, handle::clear(&mut self.conn));
            }
            Command::ApplyDeltas { deltas, reply } => {
                Self::respond(reply, handle::apply_deltas(&mut self.conn, &deltas));
            }
            Command::LoadLedger { reply } => {
                Self::respond(reply, handle::load_ledger(&mut self.conn));
            }
            Command::ClearLedger { reply } => {
                Self::respond(reply, handle::clear_ledger(&mut self.conn));
            }
        }
    }

    fn respond<T>(reply: model::Reply<T>, result: Result<T, ShiftError>) {
        if let Err(err) = &result {
            error!("Error handling store command: {err}");
        }
        if reply.send(result).is_err() {
            debug!("Store client went away before the reply was ready");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::session::keys;

    fn launch_temp() -> (SessionStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let (store, _join) = SessionStore::launch(&dir.path().join("test.sqlite")).unwrap();
        (store, dir)
    }

    fn key(s: &str) -> TaskKey {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn set_get_remove_round_trip() {
        let (store, _dir) = launch_temp();
        assert_eq!(store.get("USERNAME").await.unwrap(), None);

        store.set("USERNAME", "joao").await.unwrap();
        store.set("CITY", "Faro").await.unwrap();
        assert_eq!(store.get("USERNAME").await.unwrap().as_deref(), Some("joao"));

        let many = store.get_many(&["USERNAME", "CITY", "missing"]).await.unwrap();
        assert_eq!(
            many,
            vec![Some("joao".to_string()), Some("Faro".to_string()), None]
        );

        store.remove(&["USERNAME"]).await.unwrap();
        assert_eq!(store.get("USERNAME").await.unwrap(), None);
        assert_eq!(store.get("CITY").await.unwrap().as_deref(), Some("Faro"));
    }

    #[tokio::test]
    async fn set_overwrites_existing_value() {
        let (store, _dir) = launch_temp();
        store.set("kmInicial", "100").await.unwrap();
        store.set("kmInicial", "250").await.unwrap();
        assert_eq!(store.get("kmInicial").await.unwrap().as_deref(), Some("250"));
    }

    #[tokio::test]
    async fn deltas_accumulate_and_clamp_through_the_store() {
        let (store, _dir) = launch_temp();
        assert_eq!(
            store.apply_delta(key("lime_collectTroti"), 3).await.unwrap(),
            3
        );
        assert_eq!(
            store.apply_delta(key("lime_collectTroti"), -1).await.unwrap(),
            2
        );
        assert_eq!(
            store.apply_delta(key("lime_collectTroti"), -10).await.unwrap(),
            0
        );

        // Mirrored individual key tracks the consolidated record.
        assert_eq!(
            store.get("lime_collectTroti").await.unwrap().as_deref(),
            Some("0")
        );
    }

    #[tokio::test]
    async fn interleaved_writers_lose_no_updates() {
        let (store, _dir) = launch_temp();
        let mut joins = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            joins.push(tokio::spawn(async move {
                store.apply_delta(key("bolt_swap"), 1).await.unwrap();
                store.apply_delta(key("bird_collect"), 2).await.unwrap();
            }));
        }
        for join in joins {
            join.await.unwrap();
        }
        let ledger = store.load_ledger().await.unwrap();
        assert_eq!(ledger["bolt_swap"], 10);
        assert_eq!(ledger["bird_collect"], 20);
    }

    #[tokio::test]
    async fn clear_ledger_removes_consolidated_and_mirrored_keys() {
        let (store, _dir) = launch_temp();
        store.set("USERNAME", "ana").await.unwrap();
        store.apply_delta(key("link_deploy"), 4).await.unwrap();

        store.clear_ledger().await.unwrap();
        assert!(store.load_ledger().await.unwrap().is_empty());
        assert_eq!(store.get(keys::TASKS).await.unwrap(), None);
        assert_eq!(store.get("link_deploy").await.unwrap(), None);
        // Non-ledger keys survive a ledger clear.
        assert_eq!(store.get("USERNAME").await.unwrap().as_deref(), Some("ana"));
    }

    #[tokio::test]
    async fn store_survives_relaunch() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("test.sqlite");
        {
            let (store, _join) = SessionStore::launch(&db).unwrap();
            store.set("startTime", "1700000000000").await.unwrap();
        }
        let (store, _join) = SessionStore::launch(&db).unwrap();
        assert_eq!(
            store.get("startTime").await.unwrap().as_deref(),
            Some("1700000000000")
        );
    }
}
