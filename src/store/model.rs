use diesel::prelude::*;
use tokio::sync::oneshot;

use super::schema::kv_entry;
use crate::{errors::ShiftError, ledger::{Ledger, TaskKey}};

pub type Reply<T> = oneshot::Sender<Result<T, ShiftError>>;

/// Work items for the single-writer store thread.
///
/// Ledger mutation is a store command (not a read + write from the caller)
/// so that concurrent task-entry flows cannot interleave their
/// read-modify-write cycles on the consolidated record.
#[derive(Debug)]
pub enum Command {
    Get {
        key: String,
        reply: Reply<Option<String>>,
    },
    GetMany {
        keys: Vec<String>,
        reply: Reply<Vec<Option<String>>>,
    },
    Set {
        key: String,
        value: String,
        reply: Reply<()>,
    },
    SetMany {
        pairs: Vec<(String, String)>,
        reply: Reply<()>,
    },
    Remove {
        keys: Vec<String>,
        reply: Reply<()>,
    },
    Clear {
        reply: Reply<()>,
    },
    ApplyDeltas {
        deltas: Vec<(TaskKey, i64)>,
        reply: Reply<Vec<i64>>,
    },
    LoadLedger {
        reply: Reply<Ledger>,
    },
    ClearLedger {
        reply: Reply<()>,
    },
}

#[derive(Insertable, Queryable, Selectable, AsChangeset, Debug, Clone)]
#[diesel(table_name = kv_entry)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
}
