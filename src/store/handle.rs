use diesel::{Connection, RunQueryDsl, SqliteConnection, prelude::*};

use crate::{
    errors::ShiftError,
    ledger::{self, Ledger, TaskKey},
    session::keys,
    store::{
        model::KvEntry,
        schema::kv_entry,
    },
};

pub(super) fn get(conn: &mut SqliteConnection, key: &str) -> Result<Option<String>, ShiftError> {
    kv_entry::table
        .find(key)
        .select(kv_entry::value)
        .first::<String>(conn)
        .optional()
        .map_err(|e| ShiftError::storage(format!("get {key}: {e}")))
}

pub(super) fn get_many(
    conn: &mut SqliteConnection,
    keys: &[String],
) -> Result<Vec<Option<String>>, ShiftError> {
    keys.iter().map(|key| get(conn, key)).collect()
}

pub(super) fn set(conn: &mut SqliteConnection, key: &str, value: &str) -> Result<(), ShiftError> {
    upsert(
        conn,
        &KvEntry {
            key: key.to_string(),
            value: value.to_string(),
        },
    )
}

pub(super) fn set_many(
    conn: &mut SqliteConnection,
    pairs: &[(String, String)],
) -> Result<(), ShiftError> {
    conn.transaction(|conn| {
        for (key, value) in pairs {
            set(conn, key, value)?;
        }
        Ok(())
    })
}

pub(super) fn remove(conn: &mut SqliteConnection, keys: &[String]) -> Result<(), ShiftError> {
    diesel::delete(kv_entry::table.filter(kv_entry::key.eq_any(keys)))
        .execute(conn)
        .map_err(|e| ShiftError::storage(format!("remove {} keys: {e}", keys.len())))?;
    Ok(())
}

pub(super) fn clear(conn: &mut SqliteConnection) -> Result<(), ShiftError> {
    diesel::delete(kv_entry::table)
        .execute(conn)
        .map_err(|e| ShiftError::storage(format!("clear store: {e}")))?;
    Ok(())
}

/// Merges a batch of deltas into the consolidated ledger record and mirrors
/// the new counts to the individual task keys.
///
/// Runs in one transaction: either the whole batch lands (record and
/// mirrors) or nothing does.
pub(super) fn apply_deltas(
    conn: &mut SqliteConnection,
    deltas: &[(TaskKey, i64)],
) -> Result<Vec<i64>, ShiftError> {
    conn.transaction(|conn| {
        let mut tasks = load_ledger(conn)?;
        let mut new_counts = Vec::with_capacity(deltas.len());
        for (key, delta) in deltas {
            let count = ledger::merge_delta(&mut tasks, key, *delta);
            set(conn, &key.storage_key(), &count.to_string())?;
            new_counts.push(count);
        }
        set(conn, keys::TASKS, &ledger::serialize(&tasks)?)?;
        Ok(new_counts)
    })
}

pub(super) fn load_ledger(conn: &mut SqliteConnection) -> Result<Ledger, ShiftError> {
    let raw = get(conn, keys::TASKS)?;
    ledger::deserialize(raw.as_deref())
}

/// Drops the consolidated record and every individual task key it mentions.
pub(super) fn clear_ledger(conn: &mut SqliteConnection) -> Result<(), ShiftError> {
    conn.transaction(|conn| {
        let tasks = load_ledger(conn)?;
        let mut doomed: Vec<String> = tasks.into_keys().collect();
        doomed.push(keys::TASKS.to_string());
        remove(conn, &doomed)
    })
}

fn upsert(conn: &mut SqliteConnection, entry: &KvEntry) -> Result<(), ShiftError> {
    diesel::insert_into(kv_entry::table)
        .values(entry)
        .on_conflict(kv_entry::key)
        .do_update()
        .set(kv_entry::value.eq(&entry.value))
        .execute(conn)
        .map_err(|e| ShiftError::storage(format!("set {}: {e}", entry.key)))?;
    Ok(())
}
