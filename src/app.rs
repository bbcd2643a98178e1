use color_eyre::{Result, eyre::eyre};
use itertools::Itertools;

use crate::{
    cli::{Cli, Command},
    close::{CloseForm, PhotoAngle},
    config::{Config, get_data_dir},
    errors::ShiftError,
    ledger::{self, TaskKey},
    session::{self, Identity},
    shift::{ShiftManager, ShiftState, now_ms},
    store::SessionStore,
    sync::{Gateway, SheetsGateway},
};

pub async fn run(cli: Cli) -> Result<()> {
    let (store, _join) = SessionStore::launch(&get_data_dir().join("fieldshift.sqlite"))?;
    let gateway = SheetsGateway::new(Config::get())?;
    let position = cli.position();

    match cli.command {
        Command::Login { username, password } => {
            let identity = session::login(&store, &gateway, &username, &password).await?;
            println!("Logged in as {} ({}, {})", identity.username, identity.city, identity.user_type);
        }
        Command::Logout => {
            session::logout(&store).await?;
            println!("Session cleared.");
        }
        Command::Vehicles => {
            for vehicle in gateway.fetch_vehicles().await? {
                println!("{vehicle}");
            }
        }
        command => {
            let identity = Identity::load(&store)
                .await?
                .ok_or_else(|| eyre!("not logged in, run `fieldshift login` first"))?;
            let mut mgr = ShiftManager::resume(store, gateway, identity).await?;
            run_shift_command(&mut mgr, position, command).await?;
        }
    }
    Ok(())
}

async fn run_shift_command<G: Gateway>(
    mgr: &mut ShiftManager<G>,
    position: Option<crate::sync::Position>,
    command: Command,
) -> Result<()> {
    match command {
        Command::Start { odometer, vehicle } => {
            let outcome = mgr.start_shift(odometer, vehicle, position, now_ms()).await?;
            println!("Shift started.");
            report_audit(outcome.audit_error);
        }
        Command::Warehouse => {
            let outcome = mgr.toggle_warehouse(position, now_ms()).await?;
            if outcome.value {
                println!("Warehouse exit recorded. Bom trabalho!");
            } else {
                println!("Warehouse entry recorded. Bem-vindo de volta!");
            }
            report_audit(outcome.audit_error);
        }
        Command::Task { entries } => {
            let deltas = entries
                .iter()
                .map(|entry| parse_task_entry(entry))
                .try_collect::<_, Vec<_>, _>()?;
            let keys: Vec<TaskKey> = deltas.iter().map(|(key, _)| key.clone()).collect();
            let outcome = mgr.record_tasks(deltas, position, now_ms()).await?;
            for (key, count) in keys.iter().zip(&outcome.value) {
                println!("{key} = {count}");
            }
            report_audit(outcome.audit_error);
        }
        Command::Status => print_status(mgr).await?,
        Command::Close {
            odometer,
            notes,
            photos,
        } => {
            mgr.request_close()?;
            let mut form = CloseForm {
                final_odometer: odometer.unwrap_or_default(),
                notes: notes.unwrap_or_default(),
                ..Default::default()
            };
            let angles = [
                PhotoAngle::Left,
                PhotoAngle::Front,
                PhotoAngle::Right,
                PhotoAngle::Rear,
            ];
            for (angle, path) in angles.into_iter().zip(photos) {
                form.photos.set_local(angle, path);
            }
            let outcome = mgr.finalize_close(&mut form, position, now_ms()).await?;
            println!("Shift closed and report submitted.");
            report_audit(outcome.audit_error);
        }
        Command::Login { .. } | Command::Logout | Command::Vehicles => {
            unreachable!("handled before shift dispatch")
        }
    }
    Ok(())
}

async fn print_status<G: Gateway>(mgr: &mut ShiftManager<G>) -> Result<()> {
    match mgr.state() {
        ShiftState::NotStarted => println!("No active shift."),
        ShiftState::Active { warehouse_out } => {
            let elapsed = mgr.elapsed(now_ms()).unwrap_or_default();
            let place = if warehouse_out { "in the field" } else { "at the warehouse" };
            println!("Shift active for {elapsed}, currently {place}.");
            // Flatten through the session store so status reflects what
            // a close would actually report.
            let ledger = mgr.ledger().await?;
            for (key, count) in ledger::flatten(&ledger) {
                println!("  {key} = {count}");
            }
        }
        ShiftState::Closing => println!("Close in progress."),
        ShiftState::Closed => println!("Shift closed."),
    }
    Ok(())
}

/// Parses `<operator>_<taskName>=<delta>`, delta sign optional.
fn parse_task_entry(entry: &str) -> Result<(TaskKey, i64), ShiftError> {
    let (key, delta) = entry
        .split_once('=')
        .ok_or_else(|| ShiftError::validation(format!("expected <task>=<delta>, got: {entry}")))?;
    let key: TaskKey = key.parse()?;
    let delta: i64 = delta
        .trim_start_matches('+')
        .parse()
        .map_err(|_| ShiftError::validation(format!("not a delta: {delta}")))?;
    Ok((key, delta))
}

fn report_audit(audit_error: Option<ShiftError>) {
    if let Some(err) = audit_error {
        eprintln!("Warning: recorded locally, but the audit log call failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn task_entries_parse_signed_deltas() {
        let (key, delta) = parse_task_entry("lime_collectTroti=+3").unwrap();
        assert_eq!(key.storage_key(), "lime_collectTroti");
        assert_eq!(delta, 3);

        let (_, delta) = parse_task_entry("bolt_swap=-2").unwrap();
        assert_eq!(delta, -2);

        assert!(parse_task_entry("bolt_swap").is_err());
        assert!(parse_task_entry("bolt_swap=two").is_err());
    }
}
