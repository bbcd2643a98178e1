use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::sync::Position;

#[derive(Parser, Debug)]
#[command(author, version, about = "Shift and task-ledger tracker for micromobility field ops")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Device latitude, attached to audit rows
    #[arg(long, global = true)]
    pub lat: Option<f64>,

    /// Device longitude, attached to audit rows
    #[arg(long, global = true)]
    pub lon: Option<f64>,
}

impl Cli {
    pub fn position(&self) -> Option<Position> {
        match (self.lat, self.lon) {
            (Some(latitude), Some(longitude)) => Some(Position {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Log in against the user directory
    Login {
        username: String,
        #[arg(long)]
        password: String,
    },
    /// End the session and wipe local state
    Logout,
    /// List the vans available for a shift
    Vehicles,
    /// Start a shift
    Start {
        /// Odometer reading at departure (required unless mechanic)
        #[arg(long)]
        odometer: Option<i64>,
        /// Van registration, e.g. BA-69-PM
        #[arg(long)]
        vehicle: Option<String>,
    },
    /// Toggle warehouse exit/entry
    Warehouse,
    /// Record task count adjustments, e.g. `task lime_collectTroti=+3`
    Task {
        /// One or more `<operator>_<taskName>=<delta>` entries
        #[arg(required = true)]
        entries: Vec<String>,
    },
    /// Show the running shift
    Status,
    /// Close the shift and submit the report
    Close {
        /// Final odometer reading
        #[arg(long)]
        odometer: Option<String>,
        #[arg(long)]
        notes: Option<String>,
        /// Evidence photos in capture order: left, front, right, rear
        #[arg(long = "photo", value_name = "FILE")]
        photos: Vec<PathBuf>,
    },
}
