use std::time::Duration;

use clap::Parser;
use cli::Cli;
use color_eyre::eyre::{Result, WrapErr};
use futures::executor;

mod app;
mod cli;
mod close;
mod config;
mod errors;
mod ledger;
mod logging;
mod report;
mod session;
mod shift;
mod store;
mod sync;

fn main() -> Result<()> {
    bootstrap(|| {
        config::Config::new()?;
        let args = Cli::parse();

        executor::block_on(app::run(args))?;

        Ok(())
    })
}

fn bootstrap(fn_do_run: fn() -> Result<()>) -> Result<()> {
    crate::errors::init()?;
    crate::logging::init()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err_with(|| "Failed to start Tokio runtime")?;
    let _guard = runtime.enter();

    let result = fn_do_run();
    runtime.shutdown_timeout(Duration::from_secs(5));

    result
}
