//! Implementation of `tally init` command.

use anyhow::Result;
use serde::Serialize;

use crate::cli::commands::helpers::{open_record, StoreOptions};
use crate::output::{Formatter, OutputFormat};

#[derive(Serialize)]
struct InitOutput {
    database: String,
    status: &'static str,
}

/// Run the init command.
///
/// Creates the database file and schema. Safe to run repeatedly.
#[tracing::instrument(skip(opts, format))]
pub fn run_init(opts: &StoreOptions, format: OutputFormat) -> Result<()> {
    open_record(&opts.db, &opts.config())?;

    Formatter::new(format).print(&InitOutput {
        database: opts.db.display().to_string(),
        status: "ready",
    })
}
