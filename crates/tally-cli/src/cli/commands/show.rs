//! Implementation of `tally show` command.

use anyhow::Result;
use serde::Serialize;

use tally_core::model::VoteType;

use crate::cli::commands::helpers::{open_services, StoreOptions};
use crate::output::{Formatter, OutputFormat};

#[derive(Serialize)]
struct ShowOutput {
    entity_id: i64,
    upvotes: u64,
    downvotes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    voter_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    your_vote: Option<VoteType>,
}

/// Run the show command.
#[tracing::instrument(skip(opts, format))]
pub fn run_show(
    opts: &StoreOptions,
    entity_id: i64,
    voter_id: Option<i64>,
    format: OutputFormat,
) -> Result<()> {
    let services = open_services(opts)?;
    let state = services.get_vote_state(entity_id, voter_id)?;

    Formatter::new(format).print(&ShowOutput {
        entity_id,
        upvotes: state.upvotes,
        downvotes: state.downvotes,
        voter_id,
        your_vote: state.your_vote,
    })
}
