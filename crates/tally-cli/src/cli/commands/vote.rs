//! Implementation of `tally vote` command.

use anyhow::Result;
use serde::Serialize;

use tally_core::model::{VoteIntent, VoteType};

use crate::cli::commands::helpers::{open_services, StoreOptions};
use crate::output::{Formatter, OutputFormat};

#[derive(Serialize)]
struct VoteOutput {
    entity_id: i64,
    voter_id: i64,
    upvotes: u64,
    downvotes: u64,
    your_vote: Option<VoteType>,
}

/// Run the vote command.
#[tracing::instrument(skip(opts, format))]
pub fn run_vote(
    opts: &StoreOptions,
    voter_id: i64,
    entity_id: i64,
    intent: VoteIntent,
    format: OutputFormat,
) -> Result<()> {
    let services = open_services(opts)?;
    let state = services.cast_vote(voter_id, entity_id, intent)?;

    Formatter::new(format).print(&VoteOutput {
        entity_id,
        voter_id,
        upvotes: state.upvotes,
        downvotes: state.downvotes,
        your_vote: state.your_vote,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands::helpers::fixtures::seeded;
    use tally_core::record::RecordStore;

    #[test]
    fn test_vote_is_persisted() {
        let (_dir, opts) = seeded(2, 1);
        run_vote(&opts, 1, 1, VoteIntent::Up, OutputFormat::Json).unwrap();
        run_vote(&opts, 2, 1, VoteIntent::Down, OutputFormat::Text).unwrap();

        let record = crate::cli::commands::helpers::open_record(&opts.db, &opts.config()).unwrap();
        assert_eq!(
            record.count_votes(1).unwrap(),
            tally_core::model::VoteCounts::new(1, 1)
        );
    }

    #[test]
    fn test_vote_on_unknown_entity_fails() {
        let (_dir, opts) = seeded(1, 1);
        let err = run_vote(&opts, 1, 9, VoteIntent::Up, OutputFormat::Text).unwrap_err();
        assert!(err.to_string().contains("Entity not found"));
    }
}
