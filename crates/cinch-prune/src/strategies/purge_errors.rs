//! Errored calls older than the configured number of turns.

use super::{collect_tool_calls, mark_record};
use crate::Message;
use crate::config::PruneConfig;
use crate::state::reconcile::count_turns;
use crate::state::{PruneSource, SessionState};

pub fn purge_errors(state: &mut SessionState, config: &PruneConfig, messages: &[Message]) -> usize {
    let purge = &config.strategies.purge_errors;
    if !purge.enabled {
        return 0;
    }

    let records = collect_tool_calls(state, messages);
    // The chronologically last call is never purged.
    let Some((_last, earlier)) = records.split_last() else {
        return 0;
    };
    let current_turn = count_turns(state, messages).saturating_sub(1);

    let mut marked = 0;
    for record in earlier {
        if !record.is_error || config.is_protected(&record.tool, &purge.protected_tools) {
            continue;
        }
        let age = current_turn.saturating_sub(record.turn);
        if age > purge.turns && mark_record(state, record, PruneSource::PurgeErrors) {
            marked += 1;
        }
    }
    marked
}
