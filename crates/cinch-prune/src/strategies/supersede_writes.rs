//! A successful write to a file makes every earlier read of it stale.

use std::collections::HashMap;

use super::names::{is_read_tool, is_write_tool};
use super::{collect_tool_calls, mark_record, resource_path};
use crate::Message;
use crate::config::PruneConfig;
use crate::state::{PruneSource, SessionState};

pub fn supersede_writes(
    state: &mut SessionState,
    config: &PruneConfig,
    messages: &[Message],
) -> usize {
    if !config.strategies.supersede_writes.enabled {
        return 0;
    }

    let records = collect_tool_calls(state, messages);

    // Position of the last successful write per path.
    let mut last_write: HashMap<&str, usize> = HashMap::new();
    for (idx, record) in records.iter().enumerate() {
        if record.is_error || !is_write_tool(&record.tool) {
            continue;
        }
        if let Some(path) = resource_path(&record.input) {
            last_write.insert(path, idx);
        }
    }

    let mut marked = 0;
    for (idx, record) in records.iter().enumerate() {
        if !is_read_tool(&record.tool) || config.is_protected(&record.tool, &[]) {
            continue;
        }
        let Some(path) = resource_path(&record.input) else {
            continue;
        };
        if last_write.get(path).is_some_and(|w| *w > idx)
            && mark_record(state, record, PruneSource::SupersedeWrites)
        {
            marked += 1;
        }
    }
    marked
}
