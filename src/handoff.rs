use std::collections::HashMap;

use crate::agent::AgentRunResult;

/// Pick the stage that runs after `result`.
///
/// An override keyed by the finished agent's name wins; otherwise the agent's
/// static handoff target is used. `None` ends the pipeline. Only the result
/// and the override map are consulted, never the run state.
pub fn determine_next_agent(
    result: &AgentRunResult,
    overrides: Option<&HashMap<String, String>>,
) -> Option<String> {
    if let Some(target) = overrides.and_then(|o| o.get(&result.agent_name)) {
        return Some(target.clone());
    }
    result.handoff_target.clone()
}
