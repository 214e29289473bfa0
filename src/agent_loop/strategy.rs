//! Continuation strategies: whether the agent loop runs another cycle.
//!
//! A strategy is consulted after each cycle that left every tool call
//! settled, so at least one cycle has always run. Counts are per run: a run
//! starts with a send, a reload, or a resume after a recorded tool result or
//! approval, and each resume counts from zero again.

use std::sync::Arc;

use crate::assembler::MessageList;
use crate::types::FinishReason;

/// What a continuation strategy gets to look at.
#[derive(Debug, Clone)]
pub struct AgentLoopState<'a> {
    /// Cycles completed so far in this run, at least 1.
    pub iteration_count: usize,
    pub messages: &'a MessageList,
    pub finish_reason: Option<FinishReason>,
}

/// Returns `true` to run another cycle.
pub type ContinuationStrategy = Arc<dyn Fn(&AgentLoopState<'_>) -> bool + Send + Sync>;

/// Continue while fewer than `max` cycles of this run have completed.
pub fn max_iterations(max: usize) -> ContinuationStrategy {
    Arc::new(move |state: &AgentLoopState<'_>| state.iteration_count < max)
}

/// Stop once the model finishes with one of `reasons`.
pub fn until_finish_reason(reasons: impl IntoIterator<Item = FinishReason>) -> ContinuationStrategy {
    let reasons: Vec<FinishReason> = reasons.into_iter().collect();
    Arc::new(move |state: &AgentLoopState<'_>| {
        !state
            .finish_reason
            .is_some_and(|reason| reasons.contains(&reason))
    })
}

/// Continue only if every strategy agrees.
pub fn combine(strategies: impl IntoIterator<Item = ContinuationStrategy>) -> ContinuationStrategy {
    let strategies: Vec<ContinuationStrategy> = strategies.into_iter().collect();
    Arc::new(move |state: &AgentLoopState<'_>| {
        strategies.iter().all(|strategy| strategy(state))
    })
}

/// Never stop on its own.
pub fn always() -> ContinuationStrategy {
    Arc::new(|_: &AgentLoopState<'_>| true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(messages: &MessageList, count: usize, reason: Option<FinishReason>) -> AgentLoopState<'_> {
        AgentLoopState {
            iteration_count: count,
            messages,
            finish_reason: reason,
        }
    }

    #[test]
    fn max_iterations_is_exclusive() {
        let messages = MessageList::new();
        let strategy = max_iterations(2);
        assert!(strategy(&state(&messages, 0, None)));
        assert!(strategy(&state(&messages, 1, None)));
        assert!(!strategy(&state(&messages, 2, None)));
    }

    #[test]
    fn finish_reason_stops_on_listed_reasons() {
        let messages = MessageList::new();
        let strategy = until_finish_reason([FinishReason::Stop, FinishReason::Length]);
        assert!(!strategy(&state(&messages, 1, Some(FinishReason::Length))));
        assert!(!strategy(&state(&messages, 1, Some(FinishReason::Stop))));
        assert!(strategy(&state(&messages, 1, Some(FinishReason::ToolCalls))));
        assert!(strategy(&state(&messages, 1, None)));
    }

    #[test]
    fn combine_requires_all() {
        let messages = MessageList::new();
        let strategy = combine([always(), max_iterations(1)]);
        assert!(strategy(&state(&messages, 0, None)));
        assert!(!strategy(&state(&messages, 1, None)));
    }
}
