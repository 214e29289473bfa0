//! Per-slot tool-call state machine.
//!
//! Every phase change goes through [`next_phase`], including the forced
//! completions that happen when a different event kind arrives. The table:
//!
//! | from | trigger | to |
//! |---|---|---|
//! | `streaming` | `explicit-end`, `slot-switch`, `text-arrived`, `stream-done` | `input-complete` |
//! | `streaming`, `input-complete` | `request-approval` | `approval-requested` |
//! | `approval-requested` | `respond-approval` | `approval-responded` |
//! | `input-complete`, `approval-responded` | `provide-output` | `output-available` |
//! | `input-complete`, `approval-responded` | `fail-output` | `output-error` |
//!
//! Anything else is rejected with [`TurnstileError::InvalidTransition`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{Result, TurnstileError};
use crate::types::{generate_id, ToolCallPhase, ToolCallState};

/// Named cause of a phase change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Trigger {
    /// A `tool-call-end` chunk for this call.
    ExplicitEnd,
    /// A different slot opened while this one was the most recently active.
    SlotSwitch,
    /// A text delta arrived.
    TextArrived,
    /// The stream finished.
    StreamDone,
    RequestApproval,
    RespondApproval,
    ProvideOutput,
    FailOutput,
}

impl Trigger {
    /// Triggers that force an open argument stream closed.
    pub fn is_forced_completion(self) -> bool {
        matches!(
            self,
            Self::ExplicitEnd | Self::SlotSwitch | Self::TextArrived | Self::StreamDone
        )
    }
}

/// The transition table.
pub fn next_phase(from: ToolCallPhase, trigger: Trigger) -> Option<ToolCallPhase> {
    use ToolCallPhase::*;
    use Trigger::*;

    match (from, trigger) {
        (Streaming, ExplicitEnd | SlotSwitch | TextArrived | StreamDone) => Some(InputComplete),
        (Streaming | InputComplete, RequestApproval) => Some(ApprovalRequested),
        (ApprovalRequested, RespondApproval) => Some(ApprovalResponded),
        (InputComplete | ApprovalResponded, ProvideOutput) => Some(OutputAvailable),
        (InputComplete | ApprovalResponded, FailOutput) => Some(OutputError),
        _ => None,
    }
}

impl ToolCallState {
    /// Apply a trigger, failing if the table has no entry for it.
    pub fn apply(&mut self, trigger: Trigger) -> Result<ToolCallPhase> {
        let next = next_phase(self.state, trigger).ok_or_else(|| {
            TurnstileError::InvalidTransition {
                tool_call_id: self.id.clone(),
                from: self.state,
                trigger,
            }
        })?;
        self.state = next;
        Ok(next)
    }

    /// Close the argument stream if it is still open. Returns whether the
    /// phase changed.
    pub fn complete_if_streaming(&mut self, trigger: Trigger) -> bool {
        if self.state != ToolCallPhase::Streaming {
            return false;
        }
        self.apply(trigger).is_ok()
    }
}

/// A tool call's phase or content changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallChange {
    /// Arrival slot of the call.
    pub index: u32,
    pub call: ToolCallState,
    /// Placeholder id this call was known by until its real id arrived.
    pub previous_id: Option<String>,
}

#[derive(Debug, Clone)]
struct Slot {
    index: u32,
    id_known: bool,
    call: ToolCallState,
}

impl Slot {
    fn change(&self) -> ToolCallChange {
        ToolCallChange {
            index: self.index,
            call: self.call.clone(),
            previous_id: None,
        }
    }

    /// Replace a generated placeholder id with the real one.
    fn adopt_id(&mut self, id: &str) -> ToolCallChange {
        let previous = std::mem::replace(&mut self.call.id, id.to_string());
        self.id_known = true;
        tracing::debug!(placeholder = %previous, tool_call_id = id, "tool call id resolved");
        ToolCallChange {
            previous_id: Some(previous),
            ..self.change()
        }
    }
}

/// Tracks the tool calls of one stream, keyed by arrival slot.
#[derive(Debug, Default)]
pub struct ToolCallTracker {
    slots: Vec<Slot>,
    by_index: HashMap<u32, usize>,
    last_active: Option<u32>,
}

impl ToolCallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn last_active(&self) -> Option<u32> {
        self.last_active
    }

    /// Apply an argument fragment addressed to `index`.
    ///
    /// Opening a new slot while the previously active slot is still
    /// streaming force-completes the previous one first, so its change is
    /// returned before the new slot's.
    pub fn apply_delta(
        &mut self,
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        args_delta: &str,
    ) -> Vec<ToolCallChange> {
        let mut changes = Vec::new();

        let position = match self.by_index.get(&index) {
            Some(position) => *position,
            None => {
                if let Some(previous) = self.last_active.filter(|p| *p != index) {
                    if let Some(slot) = self.slot_mut(previous) {
                        if slot.call.complete_if_streaming(Trigger::SlotSwitch) {
                            tracing::debug!(
                                tool_call_id = %slot.call.id,
                                trigger = %Trigger::SlotSwitch,
                                "forced tool call completion"
                            );
                            changes.push(slot.change());
                        }
                    }
                }
                let id_known = id.is_some();
                let call = ToolCallState::new(
                    id.map(str::to_owned).unwrap_or_else(|| generate_id("call")),
                    name.unwrap_or_default(),
                );
                self.slots.push(Slot {
                    index,
                    id_known,
                    call,
                });
                let position = self.slots.len() - 1;
                self.by_index.insert(index, position);
                position
            }
        };

        let slot = &mut self.slots[position];
        let previous_id = match id.filter(|_| !slot.id_known) {
            Some(id) => slot.adopt_id(id).previous_id,
            None => None,
        };
        if let Some(name) = name.filter(|n| !n.is_empty() && slot.call.name.is_empty()) {
            slot.call.name = name.to_string();
        }
        if slot.call.state != ToolCallPhase::Streaming && !args_delta.is_empty() {
            tracing::debug!(
                tool_call_id = %slot.call.id,
                state = %slot.call.state,
                "argument fragment for a completed tool call"
            );
        }
        slot.call.append_arguments(args_delta);
        changes.push(ToolCallChange {
            previous_id,
            ..slot.change()
        });

        self.last_active = Some(index);
        changes
    }

    /// Make sure a call with this id exists, attaching the id to the most
    /// recent slot still running under a placeholder if needed.
    ///
    /// Returns the rename when one happened.
    pub fn resolve_id(&mut self, id: &str) -> Option<ToolCallChange> {
        if self.get(id).is_some() {
            return None;
        }
        self.slots
            .iter_mut()
            .rev()
            .find(|slot| !slot.id_known)
            .map(|slot| slot.adopt_id(id))
    }

    /// Handle an explicit end signal for the call with this id.
    pub fn end(&mut self, id: &str) -> Option<ToolCallChange> {
        let slot = self.slots.iter_mut().find(|s| s.call.id == id)?;
        slot.call
            .complete_if_streaming(Trigger::ExplicitEnd)
            .then(|| slot.change())
    }

    /// Force-complete every call still streaming.
    pub fn complete_all(&mut self, trigger: Trigger) -> Vec<ToolCallChange> {
        self.slots
            .iter_mut()
            .filter_map(|slot| {
                slot.call.complete_if_streaming(trigger).then(|| {
                    tracing::debug!(
                        tool_call_id = %slot.call.id,
                        trigger = %trigger,
                        "forced tool call completion"
                    );
                    slot.change()
                })
            })
            .collect()
    }

    /// Mutate the call with this id and report the resulting change.
    pub fn update<F>(&mut self, id: &str, f: F) -> Option<ToolCallChange>
    where
        F: FnOnce(&mut ToolCallState),
    {
        let slot = self.slots.iter_mut().find(|s| s.call.id == id)?;
        f(&mut slot.call);
        Some(slot.change())
    }

    pub fn get(&self, id: &str) -> Option<&ToolCallState> {
        self.slots.iter().map(|s| &s.call).find(|c| c.id == id)
    }

    /// All calls in arrival order.
    pub fn calls(&self) -> Vec<ToolCallState> {
        self.slots.iter().map(|s| s.call.clone()).collect()
    }

    fn slot_mut(&mut self, index: u32) -> Option<&mut Slot> {
        let position = *self.by_index.get(&index)?;
        self.slots.get_mut(position)
    }
}
