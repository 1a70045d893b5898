//! Session state machine.
//!
//! The current state only changes through [`SessionStateMachine::tick`] (the
//! rule table) or the explicit limit-wait pair
//! [`confirm_limit`](SessionStateMachine::confirm_limit) /
//! [`clear_reset_pending`](SessionStateMachine::clear_reset_pending).
//! A transition is applied only when the target differs from the current
//! state, so the history never holds two consecutive entries with the same
//! destination.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use handoff_protocol::SessionState;

use crate::consensus::ConsensusResult;
use crate::usage::UsageReport;

/// Audit record of one applied transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryAction {
    /// Allow delegation to the assistant again.
    DisableLocalOnly,
    /// Forbid delegation to the assistant.
    EnableLocalOnly,
    PublishStatus,
    PublishWarning(String),
    SaveSnapshot,
}

/// Side effects run on state entry.
pub trait StateActions {
    fn run(&mut self, action: &EntryAction, transition: &SessionTransition);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MachineThresholds {
    pub fallback_confidence: f64,
    pub warn: f64,
    pub critical: f64,
}

impl Default for MachineThresholds {
    fn default() -> Self {
        Self {
            fallback_confidence: 0.4,
            warn: 0.75,
            critical: 0.90,
        }
    }
}

/// The rule table, in priority order.
pub fn evaluate_rule(
    consensus: &ConsensusResult,
    usage_percentage: f64,
    thresholds: &MachineThresholds,
) -> (SessionState, String) {
    if consensus.is_unavailable() {
        return (SessionState::Unknown, "no probe settled".to_string());
    }
    if !consensus.is_active || consensus.confidence < thresholds.fallback_confidence {
        return (
            SessionState::Fallback,
            format!(
                "assistant inactive ({} of {} probes active)",
                consensus.active_count(),
                consensus.contributing_signals.len() + consensus.failed.len()
            ),
        );
    }
    if usage_percentage >= thresholds.critical {
        return (
            SessionState::LimitReached,
            format!("usage at {:.1}%", usage_percentage * 100.0),
        );
    }
    if usage_percentage >= thresholds.warn {
        return (
            SessionState::ApproachingLimit,
            format!("usage at {:.1}%", usage_percentage * 100.0),
        );
    }
    (SessionState::Active, "assistant active".to_string())
}

pub struct SessionStateMachine<A: StateActions> {
    state: SessionState,
    history: VecDeque<SessionTransition>,
    history_cap: usize,
    thresholds: MachineThresholds,
    /// Set while waiting for a usage-limit reset; the rule table is skipped.
    suppressed: bool,
    /// Routing latch. Rule-driven entries into UNKNOWN leave it as it was.
    local_only: bool,
    last_consensus: Option<(bool, f64)>,
    actions: A,
}

impl<A: StateActions> SessionStateMachine<A> {
    pub fn new(thresholds: MachineThresholds, history_cap: usize, actions: A) -> Self {
        Self {
            state: SessionState::Unknown,
            history: VecDeque::with_capacity(history_cap.min(64)),
            history_cap: history_cap.max(1),
            thresholds,
            suppressed: false,
            local_only: false,
            last_consensus: None,
            actions,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn history(&self) -> Vec<SessionTransition> {
        self.history.iter().cloned().collect()
    }

    pub fn actions(&self) -> &A {
        &self.actions
    }

    pub fn actions_mut(&mut self) -> &mut A {
        &mut self.actions
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    /// Derived from the current state; there is no separate flag to drift.
    pub fn is_fallback(&self) -> bool {
        matches!(
            self.state,
            SessionState::Fallback | SessionState::LimitReached | SessionState::ResetPending
        )
    }

    /// Whether delegation to the assistant is currently forbidden. Unlike
    /// [`is_fallback`](Self::is_fallback) this survives a drop into UNKNOWN
    /// and is only released by ACTIVE or a cleared limit wait.
    pub fn routes_local_only(&self) -> bool {
        self.local_only
    }

    pub fn is_assistant_available(&self) -> bool {
        let consensus_ok = self
            .last_consensus
            .map(|(active, confidence)| active && confidence >= self.thresholds.fallback_confidence)
            .unwrap_or(false);
        consensus_ok
            && !matches!(
                self.state,
                SessionState::LimitReached | SessionState::ResetPending
            )
    }

    /// Evaluates the rule table for this tick.
    pub fn tick(
        &mut self,
        consensus: &ConsensusResult,
        usage: &UsageReport,
        now: DateTime<Utc>,
    ) -> Option<SessionTransition> {
        self.last_consensus = Some((consensus.is_active, consensus.confidence));
        if self.suppressed {
            return None;
        }

        let (target, reason) = evaluate_rule(consensus, usage.percentage, &self.thresholds);
        let warning = usage
            .warning
            .should_warn
            .then(|| usage.warning.message.clone());
        self.transition_to(target, reason, consensus.confidence, now, warning)
    }

    /// A confirmed usage limit: enter RESET_PENDING and stop evaluating rules
    /// until [`clear_reset_pending`](Self::clear_reset_pending).
    pub fn confirm_limit(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Option<SessionTransition> {
        self.suppressed = true;
        let confidence = self.last_consensus.map(|(_, c)| c).unwrap_or(0.0);
        self.transition_to(SessionState::ResetPending, reason.into(), confidence, now, None)
    }

    /// The limit has reset. Returns to UNKNOWN; the next tick decides the
    /// real state.
    pub fn clear_reset_pending(&mut self, now: DateTime<Utc>) -> Option<SessionTransition> {
        self.suppressed = false;
        if self.state != SessionState::ResetPending {
            return None;
        }
        let confidence = self.last_consensus.map(|(_, c)| c).unwrap_or(0.0);
        self.apply(
            SessionState::Unknown,
            "usage limit reset".to_string(),
            confidence,
            now,
            vec![EntryAction::DisableLocalOnly, EntryAction::PublishStatus],
        )
    }

    fn transition_to(
        &mut self,
        to: SessionState,
        reason: String,
        confidence: f64,
        now: DateTime<Utc>,
        warning: Option<String>,
    ) -> Option<SessionTransition> {
        self.apply(to, reason, confidence, now, entry_actions(to, warning))
    }

    fn apply(
        &mut self,
        to: SessionState,
        reason: String,
        confidence: f64,
        now: DateTime<Utc>,
        actions: Vec<EntryAction>,
    ) -> Option<SessionTransition> {
        if to == self.state {
            return None;
        }

        let transition = SessionTransition {
            from: self.state,
            to,
            timestamp: now,
            reason,
            confidence,
        };
        info!(
            from = %transition.from,
            to = %transition.to,
            reason = %transition.reason,
            confidence = transition.confidence,
            "Session state transition"
        );

        self.state = to;
        if self.history.len() >= self.history_cap {
            self.history.pop_front();
        }
        self.history.push_back(transition.clone());

        for action in actions {
            match action {
                EntryAction::EnableLocalOnly => self.local_only = true,
                EntryAction::DisableLocalOnly => self.local_only = false,
                _ => {}
            }
            self.actions.run(&action, &transition);
        }
        Some(transition)
    }
}

pub fn entry_actions(state: SessionState, warning: Option<String>) -> Vec<EntryAction> {
    match state {
        SessionState::Active => vec![EntryAction::DisableLocalOnly, EntryAction::PublishStatus],
        // Losing every signal is no evidence the assistant came back.
        SessionState::Unknown => vec![EntryAction::PublishStatus],
        SessionState::ApproachingLimit => vec![
            EntryAction::PublishStatus,
            EntryAction::PublishWarning(
                warning.unwrap_or_else(|| "Approaching usage limit".to_string()),
            ),
        ],
        SessionState::LimitReached | SessionState::Fallback => vec![
            EntryAction::EnableLocalOnly,
            EntryAction::PublishStatus,
            EntryAction::SaveSnapshot,
        ],
        SessionState::ResetPending => vec![EntryAction::EnableLocalOnly, EntryAction::PublishStatus],
    }
}
