//! # Reducers
//!
//! Pure state transitions. Every reducer takes the whole state and one
//! action, mutates in place and reports whether anything changed. Guards are
//! strict: an action arriving in the wrong lifecycle state is a no-op, which
//! is what makes duplicate and reverted on-chain observations safe.

mod channels;
mod transport;

use std::mem::discriminant;

use shared_bus::Action;
use tracing::trace;

use crate::state::EngineState;

/// Apply `action` to `state`. Returns true if the state changed.
pub fn reduce(state: &mut EngineState, action: &Action) -> bool {
    let mut changed = false;
    changed |= chain_reduce(state, action);
    changed |= channels::reduce(state, action);
    changed |= pending_txs_reduce(state, action);
    changed |= transport::reduce(state, action);
    changed |= services_reduce(state, action);
    changed |= config_reduce(state, action);
    if changed {
        trace!(topic = ?action.topic(), "state changed");
    }
    changed
}

/// Block number and monitored-token slices.
fn chain_reduce(state: &mut EngineState, action: &Action) -> bool {
    match action {
        Action::NewBlock { block_number } => {
            if state.block_number == *block_number {
                return false;
            }
            state.block_number = *block_number;
            true
        }
        Action::TokenMonitored { token, token_network, .. } => {
            state.tokens.insert(*token, *token_network) != Some(*token_network)
        }
        _ => false,
    }
}

/// Tracks confirmable observations until the confirmation epic resolves them.
///
/// At most one entry per action kind and channel: a later observation of the
/// same kind supersedes the earlier one (a resubmitted transaction), and a
/// resolution of either polarity clears the slot.
fn pending_txs_reduce(state: &mut EngineState, action: &Action) -> bool {
    let Some(confirmation) = action.confirmation() else {
        return false;
    };
    let same_slot = |pending: &Action| {
        discriminant(pending) == discriminant(action)
            && pending.channel_key() == action.channel_key()
    };
    match confirmation.confirmed {
        // observed, not yet final: remember the latest observation
        None => match state.pending_txs.iter().position(same_slot) {
            Some(slot) if state.pending_txs[slot] == *action => false,
            Some(slot) => {
                state.pending_txs[slot] = action.clone();
                true
            }
            None => {
                state.pending_txs.push(action.clone());
                true
            }
        },
        // resolved either way: forget it
        Some(_) => {
            let before = state.pending_txs.len();
            state.pending_txs.retain(|pending| !same_slot(pending));
            state.pending_txs.len() != before
        }
    }
}

/// Service IOU slice.
fn services_reduce(state: &mut EngineState, action: &Action) -> bool {
    match action {
        Action::IouStored { token_network, service, iou } => {
            state
                .ious
                .entry(*token_network)
                .or_default()
                .insert(*service, iou.clone())
                .as_ref()
                != Some(iou)
        }
        Action::IouCleared { token_network, service } => {
            let Some(by_service) = state.ious.get_mut(token_network) else {
                return false;
            };
            let removed = by_service.remove(service).is_some();
            if by_service.is_empty() {
                state.ious.remove(token_network);
            }
            removed
        }
        _ => false,
    }
}

/// User configuration overlay slice.
fn config_reduce(state: &mut EngineState, action: &Action) -> bool {
    let Action::ConfigUpdate { config } = action else {
        return false;
    };
    let before = state.config.clone();
    state.config.update(config);
    state.config != before
}
