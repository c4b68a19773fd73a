//! Channel lifecycle slice.
//!
//! Transitions only ever move forward (opening -> open -> closing -> closed
//! -> settleable -> settling -> gone) and confirmed observations are the only
//! ones that advance past `Closing`/`Settling`. An unconfirmed close or
//! settle pre-positions the channel so it cannot be used for new transfers
//! while the observation awaits finality.

use shared_bus::Action;
use shared_types::ChannelKey;

use crate::state::{Channel, ChannelEnd, ChannelState, EngineState};

pub(super) fn reduce(state: &mut EngineState, action: &Action) -> bool {
    match action {
        Action::ChannelOpenRequest { meta, .. } => open_request(state, meta),
        Action::ChannelOpenSuccess { .. } => open_success(state, action),
        Action::ChannelOpenFailure { meta, .. } => open_failure(state, meta),
        Action::ChannelDepositSuccess { .. } | Action::ChannelWithdrawn { .. } => {
            onchain_balance(state, action)
        }
        Action::ChannelCloseSuccess { .. } => close_success(state, action),
        Action::ChannelCloseRequest { .. }
        | Action::ChannelSettleable { .. }
        | Action::ChannelSettleRequest { .. } => forward_transition(state, action),
        Action::ChannelSettleSuccess { .. } => settle_success(state, action),
        _ => false,
    }
}

fn open_request(state: &mut EngineState, meta: &ChannelKey) -> bool {
    // at most one channel per token network and partner
    if state.channels.contains_key(meta) {
        return false;
    }
    state.channels.insert(*meta, Channel::opening());
    true
}

fn open_success(state: &mut EngineState, action: &Action) -> bool {
    let Action::ChannelOpenSuccess {
        meta,
        id,
        settle_timeout,
        is_first_participant,
        confirmation,
    } = action
    else {
        return false;
    };
    if confirmation.confirmed != Some(true) {
        return false;
    }
    // ignore events older than the channel we already track
    let known_open_block = state
        .channels
        .get(meta)
        .and_then(|c| c.open_block)
        .unwrap_or(0);
    if known_open_block >= confirmation.tx_block {
        return false;
    }
    state.channels.insert(
        *meta,
        Channel {
            state: ChannelState::Open,
            id: Some(*id),
            settle_timeout: Some(*settle_timeout),
            is_first_participant: *is_first_participant,
            open_block: Some(confirmation.tx_block),
            close_block: None,
            close_participant: None,
            own: ChannelEnd::default(),
            partner: ChannelEnd::default(),
        },
    );
    true
}

fn open_failure(state: &mut EngineState, meta: &ChannelKey) -> bool {
    // only a never-opened channel is removed on failure
    if state.channels.get(meta).map(|c| c.state) != Some(ChannelState::Opening) {
        return false;
    }
    state.channels.remove(meta);
    true
}

fn onchain_balance(state: &mut EngineState, action: &Action) -> bool {
    let own_address = state.address;
    let (meta, id, participant, total, is_withdraw) = match action {
        Action::ChannelDepositSuccess { meta, id, participant, total_deposit, confirmation } => {
            if confirmation.confirmed != Some(true) {
                return false;
            }
            (meta, *id, *participant, *total_deposit, false)
        }
        Action::ChannelWithdrawn { meta, id, participant, total_withdraw, confirmation } => {
            if confirmation.confirmed != Some(true) {
                return false;
            }
            (meta, *id, *participant, *total_withdraw, true)
        }
        _ => return false,
    };
    let Some(channel) = state.channels.get_mut(meta) else {
        return false;
    };
    if channel.state != ChannelState::Open || channel.id != Some(id) {
        return false;
    }
    // balance events name their participant; one not in this channel is
    // someone else's observation
    let end = if participant == meta.partner {
        &mut channel.partner
    } else if participant == own_address {
        &mut channel.own
    } else {
        return false;
    };
    let slot = if is_withdraw { &mut end.withdraw } else { &mut end.deposit };
    if *slot == total {
        return false;
    }
    *slot = total;
    true
}

fn close_success(state: &mut EngineState, action: &Action) -> bool {
    let Action::ChannelCloseSuccess { meta, id, participant, confirmation } = action else {
        return false;
    };
    let Some(channel) = state.channels.get_mut(meta) else {
        return false;
    };
    if !matches!(channel.state, ChannelState::Open | ChannelState::Closing)
        || channel.id != Some(*id)
    {
        return false;
    }
    match confirmation.confirmed {
        // pre-position on the unconfirmed observation so no new transfers start
        None if channel.state == ChannelState::Open => {
            channel.state = ChannelState::Closing;
            true
        }
        Some(true) => {
            channel.state = ChannelState::Closed;
            channel.close_block = Some(confirmation.tx_block);
            channel.close_participant = Some(*participant);
            true
        }
        _ => false,
    }
}

/// Request- and timer-driven forward transitions with no on-chain payload.
fn forward_transition(state: &mut EngineState, action: &Action) -> bool {
    let Some(meta) = action.channel_key() else {
        return false;
    };
    let Some(channel) = state.channels.get_mut(&meta) else {
        return false;
    };
    let next = match (action, channel.state) {
        (Action::ChannelCloseRequest { .. }, ChannelState::Open) => ChannelState::Closing,
        (Action::ChannelSettleable { .. }, ChannelState::Closed) => ChannelState::Settleable,
        (Action::ChannelSettleRequest { .. }, ChannelState::Settleable) => ChannelState::Settling,
        _ => return false,
    };
    channel.state = next;
    true
}

fn settle_success(state: &mut EngineState, action: &Action) -> bool {
    let Action::ChannelSettleSuccess { meta, id, confirmation } = action else {
        return false;
    };
    let Some(channel) = state.channels.get_mut(meta) else {
        return false;
    };
    if matches!(
        channel.state,
        ChannelState::Opening | ChannelState::Open | ChannelState::Closing
    ) || channel.id != Some(*id)
    {
        return false;
    }
    match confirmation.confirmed {
        None if channel.state != ChannelState::Settling => {
            channel.state = ChannelState::Settling;
            true
        }
        // confirmed settle retires the channel into the history archive
        Some(true) => {
            if let Some(settled) = state.channels.remove(meta) {
                state
                    .old_channels
                    .insert(EngineState::old_channel_key(meta, *id), settled);
            }
            true
        }
        _ => false,
    }
}
