//! # Direct Transfers
//!
//! Fulfils transfer requests over a direct open channel with the target:
//! builds the signed locked-transfer envelope, hands it to the messaging
//! layer and reports success once the peer acknowledged delivery. Routing
//! through intermediaries is not attempted; a request without a usable
//! direct channel fails.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use pc_engine::{Epic, EpicContext};
use pc_messages::{encode_message, sign_message, Envelope, LockedTransfer, Message, Metadata, RouteMetadata};
use pc_state::ChannelState;
use shared_bus::{Action, ActionFilter, ActionTopic};
use shared_crypto::Signer;
use shared_types::{Address, ChannelKey, EngineError, Hash, Lock, TokenAmount};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::ids::next_id;

/// Locks pending on one channel, tracked across transfers so each new
/// envelope carries cumulative totals and a fresh nonce.
#[derive(Default)]
struct ChannelLedger {
    nonce: u64,
    locked_amount: TokenAmount,
    lock_hashes: Vec<[u8; 96]>,
}

/// Root hash committing to all pending locks, in creation order.
fn locksroot(lock_hashes: &[[u8; 96]]) -> Hash {
    let mut packed = Vec::with_capacity(lock_hashes.len() * 96);
    for lock in lock_hashes {
        packed.extend_from_slice(lock);
    }
    Hash::keccak(&packed)
}

/// The canonical 96-byte packing of one lock.
fn pack_lock(lock: &Lock) -> [u8; 96] {
    let mut out = [0u8; 96];
    primitive_u256(&mut out[..32], TokenAmount::from(lock.expiration));
    primitive_u256(&mut out[32..64], lock.amount);
    out[64..].copy_from_slice(lock.secrethash.as_bytes());
    out
}

fn primitive_u256(out: &mut [u8], value: TokenAmount) {
    let mut bytes = [0u8; 32];
    value.to_big_endian(&mut bytes);
    out.copy_from_slice(&bytes);
}

pub struct TransferEpic {
    signer: Arc<dyn Signer>,
}

impl TransferEpic {
    #[must_use]
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self { signer }
    }

    /// Build, sign and deliver one locked transfer; resolves once the
    /// messaging layer acknowledged delivery.
    async fn fulfil(
        &self,
        ctx: &EpicContext,
        ledgers: &mut HashMap<ChannelKey, ChannelLedger>,
        token: Address,
        target: Address,
        amount: TokenAmount,
        secrethash: Hash,
        payment_identifier: u64,
    ) -> Result<(), EngineError> {
        let snapshot = ctx.snapshot();
        let token_network = snapshot
            .token_network(&token)
            .ok_or(EngineError::UnknownTokenNetwork(token))?;
        let meta = ChannelKey { token_network, partner: target };
        let channel = snapshot
            .channel(&meta)
            .ok_or(EngineError::NoChannelFound(meta))?;
        let channel_identifier = match (channel.state, channel.id) {
            (ChannelState::Open, Some(id)) => id,
            _ => {
                return Err(EngineError::InvalidChannelState {
                    key: meta,
                    state: channel.state.to_string(),
                })
            }
        };

        let config = ctx.config();
        let lock = Lock {
            amount,
            expiration: snapshot.block_number + 2 * config.reveal_timeout,
            secrethash,
        };
        let ledger = ledgers.entry(meta).or_default();
        ledger.nonce += 1;
        ledger.locked_amount = ledger.locked_amount + amount;
        ledger.lock_hashes.push(pack_lock(&lock));

        let message_identifier = next_id();
        let mut message = Message::LockedTransfer(LockedTransfer {
            envelope: Envelope {
                chain_id: snapshot.chain_id,
                token_network_address: token_network,
                channel_identifier,
                nonce: ledger.nonce,
                transferred_amount: TokenAmount::zero(),
                locked_amount: ledger.locked_amount,
                locksroot: locksroot(&ledger.lock_hashes),
            },
            message_identifier,
            payment_identifier,
            token,
            recipient: target,
            lock,
            target,
            initiator: snapshot.address,
            metadata: Metadata {
                routes: vec![RouteMetadata { route: vec![target] }],
            },
            signature: None,
        });
        sign_message(self.signer.as_ref(), &mut message)
            .map_err(|err| EngineError::Signing(err.to_string()))?;
        let text = encode_message(&message)
            .map_err(|err| EngineError::Decode(err.to_string()))?;

        // subscribed before dispatch so the acknowledgement cannot be missed
        let mut sub =
            ctx.subscribe(ActionFilter::topics(vec![ActionTopic::Messages]).peer(target));
        ctx.dispatch(Action::MessageSend {
            address: target,
            message_id: message_identifier,
            text,
        });
        let acked = timeout(
            config.http_timeout(),
            sub.find(|action| {
                matches!(
                    action,
                    Action::MessageSent { message_id, .. } if *message_id == message_identifier
                ) || matches!(action, Action::Shutdown { .. })
            }),
        )
        .await
        .map_err(|_| EngineError::Timeout("transfer delivery".to_string()))?;
        match acked {
            Ok(Action::Shutdown { reason }) => Err(EngineError::ShuttingDown(reason)),
            Ok(_) => Ok(()),
            Err(_) => Err(EngineError::Transport("action stream closed".to_string())),
        }
    }
}

#[async_trait]
impl Epic for TransferEpic {
    fn name(&self) -> &'static str {
        "transfers"
    }

    async fn run(self: Arc<Self>, ctx: EpicContext) -> Result<(), EngineError> {
        let mut sub = ctx.subscribe(ActionFilter::topics(vec![ActionTopic::Transfers]));
        ctx.wait_started().await;
        let mut ledgers: HashMap<ChannelKey, ChannelLedger> = HashMap::new();
        while let Ok(action) = sub.recv().await {
            let (transfer_id, token, target, amount, secrethash) = match action {
                Action::Shutdown { .. } => break,
                Action::TransferRequest { transfer_id, token, target, amount, secrethash } => {
                    (transfer_id, token, target, amount, secrethash)
                }
                _ => continue,
            };
            match self
                .fulfil(&ctx, &mut ledgers, token, target, amount, secrethash, transfer_id)
                .await
            {
                Ok(()) => {
                    debug!(transfer_id, %target, "transfer delivered");
                    ctx.dispatch(Action::TransferSuccess { transfer_id });
                }
                Err(error) => {
                    warn!(transfer_id, %target, %error, "transfer failed");
                    ctx.dispatch(Action::TransferFailure { transfer_id, error });
                }
            }
        }
        Ok(())
    }
}
