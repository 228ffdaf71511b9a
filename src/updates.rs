//! Update bus.
//!
//! After a transaction commits, the owning operation hands typed envelopes to
//! the bus. Delivery is best-effort: a failed send is logged and swallowed,
//! never unwinding the committed state. Subscribers (the WebSocket fan-out,
//! activity feeds, notification relays) attach through [`UpdateBus::subscribe`].

use crate::lmsr::Side;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MarketEvent {
    Created,
    Resolved,
    Initialized,
    Updated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateEnvelope {
    Trade {
        market_id: i64,
        option_id: i64,
        trade_type: String,
        side: Side,
        quantity: i64,
        price_per_share: i64,
        ts: i64,
    },
    Price {
        option_id: i64,
        yes_price: i64,
        no_price: i64,
        yes_qty: i64,
        no_qty: i64,
        ts: i64,
    },
    Balance {
        user_id: i64,
        new_balance: i64,
        ts: i64,
    },
    Market {
        market_id: i64,
        event: MarketEvent,
        payload: serde_json::Value,
        ts: i64,
    },
    Comment {
        market_id: i64,
        comment_id: i64,
        user_id: i64,
        ts: i64,
    },
}

#[derive(Clone)]
pub struct UpdateBus {
    tx: broadcast::Sender<UpdateEnvelope>,
}

impl UpdateBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Post-commit emission. Returns nothing: failure here must never fail
    /// the user-facing operation.
    pub fn emit(&self, envelope: UpdateEnvelope) {
        if let Err(e) = self.tx.send(envelope) {
            debug!(error = %e, "update envelope dropped (no subscribers)");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEnvelope> {
        self.tx.subscribe()
    }
}

impl Default for UpdateBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn envelopes_reach_subscribers() {
        let bus = UpdateBus::new(16);
        let mut rx = bus.subscribe();
        bus.emit(UpdateEnvelope::Balance {
            user_id: 7,
            new_balance: 123_456,
            ts: 1_700_000_000,
        });
        match rx.recv().await.unwrap() {
            UpdateEnvelope::Balance { user_id, new_balance, .. } => {
                assert_eq!(user_id, 7);
                assert_eq!(new_balance, 123_456);
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = UpdateBus::new(4);
        // no receiver attached; must not panic or error
        bus.emit(UpdateEnvelope::Comment {
            market_id: 1,
            comment_id: 2,
            user_id: 3,
            ts: 4,
        });
    }

    #[test]
    fn envelope_json_shape_is_tagged() {
        let envelope = UpdateEnvelope::Market {
            market_id: 5,
            event: MarketEvent::Resolved,
            payload: serde_json::json!({"winning_side": 1}),
            ts: 1_700_000_000,
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "market");
        assert_eq!(json["event"], "resolved");
    }

    #[test]
    fn trade_envelope_serializes_side_lowercase() {
        let envelope = UpdateEnvelope::Trade {
            market_id: 1,
            option_id: 2,
            trade_type: "buy".into(),
            side: Side::Yes,
            quantity: 1_000_000,
            price_per_share: 510_000,
            ts: 0,
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["side"], "yes");
    }
}
