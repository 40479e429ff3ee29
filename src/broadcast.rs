//! Fan-out of result events to in-process subscribers.
//!
//! The WebSocket hub lives outside the engine and subscribes here like any
//! other consumer. Delivery is best-effort: each subscriber gets a bounded
//! buffer (64 events) and slow subscribers lose events rather than slowing
//! the publisher down. The hub lock is only ever held for map mutation and
//! sender cloning, never across a send.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::RwLock;

use serde::Serialize;
use tracing::trace;

use crate::model::{GameId, MatchId, TournamentId, Winner};

/// Per-subscriber buffer; events beyond this are dropped for that
/// subscriber only.
pub const SUBSCRIBER_BUFFER: usize = 64;

/// Topic for all events of one tournament.
pub fn tournament_topic(t: TournamentId) -> String {
    format!("tournament:{t}")
}

/// Topic for one (tournament, game) round stream.
pub fn round_topic(t: TournamentId, g: GameId) -> String {
    format!("round:{t}:{g}")
}

/// Events published after results commit. Serializes to the
/// `{"type": ..., "payload": {...}}` shape the gateway forwards verbatim.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Event {
    /// A match reached a terminal state.
    MatchCompleted {
        match_id: MatchId,
        tournament_id: TournamentId,
        game_id: GameId,
        winner: Option<Winner>,
        score1: i64,
        score2: i64,
    },
    /// Every match of a round reached a terminal state.
    RoundCompleted {
        tournament_id: TournamentId,
        game_id: GameId,
        round_number: u32,
        completed: u32,
        failed: u32,
    },
    /// A rating pair changed; standings consumers should refresh.
    LeaderboardUpdate {
        tournament_id: TournamentId,
        game_id: GameId,
        /// Ratings after the update, by team id.
        ratings_after: Vec<(u64, f64)>,
    },
}

/// Topic-keyed hub of bounded subscriber channels.
#[derive(Debug, Default)]
pub struct Broadcaster {
    topics: RwLock<HashMap<String, Vec<(u64, SyncSender<Event>)>>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    /// A hub with no topics yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for `topic`. Dropping the receiver
    /// unsubscribes it on the next publish.
    pub fn subscribe(&self, topic: &str) -> Receiver<Event> {
        let (tx, rx) = sync_channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .write()
            .expect("poisoned")
            .entry(topic.to_string())
            .or_default()
            .push((id, tx));
        rx
    }

    /// Non-blocking fan-out to every current subscriber of `topic`.
    ///
    /// Full buffers drop the event for that subscriber; disconnected
    /// subscribers are pruned.
    pub fn publish(&self, topic: &str, event: &Event) {
        let senders = {
            let guard = self.topics.read().expect("poisoned");
            match guard.get(topic) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        let mut dead = Vec::new();
        for (id, tx) in &senders {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    trace!(topic, subscriber = id, "subscriber buffer full, dropping event");
                }
                Err(TrySendError::Disconnected(_)) => {
                    dead.push(*id);
                }
            }
        }

        if !dead.is_empty() {
            let mut guard = self.topics.write().expect("poisoned");
            if let Some(list) = guard.get_mut(topic) {
                list.retain(|(id, _)| !dead.contains(id));
                if list.is_empty() {
                    guard.remove(topic);
                }
            }
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .expect("poisoned")
            .get(topic)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(match_id: MatchId) -> Event {
        Event::MatchCompleted {
            match_id,
            tournament_id: 1,
            game_id: 1,
            winner: Some(Winner::Player1),
            score1: 10,
            score2: 4,
        }
    }

    #[test]
    fn fan_out_reaches_all_subscribers() {
        let hub = Broadcaster::new();
        let rx1 = hub.subscribe("round:1:1");
        let rx2 = hub.subscribe("round:1:1");
        let ev = completed(uuid::Uuid::new_v4());
        hub.publish("round:1:1", &ev);
        assert_eq!(rx1.try_recv().unwrap(), ev);
        assert_eq!(rx2.try_recv().unwrap(), ev);
    }

    #[test]
    fn slow_subscriber_drops_but_does_not_block() {
        let hub = Broadcaster::new();
        let rx = hub.subscribe("t");
        for _ in 0..SUBSCRIBER_BUFFER + 10 {
            hub.publish("t", &completed(uuid::Uuid::new_v4()));
        }
        // Exactly the buffered window is readable.
        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, SUBSCRIBER_BUFFER);
    }

    #[test]
    fn dropped_receiver_is_pruned() {
        let hub = Broadcaster::new();
        let rx = hub.subscribe("t");
        drop(rx);
        hub.publish("t", &completed(uuid::Uuid::new_v4()));
        assert_eq!(hub.subscriber_count("t"), 0);
    }

    #[test]
    fn within_topic_order_is_preserved() {
        let hub = Broadcaster::new();
        let rx = hub.subscribe("t");
        let a = completed(uuid::Uuid::new_v4());
        let b = completed(uuid::Uuid::new_v4());
        hub.publish("t", &a);
        hub.publish("t", &b);
        assert_eq!(rx.try_recv().unwrap(), a);
        assert_eq!(rx.try_recv().unwrap(), b);
    }

    #[test]
    fn event_json_shape() {
        let ev = Event::MatchCompleted {
            match_id: uuid::Uuid::nil(),
            tournament_id: 3,
            game_id: 1,
            winner: Some(Winner::Draw),
            score1: 5,
            score2: 5,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "match_completed");
        assert_eq!(json["payload"]["winner"], "draw");
        assert_eq!(json["payload"]["tournament_id"], 3);
    }
}
