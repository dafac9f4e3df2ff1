//! In-memory relay store
//!
//! Shared state behind the signaling relay. Offers and answers are kept per
//! (kind, from, to) with last-write-wins semantics and handed out exactly
//! once; ICE candidates accumulate per (from, to) and drain as a batch.
//! When the addressee holds a push subscription, messages bypass storage.

use crate::signaling::protocol::{Participant, SignalEnvelope, SignalKind};
use crate::{Error, Result};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capacity limits enforced at join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayLimits {
    /// Maximum number of live rooms (default: 1000)
    pub max_rooms: usize,
    /// Maximum participants per room (default: 2)
    pub max_participants_per_room: usize,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            max_rooms: 1000,
            max_participants_per_room: 2,
        }
    }
}

/// How a published message reached its addressee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Sent straight to a live subscription
    Pushed,
    /// Stored until fetched or subscribed
    Stored,
}

/// Result of a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published {
    pub seq: u64,
    pub delivery: Delivery,
}

/// Live push subscription handed to a subscriber
#[derive(Debug)]
pub struct Subscription {
    /// Token for [`RelayStore::unsubscribe`]
    pub id: u64,
    /// Stream of envelopes addressed to the subscriber
    pub receiver: mpsc::UnboundedReceiver<SignalEnvelope>,
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<SignalEnvelope>,
}

type DescriptionKey = (SignalKind, String, String);
type CandidateKey = (String, String);

#[derive(Default)]
struct RoomState {
    /// Members in first-join order
    participants: Vec<Participant>,
    descriptions: HashMap<DescriptionKey, SignalEnvelope>,
    candidates: HashMap<CandidateKey, Vec<SignalEnvelope>>,
    subscribers: HashMap<String, Subscriber>,
}

impl RoomState {
    fn is_member(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    fn others(&self, user_id: &str) -> Vec<Participant> {
        self.participants
            .iter()
            .filter(|p| p.user_id != user_id)
            .cloned()
            .collect()
    }

    fn purge_user(&mut self, user_id: &str) -> usize {
        let before = self.descriptions.len()
            + self.candidates.values().map(Vec::len).sum::<usize>();
        self.descriptions
            .retain(|(_, from, to), _| from != user_id && to != user_id);
        self.candidates
            .retain(|(from, to), _| from != user_id && to != user_id);
        let after = self.descriptions.len()
            + self.candidates.values().map(Vec::len).sum::<usize>();
        before - after
    }

    fn take_pending_for(&mut self, user_id: &str) -> Vec<SignalEnvelope> {
        let mut pending = Vec::new();

        let keys: Vec<DescriptionKey> = self
            .descriptions
            .keys()
            .filter(|(_, _, to)| to == user_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(envelope) = self.descriptions.remove(&key) {
                pending.push(envelope);
            }
        }

        let keys: Vec<CandidateKey> = self
            .candidates
            .keys()
            .filter(|(_, to)| to == user_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(batch) = self.candidates.remove(&key) {
                pending.extend(batch);
            }
        }

        pending.sort_by_key(|e| e.seq);
        pending
    }

    fn store(&mut self, envelope: SignalEnvelope) {
        match envelope.kind {
            SignalKind::Offer | SignalKind::Answer => {
                let key = (
                    envelope.kind,
                    envelope.from_user_id.clone(),
                    envelope.to_user_id.clone(),
                );
                let new_seq = envelope.seq;
                if let Some(previous) = self.descriptions.insert(key, envelope) {
                    warn!(
                        kind = %previous.kind,
                        from = %previous.from_user_id,
                        to = %previous.to_user_id,
                        replaced_seq = previous.seq,
                        new_seq,
                        "Undelivered signal overwritten"
                    );
                }
            }
            SignalKind::IceCandidate => {
                let key = (envelope.from_user_id.clone(), envelope.to_user_id.clone());
                self.candidates.entry(key).or_default().push(envelope);
            }
        }
    }
}

/// Shared store for all relay rooms
pub struct RelayStore {
    rooms: DashMap<String, RoomState>,
    seq: AtomicU64,
    next_subscription: AtomicU64,
    limits: RelayLimits,
}

impl Default for RelayStore {
    fn default() -> Self {
        Self::new(RelayLimits::default())
    }
}

impl RelayStore {
    /// Create an empty store with the given limits
    pub fn new(limits: RelayLimits) -> Self {
        Self {
            rooms: DashMap::new(),
            seq: AtomicU64::new(0),
            next_subscription: AtomicU64::new(1),
            limits,
        }
    }

    /// Capacity limits
    pub fn limits(&self) -> RelayLimits {
        self.limits
    }

    /// Add `user_id` to `room`, creating the room if needed
    ///
    /// Idempotent: re-joining refreshes `joined_at` and the display name.
    /// Returns the other participants in join order.
    pub fn join(&self, room: &str, user_id: &str, user_name: &str) -> Result<Vec<Participant>> {
        if !self.rooms.contains_key(room) && self.rooms.len() >= self.limits.max_rooms {
            return Err(Error::RoomFull(format!(
                "relay at capacity ({} rooms)",
                self.limits.max_rooms
            )));
        }

        let mut state = self.rooms.entry(room.to_string()).or_default();
        let now = Utc::now();

        if let Some(existing) = state.participants.iter_mut().find(|p| p.user_id == user_id) {
            existing.joined_at = now;
            existing.user_name = user_name.to_string();
            debug!(room = %room, user_id = %user_id, "Participant re-joined");
        } else {
            if state.participants.len() >= self.limits.max_participants_per_room {
                return Err(Error::RoomFull(format!(
                    "room {} already has {} participants",
                    room,
                    state.participants.len()
                )));
            }
            state.participants.push(Participant {
                user_id: user_id.to_string(),
                user_name: user_name.to_string(),
                joined_at: now,
            });
            info!(
                room = %room,
                user_id = %user_id,
                participants = state.participants.len(),
                "Participant joined"
            );
        }

        Ok(state.others(user_id))
    }

    /// Remove `user_id` from `room`
    ///
    /// Pending messages sent by or addressed to the user are purged. The
    /// room is discarded once empty. Returns whether the user was present.
    pub fn leave(&self, room: &str, user_id: &str) -> bool {
        let was_member = {
            let Some(mut state) = self.rooms.get_mut(room) else {
                return false;
            };
            let before = state.participants.len();
            state.participants.retain(|p| p.user_id != user_id);
            let purged = state.purge_user(user_id);
            state.subscribers.remove(user_id);
            let was_member = state.participants.len() != before;
            if was_member {
                info!(room = %room, user_id = %user_id, purged, "Participant left");
            }
            was_member
        };

        if self
            .rooms
            .remove_if(room, |_, state| state.participants.is_empty())
            .is_some()
        {
            info!(room = %room, "Room discarded");
        }

        was_member
    }

    /// Publish a message from `from` to `to`
    ///
    /// # Errors
    ///
    /// - [`Error::SessionNotFound`] if the room does not exist
    /// - [`Error::PeerNotFound`] if `from` is not a participant
    pub fn publish(
        &self,
        room: &str,
        kind: SignalKind,
        from: &str,
        to: &str,
        payload: Value,
    ) -> Result<Published> {
        let mut state = self
            .rooms
            .get_mut(room)
            .ok_or_else(|| Error::SessionNotFound(room.to_string()))?;

        if !state.is_member(from) {
            return Err(Error::PeerNotFound(format!("{} is not in room {}", from, room)));
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = SignalEnvelope {
            seq,
            session_id: room.to_string(),
            from_user_id: from.to_string(),
            to_user_id: to.to_string(),
            kind,
            payload,
            timestamp: Utc::now(),
        };

        if let Some(subscriber) = state.subscribers.get(to) {
            match subscriber.tx.send(envelope) {
                Ok(()) => {
                    debug!(room = %room, kind = %kind, from = %from, to = %to, seq, "Signal pushed");
                    return Ok(Published {
                        seq,
                        delivery: Delivery::Pushed,
                    });
                }
                Err(mpsc::error::SendError(envelope)) => {
                    debug!(room = %room, to = %to, "Subscriber gone, storing signal");
                    state.subscribers.remove(to);
                    state.store(envelope);
                }
            }
        } else {
            state.store(envelope);
        }

        debug!(room = %room, kind = %kind, from = %from, to = %to, seq, "Signal stored");
        Ok(Published {
            seq,
            delivery: Delivery::Stored,
        })
    }

    /// Consume the stored offer or answer from `from` to `to`
    pub fn take_description(
        &self,
        room: &str,
        kind: SignalKind,
        from: &str,
        to: &str,
    ) -> Option<SignalEnvelope> {
        let mut state = self.rooms.get_mut(room)?;
        state
            .descriptions
            .remove(&(kind, from.to_string(), to.to_string()))
    }

    /// Drain every stored ICE candidate from `from` to `to`, in send order
    pub fn drain_candidates(&self, room: &str, from: &str, to: &str) -> Vec<SignalEnvelope> {
        let Some(mut state) = self.rooms.get_mut(room) else {
            return Vec::new();
        };
        state
            .candidates
            .remove(&(from.to_string(), to.to_string()))
            .unwrap_or_default()
    }

    /// Consume stored messages of `kind` from `from` to `to`
    pub fn take(&self, room: &str, kind: SignalKind, from: &str, to: &str) -> Vec<SignalEnvelope> {
        match kind {
            SignalKind::Offer | SignalKind::Answer => self
                .take_description(room, kind, from, to)
                .into_iter()
                .collect(),
            SignalKind::IceCandidate => self.drain_candidates(room, from, to),
        }
    }

    /// Open a push subscription for `user_id`
    ///
    /// Stored messages addressed to the user are moved into the new
    /// subscription in sequence order. An existing subscription for the same
    /// user is replaced.
    pub fn subscribe(&self, room: &str, user_id: &str) -> Result<Subscription> {
        let mut state = self
            .rooms
            .get_mut(room)
            .ok_or_else(|| Error::SessionNotFound(room.to_string()))?;

        if !state.is_member(user_id) {
            return Err(Error::PeerNotFound(format!(
                "{} is not in room {}",
                user_id, room
            )));
        }

        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let (tx, receiver) = mpsc::unbounded_channel();

        let pending = state.take_pending_for(user_id);
        let flushed = pending.len();
        for envelope in pending {
            // Receiver is held locally, send cannot fail
            let _ = tx.send(envelope);
        }

        state
            .subscribers
            .insert(user_id.to_string(), Subscriber { id, tx });
        debug!(room = %room, user_id = %user_id, subscription = id, flushed, "Subscribed");

        Ok(Subscription { id, receiver })
    }

    /// Drop the subscription `id` if it is still the user's current one
    pub fn unsubscribe(&self, room: &str, user_id: &str, id: u64) {
        if let Some(mut state) = self.rooms.get_mut(room) {
            if state.subscribers.get(user_id).is_some_and(|s| s.id == id) {
                state.subscribers.remove(user_id);
                debug!(room = %room, user_id = %user_id, subscription = id, "Unsubscribed");
            }
        }
    }

    /// Participants of `room` in join order
    pub fn participants(&self, room: &str) -> Vec<Participant> {
        self.rooms
            .get(room)
            .map(|state| state.participants.clone())
            .unwrap_or_default()
    }

    /// Number of live rooms
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Whether `room` exists
    pub fn has_room(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }
}
