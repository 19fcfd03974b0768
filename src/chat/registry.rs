use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::chat::protocol::{Frame, room_topic};
use crate::models::RoomId;
use crate::models::messages::ChatMessage;

/// An inbound frame that could not be turned into a [`ChatMessage`]. Never
/// propagated: the connection logs it and moves on to the next frame.
#[derive(Debug, Error)]
pub enum MalformedMessageError {
    #[error("MESSAGE frame has no subscription header")]
    MissingSubscription,
    #[error("payload is not a chat message: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Outcome of routing one MESSAGE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered(RoomId),
    /// The frame names a subscription that is no longer registered.
    UnknownSubscription,
    /// The room's feed was dropped without unsubscribing.
    FeedClosed(RoomId),
}

/// Live messages for one room, in the order the transport delivered them.
/// The feed ends (`recv` returns `None`) once the room is unsubscribed or
/// re-subscribed elsewhere.
#[derive(Debug)]
pub struct RoomFeed {
    room_id: RoomId,
    subscription_id: String,
    receiver: mpsc::UnboundedReceiver<ChatMessage>,
}

impl RoomFeed {
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub async fn recv(&mut self) -> Option<ChatMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChatMessage> {
        self.receiver.try_recv().ok()
    }
}

/// A registered room subscription.
#[derive(Debug)]
pub struct RoomSubscription {
    pub room_id: RoomId,
    pub id: String,
    pub destination: String,
    sender: mpsc::UnboundedSender<ChatMessage>,
}

#[derive(Debug, Default)]
struct Maps {
    by_room: HashMap<RoomId, RoomSubscription>,
    by_id: HashMap<String, RoomId>,
}

/// Room id -> live subscription, at most one per room.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    maps: Mutex<Maps>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a fresh subscription for `room_id`, replacing any existing
    /// one. `send` gets the UNSUBSCRIBE for the replaced id and then the
    /// SUBSCRIBE for the new one, both queued under the registry lock so
    /// concurrent callers cannot interleave them. The old feed closes once
    /// the returned subscription is dropped.
    pub fn register<F>(&self, room_id: RoomId, mut send: F) -> (RoomFeed, Option<RoomSubscription>)
    where
        F: FnMut(&Frame) -> bool,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = RoomSubscription {
            room_id,
            id: format!("sub-{}", Uuid::new_v4()),
            destination: room_topic(room_id),
            sender: tx,
        };

        let feed = RoomFeed {
            room_id,
            subscription_id: subscription.id.clone(),
            receiver: rx,
        };

        let mut maps = self.lock();
        maps.by_id.insert(subscription.id.clone(), room_id);
        let subscribe = Frame::subscribe(&subscription.id, &subscription.destination);
        let replaced = maps.by_room.insert(room_id, subscription);
        if let Some(old) = &replaced {
            maps.by_id.remove(&old.id);
            send(&Frame::unsubscribe(&old.id));
        }
        send(&subscribe);
        (feed, replaced)
    }

    /// Remove the room's subscription, queueing its UNSUBSCRIBE through
    /// `send` before the lock is released.
    pub fn remove<F>(&self, room_id: RoomId, mut send: F) -> Option<RoomSubscription>
    where
        F: FnMut(&Frame) -> bool,
    {
        let mut maps = self.lock();
        let removed = maps.by_room.remove(&room_id)?;
        maps.by_id.remove(&removed.id);
        send(&Frame::unsubscribe(&removed.id));
        Some(removed)
    }

    /// Like [`remove`](Self::remove), but only if the room's subscription is
    /// still `subscription_id`.
    pub fn remove_if<F>(
        &self,
        room_id: RoomId,
        subscription_id: &str,
        mut send: F,
    ) -> Option<RoomSubscription>
    where
        F: FnMut(&Frame) -> bool,
    {
        let mut maps = self.lock();
        if maps.by_room.get(&room_id)?.id != subscription_id {
            return None;
        }
        maps.by_id.remove(subscription_id);
        let removed = maps.by_room.remove(&room_id)?;
        send(&Frame::unsubscribe(&removed.id));
        Some(removed)
    }

    /// Empty the registry, sending an UNSUBSCRIBE for every entry, and hand
    /// back what was in it.
    pub fn take_all<F>(&self, mut send: F) -> Vec<RoomSubscription>
    where
        F: FnMut(&Frame) -> bool,
    {
        let mut maps = self.lock();
        maps.by_id.clear();
        let removed: Vec<RoomSubscription> = maps.by_room.drain().map(|(_, sub)| sub).collect();
        for sub in &removed {
            send(&Frame::unsubscribe(&sub.id));
        }
        removed
    }

    /// Send SUBSCRIBE again for every entry. Returns how many `send`
    /// accepted.
    pub fn resubscribe<F>(&self, mut send: F) -> usize
    where
        F: FnMut(&Frame) -> bool,
    {
        let maps = self.lock();
        maps.by_room
            .values()
            .filter(|sub| send(&Frame::subscribe(&sub.id, &sub.destination)))
            .count()
    }

    pub fn contains(&self, room_id: RoomId) -> bool {
        self.lock().by_room.contains_key(&room_id)
    }

    pub fn len(&self) -> usize {
        self.lock().by_room.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route a MESSAGE frame to the feed named by its `subscription` header.
    pub fn dispatch(&self, frame: &Frame) -> Result<Delivery, MalformedMessageError> {
        let subscription_id = frame
            .get("subscription")
            .ok_or(MalformedMessageError::MissingSubscription)?;

        let message: ChatMessage = serde_json::from_str(&frame.body)?;

        // Send under the lock so a concurrent re-subscribe cannot leave this
        // message on a feed that was just replaced.
        let maps = self.lock();
        let Some(room_id) = maps.by_id.get(subscription_id).copied() else {
            return Ok(Delivery::UnknownSubscription);
        };
        let Some(subscription) = maps.by_room.get(&room_id) else {
            return Ok(Delivery::UnknownSubscription);
        };
        if subscription.sender.send(message).is_err() {
            return Ok(Delivery::FeedClosed(room_id));
        }
        Ok(Delivery::Delivered(room_id))
    }
}
