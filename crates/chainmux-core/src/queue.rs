//! Outbound send queue.
//!
//! Holds frames that have not reached the socket yet, in enqueue order.
//! Subscription frames are tagged with their key so the queue can cancel a
//! pending subscribe against a later unsubscribe, and so a reconnect replay
//! can skip keys whose subscribe is still waiting to go out.

use std::collections::VecDeque;

use crate::error::MuxError;
use crate::key::SubscriptionKey;

/// What a queued frame does to server-side subscription state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameTag {
    Subscribe(SubscriptionKey),
    Unsubscribe(SubscriptionKey),
    /// Anything else (pings, application messages).
    Raw,
}

impl FrameTag {
    pub fn key(&self) -> Option<&SubscriptionKey> {
        match self {
            Self::Subscribe(k) | Self::Unsubscribe(k) => Some(k),
            Self::Raw => None,
        }
    }
}

/// A serialized frame waiting for transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedFrame {
    pub tag: FrameTag,
    pub payload: String,
}

impl QueuedFrame {
    pub fn new(tag: FrameTag, payload: impl Into<String>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }
}

/// What [`SendQueue::push`] did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// An unsubscribe cancelled a subscribe that had not been sent yet;
    /// neither frame will reach the wire.
    Elided,
}

/// FIFO of untransmitted frames.
#[derive(Debug, Default)]
pub struct SendQueue {
    frames: VecDeque<QueuedFrame>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame.
    ///
    /// An unsubscribe whose newest pending frame for the same key is a
    /// subscribe removes that subscribe instead of being queued. A subscribe
    /// whose newest pending frame for the key is already a subscribe is
    /// rejected with [`MuxError::DuplicateSubscribe`].
    pub fn push(&mut self, frame: QueuedFrame) -> Result<Enqueued, MuxError> {
        match &frame.tag {
            FrameTag::Subscribe(key) => {
                if let Some((_, FrameTag::Subscribe(_))) = self.newest_for(key) {
                    return Err(MuxError::DuplicateSubscribe { key: key.clone() });
                }
            }
            FrameTag::Unsubscribe(key) => {
                if let Some((idx, FrameTag::Subscribe(_))) = self.newest_for(key) {
                    self.frames.remove(idx);
                    return Ok(Enqueued::Elided);
                }
            }
            FrameTag::Raw => {}
        }
        self.frames.push_back(frame);
        Ok(Enqueued::Queued)
    }

    /// Append a replayed subscribe unless a frame for its key is still
    /// pending. Returns whether the frame was queued.
    pub fn push_replay(&mut self, frame: QueuedFrame) -> bool {
        if let Some(key) = frame.tag.key() {
            if self.has_pending(key) {
                return false;
            }
        }
        self.frames.push_back(frame);
        true
    }

    pub fn pop_front(&mut self) -> Option<QueuedFrame> {
        self.frames.pop_front()
    }

    /// Return a frame whose write failed to the head of the queue.
    pub fn push_front(&mut self, frame: QueuedFrame) {
        self.frames.push_front(frame);
    }

    pub fn has_pending(&self, key: &SubscriptionKey) -> bool {
        self.frames.iter().any(|f| f.tag.key() == Some(key))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedFrame> {
        self.frames.iter()
    }

    fn newest_for(&self, key: &SubscriptionKey) -> Option<(usize, &FrameTag)> {
        self.frames
            .iter()
            .enumerate()
            .rev()
            .find(|(_, f)| f.tag.key() == Some(key))
            .map(|(i, f)| (i, &f.tag))
    }
}
