//! Per-chain traffic counters.

use serde::Serialize;

use crate::queue::FrameTag;

/// Metrics snapshot for one chain's connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionMetrics {
    /// Valid event frames handed to handlers.
    pub frames_received: u64,
    /// Inbound frames dropped by validation.
    pub frames_malformed: u64,
    /// Broker acknowledgements and notices.
    pub control_frames: u64,
    pub subscribe_frames_sent: u64,
    pub unsubscribe_frames_sent: u64,
    /// Subscribe/unsubscribe pairs cancelled before reaching the wire.
    pub frames_elided: u64,
    /// Subscribe frames queued by reconnect replay.
    pub resubscriptions: u64,
    /// Times the socket was lost after being open, or failed to open.
    pub reconnections: u64,
    /// Releases of keys with no live entry.
    pub unknown_releases: u64,
}

impl ConnectionMetrics {
    /// Count a frame that reached the socket.
    pub fn record_sent(&mut self, tag: &FrameTag) {
        match tag {
            FrameTag::Subscribe(_) => self.subscribe_frames_sent += 1,
            FrameTag::Unsubscribe(_) => self.unsubscribe_frames_sent += 1,
            FrameTag::Raw => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes_every_counter() {
        let mut m = ConnectionMetrics::default();
        m.record_sent(&FrameTag::Subscribe("a".into()));
        m.record_sent(&FrameTag::Raw);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["subscribe_frames_sent"], 1);
        assert_eq!(json["unsubscribe_frames_sent"], 0);
        assert_eq!(json.as_object().unwrap().len(), 9);
    }
}
