//! DM room (C7): per-pair ciphertext history.
//!
//! A plain struct, not its own task — it is only ever touched from within
//! the single chat-room-actor task, so the single-writer invariant already
//! holds structurally. It never interprets `nonce`/`ciphertext`; it is an
//! append-only ciphertext log bounded to the configured history length.

use std::collections::VecDeque;

use moltis_protocol::CiphertextFrame;

pub struct DmRoom {
    history: VecDeque<CiphertextFrame>,
    cap: usize,
    pending_persist_count: u32,
}

impl DmRoom {
    pub fn new(cap: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(cap.min(64)),
            cap,
            pending_persist_count: 0,
        }
    }

    pub fn from_snapshot(history: Vec<CiphertextFrame>, cap: usize) -> Self {
        let mut room = Self::new(cap);
        room.history.extend(history);
        room.truncate();
        room
    }

    pub fn history(&self) -> Vec<CiphertextFrame> {
        self.history.iter().cloned().collect()
    }

    /// Append a frame. Returns `true` when the caller should persist a
    /// snapshot (every `persist_every_n` appends).
    pub fn append(&mut self, frame: CiphertextFrame, persist_every_n: u32) -> bool {
        self.history.push_back(frame);
        self.truncate();
        self.pending_persist_count += 1;
        if self.pending_persist_count >= persist_every_n.max(1) {
            self.pending_persist_count = 0;
            true
        } else {
            false
        }
    }

    fn truncate(&mut self) {
        while self.history.len() > self.cap {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: &str) -> CiphertextFrame {
        CiphertextFrame {
            id: id.into(),
            pair_id: "dm:v1:1:2".into(),
            sender: moltis_protocol::UserIdentity {
                account_id: moltis_protocol::AccountId::parse("1").unwrap(),
                login: "a".into(),
                avatar_url: "https://example.com/a.png".into(),
                roles: vec![],
            },
            recipient_account_id: "2".into(),
            sender_identity: moltis_protocol::PublicIdentity {
                suite: "v1".into(),
                public_key: "a".repeat(44),
            },
            recipient_identity: moltis_protocol::PublicIdentity {
                suite: "v1".into(),
                public_key: "b".repeat(44),
            },
            nonce: "c".repeat(32),
            ciphertext: "d".repeat(8),
            created_at: "2024-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn history_is_bounded() {
        let mut room = DmRoom::new(2);
        room.append(frame("1"), 1);
        room.append(frame("2"), 1);
        room.append(frame("3"), 1);
        let history = room.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, "2");
        assert_eq!(history[1].id, "3");
    }

    #[test]
    fn persist_signal_fires_every_n() {
        let mut room = DmRoom::new(10);
        assert!(!room.append(frame("1"), 3));
        assert!(!room.append(frame("2"), 3));
        assert!(room.append(frame("3"), 3));
    }
}
