//! Downstream Connection Hub
//!
//! Registry of live downstream connections and the per-instrument fan-out
//! groups they belong to.
//!
//! Every connection owns a bounded outbound queue drained by its socket
//! writer task. Fan-out uses `try_send`: a connection whose queue is full
//! misses that frame rather than slowing the other members down.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::domain::streaming::Instrument;

/// Outbound queue depth per connection.
pub const OUTBOUND_CAPACITY: usize = 1024;

/// Unique id of one downstream connection.
pub type ConnectionId = Uuid;

/// A freshly registered connection.
#[derive(Debug)]
pub struct Registration {
    /// Connection id.
    pub id: ConnectionId,
    /// Queue for frames addressed to this connection only (responses).
    pub outbound: mpsc::Sender<String>,
    /// Everything to be written to the socket, in order.
    pub frames: mpsc::Receiver<String>,
}

#[derive(Debug, Default)]
struct HubState {
    connections: HashMap<ConnectionId, mpsc::Sender<String>>,
    groups: HashMap<Instrument, HashSet<ConnectionId>>,
}

/// Connection registry and fan-out groups.
#[derive(Debug, Default)]
pub struct ConnectionHub {
    state: RwLock<HubState>,
}

impl ConnectionHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection.
    #[must_use]
    pub fn register(&self) -> Registration {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let id = Uuid::new_v4();
        self.state.write().connections.insert(id, tx.clone());
        Registration {
            id,
            outbound: tx,
            frames: rx,
        }
    }

    /// Drop a connection and its group memberships.
    ///
    /// Returns the instruments it was subscribed to, sorted.
    pub fn unregister(&self, id: ConnectionId) -> Vec<Instrument> {
        let mut state = self.state.write();
        state.connections.remove(&id);

        let mut instruments = Vec::new();
        state.groups.retain(|instrument, members| {
            if members.remove(&id) {
                instruments.push(*instrument);
            }
            !members.is_empty()
        });
        drop(state);

        instruments.sort_unstable();
        instruments
    }

    /// Add a connection to an instrument's group. False if it already was
    /// a member or is not registered.
    pub fn join(&self, id: ConnectionId, instrument: Instrument) -> bool {
        let mut state = self.state.write();
        if !state.connections.contains_key(&id) {
            return false;
        }
        state.groups.entry(instrument).or_default().insert(id)
    }

    /// Remove a connection from an instrument's group. False if it was not
    /// a member.
    pub fn leave(&self, id: ConnectionId, instrument: Instrument) -> bool {
        let mut state = self.state.write();
        let Some(members) = state.groups.get_mut(&instrument) else {
            return false;
        };
        let removed = members.remove(&id);
        if members.is_empty() {
            state.groups.remove(&instrument);
        }
        removed
    }

    /// Whether a connection is in an instrument's group.
    #[must_use]
    pub fn is_member(&self, id: ConnectionId, instrument: Instrument) -> bool {
        self.state
            .read()
            .groups
            .get(&instrument)
            .is_some_and(|members| members.contains(&id))
    }

    /// Queue `frame` for every member of `instrument`'s group.
    ///
    /// Returns how many connections accepted it.
    pub fn send_to_group(&self, instrument: Instrument, frame: &str) -> usize {
        let state = self.state.read();
        let Some(members) = state.groups.get(&instrument) else {
            return 0;
        };

        members
            .iter()
            .filter_map(|id| state.connections.get(id).map(|tx| (id, tx)))
            .filter(|(id, tx)| offer(**id, tx, frame))
            .count()
    }

    /// Queue `frame` for every registered connection.
    ///
    /// Returns how many connections accepted it.
    pub fn send_to_all(&self, frame: &str) -> usize {
        self.state
            .read()
            .connections
            .iter()
            .filter(|(id, tx)| offer(**id, tx, frame))
            .count()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.read().connections.len()
    }

    /// Number of connections in an instrument's group.
    #[must_use]
    pub fn group_size(&self, instrument: Instrument) -> usize {
        self.state
            .read()
            .groups
            .get(&instrument)
            .map_or(0, HashSet::len)
    }
}

fn offer(id: ConnectionId, tx: &mpsc::Sender<String>, frame: &str) -> bool {
    match tx.try_send(frame.to_string()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::warn!(connection_id = %id, "Outbound queue full, dropping frame");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_fanout_reaches_members_only() {
        let hub = ConnectionHub::new();
        let mut a = hub.register();
        let mut b = hub.register();

        assert!(hub.join(a.id, Instrument::BtcUsd));
        assert_eq!(hub.send_to_group(Instrument::BtcUsd, "trade"), 1);

        assert_eq!(a.frames.try_recv().unwrap(), "trade");
        assert!(b.frames.try_recv().is_err());
    }

    #[test]
    fn send_to_all_ignores_groups() {
        let hub = ConnectionHub::new();
        let mut a = hub.register();
        let mut b = hub.register();
        hub.join(a.id, Instrument::EthUsd);

        assert_eq!(hub.send_to_all("lost"), 2);
        assert_eq!(a.frames.try_recv().unwrap(), "lost");
        assert_eq!(b.frames.try_recv().unwrap(), "lost");
    }

    #[test]
    fn join_is_idempotent() {
        let hub = ConnectionHub::new();
        let a = hub.register();

        assert!(hub.join(a.id, Instrument::BtcUsd));
        assert!(!hub.join(a.id, Instrument::BtcUsd));
        assert_eq!(hub.group_size(Instrument::BtcUsd), 1);
    }

    #[test]
    fn join_requires_registration() {
        let hub = ConnectionHub::new();
        assert!(!hub.join(Uuid::new_v4(), Instrument::BtcUsd));
        assert_eq!(hub.group_size(Instrument::BtcUsd), 0);
    }

    #[test]
    fn leave_reports_membership() {
        let hub = ConnectionHub::new();
        let a = hub.register();
        hub.join(a.id, Instrument::BtcUsd);

        assert!(hub.leave(a.id, Instrument::BtcUsd));
        assert!(!hub.leave(a.id, Instrument::BtcUsd));
        assert!(!hub.is_member(a.id, Instrument::BtcUsd));
    }

    #[test]
    fn unregister_returns_memberships() {
        let hub = ConnectionHub::new();
        let a = hub.register();
        let b = hub.register();
        hub.join(a.id, Instrument::EthUsd);
        hub.join(a.id, Instrument::BtcUsd);
        hub.join(b.id, Instrument::BtcUsd);

        let instruments = hub.unregister(a.id);

        assert_eq!(instruments, vec![Instrument::EthUsd, Instrument::BtcUsd]);
        assert_eq!(hub.connection_count(), 1);
        assert_eq!(hub.group_size(Instrument::EthUsd), 0);
        assert_eq!(hub.group_size(Instrument::BtcUsd), 1);
    }

    #[test]
    fn full_queue_drops_frame_for_that_connection_only() {
        let hub = ConnectionHub::new();
        let slow = hub.register();
        let mut fast = hub.register();

        for _ in 0..OUTBOUND_CAPACITY {
            slow.outbound.try_send("filler".to_string()).unwrap();
        }

        assert_eq!(hub.send_to_all("frame"), 1);
        assert_eq!(fast.frames.try_recv().unwrap(), "frame");
    }
}
