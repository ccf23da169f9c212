//! Connection lifecycle state machine.
//!
//! States move strictly forward; `Closed` is terminal and absorbing.
//! Skipping states is legal (listener-origin connections go straight from
//! `Created` to `Handshaking` because their socket is already open).
//!
//! The `Handshaking` entry action starts the read loop *before* the first
//! handshake send goes out: the handshake itself is a request/response
//! pair over that loop, and its response would otherwise never be read.

use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::watch;

/// Lifecycle of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    /// Constructed, no socket activity yet.
    Created = 0,
    /// Resolving and dialing (dialer-origin only).
    Connecting = 1,
    /// Socket open, read loop running, authentication exchange pending.
    Handshaking = 2,
    /// Authenticated and fully usable.
    Connected = 3,
    /// Terminal. Socket shut down, pending requests failed.
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Created,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Handshaking,
            3 => ConnectionState::Connected,
            _ => ConnectionState::Closed,
        }
    }

    /// Whether frames may be written in this state. Handshake traffic
    /// flows before `Connected`, so both phases allow sending.
    pub fn allows_send(self) -> bool {
        matches!(
            self,
            ConnectionState::Handshaking | ConnectionState::Connected
        )
    }

    /// Whether this is the absorbing final state.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Created => "created",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Atomic state holder with change notification.
///
/// Transitions compare-and-swap the current state and publish the change
/// on a watch channel. Observers see every committed transition and never
/// block the transitioning task.
#[derive(Debug)]
pub(crate) struct StateCell {
    current: AtomicU8,
    notify: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (notify, _) = watch::channel(ConnectionState::Created);
        Self {
            current: AtomicU8::new(ConnectionState::Created as u8),
            notify,
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.current.load(Ordering::Acquire))
    }

    /// Attempt a forward transition. Returns `false` when the connection
    /// is already at or past `next`; backward movement never happens.
    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        let target = next as u8;
        let mut current = self.current.load(Ordering::Acquire);
        loop {
            if current >= target {
                return false;
            }
            match self.current.compare_exchange(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.notify.send_replace(next);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.notify.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_succeed_in_order() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ConnectionState::Created);

        assert!(cell.transition(ConnectionState::Connecting));
        assert!(cell.transition(ConnectionState::Handshaking));
        assert!(cell.transition(ConnectionState::Connected));
        assert!(cell.transition(ConnectionState::Closed));
        assert_eq!(cell.get(), ConnectionState::Closed);
    }

    #[test]
    fn backward_transitions_are_rejected() {
        let cell = StateCell::new();
        assert!(cell.transition(ConnectionState::Connected));
        assert!(!cell.transition(ConnectionState::Handshaking));
        assert!(!cell.transition(ConnectionState::Connected));
        assert_eq!(cell.get(), ConnectionState::Connected);
    }

    #[test]
    fn states_may_be_skipped() {
        // Listener-origin path: socket already open.
        let cell = StateCell::new();
        assert!(cell.transition(ConnectionState::Handshaking));
        assert_eq!(cell.get(), ConnectionState::Handshaking);
    }

    #[test]
    fn closed_is_absorbing() {
        let cell = StateCell::new();
        assert!(cell.transition(ConnectionState::Closed));
        assert!(!cell.transition(ConnectionState::Connecting));
        assert!(!cell.transition(ConnectionState::Closed));
        assert_eq!(cell.get(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn observers_see_transitions() {
        let cell = StateCell::new();
        let mut receiver = cell.subscribe();

        assert!(cell.transition(ConnectionState::Connecting));
        receiver.changed().await.expect("change notification");
        assert_eq!(*receiver.borrow(), ConnectionState::Connecting);

        assert!(cell.transition(ConnectionState::Closed));
        receiver.changed().await.expect("change notification");
        assert_eq!(*receiver.borrow(), ConnectionState::Closed);
    }

    #[test]
    fn send_is_allowed_during_handshake_and_connected() {
        assert!(!ConnectionState::Created.allows_send());
        assert!(!ConnectionState::Connecting.allows_send());
        assert!(ConnectionState::Handshaking.allows_send());
        assert!(ConnectionState::Connected.allows_send());
        assert!(!ConnectionState::Closed.allows_send());
    }
}
