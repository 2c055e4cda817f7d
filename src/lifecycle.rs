//! Connection lifecycle management.
//!
//! Each adapter owns exactly one [`ConnectionMonitor`], the single place
//! that holds the current connection state. Transitions are driven by
//! events observed from the transport; the monitor never initiates retry
//! or backoff of its own, it only tracks and re-exposes what the
//! transport reports.

use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::error::BrokerError;

/// Connection state as tracked by the lifecycle manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	/// No transport connection exists yet
	Disconnected,
	/// Initial connection handshake in progress
	Connecting,
	/// Transport connection established and operable
	Connected,
	/// Transport lost the connection and is re-establishing it
	Reconnecting,
	/// Transport reported a connection-level error
	Error,
	/// Graceful shutdown requested, in progress
	Closing,
	/// Shutdown complete; no further operations are accepted
	Closed,
}

impl ConnectionState {
	/// Whether `close()` has been requested or completed.
	pub fn is_closed(&self) -> bool {
		matches!(self, Self::Closing | Self::Closed)
	}
}

/// Lifecycle event observed from the transport and re-exposed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
	/// Transport connection established
	Connected,
	/// Initial connection attempt failed
	ConnectFailed,
	/// Established connection was lost
	Disconnected,
	/// Transport is re-establishing a lost connection
	Reconnecting,
	/// Backend applied flow control; publishes may stall
	Blocked,
	/// Backend lifted flow control
	Unblocked,
	/// Graceful shutdown completed
	Closed,
}

/// Capacity of the event broadcast channel.
///
/// Slow host listeners that fall further behind than this lose the oldest
/// events, never the adapter's own state tracking.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Owns the connection state and fans lifecycle events out to listeners.
#[derive(Debug)]
pub struct ConnectionMonitor {
	state_tx: watch::Sender<ConnectionState>,
	event_tx: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionMonitor {
	/// Create a monitor in the `Disconnected` state.
	pub fn new() -> Self {
		let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
		let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
		Self { state_tx, event_tx }
	}

	/// Current connection state.
	pub fn state(&self) -> ConnectionState {
		*self.state_tx.borrow()
	}

	/// Watch state changes.
	pub fn watch(&self) -> watch::Receiver<ConnectionState> {
		self.state_tx.subscribe()
	}

	/// Subscribe to lifecycle events.
	pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
		self.event_tx.subscribe()
	}

	/// Mark the start of the initial connection handshake.
	pub fn begin_connect(&self) {
		self.state_tx.send_if_modified(|state| {
			if state.is_closed() {
				return false;
			}
			*state = ConnectionState::Connecting;
			true
		});
	}

	/// Record a transport event, apply the state transition it implies and
	/// broadcast it to listeners.
	///
	/// Once `close()` has been requested the state is final; late transport
	/// events are still broadcast for observability but no longer move the
	/// state machine.
	pub fn observe(&self, event: ConnectionEvent) {
		self.state_tx.send_if_modified(|state| {
			if state.is_closed() && event != ConnectionEvent::Closed {
				return false;
			}
			let next = match event {
				| ConnectionEvent::Connected => ConnectionState::Connected,
				| ConnectionEvent::ConnectFailed => ConnectionState::Error,
				| ConnectionEvent::Disconnected => {
					ConnectionState::Disconnected
				}
				| ConnectionEvent::Reconnecting => {
					ConnectionState::Reconnecting
				}
				| ConnectionEvent::Closed => ConnectionState::Closed,
				// Flow control does not change the connection state
				| ConnectionEvent::Blocked | ConnectionEvent::Unblocked => {
					*state
				}
			};
			if next == *state {
				return false;
			}
			debug!(from = ?state, to = ?next, event = ?event, "connection state changed");
			*state = next;
			true
		});
		// Listener lag or absence is not an adapter concern
		let _ = self.event_tx.send(event);
	}

	/// Arbitrate the settle-once close: the first caller gets `true` and
	/// performs the actual shutdown, every later caller gets `false`.
	pub fn begin_close(&self) -> bool {
		let mut first = false;
		self.state_tx.send_if_modified(|state| {
			if state.is_closed() {
				return false;
			}
			first = true;
			*state = ConnectionState::Closing;
			true
		});
		first
	}

	/// Transition to `Closed` and emit the final event.
	///
	/// Called unconditionally after shutdown, even when the transport
	/// refused a graceful close, so `close()` can never be left pending.
	pub fn finish_close(&self) {
		self.observe(ConnectionEvent::Closed);
	}

	/// Fail with [`BrokerError::Closed`] once `close()` has been requested.
	pub fn guard_open(&self) -> Result<(), BrokerError> {
		if self.state().is_closed() {
			Err(BrokerError::Closed)
		} else {
			Ok(())
		}
	}

	/// Fail fast unless the transport connection is currently operable.
	///
	/// Used by adapters whose backend cannot honor delivery while
	/// disconnected.
	pub fn guard_operable(&self) -> Result<(), BrokerError> {
		match self.state() {
			| ConnectionState::Connected => Ok(()),
			| ConnectionState::Closing | ConnectionState::Closed => {
				Err(BrokerError::Closed)
			}
			| state => Err(BrokerError::connection(format!(
				"connection is not operable (state: {state:?})"
			))),
		}
	}
}

impl Default for ConnectionMonitor {
	fn default() -> Self {
		Self::new()
	}
}
