//! Tests for the connection state machine.

use super::lifecycle::{ConnectionEvent, ConnectionMonitor, ConnectionState};
use crate::error::BrokerError;

#[test]
fn starts_disconnected() {
	let monitor = ConnectionMonitor::new();
	assert_eq!(monitor.state(), ConnectionState::Disconnected);
}

#[test]
fn connect_handshake_transitions() {
	let monitor = ConnectionMonitor::new();
	monitor.begin_connect();
	assert_eq!(monitor.state(), ConnectionState::Connecting);

	monitor.observe(ConnectionEvent::Connected);
	assert_eq!(monitor.state(), ConnectionState::Connected);
}

#[test]
fn connect_failure_is_observed_as_error() {
	let monitor = ConnectionMonitor::new();
	monitor.begin_connect();
	monitor.observe(ConnectionEvent::ConnectFailed);
	assert_eq!(monitor.state(), ConnectionState::Error);
}

#[test]
fn reconnect_cycle_round_trips() {
	let monitor = ConnectionMonitor::new();
	monitor.observe(ConnectionEvent::Connected);
	monitor.observe(ConnectionEvent::Reconnecting);
	assert_eq!(monitor.state(), ConnectionState::Reconnecting);

	monitor.observe(ConnectionEvent::Connected);
	assert_eq!(monitor.state(), ConnectionState::Connected);
}

#[test]
fn flow_control_events_do_not_move_state() {
	let monitor = ConnectionMonitor::new();
	monitor.observe(ConnectionEvent::Connected);
	monitor.observe(ConnectionEvent::Blocked);
	assert_eq!(monitor.state(), ConnectionState::Connected);
	monitor.observe(ConnectionEvent::Unblocked);
	assert_eq!(monitor.state(), ConnectionState::Connected);
}

#[test]
fn begin_close_arbitrates_exactly_one_winner() {
	let monitor = ConnectionMonitor::new();
	monitor.observe(ConnectionEvent::Connected);

	assert!(monitor.begin_close());
	assert_eq!(monitor.state(), ConnectionState::Closing);
	// Every later caller loses the arbitration
	assert!(!monitor.begin_close());
	assert!(!monitor.begin_close());
}

#[test]
fn closed_state_is_sticky_against_late_transport_events() {
	let monitor = ConnectionMonitor::new();
	monitor.observe(ConnectionEvent::Connected);
	monitor.begin_close();
	monitor.finish_close();
	assert_eq!(monitor.state(), ConnectionState::Closed);

	// A late disconnect from the transport must not revive the adapter
	monitor.observe(ConnectionEvent::Disconnected);
	assert_eq!(monitor.state(), ConnectionState::Closed);
	monitor.observe(ConnectionEvent::Connected);
	assert_eq!(monitor.state(), ConnectionState::Closed);
}

#[test]
fn guard_open_fails_only_after_close_requested() {
	let monitor = ConnectionMonitor::new();
	assert!(monitor.guard_open().is_ok());

	monitor.observe(ConnectionEvent::Connected);
	assert!(monitor.guard_open().is_ok());

	monitor.begin_close();
	assert!(matches!(monitor.guard_open(), Err(BrokerError::Closed)));
	monitor.finish_close();
	assert!(matches!(monitor.guard_open(), Err(BrokerError::Closed)));
}

#[test]
fn guard_operable_fails_fast_while_disconnected() {
	let monitor = ConnectionMonitor::new();
	assert!(matches!(
		monitor.guard_operable(),
		Err(BrokerError::Connection(_))
	));

	monitor.observe(ConnectionEvent::Connected);
	assert!(monitor.guard_operable().is_ok());

	monitor.observe(ConnectionEvent::Disconnected);
	assert!(matches!(
		monitor.guard_operable(),
		Err(BrokerError::Connection(_))
	));

	monitor.begin_close();
	assert!(matches!(monitor.guard_operable(), Err(BrokerError::Closed)));
}

#[tokio::test]
async fn events_are_broadcast_to_listeners() {
	let monitor = ConnectionMonitor::new();
	let mut events = monitor.events();

	monitor.observe(ConnectionEvent::Connected);
	monitor.observe(ConnectionEvent::Blocked);
	monitor.observe(ConnectionEvent::Unblocked);

	assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connected);
	assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Blocked);
	assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Unblocked);
}

#[tokio::test]
async fn state_watch_sees_the_latest_transition() {
	let monitor = ConnectionMonitor::new();
	let mut watch = monitor.watch();

	monitor.begin_connect();
	monitor.observe(ConnectionEvent::Connected);

	watch.changed().await.unwrap();
	assert_eq!(*watch.borrow(), ConnectionState::Connected);
}
