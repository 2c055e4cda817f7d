//! Per-adapter topic registry.
//!
//! Two registry shapes cover the three backend families:
//!
//! - [`TopicRegistry`] caches a lazily-created backend handle per topic
//!   (exchange-bound queue channels). Creation is serialized per topic:
//!   the first caller creates the handle, concurrent callers for the same
//!   topic wait on that same creation, so at most one handle ever exists
//!   per topic per adapter instance.
//! - [`CallbackTable`] is the flat topic-to-callback map used by backends
//!   with no per-topic server-side resource beyond the subscription
//!   itself (flat topics, pattern channels).

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use arcstr::ArcStr;
use tokio::sync::OnceCell;

use crate::broker::Callback;
use crate::error::BrokerError;

/// A cached per-topic entry: the backend handle plus the registered
/// callback, sharing one lifetime.
pub struct TopicEntry<H> {
	handle: OnceCell<H>,
	callback: RwLock<Option<Callback>>,
}

impl<H> TopicEntry<H> {
	fn new() -> Self {
		Self {
			handle: OnceCell::new(),
			callback: RwLock::new(None),
		}
	}

	/// Return the handle, creating it through `init` on first use.
	///
	/// Concurrent callers converge on a single creation: one runs `init`,
	/// the rest wait for its outcome. A failed creation leaves the entry
	/// empty so a later call can retry.
	pub async fn handle_or_init<F, Fut>(
		&self,
		init: F,
	) -> Result<&H, BrokerError>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<H, BrokerError>>,
	{
		self.handle.get_or_try_init(init).await
	}

	/// The handle, if it was already created.
	pub fn handle(&self) -> Option<&H> {
		self.handle.get()
	}

	/// Register a callback, replacing any previous one.
	///
	/// Returns `true` when a previous callback was replaced.
	pub fn set_callback(&self, callback: Callback) -> bool {
		let mut slot = self.callback.write().expect("callback lock poisoned");
		slot.replace(callback).is_some()
	}

	/// Currently registered callback, if any.
	pub fn callback(&self) -> Option<Callback> {
		self.callback
			.read()
			.expect("callback lock poisoned")
			.clone()
	}

	/// Drop the registered callback.
	pub fn clear_callback(&self) {
		self.callback
			.write()
			.expect("callback lock poisoned")
			.take();
	}
}

/// Topic-keyed cache of backend handles, owned by a single adapter
/// instance.
pub struct TopicRegistry<H> {
	entries: Mutex<HashMap<ArcStr, Arc<TopicEntry<H>>>>,
}

impl<H> TopicRegistry<H> {
	/// Create an empty registry.
	pub fn new() -> Self {
		Self {
			entries: Mutex::new(HashMap::new()),
		}
	}

	/// Entry for `topic`, inserting an empty one if absent.
	pub fn entry(&self, topic: &str) -> Arc<TopicEntry<H>> {
		let mut entries = self.entries.lock().expect("registry lock poisoned");
		match entries.get(topic) {
			| Some(entry) => Arc::clone(entry),
			| None => {
				let entry = Arc::new(TopicEntry::new());
				entries.insert(ArcStr::from(topic), Arc::clone(&entry));
				entry
			}
		}
	}

	/// Entry for `topic`, if one exists.
	pub fn get(&self, topic: &str) -> Option<Arc<TopicEntry<H>>> {
		self.entries
			.lock()
			.expect("registry lock poisoned")
			.get(topic)
			.cloned()
	}

	/// Remove and return the entry for `topic`.
	pub fn remove(&self, topic: &str) -> Option<Arc<TopicEntry<H>>> {
		self.entries
			.lock()
			.expect("registry lock poisoned")
			.remove(topic)
	}

	/// Remove every entry, returning them for teardown.
	pub fn drain(&self) -> Vec<(ArcStr, Arc<TopicEntry<H>>)> {
		self.entries
			.lock()
			.expect("registry lock poisoned")
			.drain()
			.collect()
	}

	/// Topics with a cached entry.
	pub fn topics(&self) -> Vec<ArcStr> {
		self.entries
			.lock()
			.expect("registry lock poisoned")
			.keys()
			.cloned()
			.collect()
	}
}

impl<H> Default for TopicRegistry<H> {
	fn default() -> Self {
		Self::new()
	}
}

/// Flat topic-to-callback map for backends where the subscription itself
/// is the only per-topic resource.
#[derive(Default)]
pub struct CallbackTable {
	callbacks: RwLock<HashMap<ArcStr, Callback>>,
}

impl CallbackTable {
	/// Create an empty table.
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a callback for `topic`, returning the callback it
	/// replaced, if any.
	pub fn insert(&self, topic: &str, callback: Callback) -> Option<Callback> {
		self.callbacks
			.write()
			.expect("callback table lock poisoned")
			.insert(ArcStr::from(topic), callback)
	}

	/// Remove the callback for `topic`, returning it if one was present.
	pub fn remove(&self, topic: &str) -> Option<Callback> {
		self.callbacks
			.write()
			.expect("callback table lock poisoned")
			.remove(topic)
	}

	/// Callback registered for exactly `topic`.
	pub fn get(&self, topic: &str) -> Option<Callback> {
		self.callbacks
			.read()
			.expect("callback table lock poisoned")
			.get(topic)
			.cloned()
	}

	/// Whether a callback is registered for `topic`.
	pub fn contains(&self, topic: &str) -> bool {
		self.callbacks
			.read()
			.expect("callback table lock poisoned")
			.contains_key(topic)
	}

	/// Every topic with a registered callback.
	pub fn topics(&self) -> Vec<ArcStr> {
		self.callbacks
			.read()
			.expect("callback table lock poisoned")
			.keys()
			.cloned()
			.collect()
	}

	/// Drop every registered callback.
	pub fn clear(&self) {
		self.callbacks
			.write()
			.expect("callback table lock poisoned")
			.clear();
	}

	/// Number of registered callbacks.
	pub fn len(&self) -> usize {
		self.callbacks
			.read()
			.expect("callback table lock poisoned")
			.len()
	}

	/// Whether no callbacks are registered.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
