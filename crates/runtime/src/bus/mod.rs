//! Topic and queue registry.
//!
//! Channels are looked up by name and created on first use, so independent
//! components can meet on a channel without a construction order. Names are
//! bound to one item type for the life of the bus; asking for an existing name
//! with another type is an error rather than a silent second channel.
//!
//! Topics deliver only to subscribers registered at publish time. Nothing is
//! replayed, so state a late subscriber needs must come from an explicit
//! startup pass.

mod queue;
mod topic;

use std::collections::HashMap;
use std::sync::Arc;

use downcast_rs::{DowncastSync, impl_downcast};
use parking_lot::Mutex;
use tracing::debug;

pub use queue::Queue;
pub use topic::{Subscription, Topic};

use crate::error::{Error, Result};

trait Channel: DowncastSync {}
impl_downcast!(sync Channel);

impl<T: Clone + Send + 'static> Channel for Topic<T> {}
impl<T: Send + 'static> Channel for Queue<T> {}

#[derive(Default)]
struct Registry {
	topics: Mutex<HashMap<String, Box<dyn Channel>>>,
	queues: Mutex<HashMap<String, Box<dyn Channel>>>,
}

/// Shared handle to the registry. Cloning is cheap; all clones see the same channels.
#[derive(Clone, Default)]
pub struct Bus {
	inner: Arc<Registry>,
}

impl Bus {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the topic called `name`, creating it on first use.
	pub fn topic<T: Clone + Send + 'static>(&self, name: &str) -> Result<Topic<T>> {
		let mut topics = self.inner.topics.lock();
		if let Some(existing) = topics.get(name) {
			return existing
				.downcast_ref::<Topic<T>>()
				.cloned()
				.ok_or_else(|| Error::ChannelType { name: name.to_string() });
		}

		debug!(target: "trap.bus", topic = name, "creating topic");
		let topic = Topic::new(name);
		topics.insert(name.to_string(), Box::new(topic.clone()));
		Ok(topic)
	}

	/// Returns the queue called `name`, creating it with `capacity` slots on first use.
	///
	/// The capacity of an existing queue is not changed.
	pub fn queue<T: Send + 'static>(&self, name: &str, capacity: usize) -> Result<Queue<T>> {
		let mut queues = self.inner.queues.lock();
		if let Some(existing) = queues.get(name) {
			return existing
				.downcast_ref::<Queue<T>>()
				.cloned()
				.ok_or_else(|| Error::ChannelType { name: name.to_string() });
		}

		debug!(target: "trap.bus", queue = name, capacity, "creating queue");
		let queue = Queue::new(name, capacity);
		queues.insert(name.to_string(), Box::new(queue.clone()));
		Ok(queue)
	}
}
