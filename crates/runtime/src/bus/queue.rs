//! Bounded FIFO work queues.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

/// Named FIFO buffer shared by producers and a serialized set of consumers.
///
/// Consumers take turns through an internal lock, so each item is handed to
/// exactly one of them in arrival order.
pub struct Queue<T> {
	name: Arc<str>,
	tx: mpsc::Sender<T>,
	rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for Queue<T> {
	fn clone(&self) -> Self {
		Self {
			name: Arc::clone(&self.name),
			tx: self.tx.clone(),
			rx: Arc::clone(&self.rx),
		}
	}
}

impl<T> fmt::Debug for Queue<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Queue")
			.field("name", &self.name)
			.field("capacity", &self.tx.max_capacity())
			.finish()
	}
}

impl<T: Send + 'static> Queue<T> {
	pub(crate) fn new(name: &str, capacity: usize) -> Self {
		let (tx, rx) = mpsc::channel(capacity.max(1));
		Self {
			name: Arc::from(name),
			tx,
			rx: Arc::new(Mutex::new(rx)),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn capacity(&self) -> usize {
		self.tx.max_capacity()
	}

	/// Number of items waiting.
	pub fn len(&self) -> usize {
		self.tx.max_capacity() - self.tx.capacity()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Appends `item`, waiting for a free slot when the queue is full.
	pub async fn put(&self, item: T) {
		// The queue owns its receiver, so the channel cannot be closed.
		let _ = self.tx.send(item).await;
	}

	/// Appends `item` if a slot is free; hands it back otherwise.
	pub fn try_put(&self, item: T) -> Result<(), T> {
		self.tx.try_send(item).map_err(|err| match err {
			mpsc::error::TrySendError::Full(item) | mpsc::error::TrySendError::Closed(item) => item,
		})
	}

	/// Waits for the next item.
	pub async fn pop(&self) -> Option<T> {
		self.rx.lock().await.recv().await
	}
}
