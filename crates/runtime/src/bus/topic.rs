//! Multicast topics.

use std::fmt::{self, Display};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace, warn};

struct Slot<T> {
	tx: mpsc::UnboundedSender<T>,
	pending: Arc<AtomicUsize>,
}

impl<T> Slot<T> {
	fn backlog(&self) -> usize {
		if self.tx.is_closed() {
			0
		} else {
			self.pending.load(Ordering::Acquire)
		}
	}
}

struct TopicInner<T> {
	name: Arc<str>,
	subscribers: Mutex<Vec<Slot<T>>>,
	drained: Arc<Notify>,
}

/// Named multicast channel.
///
/// Every subscriber owns an unbounded FIFO, and [`Topic::publish`] pushes into
/// all of them under one lock, so each subscriber observes events in publish
/// order and publishing never waits on a slow subscriber. Producers that can
/// outrun a subscriber bound themselves with [`Topic::drained`].
pub struct Topic<T> {
	inner: Arc<TopicInner<T>>,
}

impl<T> Clone for Topic<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> fmt::Debug for Topic<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Topic")
			.field("name", &self.inner.name)
			.field("subscribers", &self.inner.subscribers.lock().len())
			.finish()
	}
}

impl<T: Clone + Send + 'static> Topic<T> {
	pub(crate) fn new(name: &str) -> Self {
		Self {
			inner: Arc::new(TopicInner {
				name: Arc::from(name),
				subscribers: Mutex::new(Vec::new()),
				drained: Arc::new(Notify::new()),
			}),
		}
	}

	pub fn name(&self) -> &str {
		&self.inner.name
	}

	/// Delivers `event` to every currently registered subscriber.
	///
	/// Returns the number of subscribers reached. Dropped subscriptions are
	/// pruned here.
	pub fn publish(&self, event: T) -> usize {
		let mut subscribers = self.inner.subscribers.lock();
		subscribers.retain(|slot| {
			slot.pending.fetch_add(1, Ordering::AcqRel);
			slot.tx.send(event.clone()).is_ok()
		});
		trace!(target: "trap.bus", topic = %self.inner.name, subscribers = subscribers.len(), "published");
		subscribers.len()
	}

	/// Registers a new subscriber. Only events published after this call are received.
	pub fn subscribe(&self) -> Subscription<T> {
		let (tx, rx) = mpsc::unbounded_channel();
		let pending = Arc::new(AtomicUsize::new(0));
		self.inner.subscribers.lock().push(Slot {
			tx,
			pending: Arc::clone(&pending),
		});
		Subscription {
			topic: Arc::clone(&self.inner.name),
			rx,
			pending,
			drained: Arc::clone(&self.inner.drained),
		}
	}

	pub fn subscriber_count(&self) -> usize {
		self.inner.subscribers.lock().iter().filter(|slot| !slot.tx.is_closed()).count()
	}

	/// Events published but not yet received by the slowest live subscriber.
	pub fn backlog(&self) -> usize {
		self.inner.subscribers.lock().iter().map(Slot::backlog).max().unwrap_or(0)
	}

	/// Waits until [`Topic::backlog`] is at most `limit`.
	pub async fn drained(&self, limit: usize) {
		loop {
			let notified = self.inner.drained.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			if self.backlog() <= limit {
				return;
			}
			notified.await;
		}
	}

	/// Subscribes and runs `handler` for each event on a dedicated task until `cancel` fires.
	///
	/// Handler errors and panics are logged and swallowed; the next event is
	/// still delivered.
	pub fn spawn_handler<F, Fut, E>(&self, cancel: CancellationToken, mut handler: F) -> JoinHandle<()>
	where
		F: FnMut(T) -> Fut + Send + 'static,
		Fut: Future<Output = Result<(), E>> + Send + 'static,
		E: Display + Send + 'static,
	{
		let mut subscription = self.subscribe();
		tokio::spawn(async move {
			loop {
				let event = tokio::select! {
					_ = cancel.cancelled() => break,
					event = subscription.recv() => match event {
						Some(event) => event,
						None => break,
					},
				};

				match AssertUnwindSafe(handler(event)).catch_unwind().await {
					Ok(Ok(())) => {}
					Ok(Err(err)) => {
						warn!(target: "trap.bus", topic = %subscription.topic, error = %err, "subscriber failed");
					}
					Err(_) => {
						error!(target: "trap.bus", topic = %subscription.topic, "subscriber panicked");
					}
				}
			}
		})
	}
}

/// Receiving end of one topic subscription.
pub struct Subscription<T> {
	topic: Arc<str>,
	rx: mpsc::UnboundedReceiver<T>,
	pending: Arc<AtomicUsize>,
	drained: Arc<Notify>,
}

impl<T> Subscription<T> {
	pub fn topic(&self) -> &str {
		&self.topic
	}

	/// Waits for the next event. `None` once the topic itself is gone.
	pub async fn recv(&mut self) -> Option<T> {
		let event = self.rx.recv().await;
		self.taken(event)
	}

	/// Takes an already delivered event without waiting.
	pub fn try_recv(&mut self) -> Option<T> {
		let event = self.rx.try_recv().ok();
		self.taken(event)
	}

	fn taken(&self, event: Option<T>) -> Option<T> {
		if event.is_some() {
			self.pending.fetch_sub(1, Ordering::AcqRel);
			self.drained.notify_waiters();
		}
		event
	}
}

impl<T> Drop for Subscription<T> {
	fn drop(&mut self) {
		self.pending.store(0, Ordering::Release);
		self.drained.notify_waiters();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	async fn next<T>(sub: &mut Subscription<T>) -> T {
		tokio::time::timeout(Duration::from_secs(1), sub.recv())
			.await
			.expect("event should arrive")
			.expect("topic should be open")
	}

	#[tokio::test]
	async fn every_subscriber_sees_publish_order() {
		let topic = Topic::<u32>::new("ordered");
		let mut a = topic.subscribe();
		let mut b = topic.subscribe();

		for n in 0..100 {
			topic.publish(n);
		}

		for n in 0..100 {
			assert_eq!(next(&mut a).await, n);
			assert_eq!(next(&mut b).await, n);
		}
	}

	#[tokio::test]
	async fn late_subscriber_gets_no_replay() {
		let topic = Topic::<&'static str>::new("late");
		assert_eq!(topic.publish("early"), 0);

		let mut sub = topic.subscribe();
		topic.publish("after");

		assert_eq!(next(&mut sub).await, "after");
		assert_eq!(sub.try_recv(), None);
	}

	#[tokio::test]
	async fn dropped_subscription_is_pruned() {
		let topic = Topic::<u8>::new("prune");
		let keep = topic.subscribe();
		drop(topic.subscribe());

		assert_eq!(topic.publish(1), 1);
		assert_eq!(topic.subscriber_count(), 1);
		drop(keep);
	}

	#[tokio::test]
	async fn failing_handler_does_not_block_others() {
		let topic = Topic::<u32>::new("isolated");
		let cancel = CancellationToken::new();

		topic.spawn_handler(cancel.clone(), |n: u32| async move {
			if n % 2 == 0 {
				Err(format!("cannot handle {n}"))
			} else {
				Ok(())
			}
		});
		topic.spawn_handler(cancel.clone(), |n: u32| async move {
			if n == 1 {
				panic!("boom");
			}
			Ok::<(), String>(())
		});

		let (tx, mut rx) = mpsc::unbounded_channel();
		topic.spawn_handler(cancel.clone(), move |n: u32| {
			let tx = tx.clone();
			async move {
				tx.send(n).map_err(|e| e.to_string())
			}
		});

		for n in 0..4 {
			topic.publish(n);
		}

		for n in 0..4 {
			let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
			assert_eq!(got, Some(n));
		}

		// The panicking and failing handlers keep consuming.
		topic.publish(5);
		assert_eq!(tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap(), Some(5));
		assert_eq!(topic.subscriber_count(), 3);
		cancel.cancel();
	}

	#[test]
	fn backlog_tracks_the_slowest_subscriber() {
		let topic = Topic::<u32>::new("backlog");
		let mut fast = topic.subscribe();
		let mut slow = topic.subscribe();

		for n in 0..3 {
			topic.publish(n);
		}
		while fast.try_recv().is_some() {}
		assert_eq!(topic.backlog(), 3);

		slow.try_recv();
		assert_eq!(topic.backlog(), 2);

		drop(slow);
		assert_eq!(topic.backlog(), 0);
	}

	#[tokio::test]
	async fn drained_waits_for_the_subscriber_to_catch_up() {
		let topic = Topic::<u32>::new("drain");
		let mut sub = topic.subscribe();
		topic.publish(1);
		topic.publish(2);

		let waiter = {
			let topic = topic.clone();
			tokio::spawn(async move { topic.drained(0).await })
		};
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert!(!waiter.is_finished());

		assert_eq!(next(&mut sub).await, 1);
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert!(!waiter.is_finished());

		assert_eq!(next(&mut sub).await, 2);
		tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
	}

	#[test]
	fn debug_names_the_topic() {
		let topic = Topic::<u8>::new("frames");
		let _sub = topic.subscribe();
		assert_eq!(format!("{topic:?}"), r#"Topic { name: "frames", subscribers: 1 }"#);
	}
}
