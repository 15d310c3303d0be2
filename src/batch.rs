//! Here we define the data structure that is responsible for collecting alerts
//! into buckets and flushing each bucket as one grouped message.
use std::{collections::VecDeque, pin::Pin, task::Poll, time::Duration};

use chrono::{DateTime, Utc};
use futures::Stream;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use tokio_util::time::{delay_queue, DelayQueue};

use crate::{alert::Alert, dedup::Fingerprint};

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct BatchSettings {
	/// how long a bucket collects alerts after its first alert arrived
	#[serde_as(as = "DurationSeconds<f64>")]
	#[serde(default = "default_window")]
	pub window: Duration,
	/// pending alerts across all buckets
	#[serde(default = "default_max_items")]
	pub max_items: usize,
	#[serde(default = "default_max_buckets")]
	pub max_buckets: usize,
}

fn default_window() -> Duration {
	Duration::from_secs(10)
}

fn default_max_items() -> usize {
	100
}

fn default_max_buckets() -> usize {
	10
}

impl Default for BatchSettings {
	fn default() -> Self {
		Self {
			window: default_window(),
			max_items: default_max_items(),
			max_buckets: default_max_buckets(),
		}
	}
}

/// an accepted alert waiting for delivery
#[derive(Debug, Clone)]
pub struct PendingAlert {
	pub alert: Alert,
	/// needed to roll back the dedup entry if the alert never gets delivered
	pub fingerprint: Fingerprint,
}

/// the alerts of a single bucket waiting for the batch window to end
#[derive(Debug)]
struct Bucket {
	/// the key for the [tokio_util::time::delay_queue]
	timeout_key: delay_queue::Key,
	/// alerts in arrival order, each with its global arrival number
	items: VecDeque<(u64, PendingAlert)>,
	opened_at: DateTime<Utc>,
}

/// the content of a bucket whose batch window ended
#[derive(Debug, Clone)]
pub struct FlushedBatch {
	pub key: String,
	pub opened_at: DateTime<Utc>,
	/// alerts in arrival order
	pub items: Vec<PendingAlert>,
}

/// Incoming alerts get queued into the BatchQueue.
///
/// The first alert for a key opens a bucket and registers a timeout of one
/// batch window. Alerts arriving for the same key in the meantime are appended
/// without touching the timeout. When the timeout fires, the bucket is removed
/// and returned as a [FlushedBatch] via the [Stream] implementation.
///
/// The queue is bounded: if there are more pending alerts than allowed, the
/// alert that arrived first is evicted. A new bucket beyond the bucket limit
/// evicts the oldest bucket. Evicted alerts are handed back to the caller.
#[derive(Debug)]
pub struct BatchQueue {
	/// open buckets, oldest first
	buckets: IndexMap<String, Bucket>,

	/// This notifies us if a bucket has finished it's batch window
	timeout_queue: DelayQueue<String>,
	batch_window: Duration,

	max_items: usize,
	max_buckets: usize,

	/// number of pending alerts across all buckets
	len: usize,
	/// arrival counter
	next_seq: u64,
}

impl BatchQueue {
	pub fn new(settings: &BatchSettings) -> Self {
		Self {
			buckets: IndexMap::new(),
			timeout_queue: DelayQueue::new(),
			batch_window: settings.window,
			max_items: settings.max_items.max(1),
			max_buckets: settings.max_buckets.max(1),
			len: 0,
			next_seq: 0,
		}
	}

	/// queues an alert into the bucket `key`, returns the alerts evicted to
	/// stay within capacity
	pub fn add(&mut self, key: String, alert: PendingAlert, now: DateTime<Utc>) -> Vec<PendingAlert> {
		let mut evicted = Vec::new();

		if !self.buckets.contains_key(&key) && self.buckets.len() >= self.max_buckets {
			if let Some((key, bucket)) = self.buckets.shift_remove_index(0) {
				tracing::warn!("too many open batches, dropping batch {key}");
				evicted.extend(self.discard(bucket));
			}
		}

		let seq = self.next_seq;
		self.next_seq += 1;

		match self.buckets.get_mut(&key) {
			Some(bucket) => bucket.items.push_back((seq, alert)),
			None => {
				let timeout_key = self.timeout_queue.insert(key.clone(), self.batch_window);
				let bucket = Bucket { timeout_key, items: VecDeque::from([(seq, alert)]), opened_at: now };
				self.buckets.insert(key, bucket);
			}
		}
		self.len += 1;

		while self.len > self.max_items {
			match self.evict_oldest() {
				Some(alert) => evicted.push(alert),
				None => break,
			}
		}

		evicted
	}

	/// removes a bucket before its batch window ended
	pub fn take_bucket(&mut self, key: &str) -> Option<FlushedBatch> {
		let bucket = self.buckets.shift_remove(key)?;
		self.timeout_queue.remove(&bucket.timeout_key);
		self.len -= bucket.items.len();

		Some(FlushedBatch {
			key: key.to_owned(),
			opened_at: bucket.opened_at,
			items: bucket.items.into_iter().map(|(_, alert)| alert).collect(),
		})
	}

	/// removes all buckets, oldest first
	pub fn drain(&mut self) -> Vec<FlushedBatch> {
		let keys: Vec<String> = self.buckets.keys().cloned().collect();
		keys.iter().filter_map(|key| self.take_bucket(key)).collect()
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub fn bucket_count(&self) -> usize {
		self.buckets.len()
	}

	fn discard(&mut self, bucket: Bucket) -> impl Iterator<Item = PendingAlert> {
		self.timeout_queue.remove(&bucket.timeout_key);
		self.len -= bucket.items.len();
		bucket.items.into_iter().map(|(_, alert)| alert)
	}

	/// removes the alert that arrived first among all buckets
	pub fn evict_oldest(&mut self) -> Option<PendingAlert> {
		let index = self
			.buckets
			.values()
			.enumerate()
			.filter_map(|(index, bucket)| bucket.items.front().map(|(seq, _)| (*seq, index)))
			.min()
			.map(|(_, index)| index)?;

		let (_, bucket) = self.buckets.get_index_mut(index)?;
		let (_, alert) = bucket.items.pop_front()?;
		self.len -= 1;

		if bucket.items.is_empty() {
			if let Some((_, bucket)) = self.buckets.shift_remove_index(index) {
				self.timeout_queue.remove(&bucket.timeout_key);
			}
		}

		Some(alert)
	}
}

/// This Stream returns buckets whose batch window has ended
impl Stream for BatchQueue {
	type Item = FlushedBatch;

	fn poll_next(
		mut self: Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> Poll<Option<Self::Item>> {
		loop {
			match self.timeout_queue.poll_expired(cx) {
				Poll::Ready(Some(expired)) => {
					let key = expired.into_inner();
					let bucket = match self.buckets.shift_remove(&key) {
						Some(bucket) => bucket,
						// already taken out of band, nothing to flush
						None => continue,
					};
					self.len -= bucket.items.len();

					if bucket.items.is_empty() {
						continue;
					}

					return Poll::Ready(Some(FlushedBatch {
						key,
						opened_at: bucket.opened_at,
						items: bucket.items.into_iter().map(|(_, alert)| alert).collect(),
					}));
				}
				// the queue is polled again by the event loop after the next insertion
				_ => return Poll::Pending,
			}
		}
	}
}
