//! Suppresses repeated alerts.
//!
//! Every alert is reduced to a [Fingerprint] over its identifying labels. The
//! first alert of a fingerprint passes and records when it was sent, further
//! alerts with the same fingerprint are suppressed until the dedup window has
//! passed. If the delivery of an accepted alert fails the entry is rolled back
//! so the next occurrence is delivered again.
//!
//! Entries are persisted through a [DedupStore] so a restart doesn't flood the
//! chat with alerts that were already delivered.

use std::{
	collections::{BTreeMap, HashMap},
	fmt::Debug,
	fs, io,
	path::PathBuf,
	sync::Arc,
	time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
	alert::Alert,
	clock::{elapsed, Clock},
};

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct DedupSettings {
	/// how long repeated alerts are suppressed
	#[serde_as(as = "DurationSeconds<f64>")]
	#[serde(default = "default_window")]
	pub window: Duration,
	/// where sent fingerprints are kept across restarts, in memory only if
	/// unset
	#[serde(default)]
	pub state_file: Option<PathBuf>,
}

fn default_window() -> Duration {
	Duration::from_secs(24 * 60 * 60)
}

impl Default for DedupSettings {
	fn default() -> Self {
		Self { window: default_window(), state_file: None }
	}
}

impl DedupSettings {
	/// the store configured by these settings
	pub fn store(&self) -> Box<dyn DedupStore> {
		match &self.state_file {
			Some(path) => Box::new(FileDedupStore::new(path.clone())),
			None => Box::new(MemoryDedupStore::default()),
		}
	}
}

/// digest of the identifying labels of an alert
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
	/// sha256 over alert name, instance, component and severity. The fields are
	/// collected into a sorted map and serialized before hashing, so neither
	/// field order nor separator characters inside values matter.
	pub fn of(alert: &Alert) -> Self {
		let mut fields = BTreeMap::new();
		fields.insert("alertname", alert.name.as_str());
		fields.insert("instance", alert.labels.instance.as_deref().unwrap_or("unknown"));
		fields.insert("component", alert.labels.component.as_deref().unwrap_or(""));
		fields.insert("severity", alert.severity.as_str());

		#[allow(clippy::expect_used)]
		let canonical = serde_json::to_vec(&fields).expect("a map of strings always serializes");

		Self(hex::encode(Sha256::digest(&canonical)))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

#[derive(Error, Debug)]
pub enum StoreError {
	#[error("i/o error on dedup state: {0}")]
	Io(#[from] io::Error),
	#[error("malformed dedup state: {0}")]
	Json(#[from] serde_json::Error),
}

/// persistence of the sent fingerprints
pub trait DedupStore: Send + Debug {
	fn load(&self) -> Result<HashMap<Fingerprint, DateTime<Utc>>, StoreError>;
	fn save(&self, entries: &HashMap<Fingerprint, DateTime<Utc>>) -> Result<(), StoreError>;
}

/// keeps the state as json object in a file
#[derive(Debug, Clone)]
pub struct FileDedupStore {
	path: PathBuf,
}

impl FileDedupStore {
	pub fn new(path: PathBuf) -> Self {
		Self { path }
	}
}

impl DedupStore for FileDedupStore {
	fn load(&self) -> Result<HashMap<Fingerprint, DateTime<Utc>>, StoreError> {
		match fs::read(&self.path) {
			Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
			Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
			Err(err) => Err(err.into()),
		}
	}

	/// writes a temporary file next to the state file and renames it, so a
	/// crash never leaves a truncated state behind
	fn save(&self, entries: &HashMap<Fingerprint, DateTime<Utc>>) -> Result<(), StoreError> {
		if let Some(parent) = self.path.parent() {
			fs::create_dir_all(parent)?;
		}

		let tmp = self.path.with_extension("tmp");
		fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
		fs::rename(&tmp, &self.path)?;

		Ok(())
	}
}

/// no persistence at all
#[derive(Debug, Default)]
pub struct MemoryDedupStore;

impl DedupStore for MemoryDedupStore {
	fn load(&self) -> Result<HashMap<Fingerprint, DateTime<Utc>>, StoreError> {
		Ok(HashMap::new())
	}

	fn save(&self, _: &HashMap<Fingerprint, DateTime<Utc>>) -> Result<(), StoreError> {
		Ok(())
	}
}

#[derive(Debug)]
pub struct Deduplicator {
	window: Duration,
	/// fingerprint to the point in time it was last accepted
	entries: HashMap<Fingerprint, DateTime<Utc>>,
	store: Box<dyn DedupStore>,
	/// entries changed since the last save
	dirty: bool,
	clock: Arc<dyn Clock>,
}

impl Deduplicator {
	/// restores the persisted state. A broken state file is logged and
	/// ignored, which at worst delivers some alerts a second time.
	pub fn new(window: Duration, store: Box<dyn DedupStore>, clock: Arc<dyn Clock>) -> Self {
		let entries = store.load().unwrap_or_else(|err| {
			tracing::warn!("failed to restore dedup state, starting empty: {err}");
			HashMap::new()
		});

		let mut dedup = Self { window, entries, store, dirty: false, clock };
		let restored = dedup.entries.len();
		dedup.sweep();
		tracing::debug!("restored {} of {restored} dedup entries", dedup.entries.len());

		dedup
	}

	/// returns true if the alert should be delivered, in which case it's
	/// recorded as sent right away
	pub fn accept(&mut self, alert: &Alert) -> bool {
		self.accept_fingerprint(&Fingerprint::of(alert))
	}

	pub fn accept_fingerprint(&mut self, fingerprint: &Fingerprint) -> bool {
		let now = self.clock.now();

		if let Some(last_sent) = self.entries.get(fingerprint) {
			if elapsed(*last_sent, now) <= self.window {
				return false;
			}
		}

		self.entries.insert(fingerprint.clone(), now);
		self.dirty = true;

		true
	}

	/// forgets an accepted fingerprint after its delivery didn't happen
	pub fn rollback(&mut self, fingerprint: &Fingerprint) {
		if self.entries.remove(fingerprint).is_some() {
			self.dirty = true;
		}
	}

	/// drops entries older than the dedup window, returns how many
	pub fn sweep(&mut self) -> usize {
		let now = self.clock.now();
		let window = self.window;
		let before = self.entries.len();

		self.entries.retain(|_, last_sent| elapsed(*last_sent, now) <= window);

		let removed = before - self.entries.len();
		if removed > 0 {
			tracing::info!("cleaned {removed} old alerts from dedup state");
			self.dirty = true;
		}

		removed
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// writes the entries to the store if they changed since the last save.
	/// A failed save is retried on the next call.
	pub fn save(&mut self) {
		if !self.dirty {
			return;
		}

		match self.store.save(&self.entries) {
			Ok(()) => self.dirty = false,
			Err(err) => tracing::error!("failed to save dedup state: {err}"),
		}
	}
}
