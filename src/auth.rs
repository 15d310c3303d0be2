//! Two factor authorization of privileged actions.
//!
//! A user has to be on the admin allow list and the target on the action allow
//! list. Without a valid session the admin is sent a one time code first,
//! submitting it opens a session for [SESSION_TTL]. With a session the request
//! becomes a [PendingAction] that has to be confirmed explicitly. The
//! confirmation id travels through the chat, so both allow lists are checked
//! once more when it comes back.
//!
//! Every expiry is checked lazily on access, [Authorizer::sweep] only bounds
//! memory.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use rand::{distributions::Alphanumeric, Rng};
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};

use crate::{
	allow_list::AllowList,
	clock::{elapsed, Clock},
};

/// how long a session lasts after the code was accepted
pub const SESSION_TTL: Duration = Duration::from_secs(60 * 60);

const PENDING_ID_LEN: usize = 16;

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
	/// lifetime of an issued one time code
	#[serde_as(as = "DurationSeconds<f64>")]
	#[serde(default = "default_ttl")]
	pub code_ttl: Duration,
	/// lifetime of a pending action waiting for confirmation
	#[serde_as(as = "DurationSeconds<f64>")]
	#[serde(default = "default_ttl")]
	pub confirmation_ttl: Duration,
}

fn default_ttl() -> Duration {
	Duration::from_secs(5 * 60)
}

impl Default for AuthSettings {
	fn default() -> Self {
		Self { code_ttl: default_ttl(), confirmation_ttl: default_ttl() }
	}
}

/// a freshly issued one time code. It has to be delivered to the user, so it
/// can be read with [IssuedCode::expose], but it never shows up in debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCode(String);

impl IssuedCode {
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for IssuedCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("IssuedCode(******)")
	}
}

/// opaque identifier of a [PendingAction]
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingActionId(String);

impl PendingActionId {
	fn generate() -> Self {
		let id = rand::thread_rng()
			.sample_iter(&Alphanumeric)
			.take(PENDING_ID_LEN)
			.map(char::from)
			.collect();
		Self(id)
	}
}

impl From<&str> for PendingActionId {
	fn from(id: &str) -> Self {
		Self(id.to_owned())
	}
}

impl fmt::Display for PendingActionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
	/// deliberately doesn't say which check failed
	Denied,
	/// the admin has no session, the code has to be delivered to them
	NeedsAuth(IssuedCode),
	NeedsConfirmation(PendingActionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeOutcome {
	Accepted,
	Rejected,
	NoCodeOutstanding,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
	/// the action may be executed on this target
	Approved(String),
	Denied,
}

#[derive(Debug, Clone)]
struct OneTimeCode {
	code: String,
	issued_at: DateTime<Utc>,
}

/// a privileged action waiting for confirmation
#[derive(Debug, Clone)]
pub struct PendingAction {
	pub user_id: String,
	pub target: String,
	pub requested_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Authorizer {
	admins: Arc<AllowList>,
	actions: Arc<AllowList>,

	/// user id to the point in time the session was opened
	sessions: HashMap<String, DateTime<Utc>>,
	/// at most one outstanding code per user
	codes: HashMap<String, OneTimeCode>,
	pending: HashMap<PendingActionId, PendingAction>,

	code_ttl: Duration,
	confirmation_ttl: Duration,
	clock: Arc<dyn Clock>,
}

impl Authorizer {
	pub fn new(
		admins: Arc<AllowList>,
		actions: Arc<AllowList>,
		settings: &AuthSettings,
		clock: Arc<dyn Clock>,
	) -> Self {
		Self {
			admins,
			actions,
			sessions: HashMap::new(),
			codes: HashMap::new(),
			pending: HashMap::new(),
			code_ttl: settings.code_ttl,
			confirmation_ttl: settings.confirmation_ttl,
			clock,
		}
	}

	pub fn is_admin(&self, user_id: &str) -> bool {
		self.admins.contains(user_id)
	}

	pub fn actions(&self) -> &AllowList {
		&self.actions
	}

	/// swaps both allow lists. Pending actions stay, they are checked against
	/// the new lists when confirmed.
	pub fn reload(&mut self, admins: Arc<AllowList>, actions: Arc<AllowList>) {
		self.admins = admins;
		self.actions = actions;

		let admins = &self.admins;
		self.sessions.retain(|user_id, _| admins.contains(user_id));
		self.codes.retain(|user_id, _| admins.contains(user_id));
	}

	/// whether the user has a session that didn't expire yet
	pub fn has_session(&mut self, user_id: &str) -> bool {
		let now = self.clock.now();

		match self.sessions.get(user_id) {
			Some(opened) if elapsed(*opened, now) < SESSION_TTL => true,
			Some(_) => {
				self.sessions.remove(user_id);
				tracing::info!("session of {user_id} expired");
				false
			}
			None => false,
		}
	}

	/// first step of a privileged action
	pub fn request_action(&mut self, user_id: &str, target: &str) -> RequestOutcome {
		if !self.admins.contains(user_id) {
			tracing::warn!("denied privileged action on {target:?} for non admin {user_id}");
			return RequestOutcome::Denied;
		}

		if !self.actions.contains(target) {
			tracing::warn!("denied privileged action on {target:?} for {user_id}, target not allowed");
			return RequestOutcome::Denied;
		}

		if !self.has_session(user_id) {
			let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
			let issued_at = self.clock.now();

			if self.codes.insert(user_id.to_owned(), OneTimeCode { code: code.clone(), issued_at }).is_some() {
				tracing::debug!("replaced outstanding code of {user_id}");
			}
			tracing::info!("issued one time code to {user_id} for action on {target}");

			return RequestOutcome::NeedsAuth(IssuedCode(code));
		}

		let id = PendingActionId::generate();
		let action = PendingAction {
			user_id: user_id.to_owned(),
			target: target.to_owned(),
			requested_at: self.clock.now(),
		};
		self.pending.insert(id.clone(), action);
		tracing::info!("{user_id} requested action on {target}, waiting for confirmation");

		RequestOutcome::NeedsConfirmation(id)
	}

	/// a wrong code stays valid for further attempts until it expires or is
	/// replaced
	pub fn submit_code(&mut self, user_id: &str, code: &str) -> CodeOutcome {
		let now = self.clock.now();

		let outstanding = match self.codes.get(user_id) {
			Some(outstanding) => outstanding,
			None => return CodeOutcome::NoCodeOutstanding,
		};

		if elapsed(outstanding.issued_at, now) >= self.code_ttl {
			self.codes.remove(user_id);
			tracing::info!("one time code of {user_id} expired");
			return CodeOutcome::NoCodeOutstanding;
		}

		if !constant_time_eq(outstanding.code.as_bytes(), code.trim().as_bytes()) {
			tracing::warn!("wrong one time code submitted by {user_id}");
			return CodeOutcome::Rejected;
		}

		self.codes.remove(user_id);
		self.sessions.insert(user_id.to_owned(), now);
		tracing::info!("opened session for {user_id}");

		CodeOutcome::Accepted
	}

	/// second step of a privileged action. Only the user who requested the
	/// action can confirm it, and only while both allow lists still permit it.
	pub fn confirm(&mut self, user_id: &str, id: &PendingActionId) -> ConfirmOutcome {
		let now = self.clock.now();

		let action = match self.pending.remove(id) {
			Some(action) => action,
			None => {
				tracing::warn!("{user_id} confirmed unknown action {id}");
				return ConfirmOutcome::Denied;
			}
		};

		if action.user_id != user_id {
			tracing::warn!("{user_id} tried to confirm action {id} of {}", action.user_id);
			self.pending.insert(id.clone(), action);
			return ConfirmOutcome::Denied;
		}

		if elapsed(action.requested_at, now) >= self.confirmation_ttl {
			tracing::info!("action {id} on {} expired before confirmation", action.target);
			return ConfirmOutcome::Denied;
		}

		if !self.admins.contains(user_id) || !self.actions.contains(&action.target) {
			tracing::warn!("denied confirmation of action on {} for {user_id}", action.target);
			return ConfirmOutcome::Denied;
		}

		tracing::info!("{user_id} confirmed action on {}", action.target);
		ConfirmOutcome::Approved(action.target)
	}

	/// discards a pending action, returns whether there was one
	pub fn cancel(&mut self, id: &PendingActionId) -> bool {
		self.pending.remove(id).is_some()
	}

	/// discards every pending action of the user, returns how many
	pub fn cancel_all_for(&mut self, user_id: &str) -> usize {
		let before = self.pending.len();
		self.pending.retain(|_, action| action.user_id != user_id);
		before - self.pending.len()
	}

	/// drops expired codes, sessions and pending actions
	pub fn sweep(&mut self) {
		let now = self.clock.now();
		let (code_ttl, confirmation_ttl) = (self.code_ttl, self.confirmation_ttl);

		self.codes.retain(|_, code| elapsed(code.issued_at, now) < code_ttl);
		self.sessions.retain(|_, opened| elapsed(*opened, now) < SESSION_TTL);
		self.pending.retain(|_, action| elapsed(action.requested_at, now) < confirmation_ttl);
	}

	#[cfg(test)]
	fn pending_len(&self) -> usize {
		self.pending.len()
	}
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	a.len() == b.len() && a.iter().zip(b).fold(0, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::ManualClock;

	fn list(entries: &[&str]) -> Arc<AllowList> {
		Arc::new(entries.iter().copied().collect())
	}

	fn authorizer(clock: &ManualClock) -> Authorizer {
		Authorizer::new(
			list(&["U1", "U2"]),
			list(&["nginx"]),
			&AuthSettings::default(),
			Arc::new(clock.clone()),
		)
	}

	fn issue(auth: &mut Authorizer, user_id: &str) -> String {
		match auth.request_action(user_id, "nginx") {
			RequestOutcome::NeedsAuth(code) => code.expose().to_owned(),
			other => panic!("expected a code, got {other:?}"),
		}
	}

	fn wrong(code: &str) -> String {
		code.chars().map(|c| if c == '0' { '1' } else { '0' }).collect()
	}

	fn confirmation(auth: &mut Authorizer, user_id: &str) -> PendingActionId {
		match auth.request_action(user_id, "nginx") {
			RequestOutcome::NeedsConfirmation(id) => id,
			other => panic!("expected confirmation, got {other:?}"),
		}
	}

	#[test]
	fn code_to_confirmed_restart() {
		let clock = ManualClock::at_hour(12, 0);
		let mut auth = authorizer(&clock);

		let code = issue(&mut auth, "U1");
		assert_eq!(code.len(), 6);
		assert!(code.chars().all(|c| c.is_ascii_digit()));

		assert_eq!(auth.submit_code("U1", &wrong(&code)), CodeOutcome::Rejected);
		assert!(!auth.has_session("U1"));

		assert_eq!(auth.submit_code("U1", &code), CodeOutcome::Accepted);
		assert!(auth.has_session("U1"));
		assert_eq!(auth.submit_code("U1", &code), CodeOutcome::NoCodeOutstanding);

		let id = confirmation(&mut auth, "U1");
		assert_eq!(auth.confirm("U1", &id), ConfirmOutcome::Approved("nginx".into()));
		// single use
		assert_eq!(auth.confirm("U1", &id), ConfirmOutcome::Denied);
	}

	#[test]
	fn denies_non_admins_and_unlisted_targets() {
		let clock = ManualClock::at_hour(12, 0);
		let mut auth = authorizer(&clock);

		assert_eq!(auth.request_action("intruder", "nginx"), RequestOutcome::Denied);
		assert_eq!(auth.request_action("U1", "sshd"), RequestOutcome::Denied);
		assert_eq!(auth.submit_code("intruder", "123456"), CodeOutcome::NoCodeOutstanding);
	}

	#[test]
	fn session_lasts_an_hour() {
		let clock = ManualClock::at_hour(12, 0);
		let mut auth = authorizer(&clock);

		let code = issue(&mut auth, "U1");
		assert_eq!(auth.submit_code("U1", &code), CodeOutcome::Accepted);

		clock.advance(SESSION_TTL - Duration::from_secs(1));
		assert!(matches!(auth.request_action("U1", "nginx"), RequestOutcome::NeedsConfirmation(_)));

		clock.advance(Duration::from_secs(1));
		assert!(matches!(auth.request_action("U1", "nginx"), RequestOutcome::NeedsAuth(_)));
	}

	#[test]
	fn code_expires() {
		let clock = ManualClock::at_hour(12, 0);
		let mut auth = authorizer(&clock);

		let code = issue(&mut auth, "U1");
		clock.advance(Duration::from_secs(5 * 60));
		assert_eq!(auth.submit_code("U1", &code), CodeOutcome::NoCodeOutstanding);
		assert!(!auth.has_session("U1"));
	}

	#[test]
	fn new_code_replaces_old_one() {
		let clock = ManualClock::at_hour(12, 0);
		let mut auth = authorizer(&clock);

		let first = issue(&mut auth, "U1");
		let second = loop {
			let code = issue(&mut auth, "U1");
			if code != first {
				break code;
			}
		};

		assert_eq!(auth.submit_code("U1", &first), CodeOutcome::Rejected);
		assert_eq!(auth.submit_code("U1", &second), CodeOutcome::Accepted);
	}

	#[test]
	fn confirmation_is_checked_against_reloaded_lists() {
		let clock = ManualClock::at_hour(12, 0);
		let mut auth = authorizer(&clock);

		let code = issue(&mut auth, "U1");
		auth.submit_code("U1", &code);
		let id = confirmation(&mut auth, "U1");

		auth.reload(list(&["U1", "U2"]), list(&["postgresql"]));
		assert_eq!(auth.confirm("U1", &id), ConfirmOutcome::Denied);
	}

	#[test]
	fn confirmation_by_revoked_admin_is_denied() {
		let clock = ManualClock::at_hour(12, 0);
		let mut auth = authorizer(&clock);

		let code = issue(&mut auth, "U1");
		auth.submit_code("U1", &code);
		let id = confirmation(&mut auth, "U1");

		auth.reload(list(&["U2"]), list(&["nginx"]));
		assert_eq!(auth.confirm("U1", &id), ConfirmOutcome::Denied);
		assert!(!auth.has_session("U1"));
	}

	#[test]
	fn only_requester_can_confirm() {
		let clock = ManualClock::at_hour(12, 0);
		let mut auth = authorizer(&clock);

		let code = issue(&mut auth, "U1");
		auth.submit_code("U1", &code);
		let id = confirmation(&mut auth, "U1");

		assert_eq!(auth.confirm("U2", &id), ConfirmOutcome::Denied);
		assert_eq!(auth.confirm("U1", &id), ConfirmOutcome::Approved("nginx".into()));
	}

	#[test]
	fn confirmation_expires() {
		let clock = ManualClock::at_hour(12, 0);
		let mut auth = authorizer(&clock);

		let code = issue(&mut auth, "U1");
		auth.submit_code("U1", &code);
		let id = confirmation(&mut auth, "U1");

		clock.advance(Duration::from_secs(5 * 60));
		assert_eq!(auth.confirm("U1", &id), ConfirmOutcome::Denied);
	}

	#[test]
	fn cancel_discards_pending_actions() {
		let clock = ManualClock::at_hour(12, 0);
		let mut auth = authorizer(&clock);

		let code = issue(&mut auth, "U1");
		auth.submit_code("U1", &code);
		let first = confirmation(&mut auth, "U1");
		confirmation(&mut auth, "U1");

		assert!(auth.cancel(&first));
		assert!(!auth.cancel(&first));
		assert_eq!(auth.confirm("U1", &first), ConfirmOutcome::Denied);
		assert_eq!(auth.cancel_all_for("U1"), 1);
		assert_eq!(auth.pending_len(), 0);
	}

	#[test]
	fn sweep_drops_expired_state() {
		let clock = ManualClock::at_hour(12, 0);
		let mut auth = authorizer(&clock);

		let code = issue(&mut auth, "U1");
		auth.submit_code("U1", &code);
		confirmation(&mut auth, "U1");
		issue(&mut auth, "U2");

		clock.advance(SESSION_TTL);
		auth.sweep();

		assert_eq!(auth.pending_len(), 0);
		assert!(auth.codes.is_empty());
		assert!(auth.sessions.is_empty());
	}

	#[test]
	fn code_is_redacted_in_debug_output() {
		let code = IssuedCode("123456".into());
		assert!(!format!("{code:?}").contains("123456"));
	}
}
