use std::fmt;

use chrono::{Local, NaiveDateTime, TimeDelta, Timelike};
use serde::{Deserialize, Serialize};

const FORMAT: &str = "%Y%m%d%H%M%S";
const LEN: usize = 14;

/// Session identifier: local start time as `YYYYMMDDhhmmss`.
///
/// The fixed-width digit form makes lexical order chronological, which is
/// what retention relies on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
	/// Accepts exactly fourteen digits forming a valid timestamp.
	pub fn parse(raw: &str) -> Option<Self> {
		if raw.len() != LEN || !raw.bytes().all(|b| b.is_ascii_digit()) {
			return None;
		}
		NaiveDateTime::parse_from_str(raw, FORMAT).ok()?;
		Some(Self(raw.to_string()))
	}

	pub fn from_datetime(at: NaiveDateTime) -> Self {
		Self(at.format(FORMAT).to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	fn datetime(&self) -> Option<NaiveDateTime> {
		NaiveDateTime::parse_from_str(&self.0, FORMAT).ok()
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl TryFrom<String> for SessionId {
	type Error = String;

	fn try_from(raw: String) -> Result<Self, String> {
		Self::parse(&raw).ok_or_else(|| format!("invalid session id '{raw}'"))
	}
}

impl From<SessionId> for String {
	fn from(id: SessionId) -> Self {
		id.0
	}
}

/// Hands out strictly increasing session ids.
///
/// Two sessions opened within the same second, or a clock that stepped
/// backwards, would otherwise collide with or sort before an existing session.
#[derive(Debug, Default)]
pub struct SessionIdGenerator {
	last: Option<SessionId>,
}

impl SessionIdGenerator {
	/// `last` is the newest session already on disk, if any.
	pub fn new(last: Option<SessionId>) -> Self {
		Self { last }
	}

	pub fn next(&mut self) -> SessionId {
		self.next_at(Local::now().naive_local())
	}

	pub fn next_at(&mut self, now: NaiveDateTime) -> SessionId {
		let now = now.with_nanosecond(0).unwrap_or(now);
		let mut id = SessionId::from_datetime(now);
		if let Some(previous) = self.last.as_ref().filter(|last| id <= **last).and_then(SessionId::datetime) {
			id = SessionId::from_datetime(previous + TimeDelta::seconds(1));
		}
		self.last = Some(id.clone());
		id
	}
}
