use std::{collections::BTreeSet, fmt};

use serde::{de, Deserialize};

/// allow list of telegram user ids or restartable service units. We implement
/// Deserialize our selves so user ids may be given as numbers and so that unit
/// names are checked before they ever reach a command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList(BTreeSet<String>);

impl AllowList {
	pub fn contains(&self, entry: &str) -> bool {
		self.0.contains(entry)
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	/// entries in sorted order
	pub fn iter(&self) -> impl Iterator<Item = &str> {
		self.0.iter().map(String::as_str)
	}

	/// entries that are not valid systemd unit names
	pub fn invalid_unit_names(&self) -> Vec<&str> {
		self.iter().filter(|name| !is_valid_unit_name(name)).collect()
	}
}

impl<S: Into<String>> FromIterator<S> for AllowList {
	fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
		Self(iter.into_iter().map(Into::into).collect())
	}
}

/// letters, digits and `_@.-`, not starting with `-` so it can't be mistaken
/// for a command line flag
pub fn is_valid_unit_name(name: &str) -> bool {
	!name.is_empty()
		&& name.len() <= 256
		&& !name.starts_with('-')
		&& name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '@' | '.' | '-'))
}

struct AllowListVisitor();

/// an allow list element
#[derive(Deserialize)]
#[serde(untagged)]
enum Entry {
	Text(String),
	Number(i64),
}

impl<'de> de::Visitor<'de> for AllowListVisitor {
	type Value = AllowList;

	fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
		formatter.write_str("a list of user ids or service names")
	}

	fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
	where
		A: de::SeqAccess<'de>,
	{
		let mut set = BTreeSet::new();

		while let Some(entry) = seq.next_element::<Entry>()? {
			let entry = match entry {
				Entry::Text(text) => text.trim().to_owned(),
				Entry::Number(number) => number.to_string(),
			};

			if entry.is_empty() {
				return Err(de::Error::invalid_value(de::Unexpected::Str(""), &self));
			}

			set.insert(entry);
		}

		Ok(AllowList(set))
	}
}

impl<'de> Deserialize<'de> for AllowList {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		deserializer.deserialize_seq(AllowListVisitor())
	}
}
