//! (De)serializes a `Duration` as a human-friendly Go-style string ("1h30m", "500ms")
//! instead of serde's default seconds-as-float. Parsing goes through `go_parse_duration` so
//! config files can use the same syntax as the upstream project this library is modeled on;
//! formatting goes through `durationfmt` so round-tripped config prints back out readably.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
	S: Serializer,
{
	serializer.serialize_str(&durationfmt::to_string(*d))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
	D: Deserializer<'de>,
{
	let s = String::deserialize(deserializer)?;
	parse(&s).map_err(serde::de::Error::custom)
}

pub fn parse(s: &str) -> Result<Duration, String> {
	let nanos = go_parse_duration::parse_duration(s)
		.map_err(|e| format!("invalid duration {s:?}: {e:?}"))?;
	if nanos < 0 {
		return Err(format!("duration {s:?} must not be negative"));
	}
	Ok(Duration::from_nanos(nanos as u64))
}

/// Same as [`mod@self`] but for `Option<Duration>`, treating an absent/null value as `None`
/// rather than an error.
pub mod option {
	use super::*;

	pub fn serialize<S>(d: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		match d {
			Some(d) => serializer.serialize_some(&durationfmt::to_string(*d)),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s: Option<String> = Option::deserialize(deserializer)?;
		s.map(|s| parse(&s).map_err(serde::de::Error::custom)).transpose()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_go_style_durations() {
		assert_eq!(parse("1s").unwrap(), Duration::from_secs(1));
		assert_eq!(parse("500ms").unwrap(), Duration::from_millis(500));
		assert_eq!(parse("1h30m").unwrap(), Duration::from_secs(5400));
	}

	#[test]
	fn rejects_negative_durations() {
		assert!(parse("-1s").is_err());
	}
}
