//! Serde helpers shared across config and wire types.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Durations as human-friendly strings ("500ms", "10s", "6h", "7d").
pub mod dur {
	use super::*;

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&super::format_duration(d))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		let raw = String::deserialize(d)?;
		duration_str::parse(&raw).map_err(serde::de::Error::custom)
	}
}

pub mod dur_option {
	use super::*;

	pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
		match d {
			Some(d) => s.serialize_some(&super::format_duration(d)),
			None => s.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
		let raw = Option::<String>::deserialize(d)?;
		raw
			.map(|raw| duration_str::parse(&raw).map_err(serde::de::Error::custom))
			.transpose()
	}
}

fn format_duration(d: &Duration) -> String {
	if d.subsec_millis() > 0 || d.as_secs() == 0 {
		format!("{}ms", d.as_millis())
	} else {
		format!("{}s", d.as_secs())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(serde::Serialize, serde::Deserialize)]
	struct Wrapper {
		#[serde(with = "dur")]
		d: Duration,
	}

	#[test]
	fn duration_round_trip() {
		for (input, want) in [
			("500ms", Duration::from_millis(500)),
			("10s", Duration::from_secs(10)),
			("6h", Duration::from_secs(6 * 3600)),
			("7d", Duration::from_secs(7 * 86_400)),
		] {
			let w: Wrapper = serde_json::from_str(&format!("{{\"d\":\"{input}\"}}")).unwrap();
			assert_eq!(w.d, want);
			let out = serde_json::to_string(&w).unwrap();
			let back: Wrapper = serde_json::from_str(&out).unwrap();
			assert_eq!(back.d, want);
		}
	}
}
