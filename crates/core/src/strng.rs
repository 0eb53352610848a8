use arcstr::ArcStr;

/// Strng is a cheap-to-clone immutable string. Names, identity components and
/// provenance tags are copied around the system constantly, so they all use
/// this instead of `String`.
pub type Strng = ArcStr;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	ArcStr::from(s.as_ref())
}

pub use arcstr::format;
pub use arcstr::literal;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn new_from_str_types() {
		let a = new("proxy");
		let b = new(String::from("proxy"));
		assert_eq!(a, b);
		assert_eq!(self::format!("{}-{}", a, 1), "proxy-1");
	}
}
