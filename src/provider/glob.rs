//! Gitignore style glob patterns.
//!
//! `*` matches within one path segment, `**` across segments, `?` one
//! character, and `[...]`/`[!...]` a character class. A pattern containing
//! a slash is anchored at the directory it is relative to; one without a
//! slash matches any single path segment. A trailing slash restricts the
//! pattern to directories.
use regex::Regex;

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
	/// The pattern as written.
	source: String,
	/// Matcher for a slash separated relative path.
	regex: Regex,
	/// Matches against the full relative path instead of single segments.
	anchored: bool,
	/// Matches directories only.
	dir_only: bool,
}

impl Pattern {
	/// Compile a pattern.
	pub fn new(pattern: &str) -> Result<Self, regex::Error> {
		let source = pattern.to_owned();
		let (pattern, dir_only) = match pattern.strip_suffix('/') {
			Some(stripped) => (stripped, true),
			None => (pattern, false),
		};
		let anchored = pattern.contains('/');
		let pattern = pattern.strip_prefix('/').unwrap_or(pattern);
		let regex = Regex::new(&translate(pattern))?;
		Ok(Self { source, regex, anchored, dir_only })
	}

	/// The pattern as written.
	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.source
	}

	/// Whether the pattern matches `path`, a slash separated path relative
	/// to the pattern's base, or any directory containing it.
	#[must_use]
	pub fn matches(&self, path: &str, is_dir: bool) -> bool {
		let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
		let last = segments.len().saturating_sub(1);
		(0..segments.len()).any(|i| {
			let candidate_is_dir = i < last || is_dir;
			if self.dir_only && !candidate_is_dir {
				return false;
			}
			if self.anchored {
				self.regex.is_match(&segments[..=i].join("/"))
			} else {
				self.regex.is_match(segments[i])
			}
		})
	}
}

/// Translate a glob into an anchored regular expression.
fn translate(glob: &str) -> String {
	let chars: Vec<char> = glob.chars().collect();
	let mut out = String::from("^");
	let mut i = 0;
	while i < chars.len() {
		match chars[i] {
			'*' if chars.get(i + 1) == Some(&'*') => {
				if chars.get(i + 2) == Some(&'/') {
					out.push_str("(?:.*/)?");
					i += 3;
				} else {
					out.push_str(".*");
					i += 2;
				}
				continue;
			}
			'*' => out.push_str("[^/]*"),
			'?' => out.push_str("[^/]"),
			'[' => match class_end(&chars, i) {
				Some(end) => {
					out.push('[');
					let mut body = &chars[i + 1..end];
					if let Some(('!' | '^', rest)) = body.split_first() {
						out.push('^');
						body = rest;
					}
					for c in body {
						if matches!(c, '\\' | '[' | ']' | '&' | '~') {
							out.push('\\');
						}
						out.push(*c);
					}
					out.push(']');
					i = end;
				}
				None => out.push_str(r"\["),
			},
			'\\' if i + 1 < chars.len() => {
				i += 1;
				out.push_str(&regex::escape(&chars[i].to_string()));
			}
			c => out.push_str(&regex::escape(&c.to_string())),
		}
		i += 1;
	}
	out.push('$');
	out
}

/// Index of the `]` closing the class opened at `start`.
fn class_end(chars: &[char], start: usize) -> Option<usize> {
	let mut i = start + 1;
	if matches!(chars.get(i), Some('!' | '^')) {
		i += 1;
	}
	// A leading `]` is part of the class.
	if chars.get(i) == Some(&']') {
		i += 1;
	}
	chars[i.min(chars.len())..].iter().position(|c| *c == ']').map(|p| p + i)
}
