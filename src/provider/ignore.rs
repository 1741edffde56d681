//! Ignore files scoping which documents the file provider emits.
use std::{
	collections::BTreeMap,
	path::{Path, PathBuf},
};

use tracing::warn;

use super::glob::Pattern;

/// File name of an ignore file.
pub const IGNORE_FILE: &str = ".mokapiignore";

/// One rule of an ignore file.
#[derive(Debug, Clone)]
struct Rule {
	/// The pattern to match.
	pattern: Pattern,
	/// Whether a match keeps the path instead of ignoring it.
	negated: bool,
}

/// The rules of one ignore file, relative to the directory holding it.
#[derive(Debug, Clone, Default)]
pub struct IgnoreFile {
	/// Rules in file order.
	rules: Vec<Rule>,
}

impl IgnoreFile {
	/// Parse the contents of an ignore file. Invalid patterns are logged and
	/// skipped.
	#[must_use]
	pub fn parse(contents: &str) -> Self {
		let rules = contents
			.lines()
			.map(str::trim)
			.filter(|line| !line.is_empty() && !line.starts_with('#'))
			.filter_map(|line| {
				let (line, negated) = match line.strip_prefix('!') {
					Some(line) => (line, true),
					None => (line, false),
				};
				match Pattern::new(line) {
					Ok(pattern) => Some(Rule { pattern, negated }),
					Err(err) => {
						warn!("skipping invalid ignore pattern {line:?}: {err}");
						None
					}
				}
			})
			.collect();
		Self { rules }
	}

	/// Whether a path relative to the ignore file's directory is ignored.
	///
	/// A path is ignored when a rule matches it and no negated rule keeps
	/// it, independent of rule order.
	#[must_use]
	pub fn is_ignored(&self, relative: &str, is_dir: bool) -> bool {
		let mut ignored = false;
		for rule in &self.rules {
			if rule.pattern.matches(relative, is_dir) {
				if rule.negated {
					return false;
				}
				ignored = true;
			}
		}
		ignored
	}
}

/// Ignore files by the directory holding them.
#[derive(Debug, Clone, Default)]
pub struct IgnoreFiles {
	/// Loaded files.
	files: BTreeMap<PathBuf, IgnoreFile>,
}

impl IgnoreFiles {
	/// Register the ignore file of `dir`.
	pub fn insert(&mut self, dir: PathBuf, file: IgnoreFile) {
		self.files.insert(dir, file);
	}

	/// Load `dir`'s ignore file if it has one, dropping a stale entry
	/// otherwise.
	pub fn load(&mut self, dir: &Path) {
		match std::fs::read_to_string(dir.join(IGNORE_FILE)) {
			Ok(contents) => self.insert(dir.to_path_buf(), IgnoreFile::parse(&contents)),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
				self.files.remove(dir);
			}
			Err(err) => warn!("reading {}: {err}", dir.join(IGNORE_FILE).display()),
		}
	}

	/// Whether `path` is ignored by the ignore file of its closest ancestor
	/// that has one.
	#[must_use]
	pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
		path.ancestors()
			.skip(1)
			.find_map(|dir| {
				let file = self.files.get(dir)?;
				let relative = path.strip_prefix(dir).ok()?;
				Some(file.is_ignored(&relative.to_string_lossy().replace('\\', "/"), is_dir))
			})
			.unwrap_or(false)
	}
}

#[cfg(test)]
mod tests {
	use std::path::Path;

	use super::{IgnoreFile, IgnoreFiles};

	#[test]
	fn negation_keeps_file_regardless_of_order() {
		let file = IgnoreFile::parse("!keep.yml\n*.yml\n");
		assert!(!file.is_ignored("keep.yml", false));
		assert!(file.is_ignored("other.yml", false));
		assert!(!file.is_ignored("other.json", false));
	}

	#[test]
	fn comments_and_blank_lines() {
		let file = IgnoreFile::parse("# drafts\n\n  drafts/\n");
		assert!(file.is_ignored("drafts/a.yml", false));
		assert!(!file.is_ignored("a.yml", false));
	}

	#[test]
	fn longest_directory_prefix_wins() {
		let mut files = IgnoreFiles::default();
		files.insert("/srv".into(), IgnoreFile::parse("*.yml"));
		files.insert("/srv/public".into(), IgnoreFile::parse("*.json"));

		assert!(files.is_ignored(Path::new("/srv/a.yml"), false));
		assert!(!files.is_ignored(Path::new("/srv/public/a.yml"), false));
		assert!(files.is_ignored(Path::new("/srv/public/a.json"), false));
		assert!(!files.is_ignored(Path::new("/elsewhere/a.yml"), false));
	}
}
