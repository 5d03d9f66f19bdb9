use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use ignore::gitignore::Gitignore;

pub const IGNORE_FILE: &str = ".moodleignore";

/// Gitignore-style rules read from `.moodleignore` files in the download
/// directory and all of its ancestors.
#[derive(Clone, Debug, Default)]
pub struct MoodleIgnore {
	// closest directory first
	rules: Vec<Rules>,
}

#[derive(Clone, Debug)]
struct Rules {
	ignore: Gitignore,
	/// Path from the directory of the ignore file to the download directory.
	prefix: PathBuf,
}

impl MoodleIgnore {
	/// `root` should be canonical, otherwise parent directories are not found.
	pub fn load(root: PathBuf) -> Result<Self> {
		let mut rules = Vec::new();
		let mut dir = root.as_path();
		let mut prefix = PathBuf::new();
		// e.g. root = /home/me/Uni/WS 24/Algorithms
		// /home/me/Uni/.moodleignore sees paths as "WS 24/Algorithms/<course>/<section>/<file>"
		loop {
			let (ignore, error) = Gitignore::new(dir.join(IGNORE_FILE));
			if let Some(err) = error {
				warning!(err);
			}
			if !ignore.is_empty() {
				log!(1, "Loaded {}", dir.join(IGNORE_FILE).display());
				rules.push(Rules {
					ignore,
					prefix: prefix.clone(),
				});
			}
			let name = match dir.components().last() {
				Some(Component::Normal(name)) => name.to_owned(),
				_ => break,
			};
			prefix = Path::new(&name).join(prefix);
			dir = match dir.parent() {
				Some(parent) => parent,
				None => break,
			};
		}
		Ok(MoodleIgnore { rules })
	}

	/// `path` is relative to the download directory.
	pub fn should_ignore(&self, path: &Path, is_dir: bool) -> bool {
		for rules in &self.rules {
			let matched = rules.ignore.matched_path_or_any_parents(rules.prefix.join(path), is_dir);
			if matched.is_whitelist() {
				return false;
			} else if matched.is_ignore() {
				return true;
			}
		}
		false
	}
}
