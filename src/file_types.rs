// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use regex::{Regex, RegexBuilder};
use url::Url;

/// Extension used when neither the URL nor the title names one.
pub const DEFAULT_EXTENSION: &str = "pdf";

/// One downloadable file category, e.g. "pptx" covering `.pptx` and `.ppt`.
#[derive(Debug)]
pub struct FileType {
	pub key: &'static str,
	pub extensions: &'static [&'static str],
	pub label: &'static str,
	/// Name of the Moodle file icon (`.../f/<icon>-24`) used for this type.
	pub icon: &'static str,
	pattern: Regex,
}

impl FileType {
	fn new(key: &'static str, extensions: &'static [&'static str], label: &'static str, icon: &'static str) -> Self {
		FileType {
			key,
			extensions,
			label,
			icon,
			pattern: extension_regex(extensions, r"(\?|$)"),
		}
	}

	/// Exact suffix match, optionally followed by a query string.
	pub fn matches(&self, url: &str) -> bool {
		self.pattern.is_match(url)
	}
}

fn extension_regex(extensions: &[&str], tail: &str) -> Regex {
	let alternatives = extensions.iter().map(|x| regex::escape(x)).collect::<Vec<_>>().join("|");
	RegexBuilder::new(&format!(r"\.({}){}", alternatives, tail))
		.case_insensitive(true)
		.build()
		.unwrap()
}

/// The registry of known file types. Built once and shared read-only.
#[derive(Debug)]
pub struct FileTypes {
	types: Vec<FileType>,
	icons: HashMap<&'static str, Option<&'static str>>,
	known_suffix: Regex,
}

impl Default for FileTypes {
	fn default() -> Self {
		FileTypes::moodle()
	}
}

impl FileTypes {
	pub fn moodle() -> Self {
		let types = vec![
			FileType::new("pdf", &["pdf"], "PDF", "pdf"),
			FileType::new("pptx", &["pptx", "ppt"], "PowerPoint", "powerpoint"),
			FileType::new("docx", &["docx", "doc"], "Word", "document"),
			FileType::new("xlsx", &["xlsx", "xls", "csv"], "Excel", "spreadsheet"),
			FileType::new("text", &["txt", "rtf"], "Text", "text"),
		];
		let mut icons = types.iter().map(|t| (t.icon, Some(t.key))).collect::<HashMap<_, _>>();
		// archives show up on course pages but are never downloaded
		icons.insert("archive", None);
		let all = types.iter().flat_map(|t| t.extensions.iter().copied()).collect::<Vec<_>>();
		FileTypes {
			known_suffix: extension_regex(&all, "$"),
			types,
			icons,
		}
	}

	pub fn get(&self, key: &str) -> Option<&FileType> {
		self.types.iter().find(|t| t.key == key)
	}

	/// Fails on the first key that is not in the registry.
	pub fn validate(&self, keys: &[String]) -> Result<()> {
		match keys.iter().find(|key| self.get(key).is_none()) {
			Some(key) => Err(anyhow!("Unknown file type: {}", key)),
			None => Ok(()),
		}
	}

	/// True if `url` has an extension belonging to any of the requested types.
	pub fn matches_any(&self, url: &str, keys: &[String]) -> bool {
		keys.iter().filter_map(|key| self.get(key)).any(|t| t.matches(url))
	}

	/// Translates a Moodle icon name into a type key. Unknown and
	/// non-downloadable icons yield `None`.
	pub fn type_for_icon(&self, icon: &str) -> Option<&'static str> {
		self.icons.get(icon).copied().flatten()
	}

	pub fn has_known_extension(&self, name: &str) -> bool {
		self.known_suffix.is_match(name)
	}

	/// Extension for a download: taken from the URL path, then the title,
	/// falling back to [`DEFAULT_EXTENSION`].
	pub fn extension_of(&self, url: &str, title: &str) -> String {
		let from_url = Url::parse(url).ok().and_then(|url| self.known_extension(url.path()));
		from_url
			.or_else(|| self.known_extension(title))
			.unwrap_or_else(|| DEFAULT_EXTENSION.to_owned())
	}

	fn known_extension(&self, text: &str) -> Option<String> {
		self.known_suffix
			.captures(text)
			.and_then(|c| c.get(1))
			.map(|m| m.as_str().to_ascii_lowercase())
	}
}
