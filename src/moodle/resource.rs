use std::collections::HashSet;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{is_plugin_file, is_resource, Moodle, ResourceLink};

static PLUGIN_FILE_URL: Lazy<Regex> =
	Lazy::new(|| Regex::new(r#"(?i)https?://[^"'\s]+/pluginfile\.php/[^"'\s]+"#).unwrap());

/// Turns collected links into direct file links of the requested types.
///
/// Resource links are resolved one after another, in input order. A resource
/// page that embeds several files yields one link per file, all sharing the
/// original section and title.
pub async fn resolve_links(moodle: &Moodle, links: Vec<ResourceLink>, types: &[String]) -> Vec<ResourceLink> {
	let file_types = &moodle.config.file_types;
	let mut resolved = Vec::new();
	for link in links {
		if is_plugin_file(&link.url) {
			if file_types.matches_any(&link.url, types) {
				resolved.push(link);
			}
		} else if is_resource(&link.url) {
			let urls = match resolve_resource(moodle, &link.url).await {
				Ok(urls) => urls,
				Err(e) => {
					warning!(format => "failed to resolve {}: {:?}", link.url, e);
					continue;
				},
			};
			for url in urls.into_iter().filter(|url| file_types.matches_any(url, types)) {
				resolved.push(ResourceLink::new(url, link.section.clone(), link.title.clone()));
			}
		}
	}
	log!(
		1,
		"Resolved {} link{}",
		resolved.len(),
		if resolved.len() == 1 { "" } else { "s" }
	);
	resolved
}

/// Follows the redirects of a resource page. If they don't end at a file,
/// the page itself is searched for file URLs.
async fn resolve_resource(moodle: &Moodle, url: &str) -> Result<Vec<String>> {
	log!(1, "Resolving {}", url);
	let resp = moodle.download(url).await?;
	if is_plugin_file(resp.url().as_str()) {
		return Ok(vec![resp.url().to_string()]);
	}
	let text = resp.text().await?;
	Ok(plugin_file_urls(&text))
}

/// All distinct file URLs mentioned in `text`, in order of appearance.
pub fn plugin_file_urls(text: &str) -> Vec<String> {
	let mut seen = HashSet::new();
	PLUGIN_FILE_URL
		.find_iter(text)
		.map(|m| m.as_str())
		.filter(|url| seen.insert(*url))
		.map(|url| url.to_owned())
		.collect()
}
