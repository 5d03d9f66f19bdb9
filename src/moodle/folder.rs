use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use crate::file_types::FileTypes;

use super::{course::Folder, Moodle, ResourceLink};

static FILE_LINKS: Lazy<Selector> = Lazy::new(|| Selector::parse(r#"a[href*="/pluginfile.php/"]"#).unwrap());
static FILE_ICONS: Lazy<Selector> = Lazy::new(|| Selector::parse(r#"img[src*="/f/"]"#).unwrap());
static ICON_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"/f/([^-/?]+)").unwrap());

/// Fetches a folder listing and returns the contained files of the requested
/// types. Failures are logged and yield no links.
pub async fn expand(moodle: &Moodle, folder: &Folder, types: &[String]) -> Vec<ResourceLink> {
	log!(1, "Fetching folder {}", folder.url);
	let page = match moodle.get_page(&folder.url).await {
		Ok(page) => page,
		Err(e) => {
			warning!(format => "could not scan folder {}: {:?}", folder.name, e);
			return Vec::new();
		},
	};
	let links = listed_files(&page.text, &page.url, folder, &moodle.config.file_types, types);
	log!(1, "Found {} files in folder: {}", links.len(), folder.name);
	links
}

/// Files in a folder listing, titled "<folder> - <file>".
pub fn listed_files(text: &str, base: &Url, folder: &Folder, file_types: &FileTypes, types: &[String]) -> Vec<ResourceLink> {
	let html = Html::parse_document(text);
	let links = html
		.select(&FILE_LINKS)
		.filter_map(|link| {
			let url = base.join(link.value().attr("href")?).ok()?.to_string();
			if !file_types.matches_any(&url, types) {
				return None;
			}
			let name = link.text().collect::<String>();
			Some(ResourceLink::new(
				url,
				folder.section.clone(),
				format!("{} - {}", folder.name, name.trim()),
			))
		})
		.collect();
	links
}

/// Type keys announced by the file icons of a folder listing.
/// Failures are logged and yield no types.
pub async fn icon_types(moodle: &Moodle, url: &str) -> BTreeSet<&'static str> {
	log!(1, "Fetching folder {}", url);
	match moodle.get_page(url).await {
		Ok(page) => {
			let types = icon_types_in(&Html::parse_document(&page.text), &moodle.config.file_types);
			log!(1, "Folder contains types: {:?}", types);
			types
		},
		Err(e) => {
			warning!(format => "could not scan folder {}: {:?}", url, e);
			BTreeSet::new()
		},
	}
}

pub fn icon_types_in(html: &Html, file_types: &FileTypes) -> BTreeSet<&'static str> {
	html.select(&FILE_ICONS)
		.filter_map(|img| img.value().attr("src"))
		.filter_map(|src| icon_type(src, file_types))
		.collect()
}

/// Type key for a Moodle file icon URL like `.../f/powerpoint-24`.
pub fn icon_type(src: &str, file_types: &FileTypes) -> Option<&'static str> {
	let icon = ICON_NAME.captures(src)?.get(1)?;
	file_types.type_for_icon(icon.as_str())
}
