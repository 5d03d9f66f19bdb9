use std::collections::{BTreeSet, HashSet};

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::queue::run_bounded;

use super::{folder, is_folder, is_resource, Boilerplate, Moodle, ResourceLink, ScanConfig, DEFAULT_COURSE_TITLE, FALLBACK_SECTION};

static PAGE_CONTENT: Lazy<Selector> = Lazy::new(|| Selector::parse("#page-content").unwrap());
static LINKS: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());
static SECTION: Lazy<Selector> = Lazy::new(|| Selector::parse("li.section.course-section").unwrap());
static SECTION_NAME: Lazy<Selector> = Lazy::new(|| Selector::parse("h3.sectionname").unwrap());
static H1: Lazy<Selector> = Lazy::new(|| Selector::parse("h1").unwrap());
static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());

/// Class of the links in the course index sidebar.
const SIDEBAR_LINK: &str = "courseindex-link";

pub struct CoursePage {
	url: Url,
	document: Html,
}

/// A folder found on the course page, expanded after the first pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Folder {
	pub url: String,
	pub name: String,
	pub section: String,
}

/// Result of the first pass over a course page.
#[derive(Debug, Default)]
pub struct Scan {
	pub links: Vec<ResourceLink>,
	pub folders: Vec<Folder>,
	seen: HashSet<String>,
}

impl CoursePage {
	pub fn parse(url: Url, text: &str) -> Self {
		CoursePage {
			url,
			document: Html::parse_document(text),
		}
	}

	pub fn url(&self) -> &Url {
		&self.url
	}

	/// The main content region, without the course index sidebar.
	pub fn content(&self) -> ElementRef {
		self.document
			.select(&PAGE_CONTENT)
			.next()
			.unwrap_or_else(|| self.document.root_element())
	}

	pub fn title(&self) -> String {
		let text_of = |selector: &Selector| {
			self.document
				.select(selector)
				.next()
				.map(|x| x.text().collect::<String>().trim().to_owned())
				.filter(|x| !x.is_empty())
		};
		text_of(&H1)
			.or_else(|| text_of(&TITLE))
			.unwrap_or_else(|| DEFAULT_COURSE_TITLE.to_owned())
	}

	/// Names of all sections with a heading, sorted.
	pub fn sections(&self) -> Vec<String> {
		self.document
			.select(&SECTION)
			.filter_map(section_heading)
			.collect::<BTreeSet<_>>()
			.into_iter()
			.collect()
	}

	/// First pass: direct file and resource links in document order, and the
	/// folders that still have to be expanded.
	pub fn scan(&self, config: &ScanConfig, types: &[String]) -> Scan {
		let mut scan = Scan::default();
		for anchor in self.content().select(&LINKS) {
			if anchor.value().classes().any(|x| x == SIDEBAR_LINK) {
				continue;
			}
			let href = match anchor.value().attr("href") {
				Some(href) => href,
				None => continue,
			};
			let url = match self.url.join(href) {
				Ok(url) => url.to_string(),
				Err(_) => continue,
			};
			if is_folder(&url) {
				let name = config.boilerplate.clean_folder_name(&title_of(anchor, &config.boilerplate));
				scan.folders.push(Folder {
					url,
					name,
					section: section_of(anchor),
				});
				continue;
			}
			if (config.file_types.matches_any(&url, types) || is_resource(&url)) && !scan.seen.contains(&url) {
				scan.seen.insert(url.clone());
				let link = ResourceLink::new(url, section_of(anchor), title_of(anchor, &config.boilerplate));
				scan.links.push(link);
			}
		}
		scan
	}
}

/// Heading text of the enclosing course section, or "General".
pub fn section_of(element: ElementRef) -> String {
	enclosing_section(element)
		.and_then(section_heading)
		.unwrap_or_else(|| FALLBACK_SECTION.to_owned())
}

pub fn enclosing_section<'a>(element: ElementRef<'a>) -> Option<ElementRef<'a>> {
	element.ancestors().filter_map(ElementRef::wrap).find(|x| SECTION.matches(x))
}

pub fn section_heading(section: ElementRef) -> Option<String> {
	section
		.select(&SECTION_NAME)
		.next()
		.map(|x| x.text().collect::<String>().trim().to_owned())
		.filter(|x| !x.is_empty())
}

/// Link text without Moodle's labels, falling back to the last part of the href.
pub fn title_of(anchor: ElementRef, boilerplate: &Boilerplate) -> String {
	let title = boilerplate.clean_title(&anchor.text().collect::<String>());
	if !title.is_empty() {
		return title;
	}
	anchor
		.value()
		.attr("href")
		.and_then(|href| href.split('/').last())
		.filter(|x| !x.is_empty())
		.unwrap_or("resource")
		.to_owned()
}

/// Expands the folders of a first pass and returns all links of the course
/// page: direct ones first, then folder contents in completion order.
pub async fn collect_links(moodle: &Moodle, scan: Scan, types: &[String]) -> Vec<ResourceLink> {
	let Scan {
		mut links,
		folders,
		mut seen,
	} = scan;
	if !folders.is_empty() {
		log!(1, "Scanning {} folders for files..", folders.len());
		let expanded = run_bounded(folders, moodle.config.folder_jobs, |item| async move {
			folder::expand(moodle, &item, types).await
		})
		.await;
		for link in expanded.into_iter().flatten() {
			if seen.insert(link.url.clone()) {
				links.push(link);
			}
		}
	}
	log!(
		1,
		"Collected {} resource link{}",
		links.len(),
		if links.len() == 1 { "" } else { "s" }
	);
	links
}
