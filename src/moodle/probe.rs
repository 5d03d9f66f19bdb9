use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use scraper::{ElementRef, Selector};

use crate::{file_types::FileTypes, queue::run_bounded};

use super::{
	course::{enclosing_section, section_heading, CoursePage},
	folder, Moodle,
};

static ACTIVITY_ITEMS: Lazy<Selector> = Lazy::new(|| Selector::parse(".activity-item").unwrap());
static FOLDER_LINK: Lazy<Selector> = Lazy::new(|| Selector::parse(r#"a[href*="/mod/folder/view.php"]"#).unwrap());
static FILE_ICON: Lazy<Selector> = Lazy::new(|| Selector::parse(r#"img[src*="/f/"]"#).unwrap());

/// Types seen directly on the course page, and folders whose contents
/// still have to be inspected.
#[derive(Debug, Default, PartialEq)]
pub struct Probe {
	pub types: BTreeSet<&'static str>,
	pub folders: Vec<String>,
}

/// Looks at the file icons of the activities in the given sections
/// (all sections if `sections` is empty).
pub fn probe_page(page: &CoursePage, file_types: &FileTypes, sections: &[String]) -> Probe {
	let mut probe = Probe::default();
	let items = page.content().select(&ACTIVITY_ITEMS).collect::<Vec<_>>();
	log!(1, "Found {} activity items", items.len());
	for item in items {
		if !sections.is_empty() && !in_sections(item, sections) {
			continue;
		}
		if let Some(link) = item.select(&FOLDER_LINK).next() {
			let url = link.value().attr("href").and_then(|href| page.url().join(href).ok());
			if let Some(url) = url {
				log!(1, "Found folder to scan: {}", activity_name(item));
				probe.folders.push(url.to_string());
			}
			continue;
		}
		let icon = item
			.select(&FILE_ICON)
			.next()
			.and_then(|img| img.value().attr("src"))
			.and_then(|src| folder::icon_type(src, file_types));
		if let Some(key) = icon {
			log!(2, "Found {}: {}", key, activity_name(item));
			probe.types.insert(key);
		}
	}
	probe
}

fn in_sections(item: ElementRef, sections: &[String]) -> bool {
	// items outside of any section never match a selection
	match enclosing_section(item) {
		Some(section) => sections.contains(&section_heading(section).unwrap_or_default()),
		None => false,
	}
}

fn activity_name<'a>(item: ElementRef<'a>) -> &'a str {
	item.value().attr("data-activityname").unwrap_or_default()
}

/// Sorted type keys available in the probed sections, including folder contents.
pub async fn available_types(moodle: &Moodle, probe: Probe) -> Vec<String> {
	let Probe { mut types, folders } = probe;
	if !folders.is_empty() {
		log!(1, "Scanning {} folders..", folders.len());
		let found = run_bounded(folders, moodle.config.folder_jobs, |url| async move {
			folder::icon_types(moodle, &url).await
		})
		.await;
		types.extend(found.into_iter().flatten());
	}
	let types = types.into_iter().map(str::to_owned).collect::<Vec<_>>();
	log!(1, "Detected file types: {:?}", types);
	types
}

#[cfg(test)]
mod tests {
	use url::Url;

	use super::*;
	use crate::moodle::ScanConfig;

	fn course(folder_href: &str) -> String {
		format!(
			r#"<div id="page-content"><ul>
			<li class="section course-section"><h3 class="sectionname">Week 1</h3><ul>
				<li class="activity"><div class="activity-item" data-activityname="Intro">
					<img src="/theme/image.php/boost/core/1/f/pdf-24"><a href="/mod/resource/view.php?id=1">Intro</a></div></li>
				<li class="activity"><div class="activity-item" data-activityname="Archive">
					<img src="/theme/image.php/boost/core/1/f/archive-24"></div></li>
			</ul></li>
			<li class="section course-section"><h3 class="sectionname">Week 2</h3><ul>
				<li class="activity"><div class="activity-item" data-activityname="Deck">
					<img src="/theme/image.php/boost/core/1/f/powerpoint-24"></div></li>
				<li class="activity"><div class="activity-item" data-activityname="Material">
					<img src="/theme/image.php/boost/core/1/monologo"><a href="{}">Material</a></div></li>
			</ul></li>
			</ul>
			<div class="activity-item"><img src="/f/spreadsheet-24"></div>
			</div>"#,
			folder_href
		)
	}

	fn page(base: &str, text: &str) -> CoursePage {
		CoursePage::parse(Url::parse(base).unwrap(), text)
	}

	#[test]
	fn probes_all_sections() {
		let page = page("https://m.example/course/view.php?id=1", &course("/mod/folder/view.php?id=4"));
		let probe = probe_page(&page, &FileTypes::moodle(), &[]);
		assert_eq!(probe.types.into_iter().collect::<Vec<_>>(), vec!["pdf", "pptx", "xlsx"]);
		assert_eq!(probe.folders, vec!["https://m.example/mod/folder/view.php?id=4"]);
	}

	#[test]
	fn probes_selected_sections_only() {
		let page = page("https://m.example/course/view.php?id=1", &course("/mod/folder/view.php?id=4"));
		let probe = probe_page(&page, &FileTypes::moodle(), &["Week 1".to_owned()]);
		assert_eq!(
			probe,
			Probe {
				types: vec!["pdf"].into_iter().collect(),
				folders: Vec::new(),
			}
		);
	}

	#[tokio::test]
	async fn folder_icons_are_included() {
		let mut server = mockito::Server::new_async().await;
		let _folder = server
			.mock("GET", mockito::Matcher::Regex(r"^/mod/folder/view\.php".to_owned()))
			.with_body(r#"<img src="/theme/image.php/boost/core/1/f/document-24"><img src="/f/text-24">"#)
			.create_async()
			.await;
		let moodle = Moodle::new(ScanConfig::default()).unwrap();
		let text = course("/mod/folder/view.php?id=4");
		let probe = {
			let page = page(&format!("{}/course/view.php?id=1", server.url()), &text);
			probe_page(&page, &moodle.config.file_types, &["Week 2".to_owned()])
		};
		assert_eq!(available_types(&moodle, probe).await, vec!["docx", "pptx", "text"]);
	}
}
