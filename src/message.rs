// SPDX-License-Identifier: GPL-3.0-or-later

use std::{collections::BTreeSet, sync::Arc};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
	downloader::{DownloadManager, Dispatcher},
	moodle::{
		course::{self, CoursePage},
		probe::{self, probe_page},
		resource, Moodle, Page, ResourceLink, DEFAULT_COURSE_TITLE,
	},
};

/// A request from the front end, tagged by `"type"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
	CollectSections,
	GetAvailableTypes {
		/// `None` or empty means all sections.
		#[serde(default)]
		sections: Option<Vec<String>>,
	},
	CollectLinks {
		#[serde(default, rename = "fileTypes")]
		file_types: Vec<String>,
	},
	DownloadLinks {
		#[serde(default)]
		links: Vec<ResourceLink>,
		#[serde(default = "default_course_title", rename = "courseTitle")]
		course_title: String,
	},
}

fn default_course_title() -> String {
	DEFAULT_COURSE_TITLE.to_owned()
}

/// The answer to a [`Request`]. Serialized without a tag, every variant
/// carries `ok`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Response {
	#[serde(rename_all = "camelCase")]
	Sections {
		ok: bool,
		sections: Vec<String>,
		course_title: String,
	},
	#[serde(rename_all = "camelCase")]
	AvailableTypes { ok: bool, available_types: Vec<String> },
	#[serde(rename_all = "camelCase")]
	Links {
		ok: bool,
		links: Vec<ResourceLink>,
		course_title: String,
		sections: Vec<String>,
	},
	Downloaded { ok: bool, count: usize },
	Failure { ok: bool, error: String },
}

impl Response {
	pub fn failure(error: impl Into<String>) -> Self {
		Response::Failure {
			ok: false,
			error: error.into(),
		}
	}

	pub fn is_ok(&self) -> bool {
		!matches!(self, Response::Failure { .. })
	}
}

/// Links of the given sections, all links if `sections` is empty.
pub fn filter_sections(links: Vec<ResourceLink>, sections: &[String]) -> Vec<ResourceLink> {
	if sections.is_empty() {
		return links;
	}
	links.into_iter().filter(|x| sections.contains(&x.section)).collect()
}

/// Answers requests about one course page. Every request fetches the page again.
pub struct Handler<M> {
	moodle: Arc<Moodle>,
	course_url: String,
	dispatcher: Dispatcher<M>,
}

impl<M: DownloadManager> Handler<M> {
	pub fn new(moodle: Arc<Moodle>, course_url: impl Into<String>, dispatcher: Dispatcher<M>) -> Self {
		Handler {
			moodle,
			course_url: course_url.into(),
			dispatcher,
		}
	}

	/// Never fails: errors become a [`Response::Failure`].
	pub async fn handle(&self, request: Request) -> Response {
		let result = match request {
			Request::CollectSections => self.collect_sections().await,
			Request::GetAvailableTypes { sections } => self.available_types(sections.unwrap_or_default()).await,
			Request::CollectLinks { file_types } => self.collect_links(file_types).await,
			Request::DownloadLinks { links, course_title } => self.download_links(links, course_title).await,
		};
		result.unwrap_or_else(|e| {
			log!(1, "Request failed: {:?}", e);
			Response::failure(format!("{:#}", e))
		})
	}

	async fn fetch_course(&self) -> Result<Page> {
		self.moodle
			.get_page(&self.course_url)
			.await
			.context("failed to fetch course page")
	}

	async fn collect_sections(&self) -> Result<Response> {
		let page = self.fetch_course().await?;
		let page = CoursePage::parse(page.url, &page.text);
		let sections = page.sections();
		log!(1, "Found {} sections", sections.len());
		Ok(Response::Sections {
			ok: true,
			sections,
			course_title: page.title(),
		})
	}

	async fn available_types(&self, sections: Vec<String>) -> Result<Response> {
		let page = self.fetch_course().await?;
		let probe = {
			let page = CoursePage::parse(page.url, &page.text);
			probe_page(&page, &self.moodle.config.file_types, &sections)
		};
		Ok(Response::AvailableTypes {
			ok: true,
			available_types: probe::available_types(&self.moodle, probe).await,
		})
	}

	async fn collect_links(&self, types: Vec<String>) -> Result<Response> {
		if types.is_empty() {
			return Err(anyhow!("No file type selected"));
		}
		self.moodle.config.file_types.validate(&types)?;
		let page = self.fetch_course().await?;
		let (course_title, scan) = {
			let page = CoursePage::parse(page.url, &page.text);
			(page.title(), page.scan(&self.moodle.config, &types))
		};
		let links = course::collect_links(&self.moodle, scan, &types).await;
		let sections = links
			.iter()
			.map(|x| x.section.clone())
			.collect::<BTreeSet<_>>()
			.into_iter()
			.collect();
		let links = resource::resolve_links(&self.moodle, links, &types).await;
		Ok(Response::Links {
			ok: true,
			links,
			course_title,
			sections,
		})
	}

	async fn download_links(&self, links: Vec<ResourceLink>, course_title: String) -> Result<Response> {
		if links.is_empty() {
			return Err(anyhow!("No files to download"));
		}
		let report = self.dispatcher.dispatch(&links, &course_title).await;
		log!(
			1,
			"{} downloads submitted, {} failed, {} ignored",
			report.submitted,
			report.failed,
			report.ignored
		);
		Ok(Response::Downloaded {
			ok: true,
			count: links.len(),
		})
	}
}
