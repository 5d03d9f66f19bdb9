// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
	io::{BufReader, Write},
	path::Path,
	sync::Arc,
	time::SystemTime,
};

use anyhow::{anyhow, Context, Result};
use cookie_store::CookieStore;
use regex::Regex;
use reqwest::{Client, Proxy};
use reqwest_cookie_store::CookieStoreMutex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{file_types::FileTypes, queue::RequestTickets};

pub mod course;
pub mod folder;
pub mod probe;
pub mod resource;

pub const FALLBACK_SECTION: &str = "General";
pub const DEFAULT_COURSE_TITLE: &str = "Moodle Course";

const FOLDER_PATH: &str = "/mod/folder/view.php";
const RESOURCE_PATH: &str = "/mod/resource/view.php";
const PLUGIN_FILE_PATH: &str = "/pluginfile.php/";
const LOGIN_PATH: &str = "/login/index.php";

/// Folder listing page, has to be fetched to find the files inside.
pub fn is_folder(url: &str) -> bool {
	url.contains(FOLDER_PATH)
}

/// Resource viewer page that redirects to (or embeds) the actual file.
pub fn is_resource(url: &str) -> bool {
	url.contains(RESOURCE_PATH)
}

/// URL pointing straight at file contents.
pub fn is_plugin_file(url: &str) -> bool {
	url.contains(PLUGIN_FILE_PATH)
}

/// A downloadable item found on a course page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLink {
	pub url: String,
	pub section: String,
	pub title: String,
}

impl ResourceLink {
	pub fn new(url: impl Into<String>, section: impl Into<String>, title: impl Into<String>) -> Self {
		ResourceLink {
			url: url.into(),
			section: section.into(),
			title: title.into(),
		}
	}
}

/// UI labels Moodle puts into link texts ("File", "קובץ", ...).
#[derive(Debug)]
pub struct Boilerplate {
	title: Vec<Regex>,
	folder: Vec<Regex>,
}

impl Default for Boilerplate {
	fn default() -> Self {
		Boilerplate::new(&[])
	}
}

impl Boilerplate {
	/// The built-in Hebrew and English labels plus `extra` literal labels.
	pub fn new(extra: &[String]) -> Self {
		let literal = |s: &String| Regex::new(&regex::escape(s)).unwrap();
		let mut title = vec![Regex::new(r"קובץ\s*").unwrap(), Regex::new(r"(?i)\s*File$").unwrap()];
		title.extend(extra.iter().map(literal));
		let mut folder = vec![
			Regex::new("תצוגת תיקיית קבצים").unwrap(),
			Regex::new("קובץ").unwrap(),
			Regex::new("File").unwrap(),
		];
		folder.extend(extra.iter().map(literal));
		Boilerplate { title, folder }
	}

	pub fn clean_title(&self, text: &str) -> String {
		strip_all(&self.title, text.trim())
	}

	pub fn clean_folder_name(&self, title: &str) -> String {
		strip_all(&self.folder, title)
	}
}

fn strip_all(patterns: &[Regex], text: &str) -> String {
	patterns
		.iter()
		.fold(text.to_owned(), |text, re| re.replace_all(&text, "").into_owned())
		.trim()
		.to_owned()
}

/// Everything the scanning side needs to know, fixed at start-up.
#[derive(Debug)]
pub struct ScanConfig {
	pub file_types: Arc<FileTypes>,
	pub boilerplate: Boilerplate,
	/// Simultaneous folder listing fetches.
	pub folder_jobs: usize,
}

impl Default for ScanConfig {
	fn default() -> Self {
		ScanConfig {
			file_types: Arc::new(FileTypes::moodle()),
			boilerplate: Boilerplate::default(),
			folder_jobs: 3,
		}
	}
}

/// A fetched HTML page and the URL it was finally served from.
#[derive(Debug)]
pub struct Page {
	pub url: Url,
	pub text: String,
}

pub struct Moodle {
	pub config: ScanConfig,
	client: Client,
	cookies: Arc<CookieStoreMutex>,
	tickets: RequestTickets,
}

impl Moodle {
	#[cfg(test)]
	pub fn new(config: ScanConfig) -> Result<Self> {
		let session = Arc::new(CookieStoreMutex::new(CookieStore::default()));
		Moodle::with_session(config, session, None, 0)
	}

	pub fn with_session(
		config: ScanConfig,
		session: Arc<CookieStoreMutex>,
		proxy: Option<&str>,
		rate: usize,
	) -> Result<Self> {
		let mut builder = Client::builder()
			.cookie_provider(Arc::clone(&session))
			.user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")));
		if let Some(proxy) = proxy {
			let proxy = Proxy::all(proxy)?;
			builder = builder.proxy(proxy);
		}
		let client = builder
			// timeout is infinite by default
			.build()?;
		Ok(Moodle {
			config,
			client,
			cookies: session,
			tickets: RequestTickets::new(rate),
		})
	}

	/// Loads cookies saved by [`Moodle::save_session`], if they are recent enough.
	pub fn load_session(path: &Path) -> Result<CookieStore> {
		let meta = std::fs::metadata(path)?;
		let modified = meta.modified()?;
		// the previous session is only useful if it isn't older than ~1 hour
		let duration = SystemTime::now().duration_since(modified)?;
		if duration.as_secs() > 60 * 60 {
			return Err(anyhow!("session data too old"));
		}
		let file = std::fs::File::open(path)?;
		CookieStore::load_json(BufReader::new(file))
			.map_err(|err| anyhow!(err))
			.context("failed to load session cookies")
	}

	pub fn save_session(&self, path: &Path) -> Result<()> {
		let mut writer = std::fs::File::create(path).map(std::io::BufWriter::new)?;
		let store = self.cookies.lock().map_err(|x| anyhow!("{}", x))?;
		// save all cookies, including session cookies
		for cookie in store.iter_unexpired().map(serde_json::to_string) {
			writeln!(writer, "{}", cookie?)?;
		}
		writer.flush()?;
		Ok(())
	}

	/// Adds a `NAME=VALUE` cookie for the whole site of `url`.
	pub fn add_cookie(&self, cookie: &str, url: &Url) -> Result<()> {
		// without a Path attribute the cookie would only apply below the course page
		let root = url.join("/")?;
		let mut store = self.cookies.lock().map_err(|x| anyhow!("{}", x))?;
		store
			.parse(cookie, &root)
			.map_err(|x| anyhow!("invalid cookie {:?}: {}", cookie, x))?;
		Ok(())
	}

	/// GET request following redirects. Non-success statuses and redirects
	/// to the login page are errors.
	pub async fn download(&self, url: &str) -> Result<reqwest::Response> {
		self.tickets.get().await;
		log!(2, "Downloading {}", url);
		let resp = self.client.get(url).send().await?.error_for_status()?;
		if resp.url().as_str().contains(LOGIN_PATH) {
			return Err(anyhow!("not logged in / session expired"));
		}
		Ok(resp)
	}

	pub async fn get_page(&self, url: &str) -> Result<Page> {
		let resp = self.download(url).await?;
		let url = resp.url().clone();
		let text = resp.text().await?;
		Ok(Page { url, text })
	}
}
