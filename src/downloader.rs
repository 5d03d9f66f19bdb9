// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
	collections::HashMap,
	io,
	path::{Path, PathBuf},
	str::FromStr,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{
	cli::{PROGRESS_BAR, PROGRESS_BAR_ENABLED},
	file_types::FileTypes,
	moodle::{Moodle, ResourceLink, DEFAULT_COURSE_TITLE},
	moodleignore::MoodleIgnore,
	queue::run_bounded,
	util::{basename_from_url, create_dir, file_escape, sanitize_for_folder, write_stream_to_file},
};

/// What the download manager does if the target file exists already.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictAction {
	/// Save as `name (1).ext`, `name (2).ext`, ...
	Uniquify,
	Overwrite,
	Skip,
}

impl Default for ConflictAction {
	fn default() -> Self {
		ConflictAction::Uniquify
	}
}

impl FromStr for ConflictAction {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"uniquify" => Ok(ConflictAction::Uniquify),
			"overwrite" => Ok(ConflictAction::Overwrite),
			"skip" => Ok(ConflictAction::Skip),
			_ => Err(format!("unknown conflict action: {}", s)),
		}
	}
}

/// A single download handed to a [`DownloadManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
	pub url: String,
	/// `course/section/file`, relative to the download directory.
	pub filename: String,
	pub conflict_action: ConflictAction,
	/// Never ask the user where to save.
	pub save_as: bool,
}

pub type DownloadId = u64;

/// Accepts download requests. Submitting may fail for single requests
/// without affecting the others.
#[async_trait]
pub trait DownloadManager: Send + Sync {
	async fn download(&self, request: &DownloadRequest) -> Result<DownloadId>;
}

/// Builds the requests for `links`, in input order.
///
/// Links sharing section and title are numbered from the second one on,
/// before the extension: `Notes.pdf`, `Notes (2).pdf`, ...
pub fn plan(
	links: &[ResourceLink],
	course_title: &str,
	file_types: &FileTypes,
	conflict_action: ConflictAction,
) -> Vec<DownloadRequest> {
	let course = if course_title.trim().is_empty() {
		DEFAULT_COURSE_TITLE
	} else {
		course_title
	};
	let course = sanitize_for_folder(course);
	let mut seen: HashMap<(&str, String), usize> = HashMap::new();
	links
		.iter()
		.map(|link| {
			let title = if link.title.trim().is_empty() {
				basename_from_url(&link.url)
			} else {
				link.title.clone()
			};
			let count = seen.entry((link.section.as_str(), title.clone())).or_insert(0);
			*count += 1;
			let name = file_name(&title, &link.url, *count, file_types);
			DownloadRequest {
				url: link.url.clone(),
				filename: format!("{}/{}/{}", course, sanitize_for_folder(&link.section), name),
				conflict_action,
				save_as: false,
			}
		})
		.collect()
}

fn file_name(title: &str, url: &str, n: usize, file_types: &FileTypes) -> String {
	let title = file_escape(title);
	let (stem, extension) = if file_types.has_known_extension(&title) {
		match title.rsplit_once('.') {
			Some((stem, extension)) => (stem.to_owned(), extension.to_owned()),
			None => (title.clone(), file_types.extension_of(url, &title)),
		}
	} else {
		(title.clone(), file_types.extension_of(url, &title))
	};
	if n > 1 {
		format!("{} ({}).{}", stem, n, extension)
	} else {
		format!("{}.{}", stem, extension)
	}
}

/// Outcome of handing a batch of links to the download manager.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
	pub submitted: usize,
	pub failed: usize,
	pub ignored: usize,
}

pub struct Dispatcher<M> {
	manager: M,
	file_types: Arc<FileTypes>,
	jobs: usize,
	conflict_action: ConflictAction,
	ignore: Option<MoodleIgnore>,
}

impl<M: DownloadManager> Dispatcher<M> {
	pub fn new(manager: M, file_types: Arc<FileTypes>, jobs: usize) -> Self {
		Dispatcher {
			manager,
			file_types,
			jobs,
			conflict_action: ConflictAction::default(),
			ignore: None,
		}
	}

	pub fn with_conflict_action(mut self, conflict_action: ConflictAction) -> Self {
		self.conflict_action = conflict_action;
		self
	}

	pub fn with_ignore(mut self, ignore: MoodleIgnore) -> Self {
		self.ignore = Some(ignore);
		self
	}

	#[cfg(test)]
	pub fn manager(&self) -> &M {
		&self.manager
	}

	/// Submits one download per link, at most `jobs` submissions at a time.
	/// Failed submissions are logged and counted, they don't stop the batch.
	pub async fn dispatch(&self, links: &[ResourceLink], course_title: &str) -> DispatchReport {
		let mut report = DispatchReport::default();
		let mut requests = plan(links, course_title, &self.file_types, self.conflict_action);
		if let Some(ignore) = self.ignore.as_ref() {
			requests.retain(|request| {
				let ignored = ignore.should_ignore(Path::new(&request.filename), false);
				if ignored {
					log!(1, "Ignored {}", request.filename);
				}
				!ignored
			});
			report.ignored = links.len() - requests.len();
		}
		if PROGRESS_BAR_ENABLED.load(Ordering::SeqCst) {
			PROGRESS_BAR.inc_length(requests.len() as u64);
		}
		let results = run_bounded(requests, self.jobs, |request| async move {
			if PROGRESS_BAR_ENABLED.load(Ordering::SeqCst) {
				PROGRESS_BAR.set_message(request.filename.clone());
			}
			let result = self.manager.download(&request).await;
			if PROGRESS_BAR_ENABLED.load(Ordering::SeqCst) {
				PROGRESS_BAR.inc(1);
			}
			match result {
				Ok(id) => {
					log!(1, "Queued download {} for {}", id, request.filename);
					true
				},
				Err(e) => {
					warning!(format => "download of {} failed: {:?}", request.filename, e);
					false
				},
			}
		})
		.await;
		for ok in results {
			if ok {
				report.submitted += 1;
			} else {
				report.failed += 1;
			}
		}
		report
	}
}

/// Saves downloads below a local directory.
pub struct FsDownloadManager {
	moodle: Arc<Moodle>,
	root: PathBuf,
	next_id: AtomicU64,
}

impl FsDownloadManager {
	pub fn new(moodle: Arc<Moodle>, root: PathBuf) -> Self {
		FsDownloadManager {
			moodle,
			root,
			next_id: AtomicU64::new(1),
		}
	}

	fn target(&self, filename: &str) -> Result<PathBuf> {
		let mut path = self.root.clone();
		for part in filename.split('/') {
			if part.is_empty() || part == "." || part == ".." {
				return Err(anyhow!("invalid download path {:?}", filename));
			}
			path.push(part);
		}
		Ok(path)
	}
}

#[async_trait]
impl DownloadManager for FsDownloadManager {
	async fn download(&self, request: &DownloadRequest) -> Result<DownloadId> {
		let id = self.next_id.fetch_add(1, Ordering::SeqCst);
		let path = self.target(&request.filename)?;
		if request.conflict_action == ConflictAction::Skip && fs::metadata(&path).await.is_ok() {
			log!(1, "Skipping download, file exists already: {}", request.filename);
			return Ok(id);
		}
		if let Some(parent) = path.parent() {
			create_dir(parent).await?;
		}
		let resp = self.moodle.download(&request.url).await?;
		let (file, path) = match open_target(&path, request.conflict_action).await? {
			Some(target) => target,
			None => {
				log!(1, "Skipping download, file exists already: {}", request.filename);
				return Ok(id);
			},
		};
		log!(0, "Writing {}", path.strip_prefix(&self.root).unwrap_or(&path).display());
		if let Err(e) = write_stream_to_file(file, resp.bytes_stream()).await {
			// don't leave a truncated file behind
			let _ = fs::remove_file(&path).await;
			return Err(e).with_context(|| format!("failed to save {}", request.filename));
		}
		Ok(id)
	}
}

/// Creates the file for a download. Returns `None` if it should be skipped.
async fn open_target(path: &Path, conflict_action: ConflictAction) -> Result<Option<(fs::File, PathBuf)>> {
	if conflict_action == ConflictAction::Overwrite {
		let file = fs::File::create(path).await.context("failed to create file")?;
		return Ok(Some((file, path.to_owned())));
	}
	let mut n = 0;
	loop {
		let candidate = if n == 0 { path.to_owned() } else { numbered(path, n) };
		match fs::OpenOptions::new().write(true).create_new(true).open(&candidate).await {
			Ok(file) => return Ok(Some((file, candidate))),
			Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
				if conflict_action == ConflictAction::Skip {
					return Ok(None);
				}
			},
			Err(e) => return Err(e).context("failed to create file"),
		}
		n += 1;
	}
}

/// `dir/name.ext` -> `dir/name (n).ext`
fn numbered(path: &Path, n: usize) -> PathBuf {
	let stem = path.file_stem().map(|x| x.to_string_lossy()).unwrap_or_default();
	let name = match path.extension() {
		Some(extension) => format!("{} ({}).{}", stem, n, extension.to_string_lossy()),
		None => format!("{} ({})", stem, n),
	};
	path.with_file_name(name)
}

#[cfg(test)]
mod tests {
	use std::sync::{
		atomic::{AtomicUsize, Ordering},
		Mutex,
	};

	use tokio::task;

	use super::*;
	use crate::moodle::ScanConfig;

	/// Remembers every request and fails those whose URL contains "fail".
	#[derive(Default)]
	struct RecordingManager {
		requests: Mutex<Vec<DownloadRequest>>,
		in_flight: AtomicUsize,
		max_in_flight: AtomicUsize,
	}

	#[async_trait]
	impl DownloadManager for RecordingManager {
		async fn download(&self, request: &DownloadRequest) -> Result<DownloadId> {
			let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
			self.max_in_flight.fetch_max(now, Ordering::SeqCst);
			task::yield_now().await;
			task::yield_now().await;
			self.in_flight.fetch_sub(1, Ordering::SeqCst);
			if request.url.contains("fail") {
				return Err(anyhow!("refused"));
			}
			let mut requests = self.requests.lock().unwrap();
			requests.push(request.clone());
			Ok(requests.len() as DownloadId)
		}
	}

	fn link(url: &str, section: &str, title: &str) -> ResourceLink {
		ResourceLink::new(url, section, title)
	}

	fn filenames(requests: &[DownloadRequest]) -> Vec<&str> {
		requests.iter().map(|x| x.filename.as_str()).collect()
	}

	#[test]
	fn plans_paths_and_numbering() {
		let links = vec![
			link("https://m.example/pluginfile.php/1/a.pdf", "Week 1", "Notes"),
			link("https://m.example/pluginfile.php/1/b.pdf", "Week 1", "Notes"),
			link("https://m.example/pluginfile.php/1/c.pdf", "Week 2", "Notes"),
			link("https://m.example/pluginfile.php/1/slides.pptx?forcedownload=1", "Week: 3", "Slides"),
			link("https://m.example/pluginfile.php/1/deck.ppt", "Week: 3", "Folder - deck.ppt"),
			link("https://m.example/pluginfile.php/1/deck.ppt", "Week: 3", "Folder - deck.ppt"),
			link("https://m.example/pluginfile.php/1/report.docx", "", "  "),
			link("https://m.example/pluginfile.php/1/view", "General", "Sheet 1/2"),
		];
		let requests = plan(&links, "Algo: Intro", &FileTypes::moodle(), ConflictAction::Uniquify);
		assert_eq!(
			filenames(&requests),
			vec![
				"Algo- Intro/Week 1/Notes.pdf",
				"Algo- Intro/Week 1/Notes (2).pdf",
				"Algo- Intro/Week 2/Notes.pdf",
				"Algo- Intro/Week- 3/Slides.pptx",
				"Algo- Intro/Week- 3/Folder - deck.ppt",
				"Algo- Intro/Week- 3/Folder - deck (2).ppt",
				"Algo- Intro/Unknown/report.docx",
				"Algo- Intro/General/Sheet 1-2.pdf",
			]
		);
		assert!(requests
			.iter()
			.all(|x| x.conflict_action == ConflictAction::Uniquify && !x.save_as));
	}

	#[test]
	fn untitled_links_are_numbered_by_their_file_name() {
		let links = vec![
			link("https://m.example/pluginfile.php/1/a.pdf", "S", ""),
			link("https://m.example/pluginfile.php/2/b.pdf", "S", ""),
			link("https://m.example/pluginfile.php/3/a.pdf", "S", " "),
		];
		let requests = plan(&links, "", &FileTypes::moodle(), ConflictAction::Uniquify);
		assert_eq!(
			filenames(&requests),
			vec![
				"Moodle Course/S/a.pdf",
				"Moodle Course/S/b.pdf",
				"Moodle Course/S/a (2).pdf",
			]
		);
	}

	#[test]
	fn requests_serialize_like_the_downloads_api() {
		let request = DownloadRequest {
			url: "https://m.example/pluginfile.php/1/a.pdf".to_owned(),
			filename: "C/S/a.pdf".to_owned(),
			conflict_action: ConflictAction::Uniquify,
			save_as: false,
		};
		assert_eq!(
			serde_json::to_value(&request).unwrap(),
			serde_json::json!({
				"url": "https://m.example/pluginfile.php/1/a.pdf",
				"filename": "C/S/a.pdf",
				"conflictAction": "uniquify",
				"saveAs": false,
			})
		);
	}

	#[test]
	fn parses_conflict_actions() {
		assert_eq!("skip".parse::<ConflictAction>(), Ok(ConflictAction::Skip));
		assert!("rename".parse::<ConflictAction>().is_err());
	}

	#[tokio::test]
	async fn failures_do_not_stop_the_batch() {
		let links = (0..10)
			.map(|i| {
				let url = if i == 4 {
					"https://m.example/pluginfile.php/fail.pdf".to_owned()
				} else {
					format!("https://m.example/pluginfile.php/{}.pdf", i)
				};
				link(&url, "S", &format!("File {}", i))
			})
			.collect::<Vec<_>>();
		let dispatcher = Dispatcher::new(RecordingManager::default(), Arc::new(FileTypes::moodle()), 3);
		let report = dispatcher.dispatch(&links, "Course").await;
		assert_eq!(
			report,
			DispatchReport {
				submitted: 9,
				failed: 1,
				ignored: 0,
			}
		);
		let manager = dispatcher.manager();
		assert_eq!(manager.max_in_flight.load(Ordering::SeqCst), 3);
		let mut names = manager
			.requests
			.lock()
			.unwrap()
			.iter()
			.map(|x| x.filename.clone())
			.collect::<Vec<_>>();
		names.sort();
		assert_eq!(names.len(), 9);
		assert!(!names.contains(&"Course/S/File 4.pdf".to_owned()));
	}

	#[tokio::test]
	async fn ignored_files_are_not_submitted() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join(".moodleignore"), "*.pptx\n").unwrap();
		let ignore = MoodleIgnore::load(dir.path().to_owned()).unwrap();
		let links = vec![
			link("https://m.example/pluginfile.php/1/a.pdf", "S", "a.pdf"),
			link("https://m.example/pluginfile.php/1/b.pptx", "S", "b.pptx"),
		];
		let dispatcher =
			Dispatcher::new(RecordingManager::default(), Arc::new(FileTypes::moodle()), 3).with_ignore(ignore);
		let report = dispatcher.dispatch(&links, "Course").await;
		assert_eq!((report.submitted, report.ignored), (1, 1));
		assert_eq!(
			filenames(&dispatcher.manager().requests.lock().unwrap()),
			vec!["Course/S/a.pdf"]
		);
	}

	#[test]
	fn numbers_before_the_extension() {
		assert_eq!(numbered(Path::new("/d/notes.pdf"), 1), Path::new("/d/notes (1).pdf"));
		assert_eq!(numbered(Path::new("/d/README"), 2), Path::new("/d/README (2)"));
	}

	#[tokio::test]
	async fn saves_files_below_the_root() {
		let mut server = mockito::Server::new_async().await;
		let _file = server
			.mock("GET", "/pluginfile.php/1/a.pdf")
			.with_body("%PDF-1.4 new")
			.create_async()
			.await;
		let _missing = server
			.mock("GET", "/pluginfile.php/1/missing.pdf")
			.with_status(404)
			.create_async()
			.await;
		let dir = tempfile::tempdir().unwrap();
		let existing = dir.path().join("Course").join("S");
		std::fs::create_dir_all(&existing).unwrap();
		std::fs::write(existing.join("a.pdf"), "old").unwrap();

		let moodle = Arc::new(Moodle::new(ScanConfig::default()).unwrap());
		let manager = FsDownloadManager::new(moodle, dir.path().to_owned());
		let request = |url: String, conflict_action| DownloadRequest {
			url,
			filename: "Course/S/a.pdf".to_owned(),
			conflict_action,
			save_as: false,
		};
		let url = format!("{}/pluginfile.php/1/a.pdf", server.url());

		manager.download(&request(url.clone(), ConflictAction::Skip)).await.unwrap();
		assert_eq!(std::fs::read_to_string(existing.join("a.pdf")).unwrap(), "old");

		manager.download(&request(url.clone(), ConflictAction::Uniquify)).await.unwrap();
		assert_eq!(std::fs::read_to_string(existing.join("a (1).pdf")).unwrap(), "%PDF-1.4 new");

		manager.download(&request(url.clone(), ConflictAction::Overwrite)).await.unwrap();
		assert_eq!(std::fs::read_to_string(existing.join("a.pdf")).unwrap(), "%PDF-1.4 new");

		let missing = format!("{}/pluginfile.php/1/missing.pdf", server.url());
		let mut failing = request(missing, ConflictAction::Uniquify);
		failing.filename = "Course/S/missing.pdf".to_owned();
		assert!(manager.download(&failing).await.is_err());
		assert!(!existing.join("missing.pdf").exists());

		let mut escaping = request(url.clone(), ConflictAction::Uniquify);
		escaping.filename = "Course/../../etc/passwd".to_owned();
		assert!(manager.download(&escaping).await.is_err());
	}

	#[tokio::test]
	async fn login_page_is_not_saved_as_the_file() {
		let mut server = mockito::Server::new_async().await;
		let login = format!("{}/login/index.php", server.url());
		let _file = server
			.mock("GET", "/pluginfile.php/1/a.pdf")
			.with_status(303)
			.with_header("location", &login)
			.create_async()
			.await;
		let _login = server
			.mock("GET", "/login/index.php")
			.with_body("<form>login</form>")
			.create_async()
			.await;
		let dir = tempfile::tempdir().unwrap();
		let moodle = Arc::new(Moodle::new(ScanConfig::default()).unwrap());
		let manager = FsDownloadManager::new(moodle, dir.path().to_owned());
		let request = DownloadRequest {
			url: format!("{}/pluginfile.php/1/a.pdf", server.url()),
			filename: "Course/S/a.pdf".to_owned(),
			conflict_action: ConflictAction::Uniquify,
			save_as: false,
		};
		assert!(manager.download(&request).await.is_err());
		assert!(!dir.path().join("Course").join("S").join("a.pdf").exists());
	}
}
