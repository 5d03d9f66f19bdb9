// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize};

use indicatif::ProgressBar;
use once_cell::sync::Lazy;
use structopt::StructOpt;

use crate::downloader::ConflictAction;

#[derive(Debug, Clone, StructOpt)]
#[structopt(name = env!("CARGO_PKG_NAME"))]
pub struct Opt {
	/// Moodle course page, e.g. https://moodle.example.org/course/view.php?id=42
	#[structopt(long)]
	pub course_url: String,

	/// Output directory
	#[structopt(short, long, parse(from_os_str), default_value = ".")]
	pub output: PathBuf,

	/// Verbose logging
	#[structopt(short, multiple = true, parse(from_occurrences))]
	pub verbose: usize,

	/// Session cookie to send, e.g. MoodleSession=0123abcd
	#[structopt(long = "cookie", number_of_values = 1)]
	pub cookies: Vec<String>,

	/// Attempt to re-use session cookies
	#[structopt(long)]
	pub keep_session: bool,

	/// Proxy, e.g. socks5h://127.0.0.1:1080
	#[structopt(short, long)]
	pub proxy: Option<String>,

	/// Requests per minute (0 = no limit)
	#[structopt(long, default_value = "60")]
	pub rate: usize,

	/// Parallel download jobs
	#[structopt(short, long, default_value = "3")]
	pub jobs: usize,

	/// Parallel folder scans
	#[structopt(long, default_value = "3")]
	pub folder_jobs: usize,

	/// Additional label to remove from link titles
	#[structopt(long = "strip-label", number_of_values = 1)]
	pub strip_labels: Vec<String>,

	/// Print raw JSON responses
	#[structopt(long)]
	pub json: bool,

	#[structopt(subcommand)]
	pub cmd: Command,
}

#[derive(Debug, Clone, StructOpt)]
pub enum Command {
	/// List the sections of the course
	Sections,
	/// Show which file types are present
	Types {
		/// Only look at this section (repeatable)
		#[structopt(short, long = "section", number_of_values = 1)]
		sections: Vec<String>,
	},
	/// List the files that would be downloaded
	Links {
		/// File type: pdf, pptx, docx, xlsx or text (repeatable)
		#[structopt(short = "t", long = "type", number_of_values = 1, default_value = "pdf")]
		types: Vec<String>,
	},
	/// Download the files of the course
	Download {
		/// File type: pdf, pptx, docx, xlsx or text (repeatable)
		#[structopt(short = "t", long = "type", number_of_values = 1, default_value = "pdf")]
		types: Vec<String>,

		/// Only download files of this section (repeatable)
		#[structopt(short, long = "section", number_of_values = 1)]
		sections: Vec<String>,

		/// What to do with existing files
		#[structopt(long, default_value = "uniquify", possible_values = &["uniquify", "overwrite", "skip"])]
		conflict: ConflictAction,
	},
	/// Answer JSON requests read from stdin, one per line
	Serve,
}

pub static LOG_LEVEL: AtomicUsize = AtomicUsize::new(0);
/// Log to stderr, keeping stdout free for responses.
pub static LOG_TO_STDERR: AtomicBool = AtomicBool::new(false);
pub static PROGRESS_BAR_ENABLED: AtomicBool = AtomicBool::new(false);
pub static PROGRESS_BAR: Lazy<ProgressBar> = Lazy::new(|| ProgressBar::new(0));

macro_rules! log {
	($lvl:expr, $($t:expr),+) => {{
		#[allow(unused_imports)]
		use colored::Colorize as _;
		#[allow(unused_comparisons)] // 0 <= 0
		if $lvl <= crate::cli::LOG_LEVEL.load(std::sync::atomic::Ordering::SeqCst) {
			if crate::cli::PROGRESS_BAR_ENABLED.load(std::sync::atomic::Ordering::SeqCst) {
				crate::cli::PROGRESS_BAR.println(format!($($t),+));
			} else if crate::cli::LOG_TO_STDERR.load(std::sync::atomic::Ordering::SeqCst) {
				eprintln!($($t),+);
			} else {
				println!($($t),+);
			}
		}
	}}
}

macro_rules! info {
	($t:tt) => {
		log!(0, $t);
	};
}

macro_rules! warning {
	($e:expr) => {{
		log!(0, "Warning: {}", format!("{:?}", $e).bright_yellow());
	}};
	(format => $($e:expr),+) => {{
		log!(0, "Warning: {}", format!($($e),+).bright_yellow());
	}};
}

macro_rules! error {
	($e:expr) => {{
		log!(0, "Error: {}", format!("{:?}", $e).bright_red());
	}};
}
