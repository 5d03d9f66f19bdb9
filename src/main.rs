// SPDX-License-Identifier: GPL-3.0-or-later

use anyhow::{Context, Result};
use colored::Colorize;
use cookie_store::CookieStore;
use indicatif::{ProgressDrawTarget, ProgressStyle};
use reqwest_cookie_store::CookieStoreMutex;
use structopt::StructOpt;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use url::Url;

use std::sync::atomic::Ordering;
use std::sync::Arc;

#[macro_use]
mod cli;
use cli::*;
mod downloader;
use downloader::*;
mod file_types;
use file_types::FileTypes;
mod message;
use message::*;
mod moodle;
use moodle::*;
mod moodleignore;
use moodleignore::MoodleIgnore;
mod queue;
mod util;
use util::*;

const SESSION_FILE: &str = ".moodlesession";

#[tokio::main]
async fn main() {
	let opt = Opt::from_args();
	match real_main(opt).await {
		Ok(true) => {},
		Ok(false) => std::process::exit(1),
		Err(e) => {
			error!(e);
			std::process::exit(1);
		},
	}
}

fn connect(opt: &Opt, course_url: &Url) -> Result<Moodle> {
	let cookies = if opt.keep_session {
		match Moodle::load_session(&opt.output.join(SESSION_FILE)).context("failed to load previous session") {
			Ok(cookies) => {
				info!("Re-using previous session cookies..");
				cookies
			},
			Err(e) => {
				warning!(e);
				CookieStore::default()
			},
		}
	} else {
		CookieStore::default()
	};
	let config = ScanConfig {
		file_types: Arc::new(FileTypes::moodle()),
		boilerplate: Boilerplate::new(&opt.strip_labels),
		folder_jobs: opt.folder_jobs,
	};
	let session = Arc::new(CookieStoreMutex::new(cookies));
	let moodle = Moodle::with_session(config, session, opt.proxy.as_deref(), opt.rate)?;
	for cookie in &opt.cookies {
		moodle.add_cookie(cookie, course_url)?;
	}
	Ok(moodle)
}

/// Returns `false` if the command failed.
async fn real_main(mut opt: Opt) -> Result<bool> {
	LOG_LEVEL.store(opt.verbose, Ordering::SeqCst);
	#[cfg(windows)]
	let _ = colored::control::set_virtual_terminal(true);

	let course_url = Url::parse(&opt.course_url).context("invalid course URL")?;
	create_dir(&opt.output).await.context("failed to create output directory")?;
	// use UNC paths on Windows (to avoid the default max. path length of 255)
	opt.output = fs::canonicalize(&opt.output)
		.await
		.context("failed to canonicalize output directory")?;

	let moodle = Arc::new(connect(&opt, &course_url)?);
	let conflict = match opt.cmd {
		Command::Download { conflict, .. } => conflict,
		_ => ConflictAction::default(),
	};
	let manager = FsDownloadManager::new(Arc::clone(&moodle), opt.output.clone());
	let dispatcher = Dispatcher::new(manager, Arc::clone(&moodle.config.file_types), opt.jobs)
		.with_conflict_action(conflict)
		.with_ignore(MoodleIgnore::load(opt.output.clone())?);
	let handler = Handler::new(Arc::clone(&moodle), course_url.as_str(), dispatcher);

	let ok = match opt.cmd.clone() {
		Command::Sections => report(&opt, &handler.handle(Request::CollectSections).await),
		Command::Types { sections } => {
			let sections = Some(sections);
			report(&opt, &handler.handle(Request::GetAvailableTypes { sections }).await)
		},
		Command::Links { types } => report(&opt, &handler.handle(Request::CollectLinks { file_types: types }).await),
		Command::Download { types, sections, .. } => download(&opt, &handler, types, &sections).await,
		Command::Serve => {
			LOG_TO_STDERR.store(true, Ordering::SeqCst);
			serve(&handler).await?;
			true
		},
	};

	if opt.keep_session {
		if let Err(e) = moodle
			.save_session(&opt.output.join(SESSION_FILE))
			.context("failed to save session cookies")
		{
			warning!(e)
		}
	}
	Ok(ok)
}

/// Collects the links of the course and hands them to the download manager.
async fn download<M: DownloadManager>(opt: &Opt, handler: &Handler<M>, types: Vec<String>, sections: &[String]) -> bool {
	let (links, course_title) = match handler.handle(Request::CollectLinks { file_types: types }).await {
		Response::Links { links, course_title, .. } => (links, course_title),
		response => return report(opt, &response),
	};
	let links = filter_sections(links, sections);
	if links.is_empty() {
		let message = if sections.is_empty() {
			"No files to download"
		} else {
			"No files in selected sections"
		};
		return report(opt, &Response::failure(message));
	}
	log!(0, "Downloading {} files of {}", links.len(), course_title);

	PROGRESS_BAR_ENABLED.store(atty::is(atty::Stream::Stdout) && !opt.json, Ordering::SeqCst);
	if PROGRESS_BAR_ENABLED.load(Ordering::SeqCst) {
		PROGRESS_BAR.set_draw_target(ProgressDrawTarget::stderr_nohz());
		PROGRESS_BAR.set_style(ProgressStyle::default_bar().template("[{pos}/{len}] {wide_msg}"));
		PROGRESS_BAR.set_message("downloading..");
	}
	let response = handler.handle(Request::DownloadLinks { links, course_title }).await;
	if PROGRESS_BAR_ENABLED.load(Ordering::SeqCst) {
		PROGRESS_BAR.finish_with_message("done");
		PROGRESS_BAR_ENABLED.store(false, Ordering::SeqCst);
	}
	report(opt, &response)
}

/// Answers one JSON request per line of stdin until it is closed.
async fn serve<M: DownloadManager>(handler: &Handler<M>) -> Result<()> {
	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	while let Some(line) = lines.next_line().await.context("failed to read request")? {
		if line.trim().is_empty() {
			continue;
		}
		let response = match serde_json::from_str::<Request>(&line) {
			Ok(request) => handler.handle(request).await,
			Err(e) => Response::failure(format!("invalid request: {}", e)),
		};
		println!("{}", serde_json::to_string(&response)?);
	}
	Ok(())
}

/// Prints a response and returns whether it was successful.
fn report(opt: &Opt, response: &Response) -> bool {
	if opt.json {
		match serde_json::to_string_pretty(response) {
			Ok(json) => println!("{}", json),
			Err(e) => {
				error!(e);
			},
		}
		return response.is_ok();
	}
	match response {
		Response::Sections {
			sections, course_title, ..
		} => {
			println!("{}", course_title.bold());
			for section in sections {
				println!("  {}", section);
			}
		},
		Response::AvailableTypes { available_types, .. } => {
			if available_types.is_empty() {
				info!("No downloadable files found");
			}
			let file_types = FileTypes::moodle();
			for key in available_types {
				let label = file_types.get(key).map(|x| x.label).unwrap_or_default();
				println!("{:<6} {}", key, label.dimmed());
			}
		},
		Response::Links {
			links, course_title, ..
		} => {
			println!("{}", course_title.bold());
			for link in links {
				println!("{} / {}\n    {}", link.section, link.title, link.url.dimmed());
			}
		},
		Response::Downloaded { count, .. } => {
			log!(0, "{}", format!("Submitted {} downloads", count).bright_green());
		},
		Response::Failure { error, .. } => {
			log!(0, "Error: {}", error.bright_red());
		},
	}
	response.is_ok()
}
