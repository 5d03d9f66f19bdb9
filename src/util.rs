// SPDX-License-Identifier: GPL-3.0-or-later

use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use futures_util::TryStreamExt;
use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};
use tokio_util::io::StreamReader;
use url::Url;

static ILLEGAL: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[\\/:*?"<>|]+"#).unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Maximum length (in characters) of a course or section directory name.
pub const MAX_FOLDER_NAME: usize = 80;

/// Turns a course or section name into a directory name.
pub fn sanitize_for_folder(name: &str) -> String {
	let name = ILLEGAL.replace_all(name, "-");
	let name = WHITESPACE.replace_all(&name, " ");
	let name = name.trim().chars().take(MAX_FOLDER_NAME).collect::<String>();
	if name.is_empty() {
		"Unknown".to_owned()
	} else {
		name
	}
}

/// Replaces characters that are not allowed in file names.
pub fn file_escape(s: &str) -> String {
	ILLEGAL.replace_all(s, "-").trim().to_owned()
}

/// File name of a download URL, e.g. `test.pdf` for `view.php?file=/a/b/test.pdf`.
pub fn basename_from_url(url: &str) -> String {
	if let Ok(url) = Url::parse(url) {
		let file_param = url.query_pairs().find(|(k, _)| k == "file").map(|(_, v)| v.into_owned());
		if let Some(name) = file_param.as_deref().and_then(last_segment) {
			return name.to_owned();
		}
		if let Some(last) = last_segment(url.path()).filter(|x| x.contains('.')) {
			return percent_decode_str(last).decode_utf8_lossy().into_owned();
		}
	}
	let millis = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|x| x.as_millis())
		.unwrap_or_default();
	format!("file-{}", millis)
}

fn last_segment(path: &str) -> Option<&str> {
	path.split('/').filter(|x| !x.is_empty()).last()
}

pub async fn create_dir(path: &Path) -> Result<()> {
	if let Err(e) = fs::create_dir_all(&path).await {
		if e.kind() != io::ErrorKind::AlreadyExists {
			return Err(e).context("failed to create directory");
		}
	}
	Ok(())
}

pub async fn write_file_data<R: ?Sized>(file: fs::File, data: &mut R) -> Result<u64>
where
	R: AsyncRead + Unpin,
{
	let mut file = BufWriter::new(file);
	let written = tokio::io::copy(data, &mut file).await.context("failed to write to file")?;
	file.flush().await.context("failed to flush file")?;
	Ok(written)
}

pub async fn write_stream_to_file(
	file: fs::File,
	stream: impl futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
) -> Result<u64> {
	let mut reader = StreamReader::new(stream.map_err(|x| io::Error::new(io::ErrorKind::Other, x)));
	write_file_data(file, &mut reader).await
}
