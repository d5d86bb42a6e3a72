use crate::chunk::ItemSource;
use crate::continuation::Cursor;
use anyhow::{anyhow, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use regex::{Regex, RegexBuilder};
use serde_json::{json, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use filetime::{FileTime, set_file_times};
use tokio::fs;

/// Line-numbered view of a file, sliced by line index. The whole sequence is
/// recomputed from the file content on every call; slicing by line number is
/// idempotent, so resumption never duplicates or skips a line. Overlong lines
/// are cut at a byte cap with an explicit marker.
pub struct LineSource {
	lines: Vec<String>,
	next_line: usize,
	max_line_bytes: usize,
	long_lines: bool,
}

impl LineSource {
	pub fn new(content: &str, next_line: usize, max_line_bytes: usize) -> Self {
		let lines = content.lines().map(|line| line.to_string()).collect();
		Self {
			lines,
			next_line,
			max_line_bytes,
			long_lines: false
		}
	}

	pub fn total(&self) -> usize {
		self.lines.len()
	}

	pub fn long_lines(&self) -> bool {
		self.long_lines
	}
}

impl ItemSource for LineSource {
	fn next_item(&mut self) -> Result<Option<Value>> {
		let Some(line) = self.lines.get(self.next_line) else {
			return Ok(None);
		};
		let number = self.next_line + 1;
		let line_bytes = line.as_bytes().len();
		let text = if line_bytes > self.max_line_bytes {
			let (kept, kept_bytes) = truncate_to_bytes(line, self.max_line_bytes);
			self.long_lines = true;
			format!(
				"{} [TRUNCATED: {} bytes hidden]",
				kept,
				line_bytes - kept_bytes
			)
		}
		else {
			line.clone()
		};
		self.next_line += 1;
		Ok(Some(Value::String(format!("{}: {}", number, text))))
	}
	fn cursor(&self) -> Cursor {
		Cursor::Line { next_line: self.next_line }
	}
}

/// One directory level, sorted by name. The sort is what makes recomputed
/// listings resumable by index.
pub struct DirSource {
	entries: Vec<Value>,
	next_index: usize,
}

impl DirSource {
	pub async fn load(path: &Path, next_index: usize) -> Result<Self> {
		let mut collected: Vec<(String, Value)> = Vec::new();
		let mut reader = fs::read_dir(path).await?;
		while let Some(entry) = reader.next_entry().await? {
			let name = entry.file_name().to_string_lossy().to_string();
			let file_type = entry.file_type().await?;
			let kind = if file_type.is_dir() {
				"dir"
			}
			else if file_type.is_symlink() {
				"symlink"
			}
			else {
				"file"
			};
			let size = if file_type.is_file() {
				entry.metadata().await.map(|meta| meta.len()).unwrap_or(0)
			}
			else {
				0
			};
			collected.push((name.clone(), json!({
				"name": name,
				"type": kind,
				"size": size
			})));
		}
		collected.sort_by(|a, b| a.0.cmp(&b.0));
		Ok(Self {
			entries: collected.into_iter().map(|(_, value)| value).collect(),
			next_index,
		})
	}

	pub fn total(&self) -> usize {
		self.entries.len()
	}
}

impl ItemSource for DirSource {
	fn next_item(&mut self) -> Result<Option<Value>> {
		let Some(entry) = self.entries.get(self.next_index) else {
			return Ok(None);
		};
		let item = entry.clone();
		self.next_index += 1;
		Ok(Some(item))
	}
	fn cursor(&self) -> Cursor {
		Cursor::Entry { next_index: self.next_index }
	}
}

pub struct ScanOptions {
	pub include: Option<GlobSet>,
	pub max_line_bytes: usize,
}

/// Content search over a path-sorted, ignore-aware walk. One item per file
/// that matched, all of its matches together; the cursor counts files
/// examined so far, so recomputing the walk and skipping that many files is
/// exact regardless of which of them matched.
pub struct ScanSource {
	root: PathBuf,
	files: Vec<PathBuf>,
	pattern: Regex,
	files_examined: usize,
	last_path: Option<String>,
	max_line_bytes: usize,
}

impl ScanSource {
	pub fn new(
		root: &Path,
		pattern: Regex,
		options: ScanOptions,
		files_examined: usize) -> Result<Self> {
		let mut builder = WalkBuilder::new(root);
		builder.hidden(true);
		builder.sort_by_file_path(|a, b| a.cmp(b));
		let mut files = Vec::new();
		for entry in builder.build() {
			let entry = entry?;
			if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
				continue;
			}
			let rel = relative_display(root, entry.path());
			if let Some(include) = &options.include {
				if !include.is_match(&rel) {
					continue;
				}
			}
			files.push(entry.into_path());
		}
		Ok(Self {
			root: root.to_path_buf(),
			files,
			pattern,
			files_examined,
			last_path: None,
			max_line_bytes: options.max_line_bytes,
		})
	}

	pub fn total_files(&self) -> usize {
		self.files.len()
	}
}

impl ItemSource for ScanSource {
	fn next_item(&mut self) -> Result<Option<Value>> {
		while self.files_examined < self.files.len() {
			let path = self.files[self.files_examined].clone();
			self.files_examined += 1;
			let rel = relative_display(&self.root, &path);
			self.last_path = Some(rel.clone());
			let Ok(content) = std::fs::read_to_string(&path) else {
				// binary or unreadable files are skipped
				continue;
			};
			let mut matches = Vec::new();
			for (index, line) in content.lines().enumerate() {
				if !self.pattern.is_match(line) {
					continue;
				}
				let line_bytes = line.as_bytes().len();
				let text = if line_bytes > self.max_line_bytes {
					let (kept, kept_bytes) = truncate_to_bytes(line, self.max_line_bytes);
					format!(
						"{} [TRUNCATED: {} bytes hidden]",
						kept,
						line_bytes - kept_bytes
					)
				}
				else {
					line.to_string()
				};
				matches.push(Value::String(format!("{}: {}", index + 1, text)));
			}
			if matches.is_empty() {
				continue;
			}
			return Ok(Some(json!({
				"path": rel,
				"matches": matches
			})));
		}
		Ok(None)
	}
	fn cursor(&self) -> Cursor {
		Cursor::Scan {
			files_examined: self.files_examined,
			last_path: self.last_path.clone(),
		}
	}
}

#[derive(Clone, Copy)]
pub enum CaseSensitivity {
	Auto,
	Sensitive,
	Insensitive,
}

pub fn build_pattern(pattern: &str, case: CaseSensitivity) -> Result<Regex> {
	if pattern.is_empty() {
		return Err(anyhow!("pattern is required"));
	}
	let case_sensitive = match case {
		CaseSensitivity::Sensitive => true,
		CaseSensitivity::Insensitive => false,
		CaseSensitivity::Auto => pattern.chars().any(|c| c.is_uppercase()),
	};
	let mut builder = RegexBuilder::new(pattern);
	builder.case_insensitive(!case_sensitive);
	builder.build().map_err(|err| anyhow!("invalid pattern: {}", err))
}

pub fn build_include_set(patterns: &[String]) -> Result<Option<GlobSet>> {
	if patterns.is_empty() {
		return Ok(None);
	}
	let mut builder = GlobSetBuilder::new();
	for pattern in patterns {
		let glob = GlobBuilder::new(pattern)
			.build()
			.map_err(|err| anyhow!("invalid glob: {}", err))?;
		builder.add(glob);
	}
	Ok(Some(builder.build().map_err(|err| anyhow!("invalid glob set: {}", err))?))
}

pub async fn move_path(from: &Path, to: &Path) -> Result<()> {
	if fs::metadata(to).await.is_ok() {
		return Err(anyhow!("target exists"));
	}
	match fs::rename(from, to).await {
		Ok(_) => return Ok(()),
		Err(err) => {
			if !is_cross_device(&err) {
				return Err(err.into());
			}
		}
	}
	let meta = fs::metadata(from).await?;
	if meta.is_dir() {
		copy_dir_recursive(from.to_path_buf(), to.to_path_buf()).await?;
		fs::remove_dir_all(from).await?;
	}
	else {
		copy_file_with_meta(from, to).await?;
		fs::remove_file(from).await?;
	}
	Ok(())
}

pub async fn delete_path(path: &Path) -> Result<()> {
	let meta = fs::metadata(path).await?;
	if meta.is_dir() {
		fs::remove_dir_all(path).await?;
	}
	else {
		fs::remove_file(path).await?;
	}
	Ok(())
}

async fn copy_file_with_meta(from: &Path, to: &Path) -> Result<()> {
	if let Some(parent) = to.parent() {
		fs::create_dir_all(parent).await?;
	}
	fs::copy(from, to).await?;
	let meta = fs::metadata(from).await?;
	fs::set_permissions(to, meta.permissions()).await?;
	let atime = FileTime::from_last_access_time(&meta);
	let mtime = FileTime::from_last_modification_time(&meta);
	set_file_times(to, atime, mtime)?;
	Ok(())
}

fn copy_dir_recursive(from: PathBuf, to: PathBuf) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
	Box::pin(
		async move {
			fs::create_dir_all(&to).await?;
			let mut entries = fs::read_dir(&from).await?;
			while let Some(entry) = entries.next_entry().await? {
				let src = entry.path();
				let dst = to.join(entry.file_name());
				let meta = fs::metadata(&src).await?;
				if meta.is_dir() {
					copy_dir_recursive(src, dst).await?;
				}
				else {
					copy_file_with_meta(&src, &dst).await?;
				}
			}
			let meta = fs::metadata(&from).await?;
			fs::set_permissions(&to, meta.permissions()).await?;
			let atime = FileTime::from_last_access_time(&meta);
			let mtime = FileTime::from_last_modification_time(&meta);
			set_file_times(&to, atime, mtime)?;
			Ok(())
		}
	)
}

fn is_cross_device(err: &std::io::Error) -> bool {
	err.raw_os_error() == Some(libc::EXDEV)
}

pub fn truncate_to_bytes(input: &str, max_bytes: usize) -> (String, usize) {
	if input.as_bytes().len() <= max_bytes {
		return (input.to_string(), input.as_bytes().len());
	}
	let mut end = 0usize;
	for (idx, ch) in input.char_indices() {
		let next = idx + ch.len_utf8();
		if next > max_bytes {
			break;
		}
		end = next;
	}
	(input[..end].to_string(), end)
}

/// Resolve-and-validate: normalize the candidate, canonicalize when it
/// exists, and require containment in one of the configured roots unless
/// escape is allowed. Called before any filesystem touch.
pub fn resolve_path(
	root: &Path,
	root_canon: &Path,
	rel: &str,
	allow_escape: bool,
	allowed_roots: &[PathBuf]) -> Result<PathBuf> {
	let rel_path = Path::new(rel);
	let candidate = if rel_path.is_absolute() {
		rel_path.to_path_buf()
	}
	else {
		root.join(rel_path)
	};
	let normalized = normalize_path(&candidate);
	if allow_escape {
		return Ok(normalized);
	}
	let checked = if normalized.exists() {
		normalized.canonicalize().unwrap_or(normalized.clone())
	}
	else {
		normalized.clone()
	};
	if checked.starts_with(root_canon) {
		return Ok(checked);
	}
	for allowed in allowed_roots {
		if checked.starts_with(allowed) {
			return Ok(checked);
		}
	}
	Err(anyhow!("path outside root"))
}

pub fn normalize_path(path: &Path) -> PathBuf {
	use std::path::Component;
	let mut stack: Vec<std::ffi::OsString> = Vec::new();
	let mut prefix: Option<std::ffi::OsString> = None;
	let mut absolute = false;
	for component in path.components() {
		match component {
			Component::Prefix(prefix_component) => {
				prefix = Some(prefix_component.as_os_str().to_os_string());
			}
			Component::RootDir => {
				absolute = true;
				stack.clear();
			}
			Component::CurDir => {}
			Component::ParentDir => {
				if !stack.is_empty() {
					stack.pop();
				}
				else if !absolute {
					stack.push(std::ffi::OsString::from(".."));
				}
			}
			Component::Normal(part) => stack.push(part.to_os_string()),
		}
	}
	let mut out = PathBuf::new();
	if let Some(prefix) = prefix {
		out.push(prefix);
	}
	if absolute {
		out.push(Path::new("/"));
	}
	for part in stack {
		out.push(part);
	}
	out
}

pub fn relative_to_root(root: &Path, path: &Path) -> String {
	if let Ok(rel) = path.strip_prefix(root) {
		let out = rel.to_string_lossy().to_string();
		if out.is_empty() {
			return ".".to_string();
		}
		return out;
	}
	let root_components: Vec<_> = root.components().collect();
	let path_components: Vec<_> = path.components().collect();
	let mut common = 0usize;
	while common < root_components.len()
		&& common < path_components.len()
		&& root_components[common] == path_components[common] {
		common += 1;
	}
	let mut rel = PathBuf::new();
	for _ in common..root_components.len() {
		rel.push("..");
	}
	for comp in &path_components[common..] {
		rel.push(comp.as_os_str());
	}
	let rel_str = rel.to_string_lossy().to_string();
	if rel_str.is_empty() {
		".".to_string()
	}
	else {
		rel_str
	}
}

fn relative_display(root: &Path, path: &Path) -> String {
	if let Ok(rel) = path.strip_prefix(root) {
		return rel.to_string_lossy().to_string();
	}
	path.to_string_lossy().to_string()
}
