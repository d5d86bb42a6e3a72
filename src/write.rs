use crate::error::EngineError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_millis(2000);
const YIELD_EVERY_CHUNKS: usize = 4;

/// Temp and backup siblings are derived from the target name plus this
/// process-monotonic sequence, so concurrent writes to different targets
/// never collide on scratch paths.
static WRITE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
	Overwrite,
	Append,
}

#[derive(Debug)]
pub struct WriteRequest {
	pub path: PathBuf,
	pub content: Vec<u8>,
	pub mode: WriteMode,
	pub chunk_size: usize,
	pub backup: bool,
	pub retry_attempts: u32,
	pub verify: bool,
}

#[derive(Debug)]
pub struct WriteReport {
	pub final_size: u64,
	pub chunks_written: usize,
	pub retries_used: u32,
	pub elapsed_ms: u64,
	pub backup_path: Option<PathBuf>,
}

/// Pure backoff curve: doubling from `base`, capped at `cap`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
	let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
	base.checked_mul(factor).map(|delay| delay.min(cap)).unwrap_or(cap)
}

/// Runs the full pipeline: preflight, optional backup, streamed write to a
/// temp sibling, durability sync, atomic commit, size verification, bounded
/// retry with backoff, best-effort rollback on failure.
///
/// Overwrite mode commits with a rename so readers never observe a partial
/// file. Append mode writes in place and is not atomic at the append level;
/// a retried append can leave duplicate bytes behind, which the at-least
/// verification floor tolerates.
pub async fn execute(request: WriteRequest) -> Result<WriteReport, EngineError> {
	run_pipeline(request, |_attempt| Ok(())).await
}

async fn run_pipeline<F>(request: WriteRequest, mut fault: F) -> Result<WriteReport, EngineError>
where
	F: FnMut(u32) -> std::io::Result<()>, {
	let started = Instant::now();
	let required = request.content.len() as u64;
	preflight(&request.path, required)?;
	let previous_size = match fs::metadata(&request.path).await {
		Ok(meta) => Some(meta.len()),
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
		Err(err) => {
			return Err(EngineError::WriteFailed {
				attempts: 0,
				source: err
			});
		}
	};
	let backup_path = if request.backup && previous_size.is_some() {
		let candidate = backup_sibling(&request.path);
		if let Err(err) = fs::copy(&request.path, &candidate).await {
			return Err(EngineError::WriteFailed {
				attempts: 0,
				source: err
			});
		}
		Some(candidate)
	}
	else {
		None
	};
	let mut last_error: Option<std::io::Error> = None;
	let mut retries_used = 0u32;
	for attempt in 0..=request.retry_attempts {
		if attempt > 0 {
			retries_used = attempt;
			tokio::time::sleep(backoff_delay(attempt - 1, BACKOFF_BASE, BACKOFF_CAP)).await;
		}
		let chunks_written = match attempt_write(&request, &mut fault, attempt).await {
			Ok(chunks) => chunks,
			Err(err) => {
				warn!(
					"write attempt {} for {} failed: {}",
					attempt + 1,
					request.path.display(),
					err
				);
				last_error = Some(err);
				continue;
			}
		};
		let final_size = match verify_size(&request, previous_size, required).await {
			Ok(size) => size,
			Err(VerifyOutcome::Transient(err)) => {
				last_error = Some(err);
				continue;
			}
			Err(VerifyOutcome::Mismatch(err)) => {
				rollback(&request.path, backup_path.as_deref()).await;
				return Err(err);
			}
		};
		return Ok(WriteReport {
			final_size,
			chunks_written,
			retries_used,
			elapsed_ms: started.elapsed().as_millis() as u64,
			backup_path,
		});
	}
	rollback(&request.path, backup_path.as_deref()).await;
	Err(EngineError::WriteFailed {
		attempts: request.retry_attempts + 1,
		source: last_error.unwrap_or_else(|| std::io::Error::other("write failed")),
	})
}

/// One STREAM_WRITE + SYNC + COMMIT pass. Returns the number of chunks
/// written; any error is transient from the caller's point of view. The temp
/// sibling is cleaned up on failure so retries start fresh.
async fn attempt_write<F>(
	request: &WriteRequest,
	fault: &mut F,
	attempt: u32) -> std::io::Result<usize>
where
	F: FnMut(u32) -> std::io::Result<()>, {
	if let Some(parent) = request.path.parent() {
		fs::create_dir_all(parent).await?;
	}
	match request.mode {
		WriteMode::Overwrite => {
			let temp = temp_sibling(&request.path);
			let result = stream_to(&temp, request, fault, attempt, false).await;
			let chunks = match result {
				Ok(chunks) => chunks,
				Err(err) => {
					discard_temp(&temp).await;
					return Err(err);
				}
			};
			if let Err(err) = fs::rename(&temp, &request.path).await {
				discard_temp(&temp).await;
				return Err(err);
			}
			Ok(chunks)
		}
		WriteMode::Append => stream_to(&request.path, request, fault, attempt, true).await,
	}
}

async fn stream_to<F>(
	target: &Path,
	request: &WriteRequest,
	fault: &mut F,
	attempt: u32,
	append: bool) -> std::io::Result<usize>
where
	F: FnMut(u32) -> std::io::Result<()>, {
	let mut file = if append {
		fs::OpenOptions::new()
			.append(true)
			.create(true)
			.open(target)
			.await?
	}
	else {
		fs::File::create(target).await?
	};
	let mut chunks = 0usize;
	for piece in request.content.chunks(request.chunk_size.max(1)) {
		file.write_all(piece).await?;
		chunks += 1;
		if chunks % YIELD_EVERY_CHUNKS == 0 {
			tokio::task::yield_now().await;
		}
	}
	fault(attempt)?;
	file.sync_all().await?;
	Ok(chunks)
}

enum VerifyOutcome {
	Transient(std::io::Error),
	Mismatch(EngineError),
}

async fn verify_size(
	request: &WriteRequest,
	previous_size: Option<u64>,
	required: u64) -> Result<u64, VerifyOutcome> {
	let actual = match fs::metadata(&request.path).await {
		Ok(meta) => meta.len(),
		Err(err) => return Err(VerifyOutcome::Transient(err)),
	};
	if !request.verify {
		return Ok(actual);
	}
	match request.mode {
		WriteMode::Overwrite => {
			if actual != required {
				return Err(VerifyOutcome::Mismatch(EngineError::Verification {
					path: request.path.clone(),
					expected: required,
					actual,
				}));
			}
		}
		WriteMode::Append => {
			let floor = previous_size.unwrap_or(0) + required;
			if actual < floor {
				return Err(VerifyOutcome::Mismatch(EngineError::Verification {
					path: request.path.clone(),
					expected: floor,
					actual,
				}));
			}
		}
	}
	Ok(actual)
}

/// Free-space check with 1.5x headroom. This is a heuristic, not the safety
/// guarantee: when the probe itself cannot run it downgrades to a warning
/// instead of blocking the write.
fn preflight(path: &Path, required: u64) -> Result<(), EngineError> {
	let probe = path.ancestors()
		.skip(1)
		.find(|ancestor| ancestor.exists())
		.map(Path::to_path_buf)
		.unwrap_or_else(|| PathBuf::from("."));
	match fs2::available_space(&probe) {
		Ok(available) => {
			let needed = required.saturating_mul(3) / 2;
			if available < needed {
				return Err(EngineError::InsufficientSpace {
					path: path.to_path_buf(),
					required: needed,
					available,
				});
			}
			Ok(())
		}
		Err(err) => {
			warn!("free space check for {} failed: {}", probe.display(), err);
			Ok(())
		}
	}
}

/// Best-effort restoration; failures are logged and swallowed so the original
/// error keeps propagating. Per-attempt temp siblings are already discarded
/// by the attempt that created them.
async fn rollback(path: &Path, backup: Option<&Path>) {
	let Some(backup) = backup else {
		return;
	};
	if let Err(err) = fs::copy(backup, path).await {
		warn!(
			"rollback of {} from {} failed: {}",
			path.display(),
			backup.display(),
			err
		);
	}
}

async fn discard_temp(temp: &Path) {
	if let Err(err) = fs::remove_file(temp).await {
		if err.kind() != std::io::ErrorKind::NotFound {
			warn!("failed to remove temp file {}: {}", temp.display(), err);
		}
	}
}

fn temp_sibling(path: &Path) -> PathBuf {
	let seq = WRITE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
	let name = file_name_for(path);
	path.with_file_name(format!(".{}.tmp.{}", name, seq))
}

fn backup_sibling(path: &Path) -> PathBuf {
	let seq = WRITE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
	let name = file_name_for(path);
	path.with_file_name(format!("{}.backup.{}", name, seq))
}

fn file_name_for(path: &Path) -> String {
	path.file_name()
		.map(|name| name.to_string_lossy().to_string())
		.unwrap_or_else(|| "file".to_string())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn request(path: PathBuf, content: Vec<u8>) -> WriteRequest {
		WriteRequest {
			path,
			content,
			mode: WriteMode::Overwrite,
			chunk_size: 1024,
			backup: true,
			retry_attempts: DEFAULT_RETRY_ATTEMPTS,
			verify: true,
		}
	}

	#[test]
	fn backoff_doubles_until_the_cap() {
		let base = Duration::from_millis(100);
		let cap = Duration::from_millis(2000);
		assert_eq!(backoff_delay(0, base, cap), Duration::from_millis(100));
		assert_eq!(backoff_delay(1, base, cap), Duration::from_millis(200));
		assert_eq!(backoff_delay(2, base, cap), Duration::from_millis(400));
		assert_eq!(backoff_delay(4, base, cap), Duration::from_millis(1600));
		assert_eq!(backoff_delay(5, base, cap), cap);
		assert_eq!(backoff_delay(31, base, cap), cap);
	}

	#[tokio::test]
	async fn fresh_write_reports_exact_size_and_chunks() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("fresh.bin");
		let content = vec![7u8; 10_000];
		let report = execute(request(path.clone(), content.clone())).await.expect("write");
		assert_eq!(report.final_size, 10_000);
		assert_eq!(report.chunks_written, 10);
		assert_eq!(report.retries_used, 0);
		assert!(report.backup_path.is_none());
		assert_eq!(std::fs::read(&path).expect("read back"), content);
	}

	#[tokio::test]
	async fn empty_content_truncates_the_target() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("empty.txt");
		std::fs::write(&path, "old").expect("seed");
		let mut req = request(path.clone(), Vec::new());
		req.backup = false;
		let report = execute(req).await.expect("write");
		assert_eq!(report.final_size, 0);
		assert_eq!(report.chunks_written, 0);
		assert_eq!(std::fs::read(&path).expect("read back"), Vec::<u8>::new());
	}

	#[tokio::test]
	async fn append_grows_the_file() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("log.txt");
		std::fs::write(&path, "abc").expect("seed");
		let mut req = request(path.clone(), b"def".to_vec());
		req.mode = WriteMode::Append;
		req.backup = false;
		let report = execute(req).await.expect("append");
		assert_eq!(report.final_size, 6);
		assert_eq!(std::fs::read_to_string(&path).expect("read back"), "abcdef");
	}

	#[tokio::test]
	async fn single_injected_failure_is_retried() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("retry.txt");
		let content = b"payload".to_vec();
		let report = run_pipeline(
			request(path.clone(), content.clone()),
			|attempt| {
				if attempt == 0 {
					Err(std::io::Error::other("injected"))
				}
				else {
					Ok(())
				}
			}
		).await.expect("write");
		assert!(report.retries_used >= 1 && report.retries_used <= DEFAULT_RETRY_ATTEMPTS);
		assert_eq!(std::fs::read(&path).expect("read back"), content);
	}

	#[tokio::test]
	async fn exhausted_attempts_restore_the_backup() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("rollback.txt");
		std::fs::write(&path, "original").expect("seed");
		let err = run_pipeline(
			request(path.clone(), b"replacement".to_vec()),
			|_attempt| Err(std::io::Error::other("injected"))
		).await.unwrap_err();
		assert_eq!(err.code(), "WRITE_FAILED");
		assert_eq!(std::fs::read_to_string(&path).expect("read back"), "original");
	}

	#[tokio::test]
	async fn backup_sibling_preserves_the_original_bytes() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("data.txt");
		std::fs::write(&path, "before").expect("seed");
		let report = execute(request(path.clone(), b"after".to_vec())).await.expect("write");
		let backup = report.backup_path.expect("backup path");
		assert_eq!(std::fs::read_to_string(&backup).expect("read backup"), "before");
		assert_eq!(std::fs::read_to_string(&path).expect("read target"), "after");
	}

	#[tokio::test]
	async fn failed_overwrite_leaves_no_temp_behind() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("clean.txt");
		let mut req = request(path.clone(), b"payload".to_vec());
		req.backup = false;
		req.retry_attempts = 0;
		let err = run_pipeline(req, |_attempt| Err(std::io::Error::other("injected")))
			.await
			.unwrap_err();
		assert_eq!(err.code(), "WRITE_FAILED");
		let leftovers: Vec<_> = std::fs::read_dir(dir.path())
			.expect("read dir")
			.filter_map(|entry| entry.ok())
			.map(|entry| entry.file_name().to_string_lossy().to_string())
			.filter(|name| name.contains(".tmp."))
			.collect();
		assert!(leftovers.is_empty(), "temp files left: {:?}", leftovers);
	}
}
