//! Control plane: a named pipe watched for the `reload_limits` command,
//! grounded on `policy_generator.py`'s `make_fifo`/`_monitor_reload_fifo`.
//! `mkfifo` has no precedent anywhere in the retrieval pack; `nix` is added
//! narrowly for this single POSIX syscall rather than hand-rolling the
//! `libc` FFI call or shelling out to `mkfifo(1)`.

use crate::error::PolygenError;
use crate::limits::LimitRegistry;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

pub const RELOAD_LIMITS_REQUEST: &str = "reload_limits";

/// Creates the reload FIFO at `path` if it doesn't already exist, with
/// mode 0o666. Idempotent: an existing FIFO (or plain file at that path
/// left by a previous run) is left alone.
///
/// # Errors
/// Returns [`PolygenError::ControlFifo`] if the path exists but isn't a
/// FIFO, or if `mkfifo` fails for a reason other than "already exists".
pub fn ensure_fifo(path: &Path) -> Result<(), PolygenError> {
	match mkfifo(path, Mode::from_bits_truncate(0o666)) {
		Ok(()) => Ok(()),
		Err(nix::errno::Errno::EEXIST) => Ok(()),
		Err(err) => Err(PolygenError::ControlFifo(format!("mkfifo {}: {err}", path.display()))),
	}
}

/// Blocks on the reload FIFO forever, setting `registry`'s reload flag
/// whenever a writer sends exactly `reload_limits`. Re-opens the FIFO
/// after each writer closes it, matching the source's outer `while True`.
/// Takes `path` by value since it's spawned as an independent `'static`
/// task.
pub async fn watch_reload_fifo(path: PathBuf, registry: Arc<LimitRegistry>) {
	loop {
		match File::open(&path).await {
			Ok(mut file) => {
				info!(path = %path.display(), "reload FIFO opened");
				let mut buf = String::new();
				match file.read_to_string(&mut buf).await {
					Ok(0) => {
						info!("writer closed the FIFO");
					}
					Ok(_) => {
						let request = buf.trim();
						if request == RELOAD_LIMITS_REQUEST {
							info!("received FIFO reload_limits request");
							registry.request_reload();
						} else if !request.is_empty() {
							warn!(request, "ignoring unrecognized FIFO request");
						}
					}
					Err(err) => {
						warn!(error = %err, "error reading reload FIFO");
					}
				}
			}
			Err(err) => {
				warn!(path = %path.display(), error = %err, "failed to open reload FIFO, retrying");
				tokio::time::sleep(std::time::Duration::from_millis(500)).await;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ensure_fifo_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("reload.fifo");
		ensure_fifo(&path).unwrap();
		ensure_fifo(&path).unwrap();
		assert!(path.exists());
	}
}
