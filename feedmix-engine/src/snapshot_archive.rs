// ---------------------------------------------------------------------------
// Snapshot archive
// ---------------------------------------------------------------------------
//
// One gzip-compressed JSON document per snapshot, named `<id>.json.gz`, in a
// single directory. The archive is format-agnostic: callers decide what a
// record is and how to verify it after loading.
// ---------------------------------------------------------------------------

use flate2::Compression;
use flate2::read::{GzDecoder, GzEncoder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::FeedError;

const EXTENSION: &str = ".json.gz";

/// Gzip-compress a byte slice at level 6.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, FeedError> {
	let mut encoder = GzEncoder::new(data, Compression::new(6));
	let mut compressed = Vec::new();
	encoder.read_to_end(&mut compressed)?;
	Ok(compressed)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, FeedError> {
	let mut decoder = GzDecoder::new(data);
	let mut decompressed = Vec::new();
	decoder.read_to_end(&mut decompressed)?;
	Ok(decompressed)
}

/// Check for the gzip magic bytes (0x1f, 0x8b).
pub fn is_gzipped(data: &[u8]) -> bool {
	data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

#[derive(Debug, Clone)]
pub struct SnapshotArchive {
	dir: PathBuf,
}

impl SnapshotArchive {
	/// Open (and create if missing) an archive directory.
	pub fn open(dir: impl Into<PathBuf>) -> Result<Self, FeedError> {
		let dir = dir.into();
		fs::create_dir_all(&dir)?;
		Ok(Self { dir })
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	fn path_for(&self, id: &str) -> Result<PathBuf, FeedError> {
		if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
			return Err(FeedError::InvalidParams(format!("Invalid snapshot id: {id:?}")));
		}
		Ok(self.dir.join(format!("{id}{EXTENSION}")))
	}

	/// Write a record atomically (temp file + rename).
	pub fn save<T: Serialize>(&self, id: &str, record: &T) -> Result<(), FeedError> {
		let path = self.path_for(id)?;
		let json = serde_json::to_vec(record)?;
		let bytes = compress(&json)?;
		let tmp = path.with_extension("tmp");
		fs::write(&tmp, bytes)?;
		fs::rename(&tmp, &path)?;
		tracing::debug!(id, path = %path.display(), "Snapshot archived");
		Ok(())
	}

	pub fn load<T: DeserializeOwned>(&self, id: &str) -> Result<T, FeedError> {
		let path = self.path_for(id)?;
		if !path.exists() {
			return Err(FeedError::SnapshotNotFound(id.to_string()));
		}
		read_record(&path)
	}

	/// Delete a record. Missing files are not an error.
	pub fn remove(&self, id: &str) -> Result<bool, FeedError> {
		let path = self.path_for(id)?;
		match fs::remove_file(&path) {
			Ok(()) => Ok(true),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
			Err(e) => Err(e.into()),
		}
	}

	/// Load every readable record. Unreadable or corrupt files are skipped
	/// with a warning.
	pub fn load_all<T: DeserializeOwned>(&self) -> Result<Vec<(String, T)>, FeedError> {
		let mut records = Vec::new();
		for entry in fs::read_dir(&self.dir)? {
			let path = entry?.path();
			let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
				continue;
			};
			let Some(id) = name.strip_suffix(EXTENSION) else {
				continue;
			};
			match read_record(&path) {
				Ok(record) => records.push((id.to_string(), record)),
				Err(e) => {
					tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable archived snapshot");
				}
			}
		}
		records.sort_by(|a, b| a.0.cmp(&b.0));
		Ok(records)
	}
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<T, FeedError> {
	let raw = fs::read(path)?;
	let json = if is_gzipped(&raw) { decompress(&raw)? } else { raw };
	Ok(serde_json::from_slice(&json)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
