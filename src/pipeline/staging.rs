use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

const SUFFIXES: [&str; 2] = [".nii.gz", ".nii"];

/// A scratch directory for uploaded volumes of one request.
///
/// The directory and everything staged in it are removed when the value is dropped, whether
/// the conversion succeeded or not.
#[derive(Debug)]
pub struct Staging {
	dir: TempDir,
}

impl Staging {
	/// Creates a fresh directory below `root`, or below the system temp directory.
	pub fn new(root: Option<&Path>) -> io::Result<Self> {
		let mut builder = tempfile::Builder::new();
		builder.prefix("vol2dcm-");
		let dir = match root {
			Some(root) => builder.tempdir_in(root)?,
			None => builder.tempdir()?,
		};
		debug!(dir = %dir.path().display(), "Created staging directory");
		Ok(Self { dir })
	}

	pub fn path(&self) -> &Path {
		self.dir.path()
	}

	/// Writes `bytes` under `stem`, keeping the `.nii` or `.nii.gz` suffix of `file_name`
	/// so the reader can tell compressed volumes apart.
	pub async fn stage(&self, stem: &str, file_name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
		let lower = file_name.to_ascii_lowercase();
		let suffix = SUFFIXES
			.into_iter()
			.find(|suffix| lower.ends_with(suffix))
			.ok_or_else(|| {
				io::Error::new(
					io::ErrorKind::InvalidInput,
					format!("{file_name} is not a NIfTI volume (.nii or .nii.gz)"),
				)
			})?;

		let stem: String = stem
			.chars()
			.map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
			.collect();
		let path = self.dir.path().join(format!("{stem}{suffix}"));
		tokio::fs::write(&path, bytes).await?;
		debug!(path = %path.display(), size = bytes.len(), "Staged volume");
		Ok(path)
	}
}
