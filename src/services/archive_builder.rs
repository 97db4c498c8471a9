//! src/services/archive_builder.rs
//!
//! ArchiveBuilder: turns an ordered list of `(source directory, archive
//! name)` pairs into one deflate-compressed zip written to a caller-owned
//! sink. Stateless; caching and publication live in the services above it.

use std::{
    collections::HashSet,
    fs::File,
    io::{self, Read, Seek, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

/// Highest deflate level supported by every zip backend.
pub const MAX_COMPRESSION_LEVEL: i64 = 9;

const COPY_BUFFER_LEN: usize = 64 * 1024;

/// One directory to add to an archive, under the `archive_name` prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub source_dir: PathBuf,
    pub archive_name: String,
}

impl ArchiveEntry {
    pub fn new(source_dir: impl Into<PathBuf>, archive_name: impl Into<String>) -> Self {
        Self {
            source_dir: source_dir.into(),
            archive_name: archive_name.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("source directory `{}` does not exist", .0.display())]
    SourceMissing(PathBuf),
    #[error("failed to read source file `{}`: {source}", path.display())]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write archive: {0}")]
    SinkWriteFailed(#[source] io::Error),
}

impl ArchiveError {
    /// Path of the source that caused the failure, if the sink is not at fault.
    pub fn source_path(&self) -> Option<&Path> {
        match self {
            ArchiveError::SourceMissing(path) => Some(path),
            ArchiveError::SourceUnreadable { path, .. } => Some(path),
            ArchiveError::SinkWriteFailed(_) => None,
        }
    }
}

/// Destination of an archive build.
pub trait ArchiveSink: Write + Seek + Send {}

impl<T: Write + Seek + Send> ArchiveSink for T {}

/// Builds one archive from an ordered list of directory entries.
///
/// Implementations are blocking; async callers run them on the blocking pool.
pub trait ArchiveBuilder: Send + Sync {
    fn build(&self, entries: &[ArchiveEntry], sink: &mut dyn ArchiveSink)
    -> Result<(), ArchiveError>;
}

/// [`ArchiveBuilder`] producing deflate zips with reproducible contents:
/// files are visited in name order and carry fixed timestamps and permissions.
#[derive(Clone, Debug)]
pub struct ZipArchiveBuilder {
    compression_level: i64,
}

impl Default for ZipArchiveBuilder {
    fn default() -> Self {
        Self {
            compression_level: MAX_COMPRESSION_LEVEL,
        }
    }
}

impl ZipArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn options(&self) -> SimpleFileOptions {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(self.compression_level))
            .last_modified_time(zip::DateTime::default())
            .unix_permissions(0o644)
    }
}

impl ArchiveBuilder for ZipArchiveBuilder {
    fn build(
        &self,
        entries: &[ArchiveEntry],
        sink: &mut dyn ArchiveSink,
    ) -> Result<(), ArchiveError> {
        // Validate every source before the first byte reaches the sink.
        for entry in entries {
            if !entry.source_dir.is_dir() {
                return Err(ArchiveError::SourceMissing(entry.source_dir.clone()));
            }
        }

        let options = self.options();
        let mut zip = ZipWriter::new(sink);
        let mut seen = HashSet::new();
        let mut buf = vec![0u8; COPY_BUFFER_LEN];

        for entry in entries {
            let walker = WalkDir::new(&entry.source_dir)
                .follow_links(false)
                .min_depth(1)
                .sort_by_file_name();

            for item in walker {
                let item = item.map_err(|err| walk_error(&entry.source_dir, err))?;
                if !item.file_type().is_file() {
                    continue;
                }

                let rel = item
                    .path()
                    .strip_prefix(&entry.source_dir)
                    .unwrap_or(item.path());
                let name = archive_path(&entry.archive_name, rel);
                if !seen.insert(name.clone()) {
                    warn!(
                        archive_path = %name,
                        source = %item.path().display(),
                        "duplicate archive path; keeping the first occurrence"
                    );
                    continue;
                }

                let mut file =
                    File::open(item.path()).map_err(|source| ArchiveError::SourceUnreadable {
                        path: item.path().to_path_buf(),
                        source,
                    })?;
                zip.start_file(name.as_str(), options).map_err(zip_error)?;
                copy_file(&mut file, item.path(), &mut zip, &mut buf)?;
                debug!(archive_path = %name, "added file to archive");
            }
        }

        let sink = zip.finish().map_err(zip_error)?;
        sink.flush().map_err(ArchiveError::SinkWriteFailed)?;
        Ok(())
    }
}

/// Join the archive prefix and a relative path with `/` separators.
fn archive_path(prefix: &str, rel: &Path) -> String {
    let mut name = prefix.trim_end_matches('/').to_string();
    for component in rel.components() {
        if !name.is_empty() {
            name.push('/');
        }
        name.push_str(&component.as_os_str().to_string_lossy());
    }
    name
}

fn copy_file<W: Write>(
    file: &mut File,
    path: &Path,
    out: &mut W,
    buf: &mut [u8],
) -> Result<(), ArchiveError> {
    loop {
        let read = match file.read(buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(ArchiveError::SourceUnreadable {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        out.write_all(&buf[..read])
            .map_err(ArchiveError::SinkWriteFailed)?;
    }
}

fn walk_error(root: &Path, err: walkdir::Error) -> ArchiveError {
    let path = err.path().unwrap_or(root).to_path_buf();
    match err.into_io_error() {
        Some(source) if source.kind() == io::ErrorKind::NotFound && path == root => {
            ArchiveError::SourceMissing(path)
        }
        Some(source) => ArchiveError::SourceUnreadable { path, source },
        None => ArchiveError::SourceUnreadable {
            path,
            source: io::Error::other("filesystem loop detected"),
        },
    }
}

fn zip_error(err: zip::result::ZipError) -> ArchiveError {
    match err {
        zip::result::ZipError::Io(err) => ArchiveError::SinkWriteFailed(err),
        other => ArchiveError::SinkWriteFailed(io::Error::other(other)),
    }
}
