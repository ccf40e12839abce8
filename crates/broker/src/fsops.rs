//! Confined filesystem operations.
//!
//! Every operation resolves its paths through the [`Confinement`] and takes
//! the appropriate advisory lock before touching the filesystem: shared for
//! reads, exclusive for anything that mutates. Chunked reads and writes use
//! a 4096-byte unit; writes past the end of a file fill the gap with spaces.

use std::path::Path;

use protocol::{CallerIdentity, FileEntry};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::locks::LockManager;
use crate::sandbox::{Confinement, SandboxError};

/// Chunk size for reads and writes, in bytes.
pub const CHUNK_SIZE: usize = 4096;

/// Errors raised by filesystem operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// Path validation failed.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// The path is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// The path is not a regular file.
    #[error("not a regular file: {0}")]
    NotAFile(String),

    /// The target already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A directory slated for deletion still has entries.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Read offset lies beyond the end of the file.
    #[error("Offset beyond EOF")]
    OffsetBeyondEof,

    /// Permission mode string did not parse as octal.
    #[error("invalid mode: {0}")]
    InvalidMode(String),

    /// Underlying I/O failure.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// The offending path.
        path: String,
        /// The underlying error.
        source: std::io::Error,
    },
}

/// Result type for filesystem operations.
pub type Result<T> = std::result::Result<T, FsError>;

fn io_err(path: &Path, source: std::io::Error) -> FsError {
    FsError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Outcome of a chunked read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadChunk {
    /// The file has no content at all.
    EmptyFile,
    /// Bytes read at the requested offset.
    Data(Vec<u8>),
}

/// Filesystem operations bound to a confinement and lock table.
#[derive(Debug)]
pub struct FileOps {
    confinement: Confinement,
    locks: LockManager,
}

impl FileOps {
    /// Create file operations over the given confinement.
    pub fn new(confinement: Confinement) -> Self {
        Self {
            confinement,
            locks: LockManager::new(),
        }
    }

    /// The confinement these operations run inside.
    pub fn confinement(&self) -> &Confinement {
        &self.confinement
    }

    /// List a directory, sorted by name.
    pub async fn list_dir(&self, caller: &CallerIdentity, path: &str) -> Result<Vec<FileEntry>> {
        let dir = self.confinement.resolve_shared(caller, path)?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory(path.to_string()));
        }

        let _guard = self.locks.lock_shared(&dir).await;

        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&dir).await.map_err(|e| io_err(&dir, e))?;
        while let Some(entry) = reader.next_entry().await.map_err(|e| io_err(&dir, e))? {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    // Entry may vanish between readdir and stat
                    warn!(entry = %entry.path().display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            entries.push(FileEntry::new(
                entry.file_name().to_string_lossy().into_owned(),
                permission_string(&metadata),
                metadata.len(),
            ));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(dir = %dir.display(), count = entries.len(), "Listed directory");
        Ok(entries)
    }

    /// Change the working directory; returns the new workdir relative to home.
    pub async fn change_dir(&self, caller: &CallerIdentity, path: &str) -> Result<String> {
        let dir = self.confinement.resolve(caller, path)?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        Ok(self.confinement.workdir_of(caller, &dir))
    }

    /// Create a file, or a directory when `directory` is set.
    pub async fn create(&self, caller: &CallerIdentity, path: &str, directory: bool) -> Result<()> {
        let target = self.confinement.resolve_for_creation(caller, path)?;
        let _guard = self.locks.lock_exclusive(&target).await;

        if target.exists() {
            return Err(FsError::AlreadyExists(path.to_string()));
        }

        if directory {
            tokio::fs::create_dir(&target)
                .await
                .map_err(|e| io_err(&target, e))?;
        } else {
            tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&target)
                .await
                .map_err(|e| io_err(&target, e))?;
        }
        Ok(())
    }

    /// Apply an octal permission mode.
    pub async fn chmod(&self, caller: &CallerIdentity, mode: &str, path: &str) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let bits =
            u32::from_str_radix(mode, 8).map_err(|_| FsError::InvalidMode(mode.to_string()))?;
        if bits > 0o7777 {
            return Err(FsError::InvalidMode(mode.to_string()));
        }

        let target = self.confinement.resolve(caller, path)?;
        let _guard = self.locks.lock_exclusive(&target).await;

        tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(bits))
            .await
            .map_err(|e| io_err(&target, e))
    }

    /// Delete a file or empty directory.
    pub async fn delete(&self, caller: &CallerIdentity, path: &str) -> Result<()> {
        let target = self.confinement.resolve(caller, path)?;
        let _guard = self.locks.lock_exclusive(&target).await;

        let metadata = tokio::fs::metadata(&target)
            .await
            .map_err(|e| io_err(&target, e))?;

        if metadata.is_dir() {
            tokio::fs::remove_dir(&target).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::DirectoryNotEmpty {
                    FsError::DirectoryNotEmpty(path.to_string())
                } else {
                    io_err(&target, e)
                }
            })
        } else {
            tokio::fs::remove_file(&target)
                .await
                .map_err(|e| io_err(&target, e))
        }
    }

    /// Move an entry into an existing directory. The destination must not
    /// already contain an entry of the same name.
    pub async fn rename_into(
        &self,
        caller: &CallerIdentity,
        src: &str,
        dstdir: &str,
    ) -> Result<()> {
        let source = self.confinement.resolve(caller, src)?;
        let dest_dir = self.confinement.resolve(caller, dstdir)?;
        if !dest_dir.is_dir() {
            return Err(FsError::NotADirectory(dstdir.to_string()));
        }

        let name = source
            .file_name()
            .ok_or_else(|| FsError::NotAFile(src.to_string()))?;
        let destination = dest_dir.join(name);
        if destination.exists() {
            return Err(FsError::AlreadyExists(destination.display().to_string()));
        }

        let _src_guard = self.locks.lock_exclusive(&source).await;
        let _dst_guard = self.locks.lock_exclusive(&destination).await;

        tokio::fs::rename(&source, &destination)
            .await
            .map_err(|e| io_err(&source, e))
    }

    /// Read up to [`CHUNK_SIZE`] bytes at the given offset.
    pub async fn read_chunk(
        &self,
        caller: &CallerIdentity,
        path: &str,
        offset: u64,
    ) -> Result<ReadChunk> {
        let target = self.confinement.resolve(caller, path)?;
        let _guard = self.locks.lock_shared(&target).await;

        let metadata = tokio::fs::metadata(&target)
            .await
            .map_err(|e| io_err(&target, e))?;
        if !metadata.is_file() {
            return Err(FsError::NotAFile(path.to_string()));
        }
        if metadata.len() == 0 {
            return Ok(ReadChunk::EmptyFile);
        }
        if offset > metadata.len() {
            return Err(FsError::OffsetBeyondEof);
        }

        let mut file = tokio::fs::File::open(&target)
            .await
            .map_err(|e| io_err(&target, e))?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| io_err(&target, e))?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut filled = 0;
        while filled < buffer.len() {
            let n = file
                .read(&mut buffer[filled..])
                .await
                .map_err(|e| io_err(&target, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(ReadChunk::Data(buffer))
    }

    /// Write bytes at the given offset, padding any gap beyond the current
    /// end of file with spaces. Returns the number of bytes written
    /// (excluding padding).
    pub async fn write_chunk(
        &self,
        caller: &CallerIdentity,
        path: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        let target = match self.confinement.resolve(caller, path) {
            Ok(p) => p,
            // Writing may create the file
            Err(SandboxError::NotFound(_)) => {
                self.confinement.resolve_for_creation(caller, path)?
            }
            Err(e) => return Err(e.into()),
        };
        let _guard = self.locks.lock_exclusive(&target).await;

        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&target)
            .await
            .map_err(|e| io_err(&target, e))?;

        let len = file.metadata().await.map_err(|e| io_err(&target, e))?.len();
        if offset > len {
            file.seek(std::io::SeekFrom::Start(len))
                .await
                .map_err(|e| io_err(&target, e))?;
            let gap = vec![b' '; (offset - len) as usize];
            file.write_all(&gap).await.map_err(|e| io_err(&target, e))?;
        } else {
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| io_err(&target, e))?;
        }

        file.write_all(data).await.map_err(|e| io_err(&target, e))?;
        file.flush().await.map_err(|e| io_err(&target, e))?;
        Ok(data.len())
    }

    /// Copy a transferred file from the sender's home into the receiver's
    /// tree and hand ownership to the receiver.
    pub async fn copy_transfer(
        &self,
        sender: &CallerIdentity,
        receiver: &CallerIdentity,
        filename: &str,
        dstdir: &str,
    ) -> Result<u64> {
        let source = self.confinement.resolve(sender, filename)?;
        if !source.is_file() {
            return Err(FsError::NotAFile(filename.to_string()));
        }

        let dest_dir = self.confinement.resolve(receiver, dstdir)?;
        if !dest_dir.is_dir() {
            return Err(FsError::NotADirectory(dstdir.to_string()));
        }

        let name = source
            .file_name()
            .ok_or_else(|| FsError::NotAFile(filename.to_string()))?;
        let destination = dest_dir.join(name);
        if destination.exists() {
            return Err(FsError::AlreadyExists(destination.display().to_string()));
        }

        let _src_guard = self.locks.lock_shared(&source).await;
        let _dst_guard = self.locks.lock_exclusive(&destination).await;

        let copied = tokio::fs::copy(&source, &destination)
            .await
            .map_err(|e| io_err(&source, e))?;

        // Same privilege caveat as home provisioning: unprivileged brokers
        // leave ownership unchanged.
        match std::os::unix::fs::chown(&destination, Some(receiver.uid), Some(receiver.gid)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                warn!(
                    destination = %destination.display(),
                    "Running unprivileged, leaving transfer ownership unchanged"
                );
            }
            Err(e) => return Err(io_err(&destination, e)),
        }

        Ok(copied)
    }
}

/// Build the `ls`-style permission string from file metadata.
pub fn permission_string(metadata: &std::fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;

    let mode = metadata.permissions().mode();
    let type_char = if metadata.is_dir() {
        'd'
    } else if metadata.file_type().is_symlink() {
        'l'
    } else {
        '-'
    };

    let mut perms = String::with_capacity(10);
    perms.push(type_char);
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        perms.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        perms.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        perms.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    perms
}
