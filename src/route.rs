/*!
 * Chunk routes: the engine's view of a transfer direction
 *
 * The engine only knows how to move byte ranges from a source to a staging
 * file and publish the result; whether the remote side is the source or
 * the destination is a single bit decided here. Both routes write to a
 * sibling staging path and promote it with an atomic rename.
 */

use crate::error::{FerryError, Result};
use crate::session::{ensure_dir, SftpPool};
use crate::verify::{hash_file, StreamingHasher};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Staging sibling for a destination: `<dir>/<basename>.part-<task_id>`
pub fn staging_path(dest: &Path, task_id: &str) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!("{}.part-{}", name, task_id))
}

/// Capability set the engine drives a transfer through.
///
/// `read_range`/`write_range` are called concurrently from workers on
/// disjoint ranges; implementations take one pooled SFTP channel per call.
pub trait ChunkRoute: Send + Sync {
    /// Create the staging file sized for the whole transfer. Existing
    /// staging bytes are kept (completed chunks survive a resume).
    fn prepare(&self, size: u64) -> Result<()>;

    /// Read exactly `len` bytes of the source at `offset`
    fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Write a block into the staging file at `offset`
    fn write_range(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Stream the staged file and return its SHA-256 hex digest
    fn stage_hash(&self) -> Result<String>;

    /// Atomically promote staging to the destination, applying mode bits
    /// first when requested
    fn publish(&self, mode: Option<u32>) -> Result<()>;

    /// Remove the staging file if present
    fn discard(&self);
}

fn short_read(offset: u64, wanted: usize, got: usize) -> FerryError {
    FerryError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!(
            "short read at offset {}: wanted {} bytes, got {}",
            offset, wanted, got
        ),
    ))
}

/// Remote source, local staging (download direction)
pub struct DownloadRoute {
    pool: Arc<SftpPool>,
    remote_source: PathBuf,
    staging: PathBuf,
    dest: PathBuf,
    staging_file: OnceLock<File>,
}

impl DownloadRoute {
    pub fn new(pool: Arc<SftpPool>, remote_source: PathBuf, dest: PathBuf, task_id: &str) -> Self {
        let staging = staging_path(&dest, task_id);
        Self {
            pool,
            remote_source,
            staging,
            dest,
            staging_file: OnceLock::new(),
        }
    }

    pub fn staging(&self) -> &Path {
        &self.staging
    }

    fn staging_handle(&self) -> Result<&File> {
        self.staging_file
            .get()
            .ok_or_else(|| FerryError::Manifest("staging file not prepared".into()))
    }
}

impl ChunkRoute for DownloadRoute {
    fn prepare(&self, size: u64) -> Result<()> {
        if let Some(parent) = self.dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.staging)?;
        file.set_len(size)?;
        debug!(staging = %self.staging.display(), size, "staging file ready");
        let _ = self.staging_file.set(file);
        Ok(())
    }

    fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }

        let channel = self.pool.checkout();
        let mut remote = channel.open(&self.remote_source)?;
        remote.seek(SeekFrom::Start(offset))?;

        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = remote.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(short_read(offset, len, filled));
            }
            filled += n;
        }
        Ok(buf)
    }

    fn write_range(&self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        write_all_at(self.staging_handle()?, data, offset)
    }

    fn stage_hash(&self) -> Result<String> {
        self.staging_handle()?.sync_data()?;
        hash_file(&self.staging)
    }

    fn publish(&self, mode: Option<u32>) -> Result<()> {
        let file = self.staging_handle()?;
        file.sync_all()?;

        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.staging, std::fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        std::fs::rename(&self.staging, &self.dest)?;
        Ok(())
    }

    fn discard(&self) {
        let _ = std::fs::remove_file(&self.staging);
    }
}

/// Local source, remote staging (upload direction)
pub struct UploadRoute {
    pool: Arc<SftpPool>,
    local_source: PathBuf,
    staging: PathBuf,
    dest: PathBuf,
    source_file: OnceLock<File>,
    staged_size: OnceLock<u64>,
}

impl UploadRoute {
    pub fn new(pool: Arc<SftpPool>, local_source: PathBuf, dest: PathBuf, task_id: &str) -> Self {
        let staging = staging_path(&dest, task_id);
        Self {
            pool,
            local_source,
            staging,
            dest,
            source_file: OnceLock::new(),
            staged_size: OnceLock::new(),
        }
    }

    pub fn staging(&self) -> &Path {
        &self.staging
    }

    fn source_handle(&self) -> Result<&File> {
        self.source_file
            .get()
            .ok_or_else(|| FerryError::Manifest("source file not opened".into()))
    }
}

impl ChunkRoute for UploadRoute {
    fn prepare(&self, size: u64) -> Result<()> {
        let source = File::open(&self.local_source)?;
        let _ = self.source_file.set(source);
        let _ = self.staged_size.set(size);

        let channel = self.pool.checkout();
        if let Some(parent) = self.staging.parent() {
            ensure_dir(&channel, parent)?;
        }

        // Create (or adopt) the staging file and force its length; bytes of
        // already-completed chunks within that length survive a resume
        let mut file = channel.open_mode(
            &self.staging,
            ssh2::OpenFlags::WRITE | ssh2::OpenFlags::CREATE,
            0o644,
            ssh2::OpenType::File,
        )?;
        file.setstat(ssh2::FileStat {
            size: Some(size),
            uid: None,
            gid: None,
            perm: None,
            atime: None,
            mtime: None,
        })?;
        debug!(staging = %self.staging.display(), size, "remote staging file ready");
        Ok(())
    }

    fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; len];
        read_exact_at(self.source_handle()?, &mut buf, offset)
            .map_err(|_| short_read(offset, len, 0))?;
        Ok(buf)
    }

    fn write_range(&self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let channel = self.pool.checkout();
        let mut remote = channel.open_mode(
            &self.staging,
            ssh2::OpenFlags::WRITE,
            0o644,
            ssh2::OpenType::File,
        )?;
        remote.seek(SeekFrom::Start(offset))?;
        remote.write_all(data)?;
        Ok(())
    }

    fn stage_hash(&self) -> Result<String> {
        let channel = self.pool.checkout();
        let mut remote = channel.open(&self.staging)?;
        let mut hasher = StreamingHasher::new();
        let mut buffer = [0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = remote.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            total += n as u64;
        }

        let expected = self.staged_size.get().copied().unwrap_or(total);
        if total != expected {
            return Err(FerryError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("staged file is {} bytes, expected {}", total, expected),
            )));
        }
        Ok(hasher.finish())
    }

    fn publish(&self, mode: Option<u32>) -> Result<()> {
        let channel = self.pool.checkout();

        if let Some(mode) = mode {
            channel
                .open_mode(
                    &self.staging,
                    ssh2::OpenFlags::WRITE,
                    0o644,
                    ssh2::OpenType::File,
                )?
                .setstat(ssh2::FileStat {
                    size: None,
                    uid: None,
                    gid: None,
                    perm: Some(mode),
                    atime: None,
                    mtime: None,
                })?;
        }

        channel.rename(
            &self.staging,
            &self.dest,
            Some(ssh2::RenameFlags::OVERWRITE | ssh2::RenameFlags::ATOMIC | ssh2::RenameFlags::NATIVE),
        )?;
        Ok(())
    }

    fn discard(&self) {
        let channel = self.pool.checkout();
        let _ = channel.unlink(&self.staging);
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)?;
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        let n = file.seek_write(data, offset)?;
        data = &data[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}
