use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::debug;

use super::header::{padding, TarHeader, BLOCK_SIZE};
use crate::error::{ArchiveError, IoError, Result};

const ZEROS: [u8; BLOCK_SIZE] = [0; BLOCK_SIZE];

#[derive(Debug, Clone)]
enum Source {
    File(PathBuf),
    Bytes {
        name: String,
        content: Vec<u8>,
        mtime: u64,
    },
}

/// Builds a flat tar archive from files on disk and in-memory entries.
///
/// Entries are written in the order they were added. Each file lands under
/// its own file name; directories are not walked. Nothing is read from disk
/// until `write_to` or `serialize`.
#[derive(Debug, Clone, Default)]
pub struct ArchiveBuilder {
    sources: Vec<Source>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.sources.push(Source::File(path.into()));
        self
    }

    pub fn add_files<I, P>(&mut self, paths: I) -> &mut Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.sources
            .extend(paths.into_iter().map(|p| Source::File(p.into())));
        self
    }

    /// Add an entry whose content is already in memory. `name` may contain
    /// `/`-separated directories.
    pub fn add_bytes(
        &mut self,
        name: impl Into<String>,
        content: impl Into<Vec<u8>>,
        mtime: u64,
    ) -> &mut Self {
        self.sources.push(Source::Bytes {
            name: name.into(),
            content: content.into(),
            mtime,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Stream the archive into `w`, returning the number of bytes written.
    ///
    /// Every header is built before the first byte is written, so a missing
    /// file, a directory, or an over-long name fails without leaving half an
    /// archive in the sink.
    pub fn write_to<W: Write>(&self, mut w: W) -> Result<u64> {
        let headers = self
            .sources
            .iter()
            .map(|source| {
                let header = header_for(source)?;
                let block = header.to_block()?;
                Ok((header, block))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut written = 0u64;
        for (source, (header, block)) in self.sources.iter().zip(&headers) {
            debug!(name = %header.name, size = header.size, "archiving entry");
            w.write_all(block)?;
            match source {
                Source::File(path) => copy_exact(path, header.size, &mut w)?,
                Source::Bytes { content, .. } => w.write_all(content)?,
            }
            let pad = padding(header.size);
            w.write_all(&ZEROS[..pad])?;
            written += (BLOCK_SIZE + pad) as u64 + header.size;
        }
        w.write_all(&ZEROS)?;
        w.write_all(&ZEROS)?;
        w.flush()?;
        Ok(written + 2 * BLOCK_SIZE as u64)
    }

    /// The whole archive in memory.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }
}

fn header_for(source: &Source) -> Result<TarHeader> {
    match source {
        Source::Bytes {
            name,
            content,
            mtime,
        } => Ok(TarHeader::regular(
            name.clone(),
            content.len() as u64,
            0o644,
            *mtime,
        )),
        Source::File(path) => {
            let meta = fs::metadata(path)?;
            if !meta.is_file() {
                return Err(ArchiveError::NotARegularFile(path.clone()).into());
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| ArchiveError::InvalidHeader {
                    field: "name",
                    reason: format!("{} has no UTF-8 file name", path.display()),
                })?;
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_secs());
            Ok(TarHeader::regular(name, meta.len(), permissions(&meta), mtime))
        }
    }
}

#[cfg(unix)]
fn permissions(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permissions(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Copy exactly `size` bytes of `path`. A file that shrank since its
/// header was built would leave the archive misaligned, so that is an error.
fn copy_exact<W: Write>(path: &Path, size: u64, w: &mut W) -> Result<()> {
    let file = File::open(path)?;
    let copied = io::copy(&mut file.take(size), w)?;
    if copied != size {
        return Err(IoError::Transport(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "{} shrank while being archived: expected {size} bytes, read {copied}",
                path.display()
            ),
        ))
        .into());
    }
    Ok(())
}
