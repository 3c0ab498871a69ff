use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use super::header::{is_zero_block, padding, EntryType, TarHeader, BLOCK_SIZE};
use crate::error::{ArchiveError, IoError, Result};

/// Reads headers and content off an archive stream, one block at a time.
/// Never reads past the first end-of-archive block.
struct BlockReader<R> {
    inner: R,
    finished: bool,
}

impl<R: Read> BlockReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            finished: false,
        }
    }

    /// The next header, or `None` at the end of the archive.
    fn next_header(&mut self) -> Result<Option<TarHeader>> {
        if self.finished {
            return Ok(None);
        }
        let mut block = [0u8; BLOCK_SIZE];
        let n = read_full(&mut self.inner, &mut block)?;
        if n == 0 {
            warn!("archive ended without an end-of-archive marker");
            self.finished = true;
            return Ok(None);
        }
        if n < BLOCK_SIZE {
            self.finished = true;
            return Err(IoError::TruncatedArchive {
                expected: BLOCK_SIZE as u64,
                received: n as u64,
            }
            .into());
        }
        if is_zero_block(&block) {
            self.finished = true;
            return Ok(None);
        }
        match TarHeader::from_block(&block) {
            Ok(header) => Ok(Some(header)),
            Err(err) => {
                self.finished = true;
                Err(err)
            }
        }
    }

    /// Copy the content of the entry whose header was just read, then skip
    /// its padding.
    fn copy_content<W: Write>(&mut self, size: u64, sink: &mut W) -> Result<()> {
        let copied = io::copy(&mut (&mut self.inner).take(size), sink)?;
        if copied < size {
            self.finished = true;
            return Err(IoError::TruncatedArchive {
                expected: size,
                received: copied,
            }
            .into());
        }
        let pad = padding(size);
        let mut scratch = [0u8; BLOCK_SIZE];
        let n = read_full(&mut self.inner, &mut scratch[..pad])?;
        if n < pad {
            self.finished = true;
            return Err(IoError::TruncatedArchive {
                expected: size + pad as u64,
                received: size + n as u64,
            }
            .into());
        }
        Ok(())
    }

    fn skip_content(&mut self, size: u64) -> Result<()> {
        self.copy_content(size, &mut io::sink())
    }
}

/// Fill `buf` unless EOF comes first; returns how much was read.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// One entry read fully into memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub header: TarHeader,
    pub content: Vec<u8>,
}

/// Iterator over the entries of an archive, for inspecting archives without
/// touching the filesystem. Stops after the first error.
pub struct Entries<R> {
    blocks: BlockReader<R>,
}

/// Iterate the entries of an archive in stream order.
pub fn entries<R: Read>(reader: R) -> Entries<R> {
    Entries {
        blocks: BlockReader::new(reader),
    }
}

impl<R: Read> Iterator for Entries<R> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        let header = match self.blocks.next_header() {
            Ok(Some(header)) => header,
            Ok(None) => return None,
            Err(err) => return Some(Err(err)),
        };
        let mut content = Vec::with_capacity(header.size.min(1 << 20) as usize);
        Some(
            self.blocks
                .copy_content(header.size, &mut content)
                .map(|()| Entry { header, content }),
        )
    }
}

/// Extract an archive under `dest`, creating it if needed.
///
/// Returns the paths of the regular files written, in archive order.
/// Directory entries are created; links, devices and other special entries
/// are skipped with a warning. An entry whose name is absolute or climbs out
/// with `..` fails the extraction, and nothing is ever written outside
/// `dest`. Entries before a failing one stay on disk; a file cut short by a
/// truncated archive does not. Only the permission bits of a mode are
/// applied, never setuid, setgid or sticky.
pub fn extract<R: Read>(reader: R, dest: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dest = dest.as_ref();
    fs::create_dir_all(dest)?;
    let root = dest.canonicalize()?;

    let mut blocks = BlockReader::new(reader);
    let mut written = Vec::new();
    while let Some(header) = blocks.next_header()? {
        let relative = safe_relative(&header.name)?;
        match header.entry_type {
            EntryType::Regular => {
                let Some(relative) = relative else {
                    return Err(ArchiveError::UnsafePath(header.name).into());
                };
                let target = prepare_target(&root, &relative, &header.name)?;
                let mut file = File::create(&target)?;
                if let Err(err) = blocks.copy_content(header.size, &mut file) {
                    drop(file);
                    let _ = fs::remove_file(&target);
                    return Err(err);
                }
                file.flush()?;
                set_mode(&target, header.mode)?;
                debug!(path = %target.display(), size = header.size, "extracted file");
                written.push(target);
            }
            EntryType::Directory => {
                if let Some(relative) = relative {
                    create_dirs(&root, &relative, &header.name)?;
                }
                blocks.skip_content(header.size)?;
            }
            EntryType::Other(flag) => {
                warn!(
                    name = %header.name,
                    flag = %char::from(flag),
                    "skipping unsupported archive entry"
                );
                blocks.skip_content(header.size)?;
            }
        }
    }
    Ok(written)
}

/// `extract` over an archive already in memory.
pub fn extract_bytes(archive: &[u8], dest: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    extract(archive, dest)
}

/// The entry name as a relative path made only of normal components.
/// `None` for names like `./` that point at the destination itself.
fn safe_relative(name: &str) -> Result<Option<PathBuf>> {
    let mut out = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::UnsafePath(name.to_string()).into());
            }
        }
    }
    Ok((!out.as_os_str().is_empty()).then_some(out))
}

/// Create the parent directories of an entry and return where it goes.
/// A symlink already sitting at the target is removed, not written through.
fn prepare_target(root: &Path, relative: &Path, name: &str) -> Result<PathBuf> {
    if let Some(parent) = relative.parent() {
        create_dirs(root, parent, name)?;
    }
    let target = root.join(relative);
    if fs::symlink_metadata(&target).is_ok_and(|m| m.file_type().is_symlink()) {
        fs::remove_file(&target)?;
    }
    Ok(target)
}

/// Create `relative` under `root` one component at a time. Each component
/// is checked before the next is created: a symlink on the way must resolve
/// inside `root`.
fn create_dirs(root: &Path, relative: &Path, name: &str) -> Result<()> {
    let mut current = root.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => ensure_inside(root, &current, name)?,
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => fs::create_dir(&current)?,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn ensure_inside(root: &Path, path: &Path, name: &str) -> Result<()> {
    // A dangling link cannot be resolved, so it is not known to be inside.
    let resolved = path
        .canonicalize()
        .map_err(|_| ArchiveError::UnsafePath(name.to_string()))?;
    if resolved.starts_with(root) {
        Ok(())
    } else {
        Err(ArchiveError::UnsafePath(name.to_string()).into())
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode != 0 {
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
