//! Tar archives for copying files into and out of containers.
//!
//! # Design
//! Only the classic ustar subset the daemon's archive endpoints exchange:
//! regular files and directories, names up to 100 bytes (plus the ustar
//! prefix when reading), octal numeric fields. The encoder streams file
//! content straight into any `Write`, so an upload never has to sit in
//! memory as a whole. The decoder reads one 512-byte block at a time from
//! any `Read` and stops at the first end-of-archive block, which lets it
//! consume a response body without reading past the archive.
//!
//! Extraction refuses names that are absolute or contain `..`, and checks
//! the resolved parent directory of every file against the destination so
//! a pre-existing symlink cannot redirect a write.

mod decoder;
mod encoder;
mod header;

pub use decoder::{entries, extract, extract_bytes, Entries, Entry};
pub use encoder::ArchiveBuilder;
pub use header::{is_zero_block, EntryType, TarHeader, BLOCK_SIZE, NAME_LEN};
