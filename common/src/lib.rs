// Copyright 2025 Oxide Computer Company

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use ErrorKind::NotFound;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use slog::{o, Drain, Logger};
use tempfile::NamedTempFile;

pub mod config;

pub use config::{ConfigError, PoolConfig, PoolDrive, ShareConfig};

pub fn build_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator)
        .build()
        .filter_level(slog::Level::Info)
        .fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

/**
 * Read a JSON datafile, returning None if the file does not exist yet.
 * Used by the durable registries, which start out empty on a fresh
 * install.
 */
pub fn read_json_maybe<P, T>(file: P) -> Result<Option<T>>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    let mut f = match File::open(file) {
        Ok(f) => f,
        Err(e) if e.kind() == NotFound => return Ok(None),
        Err(e) => bail!("open {:?}: {:?}", file, e),
    };
    let mut buf = Vec::<u8>::new();
    f.read_to_end(&mut buf)
        .with_context(|| anyhow!("read {:?}", file))?;
    Ok(serde_json::from_slice(buf.as_slice())
        .with_context(|| anyhow!("parse {:?}", file))?)
}

pub fn read_json<P, T>(file: P) -> Result<T>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    Ok(read_json_maybe(file)?
        .ok_or_else(|| anyhow!("open {:?}: file not found", file))?)
}

/**
 * Atomically replace a JSON datafile: write the new contents to a
 * temporary file in the same directory, then rename it over the target.
 * A crash mid-write leaves the previous version intact.
 */
pub fn write_json<P, T>(file: P, data: &T) -> Result<()>
where
    P: AsRef<Path>,
    T: Serialize,
{
    let file = file.as_ref();
    let mut buf = serde_json::to_vec_pretty(data)?;
    buf.push(b'\n');
    let parent = file
        .parent()
        .ok_or_else(|| anyhow!("no parent directory for {:?}", file))?;
    let mut tmpf = NamedTempFile::new_in(parent)?;
    tmpf.write_all(&buf)?;
    tmpf.flush()?;
    tmpf.persist(file)?;
    Ok(())
}

pub fn mkdir_for_file(file: &Path) -> Result<()> {
    Ok(std::fs::create_dir_all(
        file.parent().ok_or_else(|| anyhow!("file path expected"))?,
    )?)
}

/**
 * Parse a human byte count ("10GiB", "512mb", "1024") into bytes.
 * Bare numbers are taken as bytes.
 */
pub fn parse_byte_count(s: &str) -> Result<u64> {
    let b = byte_unit::Byte::parse_str(s, true)
        .map_err(|e| anyhow!("cannot parse byte count {:?}: {}", s, e))?;
    Ok(b.as_u64())
}
