//! Chunk archives: a zstd-compressed tar of a chunk directory, and byte-range
//! splitting for artifacts the sink would reject as too large.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use eyre::{bail, eyre, Context, Result};
use tar::Builder;
use walkdir::WalkDir;

use crate::layout::is_partial;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub files: u64,
    pub input_bytes: u64,
    pub archive_bytes: u64,
}

pub(crate) fn sanitize_rel_path(rel: &Path) -> Result<PathBuf> {
    use std::path::Component::*;
    if rel.is_absolute() {
        bail!("refusing absolute archive entry path: {}", rel.display());
    }
    let mut clean = PathBuf::new();
    for comp in rel.components() {
        match comp {
            Normal(s) => clean.push(s),
            CurDir => {}
            ParentDir | RootDir | Prefix(_) => {
                bail!("unsafe component in archive entry path: {}", rel.display());
            }
        }
    }
    if clean.as_os_str().is_empty() {
        bail!("empty archive entry path");
    }
    Ok(clean)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Pack every finished file under `chunk_dir` into `archive_path`.
///
/// Entries keep their path relative to `chunk_dir`. `on_progress` receives
/// `(bytes_packed, bytes_total)` after each file. The archive is written under a
/// temporary name and renamed into place once complete.
pub fn build_archive(
    chunk_dir: &Path,
    archive_path: &Path,
    level: i32,
    mut on_progress: impl FnMut(u64, u64),
) -> Result<ArchiveSummary> {
    if !chunk_dir.is_dir() {
        bail!("chunk directory not found: {}", chunk_dir.display());
    }

    let mut files: Vec<(PathBuf, PathBuf, u64)> = Vec::new();
    for entry in WalkDir::new(chunk_dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {}", chunk_dir.display()))?;
        if !entry.file_type().is_file() || is_partial(entry.path()) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(chunk_dir)
            .map_err(|_| eyre!("failed to compute relative path for {}", entry.path().display()))?;
        let clean = sanitize_rel_path(rel)?;
        let size = entry
            .metadata()
            .with_context(|| format!("stat {}", entry.path().display()))?
            .len();
        files.push((entry.path().to_path_buf(), clean, size));
    }
    if files.is_empty() {
        bail!("no files to archive in {}", chunk_dir.display());
    }
    let total: u64 = files.iter().map(|(_, _, size)| *size).sum();

    let staging = with_suffix(archive_path, ".building");
    let result = (|| -> Result<()> {
        let out = File::create(&staging)
            .with_context(|| format!("create archive {}", staging.display()))?;
        let encoder = zstd::stream::Encoder::new(BufWriter::new(out), level)
            .context("initialise zstd encoder")?;
        let mut builder = Builder::new(encoder);

        let mut packed = 0u64;
        for (path, rel, size) in &files {
            builder
                .append_path_with_name(path, rel)
                .with_context(|| format!("add {} to archive", path.display()))?;
            packed += size;
            on_progress(packed, total);
        }

        let encoder = builder.into_inner().context("finish tar stream")?;
        let mut writer = encoder.finish().context("finish zstd stream")?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|err| eyre!("flush archive: {}", err.error()))?
            .sync_all()?;
        Ok(())
    })();

    if let Err(err) = result {
        let _ = fs::remove_file(&staging);
        return Err(err);
    }
    fs::rename(&staging, archive_path).with_context(|| {
        format!(
            "move {} into place at {}",
            staging.display(),
            archive_path.display()
        )
    })?;

    let archive_bytes = fs::metadata(archive_path)?.len();
    log::debug!(
        "archived {} file(s), {} bytes -> {} ({} bytes)",
        files.len(),
        total,
        archive_path.display(),
        archive_bytes
    );
    Ok(ArchiveSummary {
        files: files.len() as u64,
        input_bytes: total,
        archive_bytes,
    })
}

/// Part file name for `index` out of `count` parts.
pub fn part_path(archive: &Path, index: usize, count: usize) -> PathBuf {
    let width = count.saturating_sub(1).to_string().len().max(3);
    with_suffix(archive, &format!(".part{index:0width$}"))
}

/// Cut `archive` into sequential parts of at most `max_part` bytes.
///
/// An artifact that already fits comes back unchanged as the only element. Part
/// names sort lexically in reassembly order. The source archive is left in place.
pub fn split_for_sink(archive: &Path, max_part: u64) -> Result<Vec<PathBuf>> {
    if max_part == 0 {
        bail!("part size must be greater than zero");
    }
    let size = fs::metadata(archive)
        .with_context(|| format!("stat {}", archive.display()))?
        .len();
    if size <= max_part {
        return Ok(vec![archive.to_path_buf()]);
    }

    let count = size.div_ceil(max_part) as usize;
    let mut reader = BufReader::new(
        File::open(archive).with_context(|| format!("open {}", archive.display()))?,
    );
    let mut parts = Vec::with_capacity(count);
    for index in 0..count {
        let path = part_path(archive, index, count);
        let written = write_part(&mut reader, &path, max_part);
        parts.push(path);
        match written {
            Ok(bytes) if bytes > 0 => {}
            Ok(_) => {
                remove_parts(&parts);
                bail!("{} ended early while splitting", archive.display());
            }
            Err(err) => {
                remove_parts(&parts);
                return Err(err);
            }
        }
    }
    log::info!(
        "split {} ({} bytes) into {} part(s) of <= {} bytes",
        archive.display(),
        size,
        count,
        max_part
    );
    Ok(parts)
}

fn write_part(reader: &mut impl Read, path: &Path, max_part: u64) -> Result<u64> {
    let out = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut writer = BufWriter::new(out);
    let copied = io::copy(&mut reader.take(max_part), &mut writer)
        .with_context(|| format!("write {}", path.display()))?;
    writer.flush()?;
    Ok(copied)
}

/// Best-effort removal of part files.
pub fn remove_parts(parts: &[PathBuf]) {
    for part in parts {
        if let Err(err) = fs::remove_file(part) {
            if err.kind() != io::ErrorKind::NotFound {
                log::warn!("failed to remove part {}: {}", part.display(), err);
            }
        }
    }
}
