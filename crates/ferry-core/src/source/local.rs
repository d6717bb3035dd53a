use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::{FolderLink, ProviderError, RemoteFile, RemoteFolder, SourceProvider};
use crate::layout::is_partial;

const COPY_BLOCK: usize = 1024 * 1024;

/// Serves shared folders from a local directory: folder id `abc` maps to `<root>/abc`.
///
/// File handles are `<folder_id>:<relative path>`.
#[derive(Debug, Clone)]
pub struct LocalSourceProvider {
    root: PathBuf,
}

impl LocalSourceProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn folder_dir(&self, folder_id: &str) -> Result<PathBuf, ProviderError> {
        if folder_id.contains(['/', '\\']) || folder_id == ".." || folder_id == "." {
            return Err(ProviderError::Remote(format!("invalid folder id {folder_id}")));
        }
        Ok(self.root.join(folder_id))
    }
}

impl SourceProvider for LocalSourceProvider {
    fn folder_listing(&self, link: &FolderLink) -> Result<RemoteFolder, ProviderError> {
        let dir = self.folder_dir(&link.folder_id)?;
        if !dir.is_dir() {
            return Err(ProviderError::Remote(format!(
                "folder {} not found",
                link.folder_id
            )));
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&dir).sort_by_file_name() {
            let entry = entry.map_err(|err| ProviderError::Remote(err.to_string()))?;
            if !entry.file_type().is_file() || is_partial(entry.path()) {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&dir) else {
                continue;
            };
            let path = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let size = entry
                .metadata()
                .map_err(|err| ProviderError::Remote(err.to_string()))?
                .len();
            files.push(RemoteFile {
                handle: format!("{}:{path}", link.folder_id),
                name: entry.file_name().to_string_lossy().into_owned(),
                path,
                size,
            });
        }
        let total_size = files.iter().map(|f| f.size).sum();
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| link.folder_id.clone());

        Ok(RemoteFolder {
            name,
            handle: link.folder_id.clone(),
            files,
            total_size,
        })
    }

    fn fetch_file(
        &self,
        file: &RemoteFile,
        target: &Path,
        progress: &mut dyn FnMut(u64, u64),
        cancel: &CancellationToken,
    ) -> Result<u64, ProviderError> {
        // handle is `<folder_id>:<relative path>`
        let (folder, rel) = file
            .handle
            .split_once(':')
            .ok_or_else(|| ProviderError::Remote(format!("bad handle {}", file.handle)))?;
        let source = self.folder_dir(folder)?.join(rel);
        let mut reader = BufReader::new(File::open(&source).map_err(|err| {
            ProviderError::Remote(format!("{}: {err}", source.display()))
        })?);
        let mut writer = BufWriter::new(File::create(target)?);

        let mut buf = vec![0u8; COPY_BLOCK];
        let mut done = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            let read = reader.read(&mut buf)?;
            if read == 0 {
                break;
            }
            writer.write_all(&buf[..read])?;
            done += read as u64;
            progress(done, file.size);
        }
        writer.flush()?;
        Ok(done)
    }
}
