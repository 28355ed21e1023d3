use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{FlowError, Result};
use crate::scheduler::PartyRef;
use crate::storage::path_segment;

/// Log directory layout: `<root>/<job_id>/<role>/<party_id>/...`.
#[derive(Debug, Clone)]
pub struct LogLayout {
    root: PathBuf,
}

impl LogLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn job_dir(&self, job_id: &str) -> Result<PathBuf> {
        Ok(self.root.join(path_segment("job_id", job_id)?))
    }

    pub fn party_dir(&self, job_id: &str, party: &PartyRef) -> Result<PathBuf> {
        Ok(self
            .job_dir(job_id)?
            .join(path_segment("role", &party.role)?)
            .join(party.party_id.to_string()))
    }

    /// Pack every file under the job's log directory into a gzipped tarball,
    /// with paths relative to that directory.
    pub async fn archive(&self, job_id: &str) -> Result<Vec<u8>> {
        let dir = self.job_dir(job_id)?;
        if !dir.is_dir() {
            return Err(FlowError::NotFound(format!("logs for job {}", job_id)));
        }
        tokio::task::spawn_blocking(move || archive_dir(&dir))
            .await
            .map_err(|e| FlowError::Internal(format!("log archival task failed: {}", e)))?
    }
}

fn archive_dir(dir: &Path) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar = tar::Builder::new(encoder);
    append_dir(&mut tar, dir, "")?;
    let mut encoder = tar.into_inner()?;
    encoder.flush()?;
    Ok(encoder.finish()?)
}

fn append_dir<W: Write>(tar: &mut tar::Builder<W>, dir: &Path, prefix: &str) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let name = entry.file_name();
        let archive_path = if prefix.is_empty() {
            name.to_string_lossy().to_string()
        } else {
            format!("{}/{}", prefix, name.to_string_lossy())
        };

        if path.is_dir() {
            append_dir(tar, &path, &archive_path)?;
        } else {
            let mut file = fs::File::open(&path)?;
            tar.append_file(&archive_path, &mut file)?;
        }
    }
    Ok(())
}
