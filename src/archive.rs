use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Zips the solver's field file and, when present, its companion HDF5 file.
///
/// The field file is required; its absence is an error rather than an empty
/// or partial archive. Entries are stored under their bare file names.
pub fn package_results(
    field: &Path,
    companion: &Path,
    archive: &Path,
) -> Result<PathBuf, ArchiveError> {
    if !field.is_file() {
        return Err(ArchiveError::MissingField(field.to_path_buf()));
    }

    let mut members = vec![field];
    if companion.is_file() {
        members.push(companion);
    } else {
        tracing::info!("No companion data file at {:?}, archiving field file only", companion);
    }

    let file = File::create(archive)
        .map_err(|e| ArchiveError::IoError(format!("Failed to create {:?}: {}", archive, e)))?;
    let mut zip = ZipWriter::new(file);

    for member in &members {
        let name = member
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| ArchiveError::IoError(format!("{:?} has no file name", member)))?;
        let data = std::fs::read(member)
            .map_err(|e| ArchiveError::IoError(format!("Failed to read {:?}: {}", member, e)))?;

        zip.start_file(name.as_str(), file_options())
            .map_err(|e| ArchiveError::ZipError(e.to_string()))?;
        zip.write_all(&data)
            .map_err(|e| ArchiveError::IoError(format!("Failed to write {}: {}", name, e)))?;
    }

    zip.finish()
        .map_err(|e| ArchiveError::ZipError(e.to_string()))?;

    tracing::info!("Packaged {} file(s) into {:?}", members.len(), archive);
    Ok(archive.to_path_buf())
}

fn file_options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

/// Archive contents for the download response.
pub async fn read_archive(archive: &Path) -> Result<Vec<u8>, ArchiveError> {
    tokio::fs::read(archive).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ArchiveError::MissingArchive(archive.to_path_buf())
        } else {
            ArchiveError::IoError(format!("Failed to read {:?}: {}", archive, e))
        }
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Field data file not found: {0:?}")]
    MissingField(PathBuf),
    #[error("No result archive at {0:?}")]
    MissingArchive(PathBuf),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Zip error: {0}")]
    ZipError(String),
}
