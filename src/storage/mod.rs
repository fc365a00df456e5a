//! Storage backend (Arrow/Parquet)
//!
//! Cache artifacts are single Parquet files, one per dataset. Writes go to a
//! temporary sibling first and are renamed into place, so a crash never leaves
//! a half-written artifact under the final name.

use crate::table::normalize;
use crate::{Error, Result};
use arrow::compute;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Row group size used for cache artifacts
pub const MAX_ROW_GROUP_SIZE: usize = 1024 * 1024;

/// Load a whole Parquet file as a single normalized table
///
/// # Errors
/// Returns error if file cannot be read or parsed
pub fn load_parquet<P: AsRef<Path>>(path: P) -> Result<RecordBatch> {
    let file = File::open(path.as_ref())
        .map_err(|e| Error::StorageError(format!("Failed to open Parquet file: {e}")))?;

    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| Error::StorageError(format!("Failed to parse Parquet file: {e}")))?;
    let schema = builder.schema().clone();

    let reader = builder
        .build()
        .map_err(|e| Error::StorageError(format!("Failed to create Parquet reader: {e}")))?;

    let mut batches = Vec::new();
    for batch in reader {
        let batch = batch
            .map_err(|e| Error::StorageError(format!("Failed to read record batch: {e}")))?;
        batches.push(batch);
    }

    let combined = match batches.len() {
        0 => RecordBatch::new_empty(schema),
        1 => batches.swap_remove(0),
        _ => compute::concat_batches(&schema, &batches)
            .map_err(|e| Error::StorageError(format!("Failed to combine batches: {e}")))?,
    };
    normalize(&combined)
}

/// Write a table to Parquet through a temporary file and an atomic rename
///
/// # Errors
/// Returns error if the file cannot be written or renamed
pub fn write_parquet_atomic<P: AsRef<Path>>(path: P, batch: &RecordBatch) -> Result<()> {
    write_through_temp(path.as_ref(), |file| {
        let props = WriterProperties::builder()
            .set_max_row_group_size(MAX_ROW_GROUP_SIZE)
            .build();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
        writer.write(batch)?;
        Ok(writer.into_inner()?)
    })
}

/// Write bytes through a temporary file and an atomic rename
///
/// # Errors
/// Returns error if the file cannot be written or renamed
pub fn write_atomic<P: AsRef<Path>>(path: P, bytes: &[u8]) -> Result<()> {
    write_through_temp(path.as_ref(), |mut file| {
        file.write_all(bytes)?;
        Ok(file)
    })
}

/// Run `write` on a temporary sibling of `path`, then rename it into place
///
/// The temporary file is removed when writing fails.
fn write_through_temp<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(File) -> Result<File>,
{
    let tmp = temp_sibling(path)?;
    let written = File::create(&tmp)
        .map_err(Error::from)
        .and_then(write)
        .and_then(|file| Ok(file.sync_all()?));
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    rename_into_place(&tmp, path)
}

fn temp_sibling(path: &Path) -> Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::StorageError(format!("No parent directory for {}", path.display())))?;
    std::fs::create_dir_all(parent)?;
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("artifact");
    Ok(parent.join(format!(".{name}.tmp.{}", std::process::id())))
}

fn rename_into_place(tmp: &Path, path: &Path) -> Result<()> {
    if let Err(e) = std::fs::rename(tmp, path) {
        let _ = std::fs::remove_file(tmp);
        return Err(Error::StorageError(format!(
            "Failed to move {} into place: {e}",
            path.display()
        )));
    }
    Ok(())
}
