//! CSV export of persisted histograms.
//!
//! One row per bin; the first column is the bin time in µs, followed by one column per
//! trace.

use crate::error::{AppResult, DaqError};
use crate::plugin::DataFromPlugin;
use std::path::Path;

/// Header of the time column.
pub const TIME_COLUMN: &str = "time_us";

/// Write `current` and `total` against `axis` with header `time_us,current,total`.
pub fn write_histogram_csv(path: &Path, axis: &[f64], current: &[f64], total: &[f64]) -> AppResult<()> {
    write_columns(path, &["current", "total"], axis, &[current, total])
}

/// Write every trace of an export block, labelled as in the block.
pub fn write_data_csv(path: &Path, data: &DataFromPlugin) -> AppResult<()> {
    let labels: Vec<&str> = data.labels.iter().map(String::as_str).collect();
    let arrays: Vec<&[f64]> = data.arrays.iter().map(Vec::as_slice).collect();
    write_columns(path, &labels, &data.axis.data, &arrays)
}

fn write_columns(path: &Path, labels: &[&str], axis: &[f64], columns: &[&[f64]]) -> AppResult<()> {
    if labels.len() != columns.len() {
        return Err(DaqError::InvalidValue {
            name: "columns".to_string(),
            reason: format!("{} labels for {} columns", labels.len(), columns.len()),
        });
    }
    if let Some(bad) = columns.iter().find(|c| c.len() != axis.len()) {
        return Err(DaqError::InvalidValue {
            name: "columns".to_string(),
            reason: format!("column has {} rows, axis has {}", bad.len(), axis.len()),
        });
    }
    imp::write(path, labels, axis, columns)
}

#[cfg(feature = "storage_csv")]
mod imp {
    use super::*;
    use tracing::info;

    pub(super) fn write(path: &Path, labels: &[&str], axis: &[f64], columns: &[&[f64]]) -> AppResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;

        let header = std::iter::once(TIME_COLUMN).chain(labels.iter().copied());
        writer.write_record(header).map_err(csv_error)?;

        for (row, time) in axis.iter().enumerate() {
            let record = std::iter::once(time.to_string())
                .chain(columns.iter().map(|column| column[row].to_string()));
            writer.write_record(record).map_err(csv_error)?;
        }
        writer.flush()?;

        info!(path = %path.display(), rows = axis.len(), "Histogram written");
        Ok(())
    }

    fn csv_error(e: csv::Error) -> DaqError {
        DaqError::Io(e.into())
    }
}

#[cfg(not(feature = "storage_csv"))]
mod imp {
    use super::*;

    pub(super) fn write(_path: &Path, _labels: &[&str], _axis: &[f64], _columns: &[&[f64]]) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }
}
