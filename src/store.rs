//! Dataset loading, the derived geo projection, and atomic output writes.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::{Builder, NamedTempFile};
use tracing::{debug, error, info};

use crate::error::SyncError;
use crate::record::BusinessRecord;

/// Records read during `Loading`, plus what is needed to detect drift.
#[derive(Debug, Clone)]
pub struct LoadedDataset {
    /// Records in file order.
    pub records: Vec<BusinessRecord>,
    /// File the records were read from (the dataset or the import).
    pub source: PathBuf,
    /// CRC32 of the existing dataset file, when one was read.
    pub previous_checksum: Option<u32>,
}

/// One row of the geo projection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint<'a> {
    /// Record id.
    pub id: &'a str,
    /// Latitude.
    pub lat: f64,
    /// Longitude.
    pub lng: f64,
}

/// Result of a successful write phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    /// CRC32 of the dataset bytes written.
    pub checksum: u32,
    /// Rows in the geo projection.
    pub geo_points: usize,
}

/// Reads the dataset for a run.
///
/// When the dataset file is absent, baseline-required runs fail with
/// [`SyncError::MissingBaseline`]; other runs fall back to `import`.
pub fn load_dataset(
    dataset: &Path,
    import: Option<&Path>,
    requires_baseline: bool,
) -> Result<LoadedDataset, SyncError> {
    if dataset.exists() {
        let bytes = fs::read(dataset).map_err(|err| SyncError::persistence(dataset, err))?;
        let records = parse_records(dataset, &bytes)?;
        info!(path = %dataset.display(), records = records.len(), "loaded dataset");
        return Ok(LoadedDataset {
            records,
            source: dataset.to_path_buf(),
            previous_checksum: Some(crc32fast::hash(&bytes)),
        });
    }
    if requires_baseline {
        return Err(SyncError::MissingBaseline {
            path: dataset.to_path_buf(),
        });
    }
    let Some(import) = import else {
        return Err(SyncError::persistence(
            dataset,
            io::Error::new(
                io::ErrorKind::NotFound,
                "dataset does not exist and no import file was configured",
            ),
        ));
    };
    let bytes = fs::read(import).map_err(|err| SyncError::persistence(import, err))?;
    let records = parse_records(import, &bytes)?;
    info!(path = %import.display(), records = records.len(), "seeded run from import");
    Ok(LoadedDataset {
        records,
        source: import.to_path_buf(),
        previous_checksum: None,
    })
}

/// Parses a dataset body and enforces id uniqueness.
pub fn parse_records(path: &Path, bytes: &[u8]) -> Result<Vec<BusinessRecord>, SyncError> {
    let records: Vec<BusinessRecord> =
        serde_json::from_slice(bytes).map_err(|err| SyncError::InvalidDataset {
            path: path.to_path_buf(),
            details: err.to_string(),
        })?;
    let mut seen = HashSet::with_capacity(records.len());
    for (idx, record) in records.iter().enumerate() {
        if record.id.trim().is_empty() {
            return Err(SyncError::InvalidDataset {
                path: path.to_path_buf(),
                details: format!("record #{idx} has an empty id"),
            });
        }
        if !seen.insert(record.id.as_str()) {
            return Err(SyncError::InvalidDataset {
                path: path.to_path_buf(),
                details: format!("duplicate id {:?}", record.id),
            });
        }
    }
    Ok(records)
}

/// Projects records with coordinates into `{id, lat, lng}` rows.
pub fn geo_projection(records: &[BusinessRecord]) -> Vec<GeoPoint<'_>> {
    records
        .iter()
        .filter_map(|record| {
            record.location.as_ref().map(|loc| GeoPoint {
                id: record.id.as_str(),
                lat: loc.lat,
                lng: loc.lng,
            })
        })
        .collect()
}

/// Two-space pretty JSON with a trailing newline.
pub fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, SyncError> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Serializes both outputs, then replaces each target via a temp file in the
/// same directory. Nothing touches disk if serialization fails.
///
/// The two renames are not one transaction. If the projection rename fails
/// after the dataset was replaced, the error names the geo path and the
/// projection stays stale until `farmsync-geo` or the next run rewrites it.
pub fn write_outputs(
    dataset: &Path,
    geo: &Path,
    records: &[BusinessRecord],
) -> Result<WriteSummary, SyncError> {
    let dataset_bytes = to_pretty_json(records)?;
    let points = geo_projection(records);
    let geo_bytes = to_pretty_json(&points)?;

    let staged_dataset = stage(dataset, &dataset_bytes)?;
    let staged_geo = stage(geo, &geo_bytes)?;
    commit(staged_dataset, dataset)?;
    if let Err(err) = commit(staged_geo, geo) {
        error!(
            dataset = %dataset.display(),
            geo = %geo.display(),
            error = %err,
            "dataset replaced but geo projection is stale; rerun farmsync-geo"
        );
        return Err(err);
    }

    let checksum = crc32fast::hash(&dataset_bytes);
    info!(
        dataset = %dataset.display(),
        geo = %geo.display(),
        records = records.len(),
        geo_points = points.len(),
        checksum = %format!("{checksum:08x}"),
        "outputs written"
    );
    Ok(WriteSummary {
        checksum,
        geo_points: points.len(),
    })
}

/// Writes a single JSON document atomically.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), SyncError> {
    let bytes = to_pretty_json(value)?;
    let staged = stage(path, &bytes)?;
    commit(staged, path)
}

fn stage(target: &Path, bytes: &[u8]) -> Result<NamedTempFile, SyncError> {
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|err| SyncError::persistence(dir, err))?;
    let existing = fs::metadata(target)
        .ok()
        .filter(|meta| meta.is_file())
        .map(|meta| meta.permissions());
    let mut builder = Builder::new();
    #[cfg(unix)]
    if existing.is_none() {
        use std::os::unix::fs::PermissionsExt;
        // New outputs are world-readable; NamedTempFile alone would give 0600.
        builder.permissions(fs::Permissions::from_mode(0o644));
    }
    let mut tmp = builder
        .tempfile_in(dir)
        .map_err(|err| SyncError::persistence(dir, err))?;
    if let Some(permissions) = existing {
        tmp.as_file()
            .set_permissions(permissions)
            .map_err(|err| SyncError::persistence(tmp.path(), err))?;
    }
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|err| SyncError::persistence(tmp.path(), err))?;
    debug!(target = %target.display(), tmp = %tmp.path().display(), "staged output");
    Ok(tmp)
}

fn commit(tmp: NamedTempFile, target: &Path) -> Result<(), SyncError> {
    tmp.persist(target)
        .map(|_| ())
        .map_err(|err| SyncError::persistence(target, err.error))
}
