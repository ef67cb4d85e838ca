use crate::align::{FieldData, LabeledTable};
use anyhow::Result;
use chrono::Utc;
use ndarray::Array2;
use polars::prelude::{Column, CsvWriter, DataFrame, NamedFrom, SerWriter, Series};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Logged metric names often contain `/` (e.g. `train/loss`).
pub fn file_safe_name(field: &str) -> String {
    let cleaned: String = field
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "field".to_string()
    } else {
        cleaned
    }
}

/// File stem for `field` that no earlier field of the export has taken.
/// Repeats get `_1`, `_2`, ... appended.
pub fn unique_file_stem(field: &str, used: &mut BTreeSet<String>) -> String {
    let base = file_safe_name(field);
    let mut stem = base.clone();
    let mut n = 1;
    while used.contains(&stem) {
        stem = format!("{}_{}", base, n);
        n += 1;
    }
    used.insert(stem.clone());
    stem
}

/// NumPy `.npy` v1.0, little-endian f64, C order.
pub fn encode_npy(values: &Array2<f64>) -> Vec<u8> {
    let (rows, cols) = values.dim();
    let mut header = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': ({}, {}), }}",
        rows, cols
    );
    // magic + version + u16 length + header + '\n' lands on a 64-byte boundary
    let unpadded = NPY_MAGIC.len() + 4 + header.len() + 1;
    header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    header.push('\n');

    let mut out = Vec::with_capacity(NPY_MAGIC.len() + 4 + header.len() + rows * cols * 8);
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for v in values.iter() {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn table_frame(table: &LabeledTable) -> Result<DataFrame> {
    let mut columns: Vec<Column> = Vec::with_capacity(table.column_labels.len() + 1);
    columns.push(Series::new("run".into(), table.row_labels.clone()).into());
    for (j, label) in table.column_labels.iter().enumerate() {
        let values: Vec<f64> = table.values.column(j).to_vec();
        columns.push(Series::new(label.as_str().into(), values).into());
    }
    Ok(DataFrame::new(columns)?)
}

pub fn encode_csv(table: &LabeledTable) -> Result<Vec<u8>> {
    let mut frame = table_frame(table)?;
    let mut buf: Vec<u8> = Vec::new();
    CsvWriter::new(&mut buf).finish(&mut frame)?;
    Ok(buf)
}

/// Writes one aligned field into `dir` as `<stem>.npy` or `<stem>.csv`.
pub fn write_field(dir: &Path, stem: &str, data: &FieldData) -> Result<PathBuf> {
    let (path, bytes) = match data {
        FieldData::Array(values) => (dir.join(format!("{}.npy", stem)), encode_npy(values)),
        FieldData::Table(table) => (dir.join(format!("{}.csv", stem)), encode_csv(table)?),
    };
    atomic_write_bytes(&path, &bytes)?;
    Ok(path)
}
