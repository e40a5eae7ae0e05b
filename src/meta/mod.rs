//! Textual tree metadata and raw record persistence.
//!
//! Layout under the tree's root directory:
//!
//! ```text
//! lsmtree.dat            one per-level meta file name per line
//! level_0000.meta        one line per run: `memory <path> <reccnt> <tscnt>`
//! run_0000_00.dat        raw little-endian records, 28 bytes each
//! ```
//!
//! Loading rebuilds each run's directory, bloom filter, and weight sums from
//! the record file and cross-checks the declared counts; any mismatch or
//! parse failure surfaces as a [`MetaError`] and construction fails.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::level::Level;
use crate::record::Record;
use crate::run::Run;

pub const TREE_META_FILE: &str = "lsmtree.dat";

const RECORD_BYTES: usize = 28;

#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata corrupt: {0}")]
    Corrupt(&'static str),
}

/// Writes the level stack: one record file per run, one meta file per level,
/// and the top-level `lsmtree.dat` listing the meta files.
pub(crate) fn persist(dir: &Path, levels: &[Level]) -> Result<(), MetaError> {
    fs::create_dir_all(dir)?;

    let mut level_meta_names = Vec::with_capacity(levels.len());
    for level in levels {
        let meta_name = format!("level_{:04}.meta", level.level_no());
        let mut meta_out = String::new();

        for (run_idx, run) in level.runs().iter().enumerate() {
            let data_name = format!("run_{:04}_{run_idx:02}.dat", level.level_no());
            write_records(&dir.join(&data_name), run.records())?;
            meta_out.push_str(&format!(
                "memory {data_name} {} {}\n",
                run.record_count(),
                run.tombstone_count()
            ));
        }

        write_text(&dir.join(&meta_name), &meta_out)?;
        level_meta_names.push(meta_name);
    }

    let mut listing = String::new();
    for name in &level_meta_names {
        listing.push_str(name);
        listing.push('\n');
    }
    write_text(&dir.join(TREE_META_FILE), &listing)?;
    Ok(())
}

/// Rebuilds the level stack from `lsmtree.dat`. `run_cap` comes from the
/// tree options; a persisted level holding more runs than the configured
/// capacity is rejected.
pub(crate) fn load(
    dir: &Path,
    run_cap: usize,
    rng: &mut impl Rng,
) -> Result<Vec<Level>, MetaError> {
    let listing = fs::read_to_string(dir.join(TREE_META_FILE))?;

    let mut levels = Vec::new();
    for (level_no, meta_name) in listing.lines().filter(|l| !l.is_empty()).enumerate() {
        let meta = fs::read_to_string(dir.join(meta_name))?;
        let mut runs = Vec::new();

        for line in meta.lines().filter(|l| !l.is_empty()) {
            let mut fields = line.split_whitespace();
            let kind = fields.next().ok_or(MetaError::Corrupt("missing run kind"))?;
            if kind != "memory" {
                return Err(MetaError::Corrupt("unsupported run kind"));
            }
            let path = fields.next().ok_or(MetaError::Corrupt("missing run path"))?;
            let reccnt: usize = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or(MetaError::Corrupt("bad record count"))?;
            let tscnt: usize = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or(MetaError::Corrupt("bad tombstone count"))?;

            let records = read_records(&dir.join(path))?;
            if records.len() != reccnt {
                return Err(MetaError::Corrupt("record count mismatch"));
            }
            if !records.windows(2).all(|w| w[0].order(&w[1]).is_le()) {
                return Err(MetaError::Corrupt("records out of order"));
            }

            let run = Run::from_sorted(records, rng);
            if run.tombstone_count() != tscnt {
                return Err(MetaError::Corrupt("tombstone count mismatch"));
            }
            runs.push(run);
        }

        if runs.len() > run_cap {
            return Err(MetaError::Corrupt("run count exceeds level capacity"));
        }
        levels.push(Level::from_runs(level_no, run_cap, runs));
    }
    Ok(levels)
}

fn write_records(path: &Path, records: &[Record]) -> Result<(), MetaError> {
    let file = fs::File::create(path)?;
    let mut out = BufWriter::new(file);
    for rec in records {
        out.write_all(&rec.key.to_le_bytes())?;
        out.write_all(&rec.value.to_le_bytes())?;
        out.write_all(&rec.weight.to_le_bytes())?;
        out.write_all(&rec.header.to_le_bytes())?;
    }
    out.flush()?;
    out.get_ref().sync_data()?;
    Ok(())
}

fn read_records(path: &Path) -> Result<Vec<Record>, MetaError> {
    let data = fs::read(path)?;
    if data.len() % RECORD_BYTES != 0 {
        return Err(MetaError::Corrupt("truncated record file"));
    }

    let mut records = Vec::with_capacity(data.len() / RECORD_BYTES);
    for chunk in data.chunks_exact(RECORD_BYTES) {
        records.push(Record {
            key: u64::from_le_bytes(slice8(&chunk[0..8])?),
            value: u64::from_le_bytes(slice8(&chunk[8..16])?),
            weight: f64::from_le_bytes(slice8(&chunk[16..24])?),
            header: u32::from_le_bytes(
                chunk[24..28]
                    .try_into()
                    .map_err(|_| MetaError::Corrupt("short record"))?,
            ),
        });
    }
    Ok(records)
}

fn slice8(bytes: &[u8]) -> Result<[u8; 8], MetaError> {
    bytes
        .try_into()
        .map_err(|_| MetaError::Corrupt("short record"))
}

fn write_text(path: &Path, contents: &str) -> Result<(), MetaError> {
    let tmp = tmp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_data()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
