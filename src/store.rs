//! Multi-resolution time-series storage
//!
//! This module implements the on-disk store behind every monitored
//! property: an append-only, partitioned hierarchy of time-series that
//! coalesces fine-grained samples into coarser ones as data ages.
//!
//! A [`Table`] is a fixed stack of [`Level`]s from coarsest to finest.
//! Samples enter at the finest level; every `roll_up` samples their
//! arithmetic mean is pushed one level down. Each level is partitioned
//! into at most three [`Segment`] files of `cap / 2` samples each, so
//! expired data is dropped by deleting whole files rather than rewriting
//! them.
//!
//! On-disk layout: `<table dir>/<level index>/<segment id>` where the
//! level index counts from the configuration (0 = finest) and segment ids
//! are decimal integers increasing in creation order.
//!
//! Record encoding: bincode with its default fixed-width little-endian
//! integer options, i.e. `i64 secs || u32 nanos || f64 value`, 20 bytes
//! per record. Independently appended batches concatenate cleanly; a
//! truncated trailing record terminates a read without error, which is
//! what lets readers run concurrently with the single writer.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::BufReader;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{StoreError, StoreResult};

/// A single timestamped sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Seconds since the Unix epoch
    pub secs: i64,
    /// Sub-second nanoseconds
    pub nanos: u32,
    /// Sample value
    pub value: f64,
}

impl DataPoint {
    /// Create a data point stamped with the current wall-clock time
    pub fn now(value: f64) -> Self {
        let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Self { secs: elapsed.as_secs() as i64, nanos: elapsed.subsec_nanos(), value }
    }

    /// Timestamp as a chrono instant, for chart axis formatting
    pub fn datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.secs, self.nanos).single().unwrap_or_default()
    }
}

/// One append-only partition file of a level
pub struct Segment {
    path: PathBuf,
    file: File,
}

impl Segment {
    /// Open or create a segment file with an append handle
    pub fn open(path: &Path) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o666)
            .open(path)
            .map_err(|e| StoreError::SegmentOpenFailed { path: path.to_path_buf(), source: e })?;
        Ok(Self { path: path.to_path_buf(), file })
    }

    /// Append one record
    pub fn add(&mut self, point: &DataPoint) -> StoreResult<()> {
        bincode::serialize_into(&mut self.file, point).map_err(|e| {
            StoreError::SegmentWriteFailed { path: self.path.clone(), reason: e.to_string() }
        })
    }

    /// Path of the underlying file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decode every record of a segment file in order.
    ///
    /// Opens its own read-only descriptor, independent of the writer's.
    /// Any decode failure ends the scan: a truncated trailing record left
    /// by an in-progress append reads as end of stream, never as an error.
    pub fn read_points(path: &Path) -> StoreResult<Vec<DataPoint>> {
        let file = File::open(path)
            .map_err(|e| StoreError::SegmentReadFailed { path: path.to_path_buf(), source: e })?;
        let mut reader = BufReader::new(file);
        let mut points = Vec::new();
        while let Ok(point) = bincode::deserialize_from::<_, DataPoint>(&mut reader) {
            points.push(point);
        }
        Ok(points)
    }

    /// Delete the segment file
    pub fn remove(self) -> std::io::Result<()> {
        fs::remove_file(&self.path)
    }
}

/// Retention parameters of one level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelProps {
    /// Number of samples coalesced into one sample of the next coarser level
    pub roll_up: u32,
    /// Nominal retention target; segment size is `cap / 2`
    pub cap: u32,
}

/// One resolution of a time series: up to three segments plus the
/// coalescing state feeding the optional coarser level below it.
pub struct Level {
    dir: PathBuf,
    roll_up: u32,
    cap: u32,
    /// Samples written since creation, including dropped ones
    len: u64,
    next_id: u64,
    /// Segments in chronological order; the last is the write target
    segments: Vec<Segment>,
    lower: Option<Box<Level>>,
    batch_len: u32,
    batch_sum: f64,
}

impl Level {
    /// Open a level directory, creating it if missing.
    ///
    /// Existing segment files are reopened for append, ordered numerically
    /// by their decimal filename, and counted to restore `len`. `lower`
    /// receives the coalesced mean of every `roll_up` samples.
    pub fn open(
        dir: &Path,
        roll_up: u32,
        cap: u32,
        lower: Option<Box<Level>>,
    ) -> StoreResult<Self> {
        if roll_up < 1 || cap < 2 {
            return Err(StoreError::InvalidLevelParams {
                reason: format!("roll_up={} cap={} (need roll_up >= 1, cap >= 2)", roll_up, cap),
            });
        }

        let mut level = Level {
            dir: dir.to_path_buf(),
            roll_up,
            cap,
            len: 0,
            next_id: 0,
            segments: Vec::new(),
            lower,
            batch_len: 0,
            batch_sum: 0.0,
        };

        match fs::metadata(dir) {
            Ok(meta) if !meta.is_dir() => {
                return Err(StoreError::NotADirectory { path: dir.to_path_buf() });
            }
            Ok(_) => level.scan_existing()?,
            Err(_) => {
                DirBuilder::new().recursive(true).mode(0o770).create(dir).map_err(|e| {
                    StoreError::DirectoryCreationFailed { path: dir.to_path_buf(), source: e }
                })?;
            }
        }
        Ok(level)
    }

    /// Reopen segments found on disk and restore counters from them
    fn scan_existing(&mut self) -> StoreResult<()> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| StoreError::LevelScanFailed { path: self.dir.clone(), source: e })?;

        let mut found: Vec<(u64, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| StoreError::LevelScanFailed { path: self.dir.clone(), source: e })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match entry.file_name().to_string_lossy().parse::<u64>() {
                Ok(id) => found.push((id, path)),
                Err(_) => {
                    warn!(path = %path.display(), "Ignoring non-segment file in level directory");
                }
            }
        }
        // Numeric order, not lexicographic: "10" follows "9"
        found.sort_by_key(|(id, _)| *id);

        for (id, path) in found {
            let segment = Segment::open(&path)?;
            self.len += Segment::read_points(&path)?.len() as u64;
            self.segments.push(segment);
            self.next_id = id + 1;
        }
        Ok(())
    }

    /// Max number of samples per segment file
    pub fn bucket_size(&self) -> u32 {
        self.cap / 2
    }

    /// Samples written to this level since its creation
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The next coarser level, if this one feeds into it
    pub fn lower(&self) -> Option<&Level> {
        self.lower.as_deref()
    }

    /// Append a sample stamped with the current time.
    ///
    /// Rolls over to a fresh segment every `cap / 2` samples, evicting
    /// down to the two newest segments first so at most three exist at
    /// any time. Every `roll_up` samples the batch mean is pushed into
    /// the lower level; a failure there propagates, but this level's own
    /// write has already succeeded and is not rolled back.
    pub fn add(&mut self, value: f64) -> StoreResult<()> {
        let bucket = self.bucket_size() as u64;

        if self.len % bucket == 0 {
            // Two full buckets are enough to keep `cap` samples; evict
            // strictly before opening the replacement.
            if self.segments.len() > 2 {
                let evicted: Vec<Segment> =
                    self.segments.drain(..self.segments.len() - 2).collect();
                for segment in evicted {
                    let path = segment.path().to_path_buf();
                    if let Err(e) = segment.remove() {
                        warn!(path = %path.display(), error = %e, "Failed to remove expired segment");
                    }
                }
            }
            let path = self.dir.join(self.next_id.to_string());
            self.segments.push(Segment::open(&path)?);
            self.next_id += 1;
        }

        let current = self.segments.last_mut().ok_or_else(|| StoreError::InvalidLevelParams {
            reason: format!("level {} has no write target", self.dir.display()),
        })?;
        current.add(&DataPoint::now(value))?;
        self.len += 1;

        if self.lower.is_some() {
            self.batch_sum += value;
            self.batch_len += 1;
            if self.batch_len == self.roll_up {
                let mean = self.batch_sum / f64::from(self.batch_len);
                self.batch_sum = 0.0;
                self.batch_len = 0;
                if let Some(lower) = self.lower.as_mut() {
                    lower.add(mean)?;
                }
            }
        }
        Ok(())
    }

    /// All retained samples in chronological order
    pub fn read_all(&self) -> StoreResult<Vec<DataPoint>> {
        let mut data = Vec::new();
        for segment in &self.segments {
            data.extend(Segment::read_points(segment.path())?);
        }
        Ok(data)
    }

    /// Paths of the current segments, oldest first.
    ///
    /// Used by readers to decode outside the table lock; a path may
    /// disappear between the snapshot and the read.
    pub fn segment_paths(&self) -> Vec<PathBuf> {
        self.segments.iter().map(|s| s.path().to_path_buf()).collect()
    }

    /// Walk `steps` levels down the coarsening chain
    fn descend(&self, steps: usize) -> Option<&Level> {
        let mut level = self;
        for _ in 0..steps {
            level = level.lower.as_deref()?;
        }
        Some(level)
    }

    /// Delete all segment files of this level and the ones below it
    fn remove_files(&mut self) {
        for segment in self.segments.drain(..) {
            let path = segment.path().to_path_buf();
            if let Err(e) = segment.remove() {
                warn!(path = %path.display(), error = %e, "Failed to remove segment");
            }
        }
        if let Some(lower) = self.lower.as_mut() {
            lower.remove_files();
        }
    }
}

/// A fixed stack of levels from finest to coarsest sharing a base
/// directory, written by exactly one poller and read by any number of
/// chart renderers.
pub struct Table {
    base: PathBuf,
    /// The finest level; coarser levels hang off its coalescing chain
    top: Mutex<Level>,
    depth: usize,
}

impl Table {
    /// Open a table under `base` with one level per entry of `props`,
    /// listed finest-first. Level `i` lives in `base/<i>/`. Reopens any
    /// state a previous run left on disk.
    pub fn open(base: &Path, props: &[LevelProps]) -> StoreResult<Self> {
        if props.is_empty() {
            return Err(StoreError::NoLevels);
        }

        // Build coarsest-first so each level owns the one below it
        let mut lower: Option<Box<Level>> = None;
        for (index, prop) in props.iter().enumerate().rev() {
            let dir = base.join(index.to_string());
            let level = Level::open(&dir, prop.roll_up, prop.cap, lower.take())?;
            lower = Some(Box::new(level));
        }
        let top = *lower.expect("props checked non-empty");

        Ok(Self { base: base.to_path_buf(), top: Mutex::new(top), depth: props.len() })
    }

    /// Number of levels
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Base directory of the table
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Append one sample at the finest level; coarsening cascades from
    /// there through the coalescing chain.
    pub fn add(&self, value: f64) -> StoreResult<()> {
        self.top.lock().unwrap().add(value)
    }

    /// Samples written to level `index` (0 = coarsest) since creation
    pub fn level_len(&self, index: usize) -> StoreResult<u64> {
        let top = self.top.lock().unwrap();
        let level = top
            .descend(self.depth - 1 - self.check_index(index)?)
            .ok_or(StoreError::NoSuchLevel { index })?;
        Ok(level.len())
    }

    /// Read all retained samples of level `index` (0 = coarsest).
    ///
    /// The segment list is snapshotted under the table lock and decoded
    /// outside it, so readers never block the writer for the duration of
    /// file I/O. A segment evicted between snapshot and read is skipped;
    /// a truncated trailing record ends that segment's scan silently.
    pub fn read_level(&self, index: usize) -> StoreResult<Vec<DataPoint>> {
        let paths = {
            let top = self.top.lock().unwrap();
            let level = top
                .descend(self.depth - 1 - self.check_index(index)?)
                .ok_or(StoreError::NoSuchLevel { index })?;
            level.segment_paths()
        };

        let mut data = Vec::new();
        for path in paths {
            match Segment::read_points(&path) {
                Ok(points) => data.extend(points),
                Err(StoreError::SegmentReadFailed { ref source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(data)
    }

    fn check_index(&self, index: usize) -> StoreResult<usize> {
        if index >= self.depth {
            return Err(StoreError::NoSuchLevel { index });
        }
        Ok(index)
    }

    /// Delete every segment file and the table directory tree
    pub fn remove(self) -> StoreResult<()> {
        self.top.lock().unwrap().remove_files();
        fs::remove_dir_all(&self.base)
            .map_err(|e| StoreError::TableRemoveFailed { path: self.base.clone(), source: e })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    /// Assert `data` is an arithmetic ramp of at least `min_len` samples
    fn assert_ramp(data: &[DataPoint], min_len: usize, incr: f64) {
        assert!(data.len() >= min_len, "only {} data points read", data.len());
        for i in 1..data.len() {
            assert_eq!(
                data[i].value,
                data[i - 1].value + incr,
                "read {} at {} (expected {})",
                data[i].value,
                i,
                data[i - 1].value + incr
            );
        }
    }

    #[test]
    fn test_datapoint_round_trip() {
        let point = DataPoint::now(3.141_592_653_5);
        let bytes = bincode::serialize(&point).unwrap();
        assert_eq!(bytes.len(), 20);
        let decoded: DataPoint = bincode::deserialize(&bytes).unwrap();
        assert_eq!(point, decoded);
    }

    #[test]
    fn test_segment_append_and_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0");

        let mut segment = Segment::open(&path).unwrap();
        for i in 0..1000 {
            segment.add(&DataPoint::now(f64::from(i))).unwrap();
        }

        let data = Segment::read_points(&path).unwrap();
        assert_eq!(data.len(), 1000);
        for (i, point) in data.iter().enumerate() {
            assert_eq!(point.value, i as f64);
        }
    }

    #[test]
    fn test_truncated_tail_is_end_of_stream() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0");

        let mut segment = Segment::open(&path).unwrap();
        for i in 0..10 {
            segment.add(&DataPoint::now(f64::from(i))).unwrap();
        }
        // Simulate an in-progress append racing the reader
        let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(&[0xAB; 7]).unwrap();

        let data = Segment::read_points(&path).unwrap();
        assert_eq!(data.len(), 10);
        assert_ramp(&data, 10, 1.0);
    }

    #[test]
    fn test_level_segment_eviction() {
        let dir = TempDir::new().unwrap();
        let mut level = Level::open(dir.path(), 10, 100, None).unwrap();

        for i in 0..200 {
            level.add(f64::from(i)).unwrap();
            assert!(level.segments.len() <= 3, "more than three segments after add {}", i);
        }

        let on_disk = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(on_disk, level.segments.len());
        let data = level.read_all().unwrap();
        assert_ramp(&data, 100, 1.0);
    }

    #[test]
    fn test_retention_bounds() {
        let dir = TempDir::new().unwrap();
        let mut level = Level::open(dir.path(), 10, 100, None).unwrap();

        for i in 0..1000 {
            level.add(f64::from(i)).unwrap();
            let retained = level.read_all().unwrap().len();
            assert!(retained <= 150, "retained {} > cap + cap/2 after add {}", retained, i);
            if i >= 99 {
                assert!(retained >= 50, "retained {} < cap/2 after add {}", retained, i);
            }
        }
    }

    #[test]
    fn test_monotone_segment_ids() {
        let dir = TempDir::new().unwrap();
        let mut level = Level::open(dir.path(), 10, 20, None).unwrap();

        // bucket size 10, so 120 adds create ids 0..=11
        for i in 0..120 {
            level.add(f64::from(i)).unwrap();
        }
        let ids: Vec<u64> = level
            .segments
            .iter()
            .map(|s| s.path().file_name().unwrap().to_string_lossy().parse().unwrap())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids not increasing: {:?}", ids);
        assert_eq!(*ids.last().unwrap(), 11);
    }

    #[test]
    fn test_coalescing_emits_batch_means() {
        let root = TempDir::new().unwrap();
        let lower = Level::open(&root.path().join("lower"), 10, 100, None).unwrap();
        let mut upper =
            Level::open(&root.path().join("upper"), 10, 100, Some(Box::new(lower))).unwrap();

        for i in 0..200 {
            upper.add(f64::from(i)).unwrap();
        }

        assert_ramp(&upper.read_all().unwrap(), 100, 1.0);

        let means = upper.lower().unwrap().read_all().unwrap();
        assert_eq!(means.len(), 20);
        assert_eq!(means[0].value, 4.5);
        assert_ramp(&means, 10, 10.0);
    }

    #[test]
    fn test_coalescing_means_preserve_order() {
        let root = TempDir::new().unwrap();
        let lower = Level::open(&root.path().join("lower"), 4, 100, None).unwrap();
        let mut upper =
            Level::open(&root.path().join("upper"), 4, 100, Some(Box::new(lower))).unwrap();

        let values = [2.0, 4.0, 6.0, 8.0, 1.0, 1.0, 1.0, 5.0, 10.0, 10.0];
        for v in values {
            upper.add(v).unwrap();
        }

        // Two complete batches of four emitted, the trailing two pending
        let means = upper.lower().unwrap().read_all().unwrap();
        assert_eq!(means.len(), 2);
        assert_eq!(means[0].value, 5.0);
        assert_eq!(means[1].value, 2.0);
        assert_eq!(upper.batch_len, 2);
        assert_eq!(upper.batch_sum, 20.0);
    }

    #[test]
    fn test_lower_level_failure_propagates_after_local_write() {
        let root = TempDir::new().unwrap();
        let lower_dir = root.path().join("lower");
        let lower = Level::open(&lower_dir, 10, 100, None).unwrap();
        let mut upper =
            Level::open(&root.path().join("upper"), 10, 100, Some(Box::new(lower))).unwrap();

        // Make the lower level's first segment creation fail
        fs::remove_dir_all(&lower_dir).unwrap();

        for i in 0..9 {
            upper.add(f64::from(i)).unwrap();
        }
        let err = upper.add(9.0).unwrap_err();
        assert!(matches!(err, StoreError::SegmentOpenFailed { .. }));

        // The upper level's own write went through before the cascade failed
        assert_eq!(upper.len(), 10);
        assert_eq!(upper.read_all().unwrap().len(), 10);
    }

    #[test]
    fn test_reopen_restores_len_and_data() {
        let dir = TempDir::new().unwrap();
        {
            let mut level = Level::open(dir.path(), 10, 100, None).unwrap();
            for i in 0..200 {
                level.add(f64::from(i)).unwrap();
            }
        }

        let level = Level::open(dir.path(), 10, 100, None).unwrap();
        let data = level.read_all().unwrap();
        assert_eq!(level.len(), data.len() as u64);
        assert_ramp(&data, 100, 1.0);
    }

    #[test]
    fn test_reopen_sorts_ids_numerically() {
        let dir = TempDir::new().unwrap();
        {
            // Small buckets push segment ids past 9, where lexicographic
            // ordering would put "10" before "9"
            let mut level = Level::open(dir.path(), 10, 20, None).unwrap();
            for i in 0..120 {
                level.add(f64::from(i)).unwrap();
            }
        }

        let mut level = Level::open(dir.path(), 10, 20, None).unwrap();
        assert_eq!(level.next_id, 12);
        assert_ramp(&level.read_all().unwrap(), 20, 1.0);

        // Appends continue the ramp in the reopened tail
        level.add(120.0).unwrap();
        let data = level.read_all().unwrap();
        assert_eq!(data.last().unwrap().value, 120.0);
        assert_ramp(&data, 21, 1.0);
    }

    #[test]
    fn test_level_rejects_bad_params() {
        let dir = TempDir::new().unwrap();
        assert!(Level::open(&dir.path().join("a"), 0, 100, None).is_err());
        assert!(Level::open(&dir.path().join("b"), 10, 1, None).is_err());
    }

    #[test]
    fn test_level_rejects_file_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("occupied");
        fs::write(&path, b"not a directory").unwrap();
        assert!(matches!(
            Level::open(&path, 10, 100, None),
            Err(StoreError::NotADirectory { .. })
        ));
    }

    #[test]
    fn test_table_three_levels() {
        let dir = TempDir::new().unwrap();
        let props = [
            LevelProps { roll_up: 10, cap: 100 },
            LevelProps { roll_up: 10, cap: 100 },
            LevelProps { roll_up: 10, cap: 100 },
        ];
        let table = Table::open(dir.path(), &props).unwrap();

        for i in 0..2000 {
            table.add(f64::from(i)).unwrap();
        }

        assert_ramp(&table.read_level(2).unwrap(), 100, 1.0);
        assert_ramp(&table.read_level(1).unwrap(), 100, 10.0);
        let coarsest = table.read_level(0).unwrap();
        assert_eq!(coarsest.len(), 20);
        assert_ramp(&coarsest, 20, 100.0);
    }

    #[test]
    fn test_table_rejects_empty_props() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(Table::open(dir.path(), &[]), Err(StoreError::NoLevels)));
    }

    #[test]
    fn test_table_rejects_bad_level_index() {
        let dir = TempDir::new().unwrap();
        let table = Table::open(dir.path(), &[LevelProps { roll_up: 10, cap: 100 }]).unwrap();
        assert!(matches!(table.read_level(1), Err(StoreError::NoSuchLevel { index: 1 })));
    }

    #[test]
    fn test_table_level_directories() {
        let dir = TempDir::new().unwrap();
        let props = [LevelProps { roll_up: 10, cap: 100 }, LevelProps { roll_up: 10, cap: 100 }];
        let table = Table::open(dir.path(), &props).unwrap();
        table.add(1.0).unwrap();

        // Finest level writes under the first config index
        assert!(dir.path().join("0").join("0").is_file());
        assert!(dir.path().join("1").is_dir());
    }

    #[test]
    fn test_table_reopen_persistence() {
        let dir = TempDir::new().unwrap();
        let props = [LevelProps { roll_up: 10, cap: 100 }, LevelProps { roll_up: 10, cap: 100 }];
        {
            let table = Table::open(dir.path(), &props).unwrap();
            for i in 0..200 {
                table.add(f64::from(i)).unwrap();
            }
        }

        let table = Table::open(dir.path(), &props).unwrap();
        assert_eq!(table.level_len(1).unwrap(), 150);
        assert_ramp(&table.read_level(1).unwrap(), 100, 1.0);
        assert_eq!(table.read_level(0).unwrap().len(), 20);
    }

    #[test]
    fn test_table_remove_deletes_tree() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("table");
        let table = Table::open(&base, &[LevelProps { roll_up: 10, cap: 100 }]).unwrap();
        table.add(1.0).unwrap();
        assert!(base.exists());

        table.remove().unwrap();
        assert!(!base.exists());
    }
}
