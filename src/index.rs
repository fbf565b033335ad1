//! Which scans are in which files, and when.
//!
//! Archives can only be read sequentially, so answering "which file holds
//! the cycle at time t" cheaply needs an index built ahead of time. Building
//! it reads every cycle record once, but only their timestamps are kept.

use std::path::{Path, PathBuf};

use hifitime::{Duration, Epoch};
use indicatif::ProgressBar;
use log::{debug, warn};
use vec1::Vec1;

use crate::{
    header::ScanHeader,
    read::{open_archive, ArchiveError, ArchiveRecord},
};

/// One scan of an archive. `start` and `end` include half a cycle time of
/// slack beyond the first and last cycle midpoints.
#[derive(Debug, Clone)]
pub struct ScanIndex {
    pub header: ScanHeader,
    pub start: Epoch,
    pub end: Epoch,
    pub num_cycles: usize,
}

impl ScanIndex {
    pub fn contains(&self, t: Epoch) -> bool {
        t >= self.start && t <= self.end
    }
}

#[derive(Debug, Clone)]
pub struct FileIndex {
    pub path: PathBuf,
    pub scans: Vec1<ScanIndex>,
}

impl FileIndex {
    /// The overall time window of the file.
    pub fn file_span(&self) -> (Epoch, Epoch) {
        let start = self
            .scans
            .iter()
            .map(|s| s.start)
            .fold(self.scans.first().start, |a, b| if b < a { b } else { a });
        let end = self
            .scans
            .iter()
            .map(|s| s.end)
            .fold(self.scans.first().end, |a, b| if b > a { b } else { a });
        (start, end)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArchiveIndex {
    /// Indexed files, in the order they were given.
    pub files: Vec<FileIndex>,

    /// Files that couldn't be indexed.
    pub skipped: Vec<PathBuf>,
}

struct OpenScan {
    header: ScanHeader,
    first: Option<f64>,
    last: Option<f64>,
    num_cycles: usize,
}

impl OpenScan {
    fn close(self) -> ScanIndex {
        let slack = Duration::from_seconds(self.header.cycle_time / 2.0);
        let (first, last) = match (self.first, self.last) {
            (Some(f), Some(l)) => (f, l),
            _ => (self.header.mjd, self.header.mjd),
        };
        ScanIndex {
            start: Epoch::from_mjd_utc(first) - slack,
            end: Epoch::from_mjd_utc(last) + slack,
            num_cycles: self.num_cycles,
            header: self.header,
        }
    }
}

/// Index the scans of one file. An error after the archive is open stops
/// the indexing there: the scans read so far are returned with it, minus a
/// scan that hadn't produced a cycle yet.
fn index_file(path: &Path) -> Result<(Vec<ScanIndex>, Option<ArchiveError>), ArchiveError> {
    let mut reader = open_archive(path)?;
    let mut scans = vec![];
    let mut current: Option<OpenScan> = None;
    let stopped = loop {
        let record = match reader.next_record() {
            Ok(Some(r)) => r,
            Ok(None) => break None,
            Err(e) => break Some(e),
        };
        match record {
            ArchiveRecord::Header(header) => {
                if let Some(scan) = current.take() {
                    scans.push(scan.close());
                }
                current = Some(OpenScan {
                    header,
                    first: None,
                    last: None,
                    num_cycles: 0,
                });
            }
            ArchiveRecord::Cycle(cycle) => {
                // The reader refuses cycles before the first header.
                if let Some(scan) = current.as_mut() {
                    scan.first.get_or_insert(cycle.mjd);
                    scan.last = Some(cycle.mjd);
                    scan.num_cycles += 1;
                }
            }
        }
    };
    if let Some(scan) = current.take() {
        if stopped.is_none() || scan.num_cycles > 0 {
            scans.push(scan.close());
        }
    }
    Ok((scans, stopped))
}

impl ArchiveIndex {
    pub fn build<P: AsRef<Path>>(paths: &[P]) -> ArchiveIndex {
        Self::build_with_progress(paths, None)
    }

    /// Index every file. A file that can't be read is logged and skipped;
    /// the remaining files are still indexed. A file that goes bad part way
    /// through keeps the scans before the bad record.
    pub fn build_with_progress<P: AsRef<Path>>(
        paths: &[P],
        progress: Option<&ProgressBar>,
    ) -> ArchiveIndex {
        let mut index = ArchiveIndex::default();
        for path in paths {
            let path = path.as_ref();
            let indexed = index_file(path).and_then(|(scans, stopped)| match stopped {
                Some(e) if scans.is_empty() => Err(e),
                Some(e) => {
                    warn!("Only indexing {} up to a bad record: {e}", path.display());
                    Ok(scans)
                }
                None => Ok(scans),
            });
            match indexed {
                Ok(scans) => match Vec1::try_from_vec(scans) {
                    Ok(scans) => {
                        debug!("{}: {} scan(s)", path.display(), scans.len());
                        index.files.push(FileIndex {
                            path: path.to_path_buf(),
                            scans,
                        });
                    }
                    Err(_) => {
                        warn!("{} contains no scans; skipping it", path.display());
                        index.skipped.push(path.to_path_buf());
                    }
                },
                Err(e) => {
                    warn!("Couldn't index {}: {e}", path.display());
                    index.skipped.push(path.to_path_buf());
                }
            }
            if let Some(p) = progress {
                p.inc(1);
            }
        }
        index
    }

    /// The file containing `path`, if it was indexed.
    pub fn file(&self, path: &Path) -> Option<&FileIndex> {
        self.files.iter().find(|f| f.path == path)
    }

    /// The (file, scan) indices of the scan whose window contains `t`.
    pub fn find_scan(&self, t: Epoch) -> Option<(usize, usize)> {
        self.files.iter().enumerate().find_map(|(i_file, f)| {
            f.scans
                .iter()
                .position(|s| s.contains(t))
                .map(|i_scan| (i_file, i_scan))
        })
    }

    /// Does the file's time window overlap [start, end]? Files that aren't
    /// in the index never overlap anything.
    pub fn overlaps(&self, path: &Path, start: Epoch, end: Epoch) -> bool {
        match self.file(path) {
            Some(f) => {
                let (s, e) = f.file_span();
                s <= end && e >= start
            }
            None => false,
        }
    }

    /// Every scan header, in file then scan order.
    pub fn headers(&self) -> impl Iterator<Item = &ScanHeader> {
        self.files
            .iter()
            .flat_map(|f| f.scans.iter().map(|s| &s.header))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::read::synthetic::SyntheticArchive;

    fn seconds(s: f64) -> Duration {
        Duration::from_seconds(s)
    }

    #[test]
    fn test_scan_windows_have_half_a_cycle_of_slack() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.arc");
        let archive = SyntheticArchive::new().with_scans(&[("1934-638", 3), ("0823-500", 2)]);
        archive.write_to(&path).unwrap();
        let mjds = archive.cycle_mjds();

        let index = ArchiveIndex::build(&[&path]);
        assert!(index.skipped.is_empty());
        assert_eq!(index.files.len(), 1);
        let scans = &index.files[0].scans;
        assert_eq!(scans.len(), 2);
        assert_eq!(scans[0].num_cycles, 3);
        assert_eq!(scans[1].header.source_name, "0823-500");

        // Just inside the end of the first scan.
        let last = Epoch::from_mjd_utc(mjds[2]);
        assert_eq!(index.find_scan(last + seconds(4.9)), Some((0, 0)));
        // Inside the gap between the scans.
        assert_eq!(index.find_scan(last + seconds(5.5)), None);
        // Just before the start of the second scan.
        let first = Epoch::from_mjd_utc(mjds[3]);
        assert_eq!(index.find_scan(first - seconds(4.9)), Some((0, 1)));
        // Before everything.
        let very_first = Epoch::from_mjd_utc(mjds[0]);
        assert_eq!(index.find_scan(very_first - seconds(6.0)), None);
    }

    #[test]
    fn test_unreadable_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.arc");
        SyntheticArchive::new().write_to(&good).unwrap();
        let bad = dir.path().join("bad.arc");
        std::fs::write(&bad, b"not an archive").unwrap();
        let missing = dir.path().join("missing.arc");

        let index = ArchiveIndex::build(&[&bad, &good, &missing]);
        assert_eq!(index.files.len(), 1);
        assert_eq!(index.files[0].path, good);
        assert_eq!(index.skipped, vec![bad, missing]);
    }

    #[test]
    fn test_a_truncated_tail_keeps_the_cycles_before_it() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("growing.arc");
        let archive = SyntheticArchive::new().with_scans(&[("1934-638", 2), ("0823-500", 3)]);
        archive.write_to(&path).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 3);
        std::fs::write(&path, bytes).unwrap();

        let index = ArchiveIndex::build(&[&path]);
        assert!(index.skipped.is_empty());
        let scans = &index.files[0].scans;
        assert_eq!(scans.len(), 2);
        assert_eq!(scans[0].num_cycles, 2);
        assert_eq!(scans[1].num_cycles, 2);
    }

    #[test]
    fn test_a_corrupt_first_cycle_skips_the_file() {
        use byteorder::{LittleEndian, WriteBytesExt};

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corrupt.arc");
        let archive = SyntheticArchive::new().with_scans(&[("1934-638", 1)]);
        let mut writer = crate::read::ArchiveWriter::create(&path).unwrap();
        let header = match archive.records().into_iter().next() {
            Some(ArchiveRecord::Header(h)) => h,
            r => panic!("unexpected {r:?}"),
        };
        writer.write_header(&header).unwrap();
        let mut file = writer.finish().unwrap();
        // A cycle record claiming u32::MAX baselines.
        file.write_u8(2).unwrap();
        file.write_f64::<LittleEndian>(header.mjd).unwrap();
        file.write_f64::<LittleEndian>(header.ut_seconds).unwrap();
        file.write_u32::<LittleEndian>(u32::MAX).unwrap();
        drop(file);
        let good = dir.path().join("good.arc");
        SyntheticArchive::new().write_to(&good).unwrap();

        let index = ArchiveIndex::build(&[&path, &good]);
        assert_eq!(index.skipped, vec![path]);
        assert_eq!(index.files.len(), 1);
        assert_eq!(index.files[0].path, good);
    }

    #[test]
    fn test_overlaps() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.arc");
        let archive = SyntheticArchive::new();
        archive.write_to(&path).unwrap();
        let index = ArchiveIndex::build(&[&path]);
        let (start, end) = index.files[0].file_span();
        assert!(index.overlaps(&path, start - seconds(100.0), start));
        assert!(index.overlaps(&path, end, end + seconds(100.0)));
        assert!(!index.overlaps(&path, end + seconds(1.0), end + seconds(100.0)));
        assert!(!index.overlaps(Path::new("elsewhere.arc"), start, end));
        assert_eq!(index.headers().count(), 1);
    }
}
