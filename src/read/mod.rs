//! Reading the scan/cycle archives.

pub mod archive;
pub mod synthetic;

use std::path::{Path, PathBuf};

use num_complex::Complex32;
use thiserror::Error;

use crate::header::{Feed, ScanHeader};

pub use archive::{ArchiveReader, ArchiveWriter};

/// The raw data of one baseline, one window and one bin within a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineRecord {
    pub ant1: u32,
    pub ant2: u32,
    /// Index into the scan header's windows.
    pub window: usize,
    pub bin: usize,
    /// Channel-major with the window's polarisation products interleaved,
    /// i.e. `vis[chan * num_pols + pol]`.
    pub vis: Vec<Complex32>,
    /// Parallel to `vis`.
    pub flags: Vec<bool>,
}

/// System temperatures for one antenna in one window, indexed by feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Syscal {
    pub antenna: u32,
    pub window: usize,
    /// The system temperatures the correlator applied online \[K\].
    pub online: [f32; 2],
    /// The system temperatures computed from the noise diode \[K\].
    pub computed: [f32; 2],
}

/// One correlator dump.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleRecord {
    /// The cycle midpoint (MJD, UTC days).
    pub mjd: f64,
    pub ut_seconds: f64,
    pub baselines: Vec<BaselineRecord>,
    pub syscal: Vec<Syscal>,
}

impl CycleRecord {
    /// The (online, computed) system temperature for an antenna feed.
    pub fn tsys(&self, antenna: u32, window: usize, feed: Feed) -> Option<(f32, f32)> {
        self.syscal
            .iter()
            .find(|s| s.antenna == antenna && s.window == window)
            .map(|s| (s.online[feed.index()], s.computed[feed.index()]))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveRecord {
    Header(ScanHeader),
    Cycle(CycleRecord),
}

/// Sequential access to an archive. The format only exposes time through
/// sequential reads, so there is no seeking below scan granularity.
pub trait ArchiveRead {
    fn path(&self) -> &Path;

    /// The next record, or `None` at the end of the archive.
    fn next_record(&mut self) -> Result<Option<ArchiveRecord>, ArchiveError>;
}

/// Open an archive for reading.
pub fn open_archive<P: AsRef<Path>>(path: P) -> Result<Box<dyn ArchiveRead>, ArchiveError> {
    Ok(Box::new(ArchiveReader::open(path)?))
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Couldn't open archive {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path} is not a scan/cycle archive")]
    BadMagic { path: PathBuf },

    #[error("{path}: unsupported archive version {version}")]
    Version { path: PathBuf, version: u16 },

    #[error("{path}: unknown record tag {tag}")]
    UnknownRecord { path: PathBuf, tag: u8 },

    #[error("{path}: cycle record before any scan header")]
    CycleBeforeHeader { path: PathBuf },

    #[error("{path}: malformed record: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
