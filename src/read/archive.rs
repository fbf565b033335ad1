//! The sequential scan/cycle container.
//!
//! Layout (little endian): the magic `ATVISARC`, a `u16` version, then tagged
//! records until the end of the file. A header record (tag 1) describes the
//! scan; every cycle record (tag 2) that follows belongs to it until the next
//! header. Strings are a `u16` byte length followed by UTF-8.

use std::{
    fs::File,
    io::{BufReader, BufWriter, ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use log::{debug, trace};
use num_complex::Complex32;

use super::{ArchiveError, ArchiveRead, ArchiveRecord, BaselineRecord, CycleRecord, Syscal};
use crate::header::{Antenna, IfWindow, Pol, ScanHeader};

const MAGIC: &[u8; 8] = b"ATVISARC";
const VERSION: u16 = 1;
const TAG_HEADER: u8 = 1;
const TAG_CYCLE: u8 = 2;

/// Bytes before the first record.
const PREAMBLE_LEN: u64 = 10;
/// The smallest encodings of the counted items of a cycle record.
const BASELINE_RECORD_LEN: u64 = 16;
const SAMPLE_LEN: u64 = 9;
const SYSCAL_LEN: u64 = 22;
/// Counts read from a file never reserve more than this many elements up
/// front.
const MAX_PREALLOC: usize = 4096;
/// More channels per window than any correlator mode produces.
const MAX_CHANNELS: usize = 1 << 20;

pub struct ArchiveReader<R: Read = BufReader<File>> {
    path: PathBuf,
    reader: R,
    /// The header of the scan being read; cycles are validated against it.
    header: Option<ScanHeader>,
    /// Bytes consumed so far.
    pos: u64,
    /// The total length, when known.
    len: Option<u64>,
}

impl ArchiveReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ArchiveError> {
        let path = path.as_ref();
        debug!("Opening archive {}", path.display());
        let open_error = |source| ArchiveError::Open {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(open_error)?;
        let len = file.metadata().map_err(open_error)?.len();
        Ok(ArchiveReader::new(BufReader::new(file), path)?.with_len(len))
    }
}

impl<R: Read> ArchiveReader<R> {
    /// Wrap a reader positioned at the start of an archive. `path` is only
    /// used in error messages.
    pub fn new<P: AsRef<Path>>(mut reader: R, path: P) -> Result<Self, ArchiveError> {
        let path = path.as_ref().to_path_buf();
        let mut magic = [0; 8];
        match reader.read_exact(&mut magic) {
            Ok(()) => (),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(ArchiveError::BadMagic { path })
            }
            Err(source) => return Err(ArchiveError::Io { path, source }),
        }
        if &magic != MAGIC {
            return Err(ArchiveError::BadMagic { path });
        }
        let version = reader
            .read_u16::<LE>()
            .map_err(|source| ArchiveError::Io {
                path: path.clone(),
                source,
            })?;
        if version != VERSION {
            return Err(ArchiveError::Version { path, version });
        }
        Ok(ArchiveReader {
            path,
            reader,
            header: None,
            pos: PREAMBLE_LEN,
            len: None,
        })
    }

    /// Declare the total length of the archive, so counts that can't fit in
    /// what's left are rejected before anything is read.
    pub fn with_len(mut self, len: u64) -> Self {
        self.len = Some(len);
        self
    }

    /// Fail unless `count` items of at least `item_len` bytes each fit in
    /// the rest of the archive.
    fn check_count(&self, what: &str, count: u64, item_len: u64) -> Result<(), ArchiveError> {
        if let Some(len) = self.len {
            let left = len.saturating_sub(self.pos);
            if count.saturating_mul(item_len) > left {
                return Err(self.malformed(format!(
                    "{count} {what} can't fit in the {left} bytes left"
                )));
            }
        }
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> ArchiveError {
        ArchiveError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn malformed(&self, reason: String) -> ArchiveError {
        ArchiveError::Malformed {
            path: self.path.clone(),
            reason,
        }
    }

    fn read_string(&mut self) -> Result<String, ArchiveError> {
        let len = self.read_u16()?;
        let mut buf = vec![0; len as usize];
        self.reader
            .read_exact(&mut buf)
            .map_err(|e| self.io_error(e))?;
        self.pos += u64::from(len);
        String::from_utf8(buf).map_err(|e| self.malformed(format!("bad string: {e}")))
    }

    fn read_f64(&mut self) -> Result<f64, ArchiveError> {
        let v = self.reader.read_f64::<LE>().map_err(|e| self.io_error(e))?;
        self.pos += 8;
        Ok(v)
    }

    fn read_f32(&mut self) -> Result<f32, ArchiveError> {
        let v = self.reader.read_f32::<LE>().map_err(|e| self.io_error(e))?;
        self.pos += 4;
        Ok(v)
    }

    fn read_u32(&mut self) -> Result<u32, ArchiveError> {
        let v = self.reader.read_u32::<LE>().map_err(|e| self.io_error(e))?;
        self.pos += 4;
        Ok(v)
    }

    fn read_u16(&mut self) -> Result<u16, ArchiveError> {
        let v = self.reader.read_u16::<LE>().map_err(|e| self.io_error(e))?;
        self.pos += 2;
        Ok(v)
    }

    fn read_u8(&mut self) -> Result<u8, ArchiveError> {
        let v = self.reader.read_u8().map_err(|e| self.io_error(e))?;
        self.pos += 1;
        Ok(v)
    }

    fn read_header(&mut self) -> Result<ScanHeader, ArchiveError> {
        let obs_date = self.read_string()?;
        let ut_seconds = self.read_f64()?;
        let mjd = self.read_f64()?;
        let source_name = self.read_string()?;
        let obs_type = self.read_string()?;
        let cycle_time = self.read_f64()?;
        if !(cycle_time > 0.0) {
            return Err(self.malformed(format!("cycle time {cycle_time} is not positive")));
        }

        let num_antennas = self.read_u16()?;
        let mut antennas = Vec::with_capacity(num_antennas as usize);
        for _ in 0..num_antennas {
            let number = self.read_u32()?;
            let name = self.read_string()?;
            let xyz = [self.read_f64()?, self.read_f64()?, self.read_f64()?];
            antennas.push(Antenna { number, name, xyz });
        }

        let num_windows = self.read_u16()?;
        let mut windows = Vec::with_capacity(num_windows as usize);
        for _ in 0..num_windows {
            let number = self.read_u32()?;
            let centre_freq = self.read_f64()?;
            let bandwidth = self.read_f64()?;
            let num_channels = self.read_u32()? as usize;
            if num_channels > MAX_CHANNELS {
                return Err(self.malformed(format!(
                    "window {number} claims {num_channels} channels"
                )));
            }
            let num_pols = self.read_u8()?;
            let mut pols = Vec::with_capacity(num_pols as usize);
            for _ in 0..num_pols {
                let code = self.read_u8()?;
                let pol = Pol::from_code(code)
                    .ok_or_else(|| self.malformed(format!("unknown polarisation code {code}")))?;
                pols.push(pol);
            }
            let labels = [self.read_string()?, self.read_string()?, self.read_string()?];
            windows.push(IfWindow {
                number,
                centre_freq,
                bandwidth,
                num_channels,
                pols,
                labels,
            });
        }

        Ok(ScanHeader {
            obs_date,
            ut_seconds,
            mjd,
            source_name,
            obs_type,
            cycle_time,
            antennas,
            windows,
        })
    }

    fn read_cycle(&mut self) -> Result<CycleRecord, ArchiveError> {
        // Shapes come from the current header.
        let shapes: Vec<usize> = match &self.header {
            Some(h) => h
                .windows
                .iter()
                .map(|w| w.num_channels * w.pols.len())
                .collect(),
            None => {
                return Err(ArchiveError::CycleBeforeHeader {
                    path: self.path.clone(),
                })
            }
        };

        let mjd = self.read_f64()?;
        let ut_seconds = self.read_f64()?;
        let num_baselines = self.read_u32()?;
        self.check_count("baselines", u64::from(num_baselines), BASELINE_RECORD_LEN)?;
        let mut baselines = Vec::with_capacity((num_baselines as usize).min(MAX_PREALLOC));
        for _ in 0..num_baselines {
            let ant1 = self.read_u32()?;
            let ant2 = self.read_u32()?;
            let window = self.read_u16()? as usize;
            let bin = self.read_u16()? as usize;
            let num_samples = self.read_u32()? as usize;
            let expected = *shapes.get(window).ok_or_else(|| {
                self.malformed(format!("baseline {ant1}-{ant2} refers to window index {window}"))
            })?;
            if num_samples != expected {
                return Err(self.malformed(format!(
                    "baseline {ant1}-{ant2} window index {window} has {num_samples} samples, expected {expected}"
                )));
            }
            self.check_count("samples", num_samples as u64, SAMPLE_LEN)?;
            let mut vis = Vec::with_capacity(num_samples.min(MAX_PREALLOC));
            for _ in 0..num_samples {
                let re = self.read_f32()?;
                let im = self.read_f32()?;
                vis.push(Complex32::new(re, im));
            }
            let mut flags = Vec::with_capacity(num_samples.min(MAX_PREALLOC));
            for _ in 0..num_samples {
                flags.push(self.read_u8()? != 0);
            }
            baselines.push(BaselineRecord {
                ant1,
                ant2,
                window,
                bin,
                vis,
                flags,
            });
        }

        let num_syscal = self.read_u16()?;
        self.check_count("system temperature records", u64::from(num_syscal), SYSCAL_LEN)?;
        let mut syscal = Vec::with_capacity(num_syscal as usize);
        for _ in 0..num_syscal {
            let antenna = self.read_u32()?;
            let window = self.read_u16()? as usize;
            let online = [self.read_f32()?, self.read_f32()?];
            let computed = [self.read_f32()?, self.read_f32()?];
            syscal.push(Syscal {
                antenna,
                window,
                online,
                computed,
            });
        }

        Ok(CycleRecord {
            mjd,
            ut_seconds,
            baselines,
            syscal,
        })
    }
}

impl<R: Read> ArchiveRead for ArchiveReader<R> {
    fn path(&self) -> &Path {
        &self.path
    }

    fn next_record(&mut self) -> Result<Option<ArchiveRecord>, ArchiveError> {
        let tag = match self.reader.read_u8() {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        self.pos += 1;
        match tag {
            TAG_HEADER => {
                let header = self.read_header()?;
                trace!(
                    "{}: scan header for {} at MJD {}",
                    self.path.display(),
                    header.source_name,
                    header.mjd
                );
                self.header = Some(header.clone());
                Ok(Some(ArchiveRecord::Header(header)))
            }
            TAG_CYCLE => Ok(Some(ArchiveRecord::Cycle(self.read_cycle()?))),
            tag => Err(ArchiveError::UnknownRecord {
                path: self.path.clone(),
                tag,
            }),
        }
    }
}

/// Writes archives in the format [`ArchiveReader`] reads.
pub struct ArchiveWriter<W: Write = BufWriter<File>> {
    writer: W,
}

impl ArchiveWriter<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, ArchiveError> {
        let path = path.as_ref();
        let open_error = |source| ArchiveError::Open {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(open_error)?;
        ArchiveWriter::new(BufWriter::new(file)).map_err(open_error)
    }
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(mut writer: W) -> std::io::Result<Self> {
        writer.write_all(MAGIC)?;
        writer.write_u16::<LE>(VERSION)?;
        Ok(ArchiveWriter { writer })
    }

    fn write_string(&mut self, s: &str) -> std::io::Result<()> {
        let len = u16::try_from(s.len())
            .map_err(|_| std::io::Error::new(ErrorKind::InvalidInput, "string too long"))?;
        self.writer.write_u16::<LE>(len)?;
        self.writer.write_all(s.as_bytes())
    }

    pub fn write_header(&mut self, header: &ScanHeader) -> std::io::Result<()> {
        let w = &mut self.writer;
        w.write_u8(TAG_HEADER)?;
        self.write_string(&header.obs_date)?;
        self.writer.write_f64::<LE>(header.ut_seconds)?;
        self.writer.write_f64::<LE>(header.mjd)?;
        self.write_string(&header.source_name)?;
        self.write_string(&header.obs_type)?;
        self.writer.write_f64::<LE>(header.cycle_time)?;

        self.writer.write_u16::<LE>(header.antennas.len() as u16)?;
        for a in &header.antennas {
            self.writer.write_u32::<LE>(a.number)?;
            self.write_string(&a.name)?;
            for c in a.xyz {
                self.writer.write_f64::<LE>(c)?;
            }
        }

        self.writer.write_u16::<LE>(header.windows.len() as u16)?;
        for win in &header.windows {
            self.writer.write_u32::<LE>(win.number)?;
            self.writer.write_f64::<LE>(win.centre_freq)?;
            self.writer.write_f64::<LE>(win.bandwidth)?;
            self.writer.write_u32::<LE>(win.num_channels as u32)?;
            self.writer.write_u8(win.pols.len() as u8)?;
            for p in &win.pols {
                self.writer.write_u8(p.code())?;
            }
            for l in &win.labels {
                self.write_string(l)?;
            }
        }
        Ok(())
    }

    pub fn write_cycle(&mut self, cycle: &CycleRecord) -> std::io::Result<()> {
        let w = &mut self.writer;
        w.write_u8(TAG_CYCLE)?;
        w.write_f64::<LE>(cycle.mjd)?;
        w.write_f64::<LE>(cycle.ut_seconds)?;
        w.write_u32::<LE>(cycle.baselines.len() as u32)?;
        for b in &cycle.baselines {
            w.write_u32::<LE>(b.ant1)?;
            w.write_u32::<LE>(b.ant2)?;
            w.write_u16::<LE>(b.window as u16)?;
            w.write_u16::<LE>(b.bin as u16)?;
            w.write_u32::<LE>(b.vis.len() as u32)?;
            for v in &b.vis {
                w.write_f32::<LE>(v.re)?;
                w.write_f32::<LE>(v.im)?;
            }
            for &f in &b.flags {
                w.write_u8(u8::from(f))?;
            }
        }
        w.write_u16::<LE>(cycle.syscal.len() as u16)?;
        for s in &cycle.syscal {
            w.write_u32::<LE>(s.antenna)?;
            w.write_u16::<LE>(s.window as u16)?;
            for t in s.online.iter().chain(s.computed.iter()) {
                w.write_f32::<LE>(*t)?;
            }
        }
        Ok(())
    }

    pub fn finish(mut self) -> std::io::Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}
