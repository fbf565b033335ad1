//! Archives with known contents, for tests and demonstrations.
//!
//! Every baseline sees a point source: the phase of baseline (a1, a2) at
//! frequency f is `2πf(τ2 − τ1) + (φ2 − φ1)` for per-antenna delays τ and
//! phases φ, and the amplitude is constant apart from the online system
//! temperature scaling.

use std::path::Path;

use hifitime::Epoch;
use num_complex::Complex32;

use super::{ArchiveError, ArchiveRecord, ArchiveWriter, BaselineRecord, CycleRecord, Syscal};
use crate::header::{Antenna, IfWindow, Pol, ScanHeader};

#[derive(Debug, Clone)]
pub struct SyntheticScan {
    pub source: String,
    pub num_cycles: usize,
}

#[derive(Debug, Clone)]
pub struct SyntheticArchive {
    pub num_antennas: u32,
    pub windows: Vec<IfWindow>,
    /// \[seconds\]
    pub cycle_time: f64,
    pub start_mjd: f64,
    pub scans: Vec<SyntheticScan>,
    /// Dead time between scans \[seconds\].
    pub scan_gap: f64,
    /// Per antenna, indexed by antenna number − 1 \[ns\]. Missing entries are 0.
    pub antenna_delays: Vec<f32>,
    /// Per antenna, indexed by antenna number − 1 \[radians\].
    pub antenna_phases: Vec<f32>,
    /// The true correlated amplitude, before system temperature scaling.
    pub amplitude: f32,
    pub num_bins: usize,
    /// 0-based channels flagged in every baseline.
    pub flagged_channels: Vec<usize>,
    /// System temperatures the correlator applied, per feed \[K\].
    pub tsys_online: [f32; 2],
    /// System temperatures from the noise diode, per feed \[K\].
    pub tsys_computed: [f32; 2],
}

fn window(number: u32, centre_freq: f64) -> IfWindow {
    IfWindow {
        number,
        centre_freq,
        bandwidth: 64.0,
        num_channels: 16,
        pols: vec![Pol::XX, Pol::YY, Pol::XY, Pol::YX],
        labels: [format!("f{number}"), number.to_string(), format!("z{number}")],
    }
}

impl Default for SyntheticArchive {
    fn default() -> Self {
        SyntheticArchive {
            num_antennas: 6,
            windows: vec![window(1, 2100.0), window(2, 5500.0)],
            cycle_time: 10.0,
            start_mjd: 60000.0,
            scans: vec![SyntheticScan {
                source: "1934-638".to_string(),
                num_cycles: 3,
            }],
            scan_gap: 60.0,
            antenna_delays: vec![],
            antenna_phases: vec![],
            amplitude: 1.0,
            num_bins: 1,
            flagged_channels: vec![],
            tsys_online: [50.0, 55.0],
            tsys_computed: [40.0, 44.0],
        }
    }
}

impl SyntheticArchive {
    pub fn new() -> SyntheticArchive {
        SyntheticArchive::default()
    }

    pub fn with_scans(mut self, scans: &[(&str, usize)]) -> SyntheticArchive {
        self.scans = scans
            .iter()
            .map(|&(source, num_cycles)| SyntheticScan {
                source: source.to_string(),
                num_cycles,
            })
            .collect();
        self
    }

    pub fn with_delays(mut self, delays: &[f32]) -> SyntheticArchive {
        self.antenna_delays = delays.to_vec();
        self
    }

    pub fn with_phases(mut self, phases: &[f32]) -> SyntheticArchive {
        self.antenna_phases = phases.to_vec();
        self
    }

    pub fn with_flagged_channels(mut self, channels: &[usize]) -> SyntheticArchive {
        self.flagged_channels = channels.to_vec();
        self
    }

    pub fn with_start_mjd(mut self, mjd: f64) -> SyntheticArchive {
        self.start_mjd = mjd;
        self
    }

    fn delay(&self, antenna: u32) -> f32 {
        self.antenna_delays
            .get(antenna as usize - 1)
            .copied()
            .unwrap_or(0.0)
    }

    fn phase(&self, antenna: u32) -> f32 {
        self.antenna_phases
            .get(antenna as usize - 1)
            .copied()
            .unwrap_or(0.0)
    }

    /// The model visibility of a baseline at a frequency \[MHz\], without any
    /// system temperature scaling.
    pub fn model_vis(&self, ant1: u32, ant2: u32, freq: f64) -> Complex32 {
        if ant1 == ant2 {
            return Complex32::new(self.amplitude, 0.0);
        }
        let tau = (self.delay(ant2) - self.delay(ant1)) as f64;
        let phase = 2.0 * std::f64::consts::PI * freq * tau * 1e-3
            + (self.phase(ant2) - self.phase(ant1)) as f64;
        Complex32::from_polar(self.amplitude, phase as f32)
    }

    /// The start of every scan (MJD).
    fn scan_starts(&self) -> Vec<f64> {
        let mut starts = Vec::with_capacity(self.scans.len());
        let mut t = self.start_mjd;
        for scan in &self.scans {
            starts.push(t);
            t += (scan.num_cycles as f64 * self.cycle_time + self.scan_gap) / 86400.0;
        }
        starts
    }

    /// The midpoint of every cycle (MJD), in archive order.
    pub fn cycle_mjds(&self) -> Vec<f64> {
        self.scans
            .iter()
            .zip(self.scan_starts())
            .flat_map(|(scan, start)| {
                let cycle_time = self.cycle_time;
                (0..scan.num_cycles)
                    .map(move |k| start + (k as f64 + 0.5) * cycle_time / 86400.0)
            })
            .collect()
    }

    fn header(&self, source: &str, mjd: f64) -> ScanHeader {
        let (y, m, d, ..) = Epoch::from_mjd_utc(mjd).to_gregorian_utc();
        ScanHeader {
            obs_date: format!("{y:04}-{m:02}-{d:02}"),
            ut_seconds: mjd.fract() * 86400.0,
            mjd,
            source_name: source.to_string(),
            obs_type: "dwell".to_string(),
            cycle_time: self.cycle_time,
            antennas: (1..=self.num_antennas)
                .map(|n| Antenna {
                    number: n,
                    name: format!("CA{n:02}"),
                    // An east-west line with growing spacings.
                    xyz: [-4_752_000.0, 2_790_000.0 + 30.6 * (n * n) as f64, -3_200_000.0],
                })
                .collect(),
            windows: self.windows.clone(),
        }
    }

    fn cycle(&self, mjd: f64) -> CycleRecord {
        let mut baselines = vec![];
        for (w, window) in self.windows.iter().enumerate() {
            for ant1 in 1..=self.num_antennas {
                for ant2 in ant1..=self.num_antennas {
                    for bin in 0..self.num_bins {
                        let mut vis = Vec::with_capacity(window.num_channels * window.pols.len());
                        let mut flags = Vec::with_capacity(vis.capacity());
                        for chan in 0..window.num_channels {
                            let model = self.model_vis(ant1, ant2, window.channel_freq(chan));
                            for pol in &window.pols {
                                let (f1, f2) = pol.feeds();
                                let scale = (self.tsys_online[f1.index()]
                                    * self.tsys_online[f2.index()])
                                .sqrt();
                                vis.push(model * scale);
                                flags.push(self.flagged_channels.contains(&chan));
                            }
                        }
                        baselines.push(BaselineRecord {
                            ant1,
                            ant2,
                            window: w,
                            bin,
                            vis,
                            flags,
                        });
                    }
                }
            }
        }

        let syscal = (0..self.windows.len())
            .flat_map(|w| {
                (1..=self.num_antennas).map(move |antenna| Syscal {
                    antenna,
                    window: w,
                    online: self.tsys_online,
                    computed: self.tsys_computed,
                })
            })
            .collect();

        CycleRecord {
            mjd,
            ut_seconds: mjd.fract() * 86400.0,
            baselines,
            syscal,
        }
    }

    /// Every record of the archive, in order.
    pub fn records(&self) -> Vec<ArchiveRecord> {
        let mut records = vec![];
        for (scan, start) in self.scans.iter().zip(self.scan_starts()) {
            records.push(ArchiveRecord::Header(self.header(&scan.source, start)));
            for k in 0..scan.num_cycles {
                let mjd = start + (k as f64 + 0.5) * self.cycle_time / 86400.0;
                records.push(ArchiveRecord::Cycle(self.cycle(mjd)));
            }
        }
        records
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<(), ArchiveError> {
        let path = path.as_ref();
        let io_error = |source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = ArchiveWriter::create(path)?;
        for record in self.records() {
            match record {
                ArchiveRecord::Header(h) => writer.write_header(&h),
                ArchiveRecord::Cycle(c) => writer.write_cycle(&c),
            }
            .map_err(io_error)?;
        }
        writer.finish().map_err(io_error)?;
        Ok(())
    }
}
