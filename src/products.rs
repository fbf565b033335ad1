//! Derived data products: per-channel spectra ([`AmpPhase`]), channel
//! averages ([`VisQuantities`]) and their containers.
//!
//! Shapes are checked once, when a product is built or decoded, by the
//! `check_shape` methods; nothing else in the crate re-validates them.

use std::rc::Rc;

use itertools::izip;
use num_complex::Complex32;
use thiserror::Error;

use crate::{header::Pol, header::ScanHeader, options::AmpPhaseOptions};

#[derive(Error, Debug, PartialEq)]
pub enum ShapeError {
    #[error("{what} has {actual} elements, expected {expected}")]
    Length {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{what} has {filtered} filtered elements but only {raw} raw elements")]
    FilteredLonger {
        what: &'static str,
        filtered: usize,
        raw: usize,
    },

    #[error("cycle {cycle} refers to scan header {header}, but there are only {num_headers}")]
    HeaderIndex {
        cycle: usize,
        header: usize,
        num_headers: usize,
    },
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<(), ShapeError> {
    if expected == actual {
        Ok(())
    } else {
        Err(ShapeError::Length {
            what,
            expected,
            actual,
        })
    }
}

/// A running minimum and maximum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub min: f32,
    pub max: f32,
}

impl Limits {
    pub const EMPTY: Limits = Limits {
        min: f32::INFINITY,
        max: f32::NEG_INFINITY,
    };

    pub fn include(&mut self, v: f32) {
        if v.is_finite() {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
    }

    pub fn merge(&mut self, other: &Limits) {
        if !other.is_empty() {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }
}

impl Default for Limits {
    fn default() -> Self {
        Limits::EMPTY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SpectrumLimits {
    pub amplitude: Limits,
    pub phase: Limits,
    pub real: Limits,
    pub imag: Limits,
}

impl SpectrumLimits {
    pub fn include(&mut self, amplitude: f32, phase: f32, raw: Complex32) {
        self.amplitude.include(amplitude);
        self.phase.include(phase);
        self.real.include(raw.re);
        self.imag.include(raw.im);
    }

    pub fn merge(&mut self, other: &SpectrumLimits) {
        self.amplitude.merge(&other.amplitude);
        self.phase.merge(&other.phase);
        self.real.merge(&other.real);
        self.imag.merge(&other.imag);
    }
}

/// The channels of one bin that survived flag filtering.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilteredSpectrum {
    pub channel: Vec<f32>,
    pub frequency: Vec<f32>,
    pub amplitude: Vec<f32>,
    pub phase: Vec<f32>,
    pub raw: Vec<Complex32>,
}

impl FilteredSpectrum {
    pub fn len(&self) -> usize {
        self.channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }

    pub fn push(&mut self, channel: f32, frequency: f32, amplitude: f32, phase: f32, raw: Complex32) {
        self.channel.push(channel);
        self.frequency.push(frequency);
        self.amplitude.push(amplitude);
        self.phase.push(phase);
        self.raw.push(raw);
    }
}

/// One bin of one baseline: every raw array has one element per channel.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BinSpectrum {
    pub amplitude: Vec<f32>,
    pub phase: Vec<f32>,
    pub raw: Vec<Complex32>,
    pub flagged: Vec<bool>,
    pub filtered: FilteredSpectrum,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BaselineSpectrum {
    pub baseline: u32,
    pub bins: Vec<BinSpectrum>,
    pub limits: SpectrumLimits,
}

/// One IF, one polarisation, one cycle, every channel.
#[derive(Debug, Clone, PartialEq)]
pub struct AmpPhase {
    /// Index into the scan header's windows.
    pub window: usize,
    pub window_number: u32,
    pub pol: Pol,
    pub obs_date: String,
    pub ut_seconds: f64,
    pub mjd: f64,

    /// Channel numbers (1-based).
    pub channel: Vec<f32>,
    /// Channel frequencies \[MHz\].
    pub frequency: Vec<f32>,

    pub baselines: Vec<BaselineSpectrum>,

    /// Over the filtered data of every baseline.
    pub limits: SpectrumLimits,

    pub options: Rc<AmpPhaseOptions>,
}

impl AmpPhase {
    pub fn nchannels(&self) -> usize {
        self.channel.len()
    }

    pub fn baseline(&self, baseline: u32) -> Option<&BaselineSpectrum> {
        self.baselines.iter().find(|b| b.baseline == baseline)
    }

    pub fn check_shape(&self) -> Result<(), ShapeError> {
        let n = self.nchannels();
        check_len("frequency", n, self.frequency.len())?;
        for b in &self.baselines {
            for bin in &b.bins {
                check_len("amplitude", n, bin.amplitude.len())?;
                check_len("phase", n, bin.phase.len())?;
                check_len("raw", n, bin.raw.len())?;
                check_len("flagged", n, bin.flagged.len())?;
                let f = &bin.filtered;
                let nf = f.channel.len();
                if nf > n {
                    return Err(ShapeError::FilteredLonger {
                        what: "channel",
                        filtered: nf,
                        raw: n,
                    });
                }
                check_len("filtered frequency", nf, f.frequency.len())?;
                check_len("filtered amplitude", nf, f.amplitude.len())?;
                check_len("filtered phase", nf, f.phase.len())?;
                check_len("filtered raw", nf, f.raw.len())?;
            }
        }
        Ok(())
    }

    /// Recompute the per-baseline and global limits from the filtered data.
    pub fn update_limits(&mut self) {
        let mut global = SpectrumLimits::default();
        for b in self.baselines.iter_mut() {
            let mut limits = SpectrumLimits::default();
            for bin in &b.bins {
                let f = &bin.filtered;
                for (&a, &p, &r) in izip!(&f.amplitude, &f.phase, &f.raw) {
                    limits.include(a, p, r);
                }
            }
            global.merge(&limits);
            b.limits = limits;
        }
        self.limits = global;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisBin {
    pub amplitude: f32,
    pub phase: f32,
    /// \[ns\]
    pub delay: f32,
    pub flagged: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BaselineVis {
    pub baseline: u32,
    pub bins: Vec<VisBin>,
}

/// One IF, one polarisation, one cycle, averaged across channels.
#[derive(Debug, Clone, PartialEq)]
pub struct VisQuantities {
    pub window: usize,
    pub window_number: u32,
    pub pol: Pol,
    pub obs_date: String,
    pub ut_seconds: f64,
    pub mjd: f64,
    pub baselines: Vec<BaselineVis>,
    pub amplitude: Limits,
    pub phase: Limits,
    pub delay: Limits,
    pub options: Rc<AmpPhaseOptions>,
}

impl VisQuantities {
    pub fn baseline(&self, baseline: u32) -> Option<&BaselineVis> {
        self.baselines.iter().find(|b| b.baseline == baseline)
    }

    pub fn update_limits(&mut self) {
        let (mut amplitude, mut phase, mut delay) = (Limits::EMPTY, Limits::EMPTY, Limits::EMPTY);
        for bin in self.baselines.iter().flat_map(|b| b.bins.iter()) {
            if !bin.flagged {
                amplitude.include(bin.amplitude);
                phase.include(bin.phase);
                delay.include(bin.delay);
            }
        }
        self.amplitude = amplitude;
        self.phase = phase;
        self.delay = delay;
    }
}

/// All IFs and polarisations of a single cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumData {
    pub header: ScanHeader,
    /// `[if][pol]`
    pub spectra: Vec<Vec<AmpPhase>>,
    pub options: Rc<AmpPhaseOptions>,
}

impl SpectrumData {
    pub fn num_ifs(&self) -> usize {
        self.spectra.len()
    }

    pub fn num_pols(&self, i: usize) -> usize {
        self.spectra.get(i).map(Vec::len).unwrap_or(0)
    }

    pub fn mjd(&self) -> Option<f64> {
        self.spectra.iter().flatten().next().map(|a| a.mjd)
    }

    pub fn check_shape(&self) -> Result<(), ShapeError> {
        self.spectra.iter().flatten().try_for_each(AmpPhase::check_shape)
    }
}

/// One cycle of averaged products.
#[derive(Debug, Clone, PartialEq)]
pub struct VisCycle {
    /// Index into [`VisData::headers`].
    pub header: usize,
    pub mjd: f64,
    /// `[if][pol]`; cycles may differ in both dimensions.
    pub windows: Vec<Vec<VisQuantities>>,
}

/// A ragged time series: cycles × IFs × pols of [`VisQuantities`]. Scan
/// headers are stored once and referenced by index.
#[derive(Debug, Clone, PartialEq)]
pub struct VisData {
    pub headers: Vec<ScanHeader>,
    pub cycles: Vec<VisCycle>,
    pub options: Rc<AmpPhaseOptions>,
}

impl VisData {
    pub fn new(options: Rc<AmpPhaseOptions>) -> VisData {
        VisData {
            headers: vec![],
            cycles: vec![],
            options,
        }
    }

    pub fn num_cycles(&self) -> usize {
        self.cycles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cycles.is_empty()
    }

    pub fn num_ifs(&self, cycle: usize) -> usize {
        self.cycles.get(cycle).map(|c| c.windows.len()).unwrap_or(0)
    }

    pub fn num_pols(&self, cycle: usize, i: usize) -> usize {
        self.cycles
            .get(cycle)
            .and_then(|c| c.windows.get(i))
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn get(&self, cycle: usize, i: usize, pol: usize) -> Option<&VisQuantities> {
        self.cycles.get(cycle)?.windows.get(i)?.get(pol)
    }

    pub fn header_of(&self, cycle: usize) -> Option<&ScanHeader> {
        self.headers.get(self.cycles.get(cycle)?.header)
    }

    pub fn latest_header(&self) -> Option<&ScanHeader> {
        self.cycles.len().checked_sub(1).and_then(|c| self.header_of(c))
    }

    /// Append a cycle, storing its header only if it differs from the last
    /// one stored.
    pub fn push_cycle(&mut self, header: &ScanHeader, mjd: f64, windows: Vec<Vec<VisQuantities>>) {
        let header_index = match self.headers.last() {
            Some(last) if last == header => self.headers.len() - 1,
            _ => {
                self.headers.push(header.clone());
                self.headers.len() - 1
            }
        };
        self.cycles.push(VisCycle {
            header: header_index,
            mjd,
            windows,
        });
    }

    pub fn check_shape(&self) -> Result<(), ShapeError> {
        for (i, c) in self.cycles.iter().enumerate() {
            if c.header >= self.headers.len() {
                return Err(ShapeError::HeaderIndex {
                    cycle: i,
                    header: c.header,
                    num_headers: self.headers.len(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ampphase() -> AmpPhase {
        AmpPhase {
            window: 0,
            window_number: 1,
            pol: Pol::XX,
            obs_date: "2024-01-01".into(),
            ut_seconds: 5.0,
            mjd: 60310.0,
            channel: vec![1.0, 2.0],
            frequency: vec![2100.0, 2101.0],
            baselines: vec![BaselineSpectrum {
                baseline: 258,
                bins: vec![BinSpectrum {
                    amplitude: vec![1.0, 3.0],
                    phase: vec![10.0, -20.0],
                    raw: vec![Complex32::new(1.0, 0.0), Complex32::new(0.0, 3.0)],
                    flagged: vec![false, true],
                    filtered: FilteredSpectrum {
                        channel: vec![1.0],
                        frequency: vec![2100.0],
                        amplitude: vec![1.0],
                        phase: vec![10.0],
                        raw: vec![Complex32::new(1.0, 0.0)],
                    },
                }],
                limits: SpectrumLimits::default(),
            }],
            limits: SpectrumLimits::default(),
            options: Rc::new(AmpPhaseOptions::default()),
        }
    }

    #[test]
    fn test_shape_check_catches_short_arrays() {
        let mut a = ampphase();
        assert_eq!(a.check_shape(), Ok(()));
        a.baselines[0].bins[0].phase.pop();
        assert!(matches!(
            a.check_shape(),
            Err(ShapeError::Length { what: "phase", .. })
        ));

        let mut a = ampphase();
        a.baselines[0].bins[0].filtered.raw.clear();
        assert!(a.check_shape().is_err());
    }

    #[test]
    fn test_limits_use_filtered_data_only() {
        let mut a = ampphase();
        a.update_limits();
        assert_eq!(a.limits.amplitude, Limits { min: 1.0, max: 1.0 });
        assert_eq!(a.baselines[0].limits.phase, Limits { min: 10.0, max: 10.0 });
    }

    #[test]
    fn test_push_cycle_shares_headers() {
        let header = ScanHeader {
            obs_date: "2024-01-01".into(),
            ut_seconds: 0.0,
            mjd: 60310.0,
            source_name: "1934-638".into(),
            obs_type: "dwell".into(),
            cycle_time: 10.0,
            antennas: vec![],
            windows: vec![],
        };
        let mut other = header.clone();
        other.source_name = "0823-500".into();

        let mut v = VisData::new(Rc::new(AmpPhaseOptions::default()));
        v.push_cycle(&header, 1.0, vec![]);
        v.push_cycle(&header, 2.0, vec![vec![], vec![]]);
        v.push_cycle(&other, 3.0, vec![vec![]]);
        assert_eq!(v.headers.len(), 2);
        assert_eq!(v.num_ifs(1), 2);
        assert_eq!(v.num_pols(1, 0), 0);
        assert_eq!(v.header_of(2).unwrap().source_name, "0823-500");
        assert_eq!(v.check_shape(), Ok(()));
        v.cycles[0].header = 7;
        assert!(v.check_shape().is_err());
    }
}
