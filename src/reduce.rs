//! Reading cycles out of archives and turning them into spectra and
//! channel-averaged products.

use std::{collections::BTreeMap, f64::consts::TAU, path::Path, rc::Rc};

use bitflags::bitflags;
use hifitime::{Duration, Epoch};
use indicatif::ProgressBar;
use log::{debug, trace, warn};
use num_complex::Complex32;
use thiserror::Error;

use crate::{
    averaging::average_ampphase,
    header::{baseline_number, Pol, ScanHeader},
    index::ArchiveIndex,
    options::{AmpPhaseOptions, TsysMode},
    products::{
        AmpPhase, BaselineSpectrum, BinSpectrum, ShapeError, SpectrumData, SpectrumLimits,
        VisData, VisQuantities,
    },
    read::{open_archive, ArchiveError, ArchiveRecord, BaselineRecord, CycleRecord},
};

bitflags! {
    /// What a call to [`reduce`] should do. Modes combine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReadMode: u8 {
        /// Rebuild the archive index.
        const METADATA = 0b001;
        /// Return the single raw cycle at a target time.
        const GRAB_SPECTRUM = 0b010;
        /// Reduce every cycle of every file into [`VisData`].
        const COMPUTE_VIS = 0b100;
    }
}

#[derive(Error, Debug)]
pub enum ReduceError {
    #[error("A spectrum was requested without a target time")]
    NoTargetTime,

    #[error(transparent)]
    Shape(#[from] ShapeError),
}

#[derive(Debug, Default)]
pub struct Reduction {
    /// Only set in [`ReadMode::GRAB_SPECTRUM`] mode, when a cycle was found.
    pub spectrum: Option<SpectrumData>,
    /// Only set in [`ReadMode::COMPUTE_VIS`] mode. May hold no cycles.
    pub vis: Option<VisData>,
}

/// The factor raw samples of a baseline are multiplied by for a tsys mode.
fn tsys_scale(
    mode: TsysMode,
    cycle: &CycleRecord,
    record: &BaselineRecord,
    pol: Pol,
) -> f32 {
    if mode == TsysMode::AsRecorded {
        return 1.0;
    }
    let (f1, f2) = pol.feeds();
    let (t1, t2) = match (
        cycle.tsys(record.ant1, record.window, f1),
        cycle.tsys(record.ant2, record.window, f2),
    ) {
        (Some(t1), Some(t2)) => (t1, t2),
        _ => {
            trace!(
                "No system temperatures for baseline {}-{}; leaving it as recorded",
                record.ant1,
                record.ant2
            );
            return 1.0;
        }
    };
    let online = (t1.0 * t2.0).sqrt();
    if !(online > 0.0) {
        return 1.0;
    }
    match mode {
        TsysMode::AsRecorded => 1.0,
        TsysMode::ReverseOnline => 1.0 / online,
        TsysMode::Computed => (t1.1 * t2.1).sqrt() / online,
    }
}

/// The spectrum of one window and one polarisation of a cycle. `None` if
/// the window doesn't record `pol`.
pub fn cycle_ampphase(
    header: &ScanHeader,
    cycle: &CycleRecord,
    window: usize,
    pol: Pol,
    options: &Rc<AmpPhaseOptions>,
) -> Result<Option<AmpPhase>, ShapeError> {
    let win = match header.windows.get(window) {
        Some(w) => w,
        None => return Ok(None),
    };
    let pol_index = match win.pol_index(pol) {
        Some(i) => i,
        None => return Ok(None),
    };
    let num_pols = win.pols.len();
    let units = options.phase_units;
    let (feed1, feed2) = pol.feeds();

    let channel: Vec<f32> = (1..=win.num_channels).map(|c| c as f32).collect();
    let frequency: Vec<f64> = (0..win.num_channels).map(|c| win.channel_freq(c)).collect();

    // Bins of the same baseline are gathered together, in bin order.
    let mut grouped: BTreeMap<u32, Vec<&BaselineRecord>> = BTreeMap::new();
    for record in cycle.baselines.iter().filter(|r| r.window == window) {
        grouped
            .entry(baseline_number(record.ant1, record.ant2))
            .or_default()
            .push(record);
    }

    let mut baselines = Vec::with_capacity(grouped.len());
    for (baseline, mut records) in grouped {
        records.sort_by_key(|r| r.bin);
        let mut bins = Vec::with_capacity(records.len());
        for record in records {
            let scale = tsys_scale(options.tsys_mode, cycle, record, pol);
            let delay = options.delay_correction(record.ant2, win.number, feed2, cycle.mjd)
                - options.delay_correction(record.ant1, win.number, feed1, cycle.mjd);

            let mut bin = BinSpectrum::default();
            for (chan, &freq) in frequency.iter().enumerate() {
                let i = chan * num_pols + pol_index;
                let (Some(&sample), Some(&flagged)) = (record.vis.get(i), record.flags.get(i))
                else {
                    continue;
                };
                let mut z = sample * scale;
                if delay != 0.0 {
                    let turn = -TAU * freq * f64::from(delay) * 1e-3;
                    z *= Complex32::from_polar(1.0, turn as f32);
                }
                let amplitude = z.norm();
                let phase = units.from_radians(z.arg());
                bin.amplitude.push(amplitude);
                bin.phase.push(phase);
                bin.raw.push(z);
                bin.flagged.push(flagged);
                if !flagged || options.include_flagged {
                    bin.filtered
                        .push(channel[chan], freq as f32, amplitude, phase, z);
                }
            }
            bins.push(bin);
        }
        baselines.push(BaselineSpectrum {
            baseline,
            bins,
            limits: SpectrumLimits::default(),
        });
    }

    let mut ampphase = AmpPhase {
        window,
        window_number: win.number,
        pol,
        obs_date: header.obs_date.clone(),
        ut_seconds: cycle.ut_seconds,
        mjd: cycle.mjd,
        channel,
        frequency: frequency.into_iter().map(|f| f as f32).collect(),
        baselines,
        limits: SpectrumLimits::default(),
        options: options.clone(),
    };
    ampphase.check_shape()?;
    ampphase.update_limits();
    Ok(Some(ampphase))
}

/// Every window and polarisation of a cycle, raw.
pub fn cycle_spectrum(
    header: &ScanHeader,
    cycle: &CycleRecord,
    options: &Rc<AmpPhaseOptions>,
) -> Result<SpectrumData, ShapeError> {
    let mut spectra = Vec::with_capacity(header.windows.len());
    for (i, win) in header.windows.iter().enumerate() {
        let mut pols = Vec::with_capacity(win.pols.len());
        for &pol in &win.pols {
            if let Some(a) = cycle_ampphase(header, cycle, i, pol, options)? {
                pols.push(a);
            }
        }
        spectra.push(pols);
    }
    Ok(SpectrumData {
        header: header.clone(),
        spectra,
        options: options.clone(),
    })
}

/// Every window and polarisation of a cycle, averaged.
pub fn cycle_vis(
    header: &ScanHeader,
    cycle: &CycleRecord,
    options: &Rc<AmpPhaseOptions>,
) -> Result<Vec<Vec<VisQuantities>>, ShapeError> {
    let mut windows = Vec::with_capacity(header.windows.len());
    for (i, win) in header.windows.iter().enumerate() {
        let if_options = options.window_options(win);
        let mut pols = Vec::with_capacity(win.pols.len());
        for &pol in &win.pols {
            // Each spectrum is dropped as soon as it's averaged.
            if let Some(a) = cycle_ampphase(header, cycle, i, pol, options)? {
                pols.push(average_ampphase(&a, &if_options, options.phase_units));
            }
        }
        windows.push(pols);
    }
    Ok(windows)
}

/// Stream the cycles of one file into `f`, with the scan header they belong
/// to. `f` returns `false` to stop early.
fn for_each_cycle<F>(path: &Path, mut f: F) -> Result<Result<(), ShapeError>, ArchiveError>
where
    F: FnMut(&ScanHeader, &CycleRecord) -> Result<bool, ShapeError>,
{
    let mut reader = open_archive(path)?;
    let mut header: Option<ScanHeader> = None;
    while let Some(record) = reader.next_record()? {
        match record {
            ArchiveRecord::Header(h) => header = Some(h),
            ArchiveRecord::Cycle(cycle) => {
                if let Some(h) = &header {
                    match f(h, &cycle) {
                        Ok(true) => (),
                        Ok(false) => break,
                        Err(e) => return Ok(Err(e)),
                    }
                }
            }
        }
    }
    Ok(Ok(()))
}

pub fn reduce<P: AsRef<Path>>(
    mode: ReadMode,
    files: &[P],
    index: &mut ArchiveIndex,
    target_mjd: Option<f64>,
    options: &Rc<AmpPhaseOptions>,
) -> Result<Reduction, ReduceError> {
    reduce_with_progress(mode, files, index, target_mjd, options, None)
}

/// Carry out the work `mode` asks for. Archive errors only affect the file
/// they happen in: they are logged, and any cycles read before the error
/// are kept.
pub fn reduce_with_progress<P: AsRef<Path>>(
    mode: ReadMode,
    files: &[P],
    index: &mut ArchiveIndex,
    target_mjd: Option<f64>,
    options: &Rc<AmpPhaseOptions>,
    progress: Option<&ProgressBar>,
) -> Result<Reduction, ReduceError> {
    if mode.contains(ReadMode::METADATA) {
        debug!("Indexing {} file(s)", files.len());
        *index = ArchiveIndex::build(files);
    }

    let mut reduction = Reduction::default();

    if mode.contains(ReadMode::GRAB_SPECTRUM) {
        let target = target_mjd.ok_or(ReduceError::NoTargetTime)?;
        reduction.spectrum = grab_spectrum(files, index, target, options)?;
    }

    if mode.contains(ReadMode::COMPUTE_VIS) {
        let mut vis = VisData::new(options.clone());
        for path in files {
            let path = path.as_ref();
            if index.file(path).is_none() {
                debug!("{} isn't indexed; not reducing it", path.display());
                continue;
            }
            debug!("Reducing {}", path.display());
            let result = for_each_cycle(path, |header, cycle| {
                trace!("Cycle at MJD {}", cycle.mjd);
                let windows = cycle_vis(header, cycle, options)?;
                vis.push_cycle(header, cycle.mjd, windows);
                Ok(true)
            });
            match result {
                Ok(r) => r?,
                Err(e) => warn!("Stopped reading {}: {e}", path.display()),
            }
            if let Some(p) = progress {
                p.inc(1);
            }
        }
        debug!("Reduced {} cycle(s)", vis.num_cycles());
        reduction.vis = Some(vis);
    }

    Ok(reduction)
}

/// The raw cycle whose midpoint is within half a cycle time of `target`.
fn grab_spectrum<P: AsRef<Path>>(
    files: &[P],
    index: &ArchiveIndex,
    target: f64,
    options: &Rc<AmpPhaseOptions>,
) -> Result<Option<SpectrumData>, ShapeError> {
    let t = Epoch::from_mjd_utc(target);
    for path in files {
        let path = path.as_ref();
        // Scan windows already include half a cycle of slack.
        if !index.overlaps(path, t, t) {
            continue;
        }
        let mut found = None;
        let result = for_each_cycle(path, |header, cycle| {
            let half = Duration::from_seconds(header.cycle_time / 2.0);
            let offset = Epoch::from_mjd_utc(cycle.mjd) - t;
            if offset.abs() <= half {
                found = Some(cycle_spectrum(header, cycle, options)?);
                Ok(false)
            } else {
                Ok(true)
            }
        });
        match result {
            Ok(r) => r?,
            Err(e) => warn!("Stopped reading {}: {e}", path.display()),
        }
        if found.is_some() {
            debug!("Found the cycle at MJD {target} in {}", path.display());
            return Ok(found);
        }
    }
    debug!("No cycle at MJD {target}");
    Ok(None)
}
