//! Delay solutions and closure phases, computed from the channel-averaged
//! products a viewer already holds.

use log::debug;
use ndarray::Array3;
use thiserror::Error;
use vec1::Vec1;

use crate::{
    header::{baseline_number, Feed, Pol},
    options::{DelayModifier, PhaseUnits},
    products::{VisData, VisQuantities},
};

/// Neighbouring cycles may be this fraction of a cycle time off and still
/// count as consecutive.
const CYCLE_TOLERANCE: f64 = 0.1;

#[derive(Error, Debug, PartialEq)]
pub enum CalibrationError {
    #[error("need {needed} consecutive cycles, found {found}")]
    InsufficientCycles { needed: usize, found: usize },

    #[error("Reference antenna {0} isn't in the array")]
    UnknownRefant(u32),

    #[error("Calibration band {0} isn't in the data")]
    UnknownBand(u32),

    #[error("No unflagged data on the reference antenna's baselines")]
    NoData,
}

/// When a delay solution applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayRange {
    /// Up to the solution time.
    Before,
    /// From the solution time on.
    After,
    All,
}

impl DelayRange {
    pub fn bounds(self, now: f64) -> (f64, f64) {
        match self {
            DelayRange::Before => (f64::NEG_INFINITY, now),
            DelayRange::After => (now, f64::INFINITY),
            DelayRange::All => (f64::NEG_INFINITY, f64::INFINITY),
        }
    }

    pub fn from_word(word: &str) -> Option<DelayRange> {
        match word {
            "before" => Some(DelayRange::Before),
            "after" => Some(DelayRange::After),
            "all" => Some(DelayRange::All),
            _ => None,
        }
    }
}

/// The run of `needed` consecutive cycles ending at `end_cycle`, in time
/// order.
pub fn consecutive_cycles(
    vis: &VisData,
    end_cycle: usize,
    needed: usize,
) -> Result<Vec1<usize>, CalibrationError> {
    let insufficient = |found| CalibrationError::InsufficientCycles { needed, found };
    if end_cycle >= vis.num_cycles() {
        return Err(insufficient(0));
    }
    let mut run = vec![end_cycle];
    let mut current = end_cycle;
    while run.len() < needed && current > 0 {
        let previous = current - 1;
        let cycle_time = match vis.header_of(current) {
            Some(h) => h.cycle_time,
            None => break,
        };
        let dt = (vis.cycles[current].mjd - vis.cycles[previous].mjd) * 86400.0;
        if (dt - cycle_time).abs() > CYCLE_TOLERANCE * cycle_time {
            break;
        }
        run.push(previous);
        current = previous;
    }
    if run.len() < needed {
        return Err(insufficient(run.len()));
    }
    run.reverse();
    Vec1::try_from_vec(run).map_err(|_| insufficient(0))
}

/// The delay of the first bin of a baseline, signed so it is the delay of
/// `ant` relative to `refant`.
fn refant_delay(vq: &VisQuantities, refant: u32, ant: u32) -> Option<f32> {
    let bin = vq.baseline(baseline_number(refant, ant))?.bins.first()?;
    if bin.flagged {
        return None;
    }
    Some(if ant < refant { -bin.delay } else { bin.delay })
}

/// Solve for the per-antenna delays that would zero the delays on every
/// baseline to `refant`, averaged over the `nncal` cycles ending at
/// `end_cycle`. XX gives the X feed and YY the Y feed of each of the two
/// calibration bands (window numbers).
pub fn delay_solution(
    vis: &VisData,
    refant: u32,
    nncal: usize,
    calbands: [u32; 2],
    end_cycle: usize,
    range: DelayRange,
) -> Result<Vec<DelayModifier>, CalibrationError> {
    let run = consecutive_cycles(vis, end_cycle, nncal.max(1))?;
    let header = vis
        .header_of(*run.last())
        .ok_or(CalibrationError::InsufficientCycles {
            needed: nncal,
            found: 0,
        })?;
    if !header.has_antenna(refant) {
        return Err(CalibrationError::UnknownRefant(refant));
    }
    for band in calbands {
        if header.window_by_number(band).is_none() {
            return Err(CalibrationError::UnknownBand(band));
        }
    }
    let antennas: Vec<u32> = header.antennas.iter().map(|a| a.number).collect();

    let shape = (antennas.len(), 2, 2);
    let mut sums = Array3::<f64>::zeros(shape);
    let mut counts = Array3::<usize>::zeros(shape);
    for &c in run.iter() {
        for vq in vis.cycles[c].windows.iter().flatten() {
            let feed = match vq.pol {
                Pol::XX => Feed::X,
                Pol::YY => Feed::Y,
                _ => continue,
            };
            let band = match calbands.iter().position(|&b| b == vq.window_number) {
                Some(b) => b,
                None => continue,
            };
            for (i_ant, &ant) in antennas.iter().enumerate() {
                if ant == refant {
                    continue;
                }
                if let Some(d) = refant_delay(vq, refant, ant) {
                    sums[(i_ant, feed.index(), band)] += f64::from(d);
                    counts[(i_ant, feed.index(), band)] += 1;
                }
            }
        }
    }

    let (valid_from, valid_to) = range.bounds(vis.cycles[*run.last()].mjd);
    let mut solution = vec![];
    for (i_ant, &antenna) in antennas.iter().enumerate() {
        for feed in [Feed::X, Feed::Y] {
            for (band, &window_number) in calbands.iter().enumerate() {
                let n = counts[(i_ant, feed.index(), band)];
                if n == 0 {
                    continue;
                }
                let delay = sums[(i_ant, feed.index(), band)] / n as f64;
                solution.push(DelayModifier {
                    antenna,
                    window_number,
                    feed,
                    delay: delay as f32,
                    valid_from,
                    valid_to,
                });
            }
        }
    }
    if solution.is_empty() {
        return Err(CalibrationError::NoData);
    }
    debug!(
        "Delay solution against antenna {refant} over {} cycles: {} corrections",
        run.len(),
        solution.len()
    );
    Ok(solution)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClosureTriangle {
    pub ant1: u32,
    pub ant2: u32,
    /// `None` when any baseline of the triangle is missing or flagged.
    pub phase: Option<f32>,
}

/// The closure phases of one cycle, one window and one polarisation.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosureQuantities {
    pub window_number: u32,
    pub pol: Pol,
    pub mjd: f64,
    pub triangles: Vec<ClosureTriangle>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClosurePhases {
    pub refant: u32,
    /// `[cycle][if][pol]`, matching the shape of the data they came from.
    pub values: Vec<Vec<Vec<ClosureQuantities>>>,
}

/// The phase of baseline (x, y), where (y, x) is the negation of (x, y).
fn baseline_phase(vq: &VisQuantities, x: u32, y: u32) -> Option<f32> {
    if x == y {
        return None;
    }
    let bin = vq.baseline(baseline_number(x, y))?.bins.first()?;
    if bin.flagged {
        None
    } else if x < y {
        Some(bin.phase)
    } else {
        Some(-bin.phase)
    }
}

fn closure_phase(vq: &VisQuantities, refant: u32, a: u32, b: u32, units: PhaseUnits) -> Option<f32> {
    let ra = baseline_phase(vq, refant, a)?;
    let ab = baseline_phase(vq, a, b)?;
    let rb = baseline_phase(vq, refant, b)?;
    Some(units.wrap(ra + ab - rb))
}

fn closure_quantities(vq: &VisQuantities, antennas: &[u32], refant: u32, units: PhaseUnits) -> ClosureQuantities {
    let others: Vec<u32> = antennas.iter().copied().filter(|&a| a != refant).collect();
    let mut triangles = vec![];
    for (i, &a) in others.iter().enumerate() {
        for &b in &others[i + 1..] {
            triangles.push(ClosureTriangle {
                ant1: a,
                ant2: b,
                phase: closure_phase(vq, refant, a, b, units),
            });
        }
    }
    ClosureQuantities {
        window_number: vq.window_number,
        pol: vq.pol,
        mjd: vq.mjd,
        triangles,
    }
}

/// The closure phase of every triangle containing `refant`, for every
/// cycle, window and polarisation.
pub fn closure_phases(vis: &VisData, refant: u32) -> ClosurePhases {
    let units = vis.options.phase_units;
    let values = vis
        .cycles
        .iter()
        .enumerate()
        .map(|(c, cycle)| {
            let mut antennas: Vec<u32> = vis
                .header_of(c)
                .map(|h| h.antennas.iter().map(|a| a.number).collect())
                .unwrap_or_default();
            antennas.sort_unstable();
            cycle
                .windows
                .iter()
                .map(|pols| {
                    pols.iter()
                        .map(|vq| closure_quantities(vq, &antennas, refant, units))
                        .collect()
                })
                .collect()
        })
        .collect();
    ClosurePhases { refant, values }
}
