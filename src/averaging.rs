//! Averaging spectra across channels.

use std::f32::consts::TAU;

use num_complex::Complex32;

use crate::{
    options::{Combination, IfOptions, PhaseUnits, Statistic},
    products::{AmpPhase, BaselineVis, BinSpectrum, Limits, VisBin, VisQuantities},
};

/// The median of some values. Even counts take the mean of the middle two.
pub(crate) fn median(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    let mut v = values.to_vec();
    v.sort_unstable_by(f32::total_cmp);
    let mid = v.len() / 2;
    if v.len() % 2 == 0 {
        Some((v[mid - 1] + v[mid]) / 2.0)
    } else {
        Some(v[mid])
    }
}

fn mean(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f32>() / values.len() as f32)
    }
}

fn statistic(statistic: Statistic, values: &[f32]) -> Option<f32> {
    match statistic {
        Statistic::Mean => mean(values),
        Statistic::Median => median(values),
    }
}

/// Wrap a phase in radians into (-π, π].
fn wrap_radians(phase: f32) -> f32 {
    PhaseUnits::Radians.wrap(phase)
}

/// Measure a delay \[ns\] from complex values at frequencies \[MHz\].
///
/// Adjacent values are combined `delay_averaging` at a time, then the phase
/// differences between consecutive combined values are wrapped, divided by
/// their frequency separation and averaged. Fewer than two combined values
/// can't give a delay, and give 0.
pub fn measure_delay(frequency: &[f32], vis: &[Complex32], delay_averaging: usize) -> f32 {
    let groups: Vec<(f32, Complex32)> = frequency
        .chunks(delay_averaging.max(1))
        .zip(vis.chunks(delay_averaging.max(1)))
        .map(|(f, v)| {
            let n = f.len() as f32;
            (
                f.iter().sum::<f32>() / n,
                v.iter().sum::<Complex32>() / n,
            )
        })
        .collect();

    let slopes: Vec<f32> = groups
        .windows(2)
        .filter_map(|w| {
            let (f1, z1) = w[0];
            let (f2, z2) = w[1];
            let df = f2 - f1;
            if df == 0.0 {
                None
            } else {
                Some(wrap_radians(z2.arg() - z1.arg()) / df)
            }
        })
        .collect();
    match mean(&slopes) {
        // radians per MHz -> ns
        Some(slope) => slope / TAU * 1e3,
        None => 0.0,
    }
}

fn average_bin(bin: &BinSpectrum, options: &IfOptions, units: PhaseUnits) -> VisBin {
    let f = &bin.filtered;
    let mut amplitude = vec![];
    let mut phase = vec![];
    let mut frequency = vec![];
    let mut raw = vec![];
    for i in 0..f.len() {
        if options.in_tvchannels(f.channel[i] as usize) {
            amplitude.push(f.amplitude[i]);
            phase.push(f.phase[i]);
            frequency.push(f.frequency[i]);
            raw.push(f.raw[i]);
        }
    }
    if amplitude.is_empty() {
        return VisBin {
            amplitude: 0.0,
            phase: 0.0,
            delay: 0.0,
            flagged: true,
        };
    }

    let method = options.averaging;
    let (amplitude, phase) = match method.combination {
        Combination::Scalar => (
            statistic(method.statistic, &amplitude).unwrap_or_default(),
            statistic(method.statistic, &phase).unwrap_or_default(),
        ),
        Combination::Vector => {
            let re: Vec<f32> = raw.iter().map(|z| z.re).collect();
            let im: Vec<f32> = raw.iter().map(|z| z.im).collect();
            let z = Complex32::new(
                statistic(method.statistic, &re).unwrap_or_default(),
                statistic(method.statistic, &im).unwrap_or_default(),
            );
            (z.norm(), units.from_radians(z.arg()))
        }
    };

    VisBin {
        amplitude,
        phase,
        delay: measure_delay(&frequency, &raw, options.delay_averaging),
        flagged: false,
    }
}

/// Average a spectrum over its tv-channel window.
pub fn average_ampphase(ampphase: &AmpPhase, options: &IfOptions, units: PhaseUnits) -> VisQuantities {
    let baselines = ampphase
        .baselines
        .iter()
        .map(|b| BaselineVis {
            baseline: b.baseline,
            bins: b
                .bins
                .iter()
                .map(|bin| average_bin(bin, options, units))
                .collect(),
        })
        .collect();
    let mut vis = VisQuantities {
        window: ampphase.window,
        window_number: ampphase.window_number,
        pol: ampphase.pol,
        obs_date: ampphase.obs_date.clone(),
        ut_seconds: ampphase.ut_seconds,
        mjd: ampphase.mjd,
        baselines,
        amplitude: Limits::EMPTY,
        phase: Limits::EMPTY,
        delay: Limits::EMPTY,
        options: ampphase.options.clone(),
    };
    vis.update_limits();
    vis
}
