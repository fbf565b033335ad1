//! Encodings of the scan header, the options and the data products.

use std::rc::Rc;

use super::*;
use crate::{
    header::{Antenna, Feed, IfWindow, Pol, ScanHeader},
    options::{
        AmpPhaseOptions, AveragingMethod, DelayModifier, IfOptions, PhaseUnits, TsysMode,
    },
    products::{
        AmpPhase, BaselineSpectrum, BaselineVis, BinSpectrum, FilteredSpectrum, Limits,
        SpectrumData, SpectrumLimits, VisBin, VisCycle, VisData, VisQuantities,
    },
};

fn get_pol(rd: &mut &[u8]) -> Result<Pol, CodecError> {
    let code = get_uint(rd)?;
    u8::try_from(code)
        .ok()
        .and_then(Pol::from_code)
        .ok_or(CodecError::UnknownTag {
            what: "polarisation",
            tag: code,
        })
}

impl Encode for ScanHeader {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        put_str(buf, &self.obs_date, capacity::OBS_DATE)?;
        put_f64(buf, self.ut_seconds)?;
        put_f64(buf, self.mjd)?;
        put_str(buf, &self.source_name, capacity::SOURCE_NAME)?;
        put_str(buf, &self.obs_type, capacity::OBS_TYPE)?;
        put_f64(buf, self.cycle_time)?;

        put_len(buf, self.antennas.len())?;
        for a in &self.antennas {
            put_uint(buf, u64::from(a.number))?;
            put_str(buf, &a.name, capacity::ANTENNA_NAME)?;
            put_f64s(buf, &a.xyz)?;
        }

        put_len(buf, self.windows.len())?;
        for w in &self.windows {
            put_uint(buf, u64::from(w.number))?;
            put_f64(buf, w.centre_freq)?;
            put_f64(buf, w.bandwidth)?;
            put_uint(buf, w.num_channels as u64)?;
            put_len(buf, w.pols.len())?;
            for p in &w.pols {
                put_uint(buf, u64::from(p.code()))?;
            }
            for l in &w.labels {
                put_str(buf, l, capacity::WINDOW_LABEL)?;
            }
        }
        Ok(())
    }
}

impl Decode for ScanHeader {
    fn decode(rd: &mut &[u8]) -> Result<Self, CodecError> {
        let obs_date = get_str(rd, capacity::OBS_DATE)?;
        let ut_seconds = get_f64(rd)?;
        let mjd = get_f64(rd)?;
        let source_name = get_str(rd, capacity::SOURCE_NAME)?;
        let obs_type = get_str(rd, capacity::OBS_TYPE)?;
        let cycle_time = get_f64(rd)?;

        let n = get_struct_len(rd)?;
        let mut antennas = Vec::with_capacity(n);
        for _ in 0..n {
            let number = get_u32(rd)?;
            let name = get_str(rd, capacity::ANTENNA_NAME)?;
            let xyz = get_f64s(rd)?;
            let xyz: [f64; 3] = xyz.try_into().map_err(|v: Vec<f64>| CodecError::LengthMismatch {
                what: "antenna position",
                expected: 3,
                actual: v.len(),
            })?;
            antennas.push(Antenna { number, name, xyz });
        }

        let n = get_struct_len(rd)?;
        let mut windows = Vec::with_capacity(n);
        for _ in 0..n {
            let number = get_u32(rd)?;
            let centre_freq = get_f64(rd)?;
            let bandwidth = get_f64(rd)?;
            let num_channels = get_usize(rd)?;
            let num_pols = get_struct_len(rd)?;
            let pols = (0..num_pols)
                .map(|_| get_pol(rd))
                .collect::<Result<Vec<_>, _>>()?;
            let labels = [
                get_str(rd, capacity::WINDOW_LABEL)?,
                get_str(rd, capacity::WINDOW_LABEL)?,
                get_str(rd, capacity::WINDOW_LABEL)?,
            ];
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
}

impl Encode for AmpPhaseOptions {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        put_sint(
            buf,
            match self.phase_units {
                PhaseUnits::Radians => 0,
                PhaseUnits::Degrees => 1,
            },
        )?;
        put_bool(buf, self.include_flagged)?;
        put_sint(buf, self.tsys_mode.code())?;

        put_len(buf, self.windows.len())?;
        for w in &self.windows {
            put_f64(buf, w.centre_freq)?;
            put_f64(buf, w.bandwidth)?;
            put_uint(buf, w.num_channels as u64)?;
            put_uint(buf, w.min_tvchannel as u64)?;
            put_uint(buf, w.max_tvchannel as u64)?;
            put_uint(buf, w.delay_averaging as u64)?;
            put_sint(buf, w.averaging.code())?;
        }

        put_len(buf, self.delay_modifiers.len())?;
        for m in &self.delay_modifiers {
            put_uint(buf, u64::from(m.antenna))?;
            put_uint(buf, u64::from(m.window_number))?;
            put_uint(buf, m.feed.index() as u64)?;
            put_f32(buf, m.delay)?;
            put_f64(buf, m.valid_from)?;
            put_f64(buf, m.valid_to)?;
        }
        Ok(())
    }
}

impl Decode for AmpPhaseOptions {
    fn decode(rd: &mut &[u8]) -> Result<Self, CodecError> {
        let phase_units = match get_sint(rd)? {
            0 => PhaseUnits::Radians,
            1 => PhaseUnits::Degrees,
            tag => {
                return Err(CodecError::UnknownTag {
                    what: "phase units",
                    tag: tag as u64,
                })
            }
        };
        let include_flagged = get_bool(rd)?;
        let code = get_sint(rd)?;
        let tsys_mode = TsysMode::from_code(code).ok_or(CodecError::UnknownTag {
            what: "tsys mode",
            tag: code as u64,
        })?;

        let n = get_struct_len(rd)?;
        let mut windows = Vec::with_capacity(n);
        for _ in 0..n {
            let centre_freq = get_f64(rd)?;
            let bandwidth = get_f64(rd)?;
            let num_channels = get_usize(rd)?;
            let min_tvchannel = get_usize(rd)?;
            let max_tvchannel = get_usize(rd)?;
            let delay_averaging = get_usize(rd)?;
            let code = get_sint(rd)?;
            let averaging = AveragingMethod::from_code(code).ok_or(CodecError::UnknownTag {
                what: "averaging method",
                tag: code as u64,
            })?;
            windows.push(IfOptions {
                centre_freq,
                bandwidth,
                num_channels,
                min_tvchannel,
                max_tvchannel,
                delay_averaging,
                averaging,
            });
        }

        let n = get_struct_len(rd)?;
        let mut delay_modifiers = Vec::with_capacity(n);
        for _ in 0..n {
            let antenna = get_u32(rd)?;
            let window_number = get_u32(rd)?;
            let code = get_usize(rd)?;
            let feed = Feed::from_index(code).ok_or(CodecError::UnknownTag {
                what: "feed",
                tag: code as u64,
            })?;
            delay_modifiers.push(DelayModifier {
                antenna,
                window_number,
                feed,
                delay: get_f32(rd)?,
                valid_from: get_f64(rd)?,
                valid_to: get_f64(rd)?,
            });
        }

        Ok(AmpPhaseOptions {
            phase_units,
            include_flagged,
            tsys_mode,
            windows,
            delay_modifiers,
        })
    }
}

fn put_limits(buf: &mut Vec<u8>, l: &Limits) -> Result<(), CodecError> {
    put_f32(buf, l.min)?;
    put_f32(buf, l.max)
}

fn get_limits(rd: &mut &[u8]) -> Result<Limits, CodecError> {
    Ok(Limits {
        min: get_f32(rd)?,
        max: get_f32(rd)?,
    })
}

fn put_spectrum_limits(buf: &mut Vec<u8>, l: &SpectrumLimits) -> Result<(), CodecError> {
    put_limits(buf, &l.amplitude)?;
    put_limits(buf, &l.phase)?;
    put_limits(buf, &l.real)?;
    put_limits(buf, &l.imag)
}

fn get_spectrum_limits(rd: &mut &[u8]) -> Result<SpectrumLimits, CodecError> {
    Ok(SpectrumLimits {
        amplitude: get_limits(rd)?,
        phase: get_limits(rd)?,
        real: get_limits(rd)?,
        imag: get_limits(rd)?,
    })
}

/// An [`AmpPhase`] without its options; those travel once with the
/// container.
pub fn encode_ampphase(buf: &mut Vec<u8>, a: &AmpPhase) -> Result<(), CodecError> {
    put_uint(buf, a.window as u64)?;
    put_uint(buf, u64::from(a.window_number))?;
    put_uint(buf, u64::from(a.pol.code()))?;
    put_str(buf, &a.obs_date, capacity::OBS_DATE)?;
    put_f64(buf, a.ut_seconds)?;
    put_f64(buf, a.mjd)?;
    put_f32s(buf, &a.channel)?;
    put_f32s(buf, &a.frequency)?;

    put_len(buf, a.baselines.len())?;
    for b in &a.baselines {
        put_uint(buf, u64::from(b.baseline))?;
        put_len(buf, b.bins.len())?;
        for bin in &b.bins {
            put_f32s(buf, &bin.amplitude)?;
            put_f32s(buf, &bin.phase)?;
            put_complexes(buf, &bin.raw)?;
            put_bools(buf, &bin.flagged)?;
            let f = &bin.filtered;
            put_f32s(buf, &f.channel)?;
            put_f32s(buf, &f.frequency)?;
            put_f32s(buf, &f.amplitude)?;
            put_f32s(buf, &f.phase)?;
            put_complexes(buf, &f.raw)?;
        }
        put_spectrum_limits(buf, &b.limits)?;
    }
    put_spectrum_limits(buf, &a.limits)
}

pub fn decode_ampphase(
    rd: &mut &[u8],
    options: &Rc<AmpPhaseOptions>,
) -> Result<AmpPhase, CodecError> {
    let window = get_usize(rd)?;
    let window_number = get_u32(rd)?;
    let pol = get_pol(rd)?;
    let obs_date = get_str(rd, capacity::OBS_DATE)?;
    let ut_seconds = get_f64(rd)?;
    let mjd = get_f64(rd)?;
    let channel = get_f32s(rd)?;
    let frequency = get_f32s(rd)?;

    let n = get_struct_len(rd)?;
    let mut baselines = Vec::with_capacity(n);
    for _ in 0..n {
        let baseline = get_u32(rd)?;
        let num_bins = get_struct_len(rd)?;
        let mut bins = Vec::with_capacity(num_bins);
        for _ in 0..num_bins {
            bins.push(BinSpectrum {
                amplitude: get_f32s(rd)?,
                phase: get_f32s(rd)?,
                raw: get_complexes(rd)?,
                flagged: get_bools(rd)?,
                filtered: FilteredSpectrum {
                    channel: get_f32s(rd)?,
                    frequency: get_f32s(rd)?,
                    amplitude: get_f32s(rd)?,
                    phase: get_f32s(rd)?,
                    raw: get_complexes(rd)?,
                },
            });
        }
        baselines.push(BaselineSpectrum {
            baseline,
            bins,
            limits: get_spectrum_limits(rd)?,
        });
    }

    let a = AmpPhase {
        window,
        window_number,
        pol,
        obs_date,
        ut_seconds,
        mjd,
        channel,
        frequency,
        baselines,
        limits: get_spectrum_limits(rd)?,
        options: options.clone(),
    };
    a.check_shape()?;
    Ok(a)
}

/// A [`VisQuantities`] without its options.
pub fn encode_vis_quantities(buf: &mut Vec<u8>, v: &VisQuantities) -> Result<(), CodecError> {
    put_uint(buf, v.window as u64)?;
    put_uint(buf, u64::from(v.window_number))?;
    put_uint(buf, u64::from(v.pol.code()))?;
    put_str(buf, &v.obs_date, capacity::OBS_DATE)?;
    put_f64(buf, v.ut_seconds)?;
    put_f64(buf, v.mjd)?;
    put_len(buf, v.baselines.len())?;
    for b in &v.baselines {
        put_uint(buf, u64::from(b.baseline))?;
        put_len(buf, b.bins.len())?;
        for bin in &b.bins {
            put_f32(buf, bin.amplitude)?;
            put_f32(buf, bin.phase)?;
            put_f32(buf, bin.delay)?;
            put_bool(buf, bin.flagged)?;
        }
    }
    put_limits(buf, &v.amplitude)?;
    put_limits(buf, &v.phase)?;
    put_limits(buf, &v.delay)
}

pub fn decode_vis_quantities(
    rd: &mut &[u8],
    options: &Rc<AmpPhaseOptions>,
) -> Result<VisQuantities, CodecError> {
    let window = get_usize(rd)?;
    let window_number = get_u32(rd)?;
    let pol = get_pol(rd)?;
    let obs_date = get_str(rd, capacity::OBS_DATE)?;
    let ut_seconds = get_f64(rd)?;
    let mjd = get_f64(rd)?;
    let n = get_struct_len(rd)?;
    let mut baselines = Vec::with_capacity(n);
    for _ in 0..n {
        let baseline = get_u32(rd)?;
        let num_bins = get_struct_len(rd)?;
        let mut bins = Vec::with_capacity(num_bins);
        for _ in 0..num_bins {
            bins.push(VisBin {
                amplitude: get_f32(rd)?,
                phase: get_f32(rd)?,
                delay: get_f32(rd)?,
                flagged: get_bool(rd)?,
            });
        }
        baselines.push(BaselineVis { baseline, bins });
    }
    Ok(VisQuantities {
        window,
        window_number,
        pol,
        obs_date,
        ut_seconds,
        mjd,
        baselines,
        amplitude: get_limits(rd)?,
        phase: get_limits(rd)?,
        delay: get_limits(rd)?,
        options: options.clone(),
    })
}

impl Encode for SpectrumData {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        self.options.encode(buf)?;
        self.header.encode(buf)?;
        put_len(buf, self.spectra.len())?;
        for pols in &self.spectra {
            put_uint(buf, pols.len() as u64)?;
        }
        for a in self.spectra.iter().flatten() {
            encode_ampphase(buf, a)?;
        }
        Ok(())
    }
}

impl Decode for SpectrumData {
    fn decode(rd: &mut &[u8]) -> Result<Self, CodecError> {
        let options = Rc::new(AmpPhaseOptions::decode(rd)?);
        let header = ScanHeader::decode(rd)?;
        let num_ifs = get_len(rd, MIN_TOKEN)?;
        let num_pols = (0..num_ifs)
            .map(|_| get_usize(rd))
            .collect::<Result<Vec<_>, _>>()?;
        let mut spectra = Vec::with_capacity(num_ifs);
        for n in num_pols {
            let pols = (0..n)
                .map(|_| decode_ampphase(rd, &options))
                .collect::<Result<Vec<_>, _>>()?;
            spectra.push(pols);
        }
        let s = SpectrumData {
            header,
            spectra,
            options,
        };
        s.check_shape()?;
        Ok(s)
    }
}

impl Encode for VisData {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        self.options.encode(buf)?;

        put_len(buf, self.headers.len())?;
        for h in &self.headers {
            h.encode(buf)?;
        }

        // The shape tables: IFs per cycle, then pols per IF per cycle.
        put_len(buf, self.cycles.len())?;
        for c in &self.cycles {
            put_uint(buf, c.windows.len() as u64)?;
        }
        for c in &self.cycles {
            put_len(buf, c.windows.len())?;
            for pols in &c.windows {
                put_uint(buf, pols.len() as u64)?;
            }
        }

        for c in &self.cycles {
            put_uint(buf, c.header as u64)?;
            put_f64(buf, c.mjd)?;
            for v in c.windows.iter().flatten() {
                encode_vis_quantities(buf, v)?;
            }
        }
        Ok(())
    }
}

impl Decode for VisData {
    fn decode(rd: &mut &[u8]) -> Result<Self, CodecError> {
        let options = Rc::new(AmpPhaseOptions::decode(rd)?);

        let n = get_struct_len(rd)?;
        let headers = (0..n)
            .map(|_| ScanHeader::decode(rd))
            .collect::<Result<Vec<_>, _>>()?;

        let num_cycles = get_len(rd, MIN_TOKEN)?;
        let num_ifs = (0..num_cycles)
            .map(|_| get_usize(rd))
            .collect::<Result<Vec<_>, _>>()?;
        let mut num_pols = Vec::with_capacity(num_cycles);
        for &n in &num_ifs {
            get_exact_len(rd, MIN_TOKEN, "pol count table", n)?;
            let pols = (0..n)
                .map(|_| get_usize(rd))
                .collect::<Result<Vec<_>, _>>()?;
            num_pols.push(pols);
        }

        let mut cycles = Vec::with_capacity(num_cycles);
        for pols_per_if in num_pols {
            let header = get_usize(rd)?;
            let mjd = get_f64(rd)?;
            let mut windows = Vec::with_capacity(pols_per_if.len());
            for n in pols_per_if {
                let pols = (0..n)
                    .map(|_| decode_vis_quantities(rd, &options))
                    .collect::<Result<Vec<_>, _>>()?;
                windows.push(pols);
            }
            cycles.push(VisCycle {
                header,
                mjd,
                windows,
            });
        }

        let v = VisData {
            headers,
            cycles,
            options,
        };
        v.check_shape()?;
        Ok(v)
    }
}
