//! The free parameters of a reduction.

use std::fmt;

use thiserror::Error;

use crate::header::{Feed, IfWindow, ScanHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseUnits {
    Radians,
    Degrees,
}

impl PhaseUnits {
    /// Convert a phase in radians to these units.
    pub fn from_radians(self, phase: f32) -> f32 {
        match self {
            PhaseUnits::Radians => phase,
            PhaseUnits::Degrees => phase.to_degrees(),
        }
    }

    /// Half of a full turn in these units.
    pub fn half_turn(self) -> f32 {
        match self {
            PhaseUnits::Radians => std::f32::consts::PI,
            PhaseUnits::Degrees => 180.0,
        }
    }

    /// Wrap a phase into (-half turn, half turn].
    pub fn wrap(self, phase: f32) -> f32 {
        let half = self.half_turn();
        let full = 2.0 * half;
        let mut p = (phase + half).rem_euclid(full) - half;
        if p <= -half {
            p += full;
        }
        p
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    Mean,
    Median,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combination {
    /// Average amplitudes and phases separately.
    Scalar,
    /// Average the complex values, then take amplitude and phase.
    Vector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AveragingMethod {
    pub statistic: Statistic,
    pub combination: Combination,
}

impl AveragingMethod {
    const MEAN: i64 = 1;
    const MEDIAN: i64 = 2;
    const SCALAR: i64 = 4;
    const VECTOR: i64 = 8;

    /// The wire code: a bitmask of statistic and combination.
    pub fn code(self) -> i64 {
        let s = match self.statistic {
            Statistic::Mean => Self::MEAN,
            Statistic::Median => Self::MEDIAN,
        };
        let c = match self.combination {
            Combination::Scalar => Self::SCALAR,
            Combination::Vector => Self::VECTOR,
        };
        s | c
    }

    pub fn from_code(code: i64) -> Option<AveragingMethod> {
        let statistic = match code & (Self::MEAN | Self::MEDIAN) {
            Self::MEAN => Statistic::Mean,
            Self::MEDIAN => Statistic::Median,
            _ => return None,
        };
        let combination = match code & (Self::SCALAR | Self::VECTOR) {
            Self::SCALAR => Combination::Scalar,
            Self::VECTOR => Combination::Vector,
            _ => return None,
        };
        Some(AveragingMethod {
            statistic,
            combination,
        })
    }
}

impl Default for AveragingMethod {
    fn default() -> Self {
        AveragingMethod {
            statistic: Statistic::Mean,
            combination: Combination::Scalar,
        }
    }
}

impl fmt::Display for AveragingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self.statistic {
            Statistic::Mean => "mean",
            Statistic::Median => "median",
        };
        let c = match self.combination {
            Combination::Scalar => "scalar",
            Combination::Vector => "vector",
        };
        write!(f, "{c} {s}")
    }
}

/// How system temperatures are applied to the raw correlations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsysMode {
    /// Leave the data as the correlator recorded it.
    AsRecorded,
    /// Undo the online system temperature scaling.
    ReverseOnline,
    /// Replace the online scaling with the computed system temperatures.
    Computed,
}

impl TsysMode {
    pub fn code(self) -> i64 {
        match self {
            TsysMode::AsRecorded => 0,
            TsysMode::ReverseOnline => 1,
            TsysMode::Computed => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<TsysMode> {
        match code {
            0 => Some(TsysMode::AsRecorded),
            1 => Some(TsysMode::ReverseOnline),
            2 => Some(TsysMode::Computed),
            _ => None,
        }
    }
}

/// Reduction settings for one IF window. Windows are identified by their
/// frequency setup, so the same settings follow a window across scans.
#[derive(Debug, Clone, PartialEq)]
pub struct IfOptions {
    pub centre_freq: f64,
    pub bandwidth: f64,
    pub num_channels: usize,

    /// First channel of the tv-channel window (1-based, inclusive).
    pub min_tvchannel: usize,

    /// Last channel of the tv-channel window (1-based, inclusive).
    pub max_tvchannel: usize,

    /// The number of adjacent channels combined before measuring delays.
    pub delay_averaging: usize,

    pub averaging: AveragingMethod,
}

impl IfOptions {
    /// The defaults for a window: the central half of the band, no delay
    /// averaging, scalar means.
    pub fn default_for(window: &IfWindow) -> IfOptions {
        let (min_tvchannel, max_tvchannel) = default_tvchannels(window.num_channels);
        IfOptions {
            centre_freq: window.centre_freq,
            bandwidth: window.bandwidth,
            num_channels: window.num_channels,
            min_tvchannel,
            max_tvchannel,
            delay_averaging: 1,
            averaging: AveragingMethod::default(),
        }
    }

    pub fn matches(&self, window: &IfWindow) -> bool {
        self.num_channels == window.num_channels
            && (self.centre_freq - window.centre_freq).abs() < 1e-6
            && (self.bandwidth - window.bandwidth).abs() < 1e-6
    }

    /// Is this (1-based) channel inside the tv-channel window?
    pub fn in_tvchannels(&self, chan: usize) -> bool {
        (self.min_tvchannel..=self.max_tvchannel).contains(&chan)
    }
}

fn default_tvchannels(num_channels: usize) -> (usize, usize) {
    if num_channels <= 4 {
        (1, num_channels.max(1))
    } else {
        (num_channels / 4 + 1, 3 * num_channels / 4)
    }
}

/// A delay correction for one antenna feed in one window, valid over a time
/// range.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayModifier {
    pub antenna: u32,
    pub window_number: u32,
    pub feed: Feed,
    /// \[ns\]
    pub delay: f32,
    /// MJD; may be negative infinity.
    pub valid_from: f64,
    /// MJD; may be infinity.
    pub valid_to: f64,
}

impl DelayModifier {
    pub fn applies(&self, antenna: u32, window_number: u32, feed: Feed, mjd: f64) -> bool {
        self.antenna == antenna
            && self.window_number == window_number
            && self.feed == feed
            && mjd >= self.valid_from
            && mjd <= self.valid_to
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AmpPhaseOptions {
    pub phase_units: PhaseUnits,

    /// Keep flagged channels in the filtered products.
    pub include_flagged: bool,

    pub tsys_mode: TsysMode,

    pub windows: Vec<IfOptions>,

    pub delay_modifiers: Vec<DelayModifier>,
}

impl Default for AmpPhaseOptions {
    fn default() -> Self {
        AmpPhaseOptions {
            phase_units: PhaseUnits::Degrees,
            include_flagged: false,
            tsys_mode: TsysMode::AsRecorded,
            windows: vec![],
            delay_modifiers: vec![],
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum OptionsError {
    #[error("tv-channels {min}-{max} don't fit a window of {num_channels} channels")]
    TvChannels {
        min: usize,
        max: usize,
        num_channels: usize,
    },

    #[error("The delay correction for antenna {antenna} isn't a number")]
    Delay { antenna: u32 },
}

impl AmpPhaseOptions {
    /// Check the settings a client could have got wrong.
    pub fn validate(&self) -> Result<(), OptionsError> {
        // Windows without channels have nothing to average.
        for w in self.windows.iter().filter(|w| w.num_channels > 0) {
            if w.min_tvchannel == 0
                || w.min_tvchannel > w.max_tvchannel
                || w.max_tvchannel > w.num_channels
            {
                return Err(OptionsError::TvChannels {
                    min: w.min_tvchannel,
                    max: w.max_tvchannel,
                    num_channels: w.num_channels,
                });
            }
        }
        if let Some(m) = self.delay_modifiers.iter().find(|m| !m.delay.is_finite()) {
            return Err(OptionsError::Delay { antenna: m.antenna });
        }
        Ok(())
    }

    /// Add default settings for every window in the header that doesn't have
    /// any yet.
    pub fn ensure_windows(&mut self, header: &ScanHeader) {
        for window in &header.windows {
            if !self.windows.iter().any(|o| o.matches(window)) {
                self.windows.push(IfOptions::default_for(window));
            }
        }
    }

    /// The settings for a window, falling back to defaults.
    pub fn window_options(&self, window: &IfWindow) -> IfOptions {
        self.windows
            .iter()
            .find(|o| o.matches(window))
            .cloned()
            .unwrap_or_else(|| IfOptions::default_for(window))
    }

    pub fn window_options_mut(&mut self, window: &IfWindow) -> &mut IfOptions {
        let i = match self.windows.iter().position(|o| o.matches(window)) {
            Some(i) => i,
            None => {
                self.windows.push(IfOptions::default_for(window));
                self.windows.len() - 1
            }
        };
        &mut self.windows[i]
    }

    /// The total delay correction for an antenna feed at a time \[ns\].
    /// Overlapping modifiers add.
    pub fn delay_correction(&self, antenna: u32, window_number: u32, feed: Feed, mjd: f64) -> f32 {
        self.delay_modifiers
            .iter()
            .filter(|m| m.applies(antenna, window_number, feed, mjd))
            .map(|m| m.delay)
            .sum()
    }

    /// Human-readable lines describing these options.
    pub fn describe(&self) -> Vec<String> {
        let mut lines = vec![
            format!(
                "phase units: {}",
                match self.phase_units {
                    PhaseUnits::Radians => "radians",
                    PhaseUnits::Degrees => "degrees",
                }
            ),
            format!(
                "flagged data: {}",
                if self.include_flagged {
                    "included"
                } else {
                    "excluded"
                }
            ),
            format!(
                "tsys: {}",
                match self.tsys_mode {
                    TsysMode::AsRecorded => "as recorded",
                    TsysMode::ReverseOnline => "online reversed",
                    TsysMode::Computed => "computed",
                }
            ),
        ];
        for w in &self.windows {
            lines.push(format!(
                "window {:.3} MHz / {:.3} MHz x {}: tvchannels {}-{}, delay averaging {}, {}",
                w.centre_freq,
                w.bandwidth,
                w.num_channels,
                w.min_tvchannel,
                w.max_tvchannel,
                w.delay_averaging,
                w.averaging
            ));
        }
        for m in &self.delay_modifiers {
            lines.push(format!(
                "delay ant {} window {} {:?}: {:+.3} ns ({} to {})",
                m.antenna, m.window_number, m.feed, m.delay, m.valid_from, m.valid_to
            ));
        }
        lines
    }
}
