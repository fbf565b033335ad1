//! Turning typed lines into commands.

use std::{path::PathBuf, str::FromStr};

use thiserror::Error;

use super::panels::PanelKind;
use crate::{
    calibration::DelayRange,
    options::{AveragingMethod, Combination, PhaseUnits, Statistic, TsysMode},
};

/// Every command word and the number of characters needed to recognise it.
pub const COMMANDS: &[(&str, usize)] = &[
    ("select", 3),
    ("array", 3),
    ("history", 4),
    ("scale", 3),
    ("calband", 3),
    ("sort", 2),
    ("refant", 3),
    ("nncal", 3),
    ("dcal", 2),
    ("reset", 3),
    ("dump", 2),
    ("tvchannel", 2),
    ("average", 3),
    ("delavg", 2),
    ("tsys", 2),
    ("flagging", 2),
    ("units", 2),
    ("describe", 2),
    ("print", 2),
    ("closure", 2),
    ("spectrum", 2),
    ("quit", 1),
    ("exit", 2),
];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    Unknown(String),

    #[error("'{word}' could be any of: {}", candidates.join(", "))]
    Ambiguous {
        word: String,
        candidates: Vec<&'static str>,
    },

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("'{0}' isn't a valid value")]
    BadValue(String),
}

/// How baselines are ordered in the panels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Shortest first.
    Length,
    /// By baseline number.
    Number,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Polarisations, panels and IF labels to display.
    Select(Vec<String>),
    Array(Vec<u32>),
    /// \[minutes\]
    History(f64),
    Scale {
        panel: PanelKind,
        /// `None` goes back to the data's own range.
        range: Option<(f32, f32)>,
    },
    Calband([u32; 2]),
    Sort(SortOrder),
    Refant(u32),
    Nncal(usize),
    Dcal(DelayRange),
    ResetDelays,
    Dump(PathBuf),
    TvChannel {
        band: String,
        min: usize,
        max: usize,
    },
    Average {
        band: String,
        method: AveragingMethod,
    },
    DelayAveraging {
        band: String,
        factor: usize,
    },
    Tsys(TsysMode),
    Flagging { include: bool },
    Units(PhaseUnits),
    Describe,
    Print,
    Closure(Option<u32>),
    Spectrum(f64),
    Quit,
}

/// Split a line into words. Commas separate words as well as spaces.
pub fn tokenise(line: &str) -> Vec<String> {
    line.replace(',', " ")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Does `word` abbreviate `command`, using at least `k` characters?
pub fn minmatch(word: &str, command: &str, k: usize) -> bool {
    word.len() >= k && command.starts_with(word)
}

/// The single command `word` abbreviates. An exact match always wins.
pub fn match_command(word: &str) -> Result<&'static str, CommandError> {
    let word = word.to_ascii_lowercase();
    if let Some((c, _)) = COMMANDS.iter().find(|(c, _)| *c == word) {
        return Ok(*c);
    }
    let candidates: Vec<&'static str> = COMMANDS
        .iter()
        .filter(|(c, k)| minmatch(&word, c, *k))
        .map(|(c, _)| *c)
        .collect();
    match candidates.as_slice() {
        [] => Err(CommandError::Unknown(word)),
        [c] => Ok(*c),
        _ => Err(CommandError::Ambiguous { word, candidates }),
    }
}

fn number<T: FromStr>(word: &str) -> Result<T, CommandError> {
    word.parse()
        .map_err(|_| CommandError::BadValue(word.to_string()))
}

/// Match `word` against a short list of keywords, allowing abbreviations of
/// at least `k` characters.
fn keyword<'a>(word: &str, choices: &[&'a str], k: usize) -> Option<&'a str> {
    let word = word.to_ascii_lowercase();
    choices.iter().copied().find(|c| minmatch(&word, c, k))
}

impl FromStr for PanelKind {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match keyword(s, &["amplitude", "phase", "delay", "closure"], 1) {
            Some("amplitude") => Ok(PanelKind::Amplitude),
            Some("phase") => Ok(PanelKind::Phase),
            Some("delay") => Ok(PanelKind::Delay),
            Some("closure") => Ok(PanelKind::ClosurePhase),
            _ => Err(CommandError::BadValue(s.to_string())),
        }
    }
}

/// Parse a line. Empty lines give `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>, CommandError> {
    let words = tokenise(line);
    let (first, args) = match words.split_first() {
        Some(s) => s,
        None => return Ok(None),
    };

    let command = match match_command(first)? {
        "select" => {
            if args.is_empty() {
                return Err(CommandError::Usage("select <pol|panel|if>..."));
            }
            Command::Select(args.iter().map(|a| a.to_ascii_lowercase()).collect())
        }

        "array" => {
            if args.is_empty() {
                return Err(CommandError::Usage("array <antenna>..."));
            }
            let mut antennas = vec![];
            for a in args {
                // "array 1234" means antennas 1, 2, 3 and 4.
                if a.len() > 1 && a.chars().all(|c| c.is_ascii_digit()) {
                    antennas.extend(a.chars().filter_map(|c| c.to_digit(10)));
                } else {
                    antennas.push(number(a)?);
                }
            }
            Command::Array(antennas)
        }

        "history" => match args {
            [m] => {
                let minutes: f64 = number(m)?;
                if !(minutes > 0.0) || !minutes.is_finite() {
                    return Err(CommandError::BadValue(m.clone()));
                }
                Command::History(minutes)
            }
            _ => return Err(CommandError::Usage("history <minutes>")),
        },

        "scale" => match args {
            [p, d] if keyword(d, &["default"], 3).is_some() => Command::Scale {
                panel: p.parse()?,
                range: None,
            },
            [p, lo, hi] => {
                let (lo, hi): (f32, f32) = (number(lo)?, number(hi)?);
                if lo >= hi {
                    return Err(CommandError::Usage("scale <panel> <min> <max>, with min < max"));
                }
                Command::Scale {
                    panel: p.parse()?,
                    range: Some((lo, hi)),
                }
            }
            _ => return Err(CommandError::Usage("scale <panel> <min> <max> | default")),
        },

        "calband" => match args {
            [a, b] => Command::Calband([number(a)?, number(b)?]),
            _ => return Err(CommandError::Usage("calband <window> <window>")),
        },

        "sort" => match args.first().and_then(|a| keyword(a, &["length", "number"], 1)) {
            Some("length") => Command::Sort(SortOrder::Length),
            Some(_) => Command::Sort(SortOrder::Number),
            None => return Err(CommandError::Usage("sort length|number")),
        },

        "refant" => match args {
            [a] => Command::Refant(number(a)?),
            _ => return Err(CommandError::Usage("refant <antenna>")),
        },

        "nncal" => match args {
            [n] => {
                let n: usize = number(n)?;
                if n == 0 {
                    return Err(CommandError::BadValue("0".to_string()));
                }
                Command::Nncal(n)
            }
            _ => return Err(CommandError::Usage("nncal <cycles>")),
        },

        "dcal" => match args {
            [] => Command::Dcal(DelayRange::All),
            [r] => Command::Dcal(
                DelayRange::from_word(&r.to_ascii_lowercase())
                    .ok_or_else(|| CommandError::BadValue(r.clone()))?,
            ),
            _ => return Err(CommandError::Usage("dcal [before|after|all]")),
        },

        "reset" => match args {
            [w] if keyword(w, &["delays"], 3).is_some() => Command::ResetDelays,
            _ => return Err(CommandError::Usage("reset delays")),
        },

        "dump" => match args {
            [f] => Command::Dump(PathBuf::from(f)),
            _ => return Err(CommandError::Usage("dump <file>")),
        },

        "tvchannel" => match args {
            [band, min, max] => {
                let (min, max): (usize, usize) = (number(min)?, number(max)?);
                if min == 0 || min > max {
                    return Err(CommandError::Usage(
                        "tvchannel <if> <min> <max>, with 1 <= min <= max",
                    ));
                }
                Command::TvChannel {
                    band: band.to_ascii_lowercase(),
                    min,
                    max,
                }
            }
            _ => return Err(CommandError::Usage("tvchannel <if> <min> <max>")),
        },

        "average" => {
            let usage = CommandError::Usage("average <if> mean|median scalar|vector");
            match args {
                [band, s, c] => {
                    let statistic = match keyword(s, &["mean", "median"], 3) {
                        Some("mean") => Statistic::Mean,
                        Some(_) => Statistic::Median,
                        None => return Err(usage),
                    };
                    let combination = match keyword(c, &["scalar", "vector"], 1) {
                        Some("scalar") => Combination::Scalar,
                        Some(_) => Combination::Vector,
                        None => return Err(usage),
                    };
                    Command::Average {
                        band: band.to_ascii_lowercase(),
                        method: AveragingMethod {
                            statistic,
                            combination,
                        },
                    }
                }
                _ => return Err(usage),
            }
        }

        "delavg" => match args {
            [band, n] => {
                let factor: usize = number(n)?;
                if factor == 0 {
                    return Err(CommandError::BadValue(n.clone()));
                }
                Command::DelayAveraging {
                    band: band.to_ascii_lowercase(),
                    factor,
                }
            }
            _ => return Err(CommandError::Usage("delavg <if> <channels>")),
        },

        "tsys" => match args
            .first()
            .and_then(|a| keyword(a, &["online", "reverse", "computed"], 1))
        {
            Some("online") => Command::Tsys(TsysMode::AsRecorded),
            Some("reverse") => Command::Tsys(TsysMode::ReverseOnline),
            Some(_) => Command::Tsys(TsysMode::Computed),
            None => return Err(CommandError::Usage("tsys online|reverse|computed")),
        },

        "flagging" => match args
            .first()
            .and_then(|a| keyword(a, &["include", "exclude"], 1))
        {
            Some("include") => Command::Flagging { include: true },
            Some(_) => Command::Flagging { include: false },
            None => return Err(CommandError::Usage("flagging include|exclude")),
        },

        "units" => match args
            .first()
            .and_then(|a| keyword(a, &["degrees", "radians"], 1))
        {
            Some("degrees") => Command::Units(PhaseUnits::Degrees),
            Some(_) => Command::Units(PhaseUnits::Radians),
            None => return Err(CommandError::Usage("units degrees|radians")),
        },

        "describe" => Command::Describe,
        "print" => Command::Print,

        "closure" => match args {
            [] => Command::Closure(None),
            [a] => Command::Closure(Some(number(a)?)),
            _ => return Err(CommandError::Usage("closure [refant]")),
        },

        "spectrum" => match args {
            [t] => Command::Spectrum(number(t)?),
            _ => return Err(CommandError::Usage("spectrum <mjd>")),
        },

        "quit" | "exit" => Command::Quit,

        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}
