//! Streaming and viewing of interferometer visibilities.
//!
//! A server ([`server`]) reduces archives of correlator cycles into
//! channel-averaged products and streams them to viewers ([`viewer`]) over a
//! framed binary protocol ([`codec`]).

pub mod averaging;
pub mod calibration;
pub mod codec;
pub mod header;
pub mod index;
pub mod net;
pub mod options;
pub mod products;
pub mod read;
pub mod reduce;
pub mod server;
pub mod viewer;

use rand::{distributions::Alphanumeric, Rng};

/// The port the server listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 8880;

/// Client ids are this many alphanumeric characters.
pub const CLIENT_ID_LENGTH: usize = 20;

/// What the server is serving data from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    RealInstrument,
    Simulator,
}

impl ServerType {
    pub fn code(self) -> u64 {
        match self {
            ServerType::RealInstrument => 1,
            ServerType::Simulator => 2,
        }
    }

    pub fn from_code(code: u64) -> Option<ServerType> {
        match code {
            1 => Some(ServerType::RealInstrument),
            2 => Some(ServerType::Simulator),
            _ => None,
        }
    }
}

/// Log to stdout. Each `-v` lowers the level; three or more also print
/// where each message came from.
pub fn setup_logging(verbosity: u8) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.target(env_logger::Target::Stdout);
    builder.format_target(false);
    match verbosity {
        0 => builder.filter_level(log::LevelFilter::Info),
        1 => builder.filter_level(log::LevelFilter::Debug),
        2 => builder.filter_level(log::LevelFilter::Trace),
        _ => {
            builder.filter_level(log::LevelFilter::Trace);
            builder.format(|buf, record| {
                use std::io::Write;

                let timestamp = buf.timestamp();
                let level = record.level();
                let target = record.target();
                let line = record.line().unwrap_or(0);
                let message = record.args();

                writeln!(buf, "[{timestamp} {level} {target}:{line}] {message}")
            })
        }
    };
    builder.init();
}

/// A new random client id.
pub fn generate_client_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CLIENT_ID_LENGTH)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ids() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert_eq!(a.len(), CLIENT_ID_LENGTH);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
