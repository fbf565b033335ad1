//! Dump files: a snapshot of a spectrum or of a whole time series, for
//! replaying without a server.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use log::debug;

use super::*;
use crate::products::{SpectrumData, VisData};

const MAGIC: &[u8; 8] = b"ATVISDMP";

#[derive(Debug, Clone, PartialEq)]
pub enum Dump {
    Spectrum(SpectrumData),
    Vis(VisData),
}

impl Encode for Dump {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        match self {
            Dump::Spectrum(s) => {
                put_preamble(buf, 1)?;
                s.encode(buf)
            }
            Dump::Vis(v) => {
                put_preamble(buf, 2)?;
                v.encode(buf)
            }
        }
    }
}

impl Decode for Dump {
    fn decode(rd: &mut &[u8]) -> Result<Self, CodecError> {
        match get_preamble(rd)? {
            1 => Ok(Dump::Spectrum(SpectrumData::decode(rd)?)),
            2 => Ok(Dump::Vis(VisData::decode(rd)?)),
            tag => Err(CodecError::UnknownTag { what: "dump", tag }),
        }
    }
}

pub fn write_dump<P: AsRef<Path>>(path: P, dump: &Dump) -> Result<(), CodecError> {
    let path = path.as_ref();
    debug!("Writing dump {}", path.display());
    let payload = encode_to_vec(dump)?;
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(MAGIC)?;
    w.write_all(&payload)?;
    w.flush()?;
    Ok(())
}

pub fn read_dump<P: AsRef<Path>>(path: P) -> Result<Dump, CodecError> {
    let path = path.as_ref();
    debug!("Reading dump {}", path.display());
    let mut bytes = vec![];
    BufReader::new(File::open(path)?).read_to_end(&mut bytes)?;
    match bytes.strip_prefix(MAGIC.as_slice()) {
        Some(payload) => decode_from_slice(payload),
        None => Err(CodecError::BadDumpMagic),
    }
}
