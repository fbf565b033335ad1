//! The messages exchanged by viewers and the server.
//!
//! A message is the protocol version, a kind tag, the client id and then the
//! body for that kind. Requests carry the sender's id; responses carry the
//! addressee's, or an empty id when they are broadcast.

use std::rc::Rc;

use super::*;
use crate::{
    options::AmpPhaseOptions,
    products::{SpectrumData, VisData},
    ServerType,
};

/// Where the options for a recompute come from.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionsSource {
    /// Adopt these options as the authoritative set.
    UseProvided(AmpPhaseOptions),
    /// Use whatever set is already authoritative.
    UseAuthoritative,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    ServerType,
    CurrentVisData,
    ComputeVisData(OptionsSource),
    ComputedVisData,
    /// One raw cycle near a time (MJD).
    SpectrumAt { mjd: f64 },
    Username(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    ServerType(ServerType),
    CurrentVisData(Rc<VisData>),
    /// The requester's recompute is ready to be fetched.
    VisDataComputed,
    ComputedVisData(Rc<VisData>),
    /// Someone else changed the options.
    OptionsChanged { author: String },
    Spectrum(SpectrumData),
    NoData,
    UsernameRequired,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestMessage {
    pub client_id: String,
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMessage {
    /// Empty for broadcasts.
    pub client_id: String,
    pub response: Response,
}

impl ResponseMessage {
    /// Is this message for `client_id`?
    pub fn is_for(&self, client_id: &str) -> bool {
        self.client_id.is_empty() || self.client_id == client_id
    }
}

impl Request {
    fn tag(&self) -> u64 {
        match self {
            Request::ServerType => 1,
            Request::CurrentVisData => 2,
            Request::ComputeVisData(_) => 3,
            Request::ComputedVisData => 4,
            Request::SpectrumAt { .. } => 5,
            Request::Username(_) => 6,
        }
    }
}

impl Response {
    fn tag(&self) -> u64 {
        match self {
            Response::ServerType(_) => 1,
            Response::CurrentVisData(_) => 2,
            Response::VisDataComputed => 3,
            Response::ComputedVisData(_) => 4,
            Response::OptionsChanged { .. } => 5,
            Response::Spectrum(_) => 6,
            Response::NoData => 7,
            Response::UsernameRequired => 8,
            Response::Shutdown => 9,
        }
    }
}

impl Encode for RequestMessage {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        put_preamble(buf, self.request.tag())?;
        put_str(buf, &self.client_id, capacity::CLIENT_ID)?;
        match &self.request {
            Request::ServerType | Request::CurrentVisData | Request::ComputedVisData => Ok(()),
            Request::ComputeVisData(OptionsSource::UseProvided(options)) => {
                put_bool(buf, true)?;
                options.encode(buf)
            }
            Request::ComputeVisData(OptionsSource::UseAuthoritative) => put_bool(buf, false),
            Request::SpectrumAt { mjd } => put_f64(buf, *mjd),
            Request::Username(name) => put_str(buf, name, capacity::USERNAME),
        }
    }
}

impl Decode for RequestMessage {
    fn decode(rd: &mut &[u8]) -> Result<Self, CodecError> {
        let tag = get_preamble(rd)?;
        let client_id = get_str(rd, capacity::CLIENT_ID)?;
        let request = match tag {
            1 => Request::ServerType,
            2 => Request::CurrentVisData,
            3 => {
                if get_bool(rd)? {
                    Request::ComputeVisData(OptionsSource::UseProvided(AmpPhaseOptions::decode(
                        rd,
                    )?))
                } else {
                    Request::ComputeVisData(OptionsSource::UseAuthoritative)
                }
            }
            4 => Request::ComputedVisData,
            5 => Request::SpectrumAt { mjd: get_f64(rd)? },
            6 => Request::Username(get_str(rd, capacity::USERNAME)?),
            tag => {
                return Err(CodecError::UnknownTag {
                    what: "request",
                    tag,
                })
            }
        };
        Ok(RequestMessage { client_id, request })
    }
}

impl Encode for ResponseMessage {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        put_preamble(buf, self.response.tag())?;
        put_str(buf, &self.client_id, capacity::CLIENT_ID)?;
        match &self.response {
            Response::ServerType(t) => put_uint(buf, t.code()),
            Response::CurrentVisData(v) | Response::ComputedVisData(v) => v.encode(buf),
            Response::OptionsChanged { author } => put_str(buf, author, capacity::USERNAME),
            Response::Spectrum(s) => s.encode(buf),
            Response::VisDataComputed
            | Response::NoData
            | Response::UsernameRequired
            | Response::Shutdown => Ok(()),
        }
    }
}

impl Decode for ResponseMessage {
    fn decode(rd: &mut &[u8]) -> Result<Self, CodecError> {
        let tag = get_preamble(rd)?;
        let client_id = get_str(rd, capacity::CLIENT_ID)?;
        let response = match tag {
            1 => {
                let code = get_uint(rd)?;
                Response::ServerType(ServerType::from_code(code).ok_or(CodecError::UnknownTag {
                    what: "server type",
                    tag: code,
                })?)
            }
            2 => Response::CurrentVisData(Rc::new(VisData::decode(rd)?)),
            3 => Response::VisDataComputed,
            4 => Response::ComputedVisData(Rc::new(VisData::decode(rd)?)),
            5 => Response::OptionsChanged {
                author: get_str(rd, capacity::USERNAME)?,
            },
            6 => Response::Spectrum(SpectrumData::decode(rd)?),
            7 => Response::NoData,
            8 => Response::UsernameRequired,
            9 => Response::Shutdown,
            tag => {
                return Err(CodecError::UnknownTag {
                    what: "response",
                    tag,
                })
            }
        };
        Ok(ResponseMessage {
            client_id,
            response,
        })
    }
}
