use std::fmt;

/// Configuration-time failures raised by the `Registry`.
#[derive(Debug)]
pub enum RegistryError {
    DuplicateName(String),
    UnknownPd(String),
    UnknownRegion(String),
    ChannelOutOfRange(u32),
    TooManyPds(usize),
    Io(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateName(name) => write!(f, "name already registered: {name}"),
            Self::UnknownPd(name) => write!(f, "no such protection domain: {name}"),
            Self::UnknownRegion(name) => write!(f, "no such shared region: {name}"),
            Self::ChannelOutOfRange(ch) => {
                write!(f, "channel id {ch} is out of range")
            }
            Self::TooManyPds(n) => write!(f, "system has {n} protection domains, more than supported"),
            Self::Io(reason) => write!(f, "i/o error setting up endpoints: {reason}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Failures raised while binding a payload at PD startup.
#[derive(Debug)]
pub enum BindError {
    MissingVariable(String),
    MapFailed(String),
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingVariable(name) => {
                write!(f, "payload does not export a variable named {name}")
            }
            Self::MapFailed(reason) => write!(f, "failed to map shared region: {reason}"),
        }
    }
}

impl std::error::Error for BindError {}

/// Failures raised by the Microkit API at call time, inside a PD.
#[derive(Debug)]
pub enum ApiError {
    UnboundChannel(u32),
    PeerGone(u32),
    Io(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnboundChannel(ch) => write!(f, "channel {ch} has no peer bound"),
            Self::PeerGone(ch) => {
                write!(f, "peer on channel {ch} is no longer reachable")
            }
            Self::Io(reason) => write!(f, "i/o error: {reason}"),
        }
    }
}

impl std::error::Error for ApiError {}
