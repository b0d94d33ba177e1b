use std::fmt;
use std::io;

use thiserror::Error;

/// The two circularly managed on-device regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Mapping,
    Metalog,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Mapping => write!(f, "mapping"),
            Region::Metalog => write!(f, "meta-log"),
        }
    }
}

/// Every failure of the indirection core carries one of these kinds. All of them are fatal to the
/// top-level operation that ran into them; consistency issues that the core can keep working
/// through are logged instead of returned.
#[derive(Debug, Error)]
pub enum AlfsError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("device I/O failed")]
    Io(#[from] io::Error),

    #[error("no free section left in the {0} region")]
    NoFreeSpace(Region),

    #[error("block address {addr:#x} is outside the {region} region")]
    InvalidAddress { region: Region, addr: u32 },
}

pub type Result<T> = std::result::Result<T, AlfsError>;
