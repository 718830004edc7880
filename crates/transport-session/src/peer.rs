use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const SEPARATOR: char = ':';

/// Identity of an advertising peer.
///
/// The `uuid` survives restarts; `generation` grows by one each time the same
/// identity starts a new advertising epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Peer {
    uuid: Uuid,
    generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerParseError {
    #[error("peer string is missing the ':' separator")]
    MissingSeparator,
    #[error("invalid peer uuid: {0}")]
    InvalidUuid(String),
    #[error("invalid peer generation: {0}")]
    InvalidGeneration(String),
}

impl Peer {
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            generation: 0,
        }
    }

    pub fn with_generation(uuid: Uuid, generation: u64) -> Self {
        Self { uuid, generation }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The same identity one generation later, or `None` once the counter is
    /// exhausted.
    pub fn next_generation(&self) -> Option<Self> {
        Some(Self {
            uuid: self.uuid,
            generation: self.generation.checked_add(1)?,
        })
    }
}

impl Default for Peer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{:x}", self.uuid, self.generation)
    }
}

impl FromStr for Peer {
    type Err = PeerParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (uuid, generation) = value
            .rsplit_once(SEPARATOR)
            .ok_or(PeerParseError::MissingSeparator)?;
        let uuid =
            Uuid::parse_str(uuid).map_err(|_| PeerParseError::InvalidUuid(uuid.to_string()))?;
        let generation = u64::from_str_radix(generation, 16)
            .map_err(|_| PeerParseError::InvalidGeneration(generation.to_string()))?;
        Ok(Self { uuid, generation })
    }
}
