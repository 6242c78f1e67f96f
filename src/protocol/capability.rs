use super::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

// Capability bits advertised in a protocol-capability response
pub const CAP_FAILSAFE: u8 = 0x01;
pub const CAP_BASIC: u8 = 0x02;
pub const CAP_UTP: u8 = 0x04;
pub const CAP_FEC: u8 = 0x08;

const CAP_ALL: u8 = CAP_FAILSAFE | CAP_BASIC | CAP_UTP | CAP_FEC;

/// A single pluggable transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum TransferProtocol {
    Failsafe = CAP_FAILSAFE,
    Basic = CAP_BASIC,
    /// Stream-based, congestion controlled.
    Utp = CAP_UTP,
    /// Forward-error-correcting.
    Fec = CAP_FEC,
}

impl TransferProtocol {
    pub fn bit(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for TransferProtocol {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            CAP_FAILSAFE => Ok(Self::Failsafe),
            CAP_BASIC => Ok(Self::Basic),
            CAP_UTP => Ok(Self::Utp),
            CAP_FEC => Ok(Self::Fec),
            other => Err(ProtocolError::UnknownProtocol(other)),
        }
    }
}

impl From<TransferProtocol> for u8 {
    fn from(p: TransferProtocol) -> u8 {
        p as u8
    }
}

impl fmt::Display for TransferProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferProtocol::Failsafe => write!(f, "failsafe"),
            TransferProtocol::Basic => write!(f, "basic"),
            TransferProtocol::Utp => write!(f, "utp"),
            TransferProtocol::Fec => write!(f, "fec"),
        }
    }
}

/// Set of transports a peer supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct ProtocolCapability(u8);

impl ProtocolCapability {
    /// Unknown bits from newer peers are kept out of the set.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & CAP_ALL)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn supports(&self, protocol: TransferProtocol) -> bool {
        self.0 & protocol.bit() != 0
    }

    pub fn insert(&mut self, protocol: TransferProtocol) {
        self.0 |= protocol.bit();
    }

    /// First protocol in `preference` that the peer also speaks.
    pub fn choose(&self, preference: &[TransferProtocol]) -> Option<TransferProtocol> {
        preference.iter().copied().find(|p| self.supports(*p))
    }
}

impl FromIterator<TransferProtocol> for ProtocolCapability {
    fn from_iter<I: IntoIterator<Item = TransferProtocol>>(iter: I) -> Self {
        let mut caps = ProtocolCapability::default();
        for p in iter {
            caps.insert(p);
        }
        caps
    }
}
