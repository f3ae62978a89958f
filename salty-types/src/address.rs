//! Addresses on a SaltyRTC path.

use std::fmt;

/// A one-byte address inside a path.
///
/// `0x00` is the server, `0x01` the initiator, `0x02..=0xff` responders.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(u8);

impl Address {
    /// The server's address.
    pub const SERVER: Address = Address(0x00);
    /// The initiator's address.
    pub const INITIATOR: Address = Address(0x01);
    /// Lowest responder address.
    pub const FIRST_RESPONDER: Address = Address(0x02);
    /// Highest responder address.
    pub const LAST_RESPONDER: Address = Address(0xff);

    /// Wrap a raw address byte.
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// Raw address byte.
    pub const fn value(self) -> u8 {
        self.0
    }

    /// Classify this address.
    pub fn kind(self) -> AddressType {
        AddressType::classify(self.0)
    }

    /// True iff this address is in `0x02..=0xff`.
    pub fn is_valid_responder(self) -> bool {
        self.0 >= Self::FIRST_RESPONDER.0
    }

    /// Iterate over every responder address in ascending order.
    pub fn responders() -> impl Iterator<Item = Address> {
        (Self::FIRST_RESPONDER.0..=Self::LAST_RESPONDER.0).map(Address)
    }
}

impl From<u8> for Address {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#04x})", self.0)
    }
}

/// Class of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    /// `0x00`
    Server,
    /// `0x01`
    Initiator,
    /// `0x02..=0xff`
    Responder,
}

impl AddressType {
    /// Classify a raw address byte.
    pub fn classify(value: u8) -> Self {
        match value {
            0x00 => Self::Server,
            0x01 => Self::Initiator,
            _ => Self::Responder,
        }
    }
}

/// Role a client declares during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientType {
    /// Owner of the path.
    Initiator,
    /// A peer joining the path.
    Responder,
}

impl ClientType {
    /// Address class a client of this role occupies.
    pub fn address_type(self) -> AddressType {
        match self {
            Self::Initiator => AddressType::Initiator,
            Self::Responder => AddressType::Responder,
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiator => write!(f, "initiator"),
            Self::Responder => write!(f, "responder"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_addresses() {
        assert_eq!(AddressType::classify(0x00), AddressType::Server);
        assert_eq!(AddressType::classify(0x01), AddressType::Initiator);
        for value in 0x02..=0xffu8 {
            assert_eq!(AddressType::classify(value), AddressType::Responder);
        }
    }

    #[test]
    fn valid_responder_range() {
        assert!(!Address::SERVER.is_valid_responder());
        assert!(!Address::INITIATOR.is_valid_responder());
        assert!(Address::new(0x02).is_valid_responder());
        assert!(Address::new(0xff).is_valid_responder());
        assert_eq!(Address::responders().count(), 254);
    }

    #[test]
    fn address_display() {
        assert_eq!(Address::new(0x0a).to_string(), "0x0a");
        assert_eq!(format!("{:?}", Address::INITIATOR), "Address(0x01)");
    }
}
