//! Connection cookies.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;

/// Cookie size in bytes.
pub const COOKIE_SIZE: usize = 16;

/// 16 random bytes identifying one direction of a connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie([u8; COOKIE_SIZE]);

impl Cookie {
    /// New random cookie.
    pub fn random() -> Self {
        let mut bytes = [0u8; COOKIE_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap raw cookie bytes.
    pub const fn new(bytes: [u8; COOKIE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Cookie from a slice of exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; COOKIE_SIZE]>::try_from(bytes).ok().map(Self)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; COOKIE_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cookie({})", &hex::encode(self.0)[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_cookies_differ() {
        assert_ne!(Cookie::random(), Cookie::random());
    }

    #[test]
    fn from_slice_checks_length() {
        assert!(Cookie::from_slice(&[0u8; 15]).is_none());
        assert!(Cookie::from_slice(&[0u8; 17]).is_none());
        assert_eq!(Cookie::from_slice(&[7u8; 16]), Some(Cookie::new([7u8; 16])));
    }
}
