//! Command nonces.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// 128-bit single-use value carried by every signed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Nonce(#[serde(with = "hex::serde")] pub [u8; 16]);

impl Nonce {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Nonce {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// Draws nonces from the OS RNG and guarantees uniqueness within one
/// issuing session.
#[derive(Debug, Default)]
pub struct NonceGenerator {
    issued: HashSet<Nonce>,
}

impl NonceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_nonce(&mut self) -> Nonce {
        loop {
            let mut bytes = [0u8; 16];
            rand::rngs::OsRng.fill_bytes(&mut bytes);
            let nonce = Nonce(bytes);
            if self.issued.insert(nonce) {
                return nonce;
            }
            tracing::warn!("nonce collision within issuing session, redrawing");
        }
    }

    /// Number of nonces issued this session
    pub fn issued_count(&self) -> usize {
        self.issued.len()
    }
}
