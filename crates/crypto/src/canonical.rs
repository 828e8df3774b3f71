//! Canonical byte encoding for everything that gets signed or hashed.
//!
//! Each message starts with a domain tag, and every field is written with an
//! explicit length or fixed width, so two different field sequences can never
//! produce the same bytes and a signature made for one purpose cannot be
//! replayed as a signature for another.

use blake3::Hasher;

/// 32-byte BLAKE3 digest
pub type Digest = [u8; 32];

/// Domain tags. Bump the version suffix whenever a layout changes.
pub mod domains {
    pub const PROPOSAL: &str = "killswitch/proposal/v1";
    pub const APPROVAL: &str = "killswitch/approval/v1";
    pub const ENVELOPE: &str = "killswitch/envelope/v1";
    pub const GROUP_KEY: &str = "killswitch/group-key/v1";
    pub const RESET: &str = "killswitch/failsafe-reset/v1";
    pub const RESUME: &str = "killswitch/failsafe-resume/v1";
    pub const CONTEXT: &str = "killswitch/context/v1";
}

/// Length-prefixed, domain-separated encoder.
#[derive(Debug, Clone)]
pub struct CanonicalEncoder {
    buf: Vec<u8>,
}

impl CanonicalEncoder {
    /// Start a message in `domain`
    pub fn new(domain: &str) -> Self {
        let mut encoder = Self {
            buf: Vec::with_capacity(128),
        };
        encoder.put_str(domain);
        encoder
    }

    /// Variable-length bytes: u32 big-endian length, then the bytes
    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf
            .extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn put_str(&mut self, s: &str) -> &mut Self {
        self.put_bytes(s.as_bytes())
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    /// Fixed-width digest, written without a length prefix
    pub fn put_digest(&mut self, digest: &Digest) -> &mut Self {
        self.buf.extend_from_slice(digest);
        self
    }

    /// Count-prefixed list of strings
    pub fn put_str_list<'a, I>(&mut self, items: I) -> &mut Self
    where
        I: IntoIterator<Item = &'a str>,
        I::IntoIter: ExactSizeIterator,
    {
        let items = items.into_iter();
        self.put_u64(items.len() as u64);
        for item in items {
            self.put_str(item);
        }
        self
    }

    /// Encoded bytes so far
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// BLAKE3 digest of the encoded bytes
    pub fn digest(&self) -> Digest {
        blake3_digest(&self.buf)
    }
}

/// BLAKE3 digest of arbitrary bytes
pub fn blake3_digest(bytes: &[u8]) -> Digest {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    *hasher.finalize().as_bytes()
}
