//! Byte signatures with wildcards and scanning of module images for them.

use std::fmt;
use std::slice;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::module::ModuleImage;

/// Parsed signature; `None` positions match any byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytePattern {
    tokens: Vec<Option<u8>>,
}

impl BytePattern {
    /// Parses whitespace-separated two-digit hex bytes, `??` (or `?`) being a wildcard.
    pub fn parse(signature: &str) -> Result<BytePattern> {
        let mut tokens = Vec::new();
        for (position, token) in signature.split_whitespace().enumerate() {
            if token == "??" || token == "?" {
                tokens.push(None);
                continue;
            }
            let byte = if token.len() == 2 && token.bytes().all(|b| b.is_ascii_hexdigit()) {
                u8::from_str_radix(token, 16).ok()
            } else {
                None
            };
            match byte {
                Some(byte) => tokens.push(Some(byte)),
                None => {
                    return Err(Error::InvalidSignatureToken {
                        token: token.to_string(),
                        position,
                    });
                }
            }
        }
        if tokens.is_empty() {
            return Err(Error::EmptySignature);
        }
        Ok(BytePattern { tokens })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn tokens(&self) -> &[Option<u8>] {
        &self.tokens
    }

    /// Checks `bytes` against the pattern. `bytes` must be exactly as long as the pattern.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        bytes.len() == self.tokens.len() &&
            self.tokens
                .iter()
                .zip(bytes)
                .all(|(token, &byte)| token.map(|t| t == byte).unwrap_or(true))
    }

    /// First fixed byte and its position, used to skip ahead with memchr.
    fn anchor(&self) -> Option<(usize, u8)> {
        self.tokens
            .iter()
            .enumerate()
            .find_map(|(pos, token)| token.map(|byte| (pos, byte)))
    }

    /// Scans the whole module image.
    pub fn scan(&self, image: &ModuleImage) -> MatchResult {
        self.scan_bytes(image.bytes(), image.base())
    }

    /// Scans `haystack`, which is mapped at `base`, returning absolute addresses in
    /// ascending order. Overlapping matches are all reported.
    pub fn scan_bytes(&self, haystack: &[u8], base: usize) -> MatchResult {
        let len = self.tokens.len();
        if haystack.len() < len {
            return MatchResult::default();
        }
        let last_start = haystack.len() - len;
        let addresses = match self.anchor() {
            Some((offset, byte)) => {
                // Every candidate start `pos` has `haystack[pos + offset] == byte`.
                let window = &haystack[offset..offset + last_start + 1];
                memchr::memchr_iter(byte, window)
                    .filter(|&pos| self.matches(&haystack[pos..pos + len]))
                    .map(|pos| base + pos)
                    .collect()
            }
            None => (0..=last_start).map(|pos| base + pos).collect(),
        };
        MatchResult { addresses }
    }
}

impl FromStr for BytePattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<BytePattern> {
        BytePattern::parse(s)
    }
}

impl fmt::Display for BytePattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, token) in self.tokens.iter().enumerate() {
            if i != 0 {
                f.write_str(" ")?;
            }
            match token {
                Some(byte) => write!(f, "{:02X}", byte)?,
                None => f.write_str("??")?,
            }
        }
        Ok(())
    }
}

/// Match addresses of one scan, ascending.
///
/// When a signature matches more than once, callers use `first()`: the earliest match
/// in the image wins. `first()` returns `None` for an empty result instead of indexing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchResult {
    addresses: Vec<usize>,
}

impl MatchResult {
    pub fn first(&self) -> Option<usize> {
        self.addresses.first().cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn addresses(&self) -> &[usize] {
        &self.addresses
    }

    pub fn iter(&self) -> slice::Iter<'_, usize> {
        self.addresses.iter()
    }
}
