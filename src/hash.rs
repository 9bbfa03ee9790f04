//! Content-addressed cell identity.

use sha1::{Digest, Sha1};
use std::fmt;

/// A SHA-1 digest over a cell-kind-tagged preimage (`"text"||content` or
/// `"code"||content`). Two cells with identical kind and normalized content
/// always produce the same hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 20]);

impl Hash {
    /// Hash the content of a text cell.
    pub fn of_text(content: &str) -> Self {
        Self::tagged("text", content)
    }

    /// Hash the content of a code cell (modeline already stripped).
    pub fn of_code(code: &str) -> Self {
        Self::tagged("code", code)
    }

    fn tagged(kind: &str, content: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(kind.as_bytes());
        hasher.update(content.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Full lower-hex representation, used on the wire and in CSS classes.
    pub fn hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Six-character prefix, used in human-visible log lines.
    pub fn short(&self) -> String {
        self.hex()[..6].to_string()
    }

    /// Parse a hash back from its full hex form, as produced by `load_from_html`.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 40 {
            return None;
        }
        let mut bytes = [0u8; 20];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let byte_str = std::str::from_utf8(chunk).ok()?;
            bytes[i] = u8::from_str_radix(byte_str, 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_content_same_kind_same_hash() {
        assert_eq!(Hash::of_code("print(1)"), Hash::of_code("print(1)"));
        assert_eq!(Hash::of_text("hello"), Hash::of_text("hello"));
    }

    #[test]
    fn different_kind_different_hash() {
        assert_ne!(Hash::of_code("x"), Hash::of_text("x"));
    }

    #[test]
    fn hex_roundtrip() {
        let h = Hash::of_code("print(1+1)");
        let hex = h.hex();
        assert_eq!(Hash::from_hex(&hex), Some(h));
    }

    #[test]
    fn short_is_six_chars() {
        let h = Hash::of_text("abc");
        assert_eq!(h.short().len(), 6);
        assert!(h.hex().starts_with(&h.short()));
    }
}
