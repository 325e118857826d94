//! Bounded host names.
//!
//! Host names travel inside fixed-size record headers, so they are stored as a
//! byte array of [`HOST_NAME_CAPACITY`] bytes plus an explicit length. Longer
//! names are truncated at a UTF-8 character boundary.

use std::fmt;

/// Maximum number of host name bytes carried per rank.
pub const HOST_NAME_CAPACITY: usize = 40;

/// Host name with fixed capacity and explicit length.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostName {
    bytes: [u8; HOST_NAME_CAPACITY],
    len: u8,
}

impl HostName {
    /// Build from a string, truncating to capacity on a character boundary.
    pub fn new(name: &str) -> Self {
        let mut end = name.len().min(HOST_NAME_CAPACITY);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0u8; HOST_NAME_CAPACITY];
        bytes[..end].copy_from_slice(&name.as_bytes()[..end]);
        Self {
            bytes,
            len: end as u8,
        }
    }

    /// Rebuild from raw record bytes.
    ///
    /// Only the first `len` bytes are looked at, and never more than the
    /// capacity. Invalid UTF-8 is replaced rather than rejected.
    pub fn from_raw(raw: &[u8], len: usize) -> Self {
        let len = len.min(HOST_NAME_CAPACITY).min(raw.len());
        let text = String::from_utf8_lossy(&raw[..len]);
        Self::new(&text)
    }

    /// Name of the machine this process runs on.
    pub fn local() -> Self {
        let name = gethostname::gethostname();
        Self::new(&name.to_string_lossy())
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        // Only ever filled from &str input cut on a char boundary
        std::str::from_utf8(self.as_bytes()).unwrap_or_default()
    }

    /// The meaningful bytes (without padding).
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// The full zero-padded storage, as written on the wire.
    pub fn padded(&self) -> &[u8; HOST_NAME_CAPACITY] {
        &self.bytes
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the name is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for HostName {
    fn default() -> Self {
        Self::new("")
    }
}

impl fmt::Display for HostName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl fmt::Debug for HostName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostName").field(&self.as_str()).finish()
    }
}

impl From<&str> for HostName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_name() {
        let host = HostName::new("node042");
        assert_eq!(host.as_str(), "node042");
        assert_eq!(host.len(), 7);
        assert_eq!(&host.padded()[7..], &[0u8; HOST_NAME_CAPACITY - 7][..]);
    }

    #[test]
    fn test_truncates_to_capacity() {
        let long = "x".repeat(100);
        let host = HostName::new(&long);
        assert_eq!(host.len(), HOST_NAME_CAPACITY);
        assert_eq!(host.as_str(), &long[..HOST_NAME_CAPACITY]);
    }

    #[test]
    fn test_truncates_on_char_boundary() {
        // 39 ASCII bytes followed by a 2-byte character straddling the limit
        let name = format!("{}é", "a".repeat(39));
        let host = HostName::new(&name);
        assert_eq!(host.len(), 39);
        assert_eq!(host.as_str(), "a".repeat(39));
    }

    #[test]
    fn test_from_raw_ignores_bytes_past_len() {
        let mut raw = [b'z'; HOST_NAME_CAPACITY];
        raw[..4].copy_from_slice(b"host");
        let host = HostName::from_raw(&raw, 4);
        assert_eq!(host.as_str(), "host");
    }

    #[test]
    fn test_from_raw_clamps_len() {
        let raw = [b'a'; 64];
        let host = HostName::from_raw(&raw, 64);
        assert_eq!(host.len(), HOST_NAME_CAPACITY);
    }
}
