//! Byte layouts for the fjall keyspaces.
//!
//! Namespaces and keys are validated to be NUL-free, so `\x00` is a unique
//! delimiter between components.

/// `raft_log` keyspace: `index(8)`, big-endian so lexicographic = numeric order.
pub fn raft_log_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

/// `entries` keyspace: `namespace ++ \x00 ++ key`
pub fn entry_key(namespace: &str, key: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(namespace.len() + 1 + key.len());
    buf.extend_from_slice(namespace.as_bytes());
    buf.push(0x00);
    buf.extend_from_slice(key.as_bytes());
    buf
}

/// `history` keyspace: `namespace ++ \x00 ++ key ++ \x00 ++ version(8)`
pub fn history_key(namespace: &str, key: &str, version: u64) -> Vec<u8> {
    let mut buf = history_prefix(namespace, key);
    buf.extend_from_slice(&version.to_be_bytes());
    buf
}

/// Prefix covering every version of one (namespace, key).
///
/// The trailing `\x00` keeps a scan for "foo" from bleeding into "foobar".
pub fn history_prefix(namespace: &str, key: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(namespace.len() + key.len() + 2 + 8);
    buf.extend_from_slice(namespace.as_bytes());
    buf.push(0x00);
    buf.extend_from_slice(key.as_bytes());
    buf.push(0x00);
    buf
}

/// Split a history key back into its version suffix.
pub fn history_version(raw: &[u8]) -> Option<u64> {
    let start = raw.len().checked_sub(8)?;
    raw[start..].try_into().ok().map(u64::from_be_bytes)
}

/// `audit` keyspace: `index(8)`
pub fn audit_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

/// `meta` keyspace: plain label.
pub fn meta_key(label: &str) -> &[u8] {
    label.as_bytes()
}
