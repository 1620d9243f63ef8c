use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

/// Identifies a message within the queue that produced it.
///
/// Backed by a v1 UUID so that ids sort roughly in creation order even
/// on adapters (in-memory, disruptor) that have no backend-assigned
/// sequence of their own. Adapters are free to accept caller-supplied
/// ids instead; `MessageId` is a thin wrapper over a string so both
/// schemes round-trip through the same type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MessageId(String);

impl MessageId {
    /// Generates a new, locally-unique id.
    pub fn new() -> Self {
        Self(now_v1().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(&self.0)
    }
}

impl From<MessageId> for String {
    fn from(id: MessageId) -> String {
        id.0
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

static MAC: OnceLock<[u8; 6]> = OnceLock::new();

fn get_mac_address() -> &'static [u8; 6] {
    MAC.get_or_init(|| match mac_address::get_mac_address() {
        Ok(Some(addr)) => addr.bytes(),
        _ => {
            // Fall back to gethostid: not great, but better than
            // an all-zero clock sequence on every node.
            let host_id = unsafe { libc::gethostid() }.to_le_bytes();
            [
                host_id[0], host_id[1], host_id[2], host_id[3], host_id[4], host_id[5],
            ]
        }
    })
}

fn now_v1() -> Uuid {
    Uuid::now_v1(get_mac_address())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ids_are_unique_and_roundtrip() {
        let a = MessageId::new();
        let b = MessageId::new();
        assert_ne!(a, b);

        let s: String = a.clone().into();
        let roundtrip = MessageId::from(s);
        assert_eq!(a, roundtrip);
    }
}
