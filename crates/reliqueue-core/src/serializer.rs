use crate::error::Result;

/// The contract an injected serializer must satisfy: total (never
/// fails on a value that round-tripped in), deterministic, and
/// reversible on every field the adapter persists across the wire.
///
/// The core does not dictate a wire format; relational and key-value
/// adapters invoke whatever `Serializer` they were constructed with to
/// turn a [`crate::Message`]'s bookkeeping fields into bytes and back.
pub trait Serializer: Send + Sync {
    fn encode(&self, record: &StoredRecord) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<StoredRecord>;
}

/// The fields an adapter needs to persist per message, independent of
/// the adapter's own schema/structure choices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRecord {
    pub content: Vec<u8>,
    pub origin_timestamp_millis: i64,
    pub timestamp_millis: i64,
    pub num_requeues: u64,
}

/// A serializer built on a fixed, documented binary layout:
/// `[origin_ts: i64 LE][timestamp: i64 LE][num_requeues: u64 LE][content: rest]`.
///
/// This is total and deterministic by construction, and is the
/// default used by adapters that don't need interop with an external
/// producer's own encoding.
#[derive(Default, Clone, Copy)]
pub struct BinaryRecordSerializer;

const HEADER_LEN: usize = 8 + 8 + 8;

impl Serializer for BinaryRecordSerializer {
    fn encode(&self, record: &StoredRecord) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_LEN + record.content.len());
        buf.extend_from_slice(&record.origin_timestamp_millis.to_le_bytes());
        buf.extend_from_slice(&record.timestamp_millis.to_le_bytes());
        buf.extend_from_slice(&record.num_requeues.to_le_bytes());
        buf.extend_from_slice(&record.content);
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> Result<StoredRecord> {
        if bytes.len() < HEADER_LEN {
            return Err(crate::error::QueueError::serialization(anyhow::anyhow!(
                "record too short: {} bytes, need at least {HEADER_LEN}",
                bytes.len()
            )));
        }
        let origin_timestamp_millis = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let timestamp_millis = i64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let num_requeues = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
        Ok(StoredRecord {
            content: bytes[HEADER_LEN..].to_vec(),
            origin_timestamp_millis,
            timestamp_millis,
            num_requeues,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip() {
        let ser = BinaryRecordSerializer;
        let record = StoredRecord {
            content: b"hello".to_vec(),
            origin_timestamp_millis: 1111,
            timestamp_millis: 2222,
            num_requeues: 3,
        };
        let bytes = ser.encode(&record).unwrap();
        let back = ser.decode(&bytes).unwrap();
        assert_eq!(record, back);
    }

    #[test]
    fn rejects_truncated_input() {
        let ser = BinaryRecordSerializer;
        assert!(ser.decode(b"short").is_err());
    }
}
