//! The columnar encoder (spec §1, §4.4): a pure function from a record
//! batch plus schema to opaque columnar bytes. `ColumnarEncoder` is the
//! seam the core calls through; `JsonLinesEncoder` is the one concrete,
//! fully-working implementation, standing in for a real Arrow/Parquet
//! writer the way the distilled spec frames the encoder as swappable.

use lakeside_types::Record;
use thiserror::Error;

use crate::schema::SchemaDocument;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to serialize record {index}: {source}")]
    Serialize { index: usize, source: serde_json::Error },
}

/// The result of encoding one partition's record batch.
#[derive(Debug, Clone)]
pub struct EncodedArtifact {
    pub bytes: bytes::Bytes,
    pub row_count: u64,
}

pub trait ColumnarEncoder: std::fmt::Debug + Send + Sync + 'static {
    /// `schema` is accepted for parity with a real encoder (which would use
    /// it to pick a physical type per column); this implementation doesn't
    /// need it since the record's own JSON already carries its shape.
    fn encode(&self, records: &[Record], schema: &SchemaDocument) -> Result<EncodedArtifact, EncodeError>;
}

/// Encodes each record as one canonical-JSON line. Not a real columnar
/// format, but a legitimate "opaque columnar bytes" implementation of the
/// encoder seam, and round-trippable for the decode used only by tests.
#[derive(Debug, Default)]
pub struct JsonLinesEncoder;

impl ColumnarEncoder for JsonLinesEncoder {
    fn encode(&self, records: &[Record], _schema: &SchemaDocument) -> Result<EncodedArtifact, EncodeError> {
        let mut out = Vec::new();
        for (index, record) in records.iter().enumerate() {
            serde_json::to_writer(&mut out, record).map_err(|source| EncodeError::Serialize { index, source })?;
            out.push(b'\n');
        }
        Ok(EncodedArtifact {
            bytes: bytes::Bytes::from(out),
            row_count: records.len() as u64,
        })
    }
}

impl JsonLinesEncoder {
    /// Decodes bytes produced by [`Self::encode`] back into records, used
    /// only by the round-trip property in spec §8.
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<Record>, serde_json::Error> {
        bytes
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(serde_json::from_slice)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(value: &str) -> Record {
        let mut m = serde_json::Map::new();
        m.insert("k".to_string(), serde_json::json!(value));
        m
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let schema = SchemaDocument { fields: vec![] };
        let encoder = JsonLinesEncoder;
        let records = vec![record("a"), record("b"), record("c")];

        let artifact = encoder.encode(&records, &schema).unwrap();
        assert_eq!(artifact.row_count, 3);

        let decoded = encoder.decode(&artifact.bytes).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn encode_of_empty_batch_is_empty_bytes() {
        let schema = SchemaDocument { fields: vec![] };
        let artifact = JsonLinesEncoder.encode(&[], &schema).unwrap();
        assert_eq!(artifact.row_count, 0);
        assert!(artifact.bytes.is_empty());
    }
}
