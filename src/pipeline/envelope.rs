//! Payload envelopes carried through pipeline slots

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::{Error, ProviderData, ProviderName, ProviderRole, Result};

/// Provider data as it is handed to the journal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub provider: ProviderName,
    pub role: ProviderRole,
    pub data: ProviderData,
    pub received_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

impl JournalRecord {
    pub fn new(provider: ProviderName, role: ProviderRole, data: ProviderData, received_at: DateTime<Utc>) -> Self {
        Self {
            provider,
            role,
            data,
            received_at,
            recorded_at: Utc::now(),
        }
    }
}

/// Serialize for a slot of `slot_size` bytes.
pub fn encode<T: Serialize>(record: &T, slot_size: usize) -> Result<Vec<u8>> {
    let bytes = serde_json::to_vec(record)?;
    if bytes.len() > slot_size {
        return Err(Error::PayloadTooLarge {
            len: bytes.len(),
            slot_size,
        });
    }
    Ok(bytes)
}

pub fn decode<T: DeserializeOwned>(payload: &[u8], sequence: u64) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| Error::ConsumerProcessing {
        sequence,
        reason: format!("undecodable payload: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Symbol, Tick};
    use rust_decimal::Decimal;

    fn record() -> JournalRecord {
        JournalRecord::new(
            ProviderName::new("Blackwood"),
            ProviderRole::MarketData,
            ProviderData::Tick(Tick {
                symbol: Symbol::new("msft"),
                bid: Decimal::new(41210, 2),
                ask: Decimal::new(41215, 2),
                last: Decimal::new(41212, 2),
                timestamp: Utc::now(),
            }),
            Utc::now(),
        )
    }

    #[test]
    fn test_encode_respects_slot_size() {
        let rec = record();
        let bytes = encode(&rec, 4096).unwrap();
        assert_eq!(decode::<JournalRecord>(&bytes, 0).unwrap(), rec);

        assert!(matches!(
            encode(&rec, 16),
            Err(Error::PayloadTooLarge { slot_size: 16, .. })
        ));
    }

    #[test]
    fn test_decode_garbage_reports_sequence() {
        let err = decode::<JournalRecord>(b"{not json", 7).unwrap_err();
        assert!(matches!(err, Error::ConsumerProcessing { sequence: 7, .. }));
    }
}
