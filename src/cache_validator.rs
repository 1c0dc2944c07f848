//! Integrity envelope for cached payloads.
//!
//! Every value placed in the cache is wrapped together with a SHA-256 checksum
//! of its JSON text. On read the checksum is recomputed; a mismatch means the
//! entry was corrupted and the caller must fall back to the database.

use sha2::{Digest, Sha256};

/// Why a cached payload could not be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    /// The stored text is not a valid envelope.
    Malformed,
    /// The data no longer matches its checksum.
    ChecksumMismatch { expected: String, actual: String },
}

/// Cached JSON text plus the checksum it was stored with.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ValidatedCacheEntry {
    pub data: String,
    /// SHA-256 of `data`, hex encoded.
    pub checksum: String,
}

impl ValidatedCacheEntry {
    pub fn new(data: String) -> Self {
        let checksum = Self::compute_checksum(&data);
        Self { data, checksum }
    }

    fn compute_checksum(data: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_valid(&self) -> bool {
        Self::compute_checksum(&self.data) == self.checksum
    }

    /// Serialises the envelope for storage.
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses an envelope and returns its data if the checksum holds.
    pub fn open(payload: &str) -> Result<String, IntegrityError> {
        let entry: ValidatedCacheEntry =
            serde_json::from_str(payload).map_err(|_| IntegrityError::Malformed)?;

        let actual = Self::compute_checksum(&entry.data);
        if actual != entry.checksum {
            tracing::warn!(
                "Cache validation failed: checksum mismatch. Expected: {}, Data length: {}",
                entry.checksum,
                entry.data.len()
            );
            return Err(IntegrityError::ChecksumMismatch {
                expected: entry.checksum,
                actual,
            });
        }

        Ok(entry.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_entry_is_valid() {
        let data = r#"{"subject": "수학", "total_time": 120}"#.to_string();
        let entry = ValidatedCacheEntry::new(data.clone());

        assert!(entry.is_valid());
        assert_eq!(entry.data, data);
    }

    #[test]
    fn payload_opens_to_original_data() {
        let data = r#"{"nodes": [], "edges": []}"#.to_string();
        let payload = ValidatedCacheEntry::new(data.clone()).to_payload().unwrap();

        assert_eq!(ValidatedCacheEntry::open(&payload), Ok(data));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let payload = ValidatedCacheEntry::new(r#"{"score": 55}"#.to_string())
            .to_payload()
            .unwrap();
        let tampered = payload.replace("55", "99");

        assert!(matches!(
            ValidatedCacheEntry::open(&tampered),
            Err(IntegrityError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(
            ValidatedCacheEntry::open("not an envelope"),
            Err(IntegrityError::Malformed)
        );
    }

    #[test]
    fn checksum_is_deterministic() {
        let a = ValidatedCacheEntry::new("test data".to_string());
        let b = ValidatedCacheEntry::new("test data".to_string());
        assert_eq!(a.checksum, b.checksum);
        assert_eq!(a.checksum.len(), 64);
    }
}
