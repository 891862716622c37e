use crate::error::{ErrorKind, Result};
use crate::sri::{Algorithm, Integrity};
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// A payload stamped with a creation time and a checksum.
///
/// Serializes flat: the payload's own fields sit alongside `time` and
/// `checksum`.
///
/// The checksum is a SHA-384 [`Integrity`] over, in order, the payload as
/// canonical JSON (object keys sorted), the artifact bytes the payload refers
/// to, and the RFC 3339 time. Each part is prefixed with its length so parts
/// cannot bleed into each other.
///
/// ```
/// use regmirror_integrity::Envelope;
/// use serde_json::json;
/// use time::OffsetDateTime;
///
/// let envelope = Envelope::seal(json!({"tarballUri": "s3://b/staged/foo-1.0.0.tgz"}), b"...", OffsetDateTime::now_utc())?;
/// envelope.verify(b"...")?;
/// assert!(envelope.verify(b"tampered").is_err());
/// # Ok::<(), regmirror_integrity::error::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(flatten)]
    pub payload: T,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    pub checksum: String,
}

impl<T: Serialize> Envelope<T> {
    pub fn seal(payload: T, artifact: &[u8], time: OffsetDateTime) -> Result<Self> {
        let checksum = checksum(&payload, artifact, time)?.to_string();
        Ok(Self { payload, time, checksum })
    }

    /// Recompute the checksum and compare.
    pub fn verify(&self, artifact: &[u8]) -> Result<()> {
        let actual = checksum(&self.payload, artifact, self.time)?.to_string();
        if actual != self.checksum {
            exn::bail!(ErrorKind::Mismatch {
                expected: self.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }
}

fn checksum<T: Serialize>(payload: &T, artifact: &[u8], time: OffsetDateTime) -> Result<Integrity> {
    // Round-tripping through `Value` sorts object keys (serde_json's map is a
    // BTreeMap without the `preserve_order` feature).
    let canonical = serde_json::to_value(payload).and_then(|v| serde_json::to_vec(&v)).or_raise(|| ErrorKind::Encode)?;
    let time = time.format(&Rfc3339).or_raise(|| ErrorKind::Encode)?;
    let mut buffer = Vec::with_capacity(canonical.len() + artifact.len() + time.len() + 24);
    for part in [canonical.as_slice(), artifact, time.as_bytes()] {
        buffer.extend_from_slice(&(part.len() as u64).to_be_bytes());
        buffer.extend_from_slice(part);
    }
    Ok(Integrity::compute(Algorithm::Sha384, &buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use time::macros::datetime;

    #[test]
    fn test_checksum_is_deterministic_and_key_order_independent() {
        let time = datetime!(2024-05-01 12:00:00 UTC);
        let a = Envelope::seal(json!({"a": 1, "b": {"c": 2, "d": 3}}), b"bytes", time).unwrap();
        let b = Envelope::seal(serde_json::from_str::<Value>(r#"{"b":{"d":3,"c":2},"a":1}"#).unwrap(), b"bytes", time)
            .unwrap();
        assert_eq!(a.checksum, b.checksum);
        assert!(a.checksum.starts_with("sha384-"));
    }

    #[test]
    fn test_checksum_covers_every_part() {
        let time = datetime!(2024-05-01 12:00:00 UTC);
        let base = Envelope::seal(json!({"a": 1}), b"bytes", time).unwrap();
        let other_payload = Envelope::seal(json!({"a": 2}), b"bytes", time).unwrap();
        let other_artifact = Envelope::seal(json!({"a": 1}), b"bytez", time).unwrap();
        let other_time = Envelope::seal(json!({"a": 1}), b"bytes", datetime!(2024-05-01 12:00:01 UTC)).unwrap();
        assert_ne!(base.checksum, other_payload.checksum);
        assert_ne!(base.checksum, other_artifact.checksum);
        assert_ne!(base.checksum, other_time.checksum);
    }

    #[test]
    fn test_serializes_flat() {
        let time = datetime!(2024-05-01 12:00:00 UTC);
        let envelope = Envelope::seal(json!({"tarballUri": "s3://bucket/staged/foo-1.0.0.tgz"}), b"x", time).unwrap();
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["tarballUri"], "s3://bucket/staged/foo-1.0.0.tgz");
        assert_eq!(value["time"], "2024-05-01T12:00:00Z");
        assert_eq!(value["checksum"], envelope.checksum.as_str());

        let parsed: Envelope<Value> = serde_json::from_value(value).unwrap();
        parsed.verify(b"x").unwrap();
    }

    #[test]
    fn test_verify_detects_tampering() {
        let time = datetime!(2024-05-01 12:00:00 UTC);
        let mut envelope = Envelope::seal(json!({"sequence": 7}), b"x", time).unwrap();
        envelope.payload = json!({"sequence": 8});
        let err = envelope.verify(b"x").unwrap_err();
        assert!(matches!(&*err, ErrorKind::Mismatch { .. }));
    }
}
