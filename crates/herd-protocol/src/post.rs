//! Posts, their signed wire envelope, and the codec that authors and
//! verifies them.
//!
//! Authoring: `Drafted -> Signed -> Published`. A fresh identity signs the
//! canonical payload `{id, text, latitude, date, longitude}`; the payload
//! string itself is what gets signed, stored (`raw`) and re-broadcast.
//!
//! Import: `Received -> Verifying -> Accepted | Rejected`. Known ids
//! short-circuit as duplicates before any signature work.
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};

use crate::error::PostError;
use crate::identity::{self, KeyGenerator};
use crate::store::{PostField, PostStore};

/// The signed, self-certifying unit of data for one post.
///
/// Field order is the wire order: `signature, publicKey, id, data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Armored detached signature over `data`.
    pub signature: String,
    /// Armored public key of the post's one-off identity.
    #[serde(rename = "publicKey")]
    pub public_key: String,
    /// Fingerprint of `public_key`.
    pub id: String,
    /// Canonical JSON payload, exactly as signed.
    pub data: String,
}

impl Envelope {
    /// Serialize to the JSON string carried on the wire.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse an envelope received from the wire.
    pub fn from_json(json: &str) -> Result<Self, PostError> {
        serde_json::from_str(json).map_err(|e| PostError::MalformedEnvelope {
            reason: e.to_string(),
        })
    }
}

/// Canonical signed payload. Field order fixes the signed bytes.
#[derive(Serialize)]
struct SignedPayload<'a> {
    id: &'a str,
    text: &'a str,
    latitude: f64,
    date: &'a str,
    longitude: f64,
}

/// Signed payload as read back on import. Coordinates may be numbers or
/// strings depending on the author's client.
#[derive(Deserialize)]
struct ImportedPayload {
    id: String,
    text: String,
    #[serde(deserialize_with = "coordinate")]
    latitude: String,
    date: String,
    #[serde(deserialize_with = "coordinate")]
    longitude: String,
}

fn coordinate<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let raw = match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s,
        other => return Err(de::Error::custom(format!("coordinate must be a number, got {other}"))),
    };
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(raw),
        _ => Err(de::Error::custom(format!("coordinate {raw:?} is not a finite number"))),
    }
}

/// Render a coordinate the way it appears in the signed payload.
fn decimal(value: f64) -> String {
    serde_json::Value::from(value).to_string()
}

/// A post as persisted locally. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub text: String,
    pub latitude: String,
    pub longitude: String,
    pub public_key: String,
    /// Only present for posts authored on this device. Never transmitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// Author-supplied creation time; authoritative for ranking.
    pub created_at: DateTime<Utc>,
    /// Local receipt time.
    pub imported_at: DateTime<Utc>,
    pub signature: String,
    /// Exact canonical payload that was signed.
    pub raw: String,
}

impl Post {
    /// Rebuild the wire envelope from stored fields, byte-for-byte.
    pub fn envelope(&self) -> Envelope {
        Envelope {
            signature: self.signature.clone(),
            public_key: self.public_key.clone(),
            id: self.id.clone(),
            data: self.raw.clone(),
        }
    }

    /// Parsed coordinates, if both are valid decimals.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        let lat = self.latitude.trim().parse::<f64>().ok()?;
        let lon = self.longitude.trim().parse::<f64>().ok()?;
        Some((lat, lon))
    }

    /// Whether this device authored the post.
    pub fn is_local(&self) -> bool {
        self.private_key.is_some()
    }
}

/// Result of authoring: the envelope to publish and the stored post.
#[derive(Debug, Clone)]
pub struct AuthoredPost {
    pub envelope: Envelope,
    pub post: Post,
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// New post, verified and stored.
    Accepted(Post),
    /// Already known; nothing was stored.
    Duplicate { id: String },
}

/// Authors and verifies posts against a post store.
pub struct PostCodec {
    keys: Box<dyn KeyGenerator>,
}

impl std::fmt::Debug for PostCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostCodec").finish_non_exhaustive()
    }
}

impl PostCodec {
    pub fn new(keys: Box<dyn KeyGenerator>) -> Self {
        Self { keys }
    }

    /// Author a post under a brand-new identity and store it locally.
    ///
    /// Coordinates must already be skewed by the caller.
    pub fn author(
        &mut self,
        latitude: f64,
        longitude: f64,
        text: &str,
        now: DateTime<Utc>,
        store: &dyn PostStore,
    ) -> Result<AuthoredPost, PostError> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return Err(PostError::MalformedPayload {
                reason: "coordinates must be finite".into(),
            });
        }

        let signing_key = self.keys.generate();
        let verifying_key = signing_key.verifying_key();
        let id = identity::fingerprint(&verifying_key);
        let date = now.to_rfc3339_opts(SecondsFormat::Millis, true);

        let data = serde_json::to_string(&SignedPayload {
            id: &id,
            text,
            latitude,
            date: &date,
            longitude,
        })
        .map_err(|e| PostError::MalformedPayload {
            reason: e.to_string(),
        })?;

        let signature = identity::sign(&signing_key, data.as_bytes());
        let public_key = identity::armor_public_key(&verifying_key);

        let envelope = Envelope {
            signature: signature.clone(),
            public_key: public_key.clone(),
            id: id.clone(),
            data: data.clone(),
        };
        let post = Post {
            id,
            text: text.to_string(),
            latitude: decimal(latitude),
            longitude: decimal(longitude),
            public_key,
            private_key: Some(identity::armor_private_key(&signing_key)),
            created_at: now,
            imported_at: now,
            signature,
            raw: data,
        };

        store.create_one(post.clone())?;
        tracing::debug!(id = %post.id, "authored post");
        Ok(AuthoredPost { envelope, post })
    }

    /// Verify an inbound envelope and store it if new.
    ///
    /// `Err` with [`PostError::is_peer_fault`] means the sender should be
    /// disconnected; nothing is stored in that case.
    pub fn verify(
        &self,
        envelope: &Envelope,
        now: DateTime<Utc>,
        store: &dyn PostStore,
    ) -> Result<Verdict, PostError> {
        let key = identity::read_public_key(&envelope.public_key)?;
        let id = identity::fingerprint(&key);

        if store.get_one(PostField::Id, &id)?.is_some() {
            return Ok(Verdict::Duplicate { id });
        }
        if envelope.id != id {
            return Err(PostError::IdMismatch {
                claimed: envelope.id.clone(),
                derived: id,
            });
        }

        identity::verify(&key, envelope.data.as_bytes(), &envelope.signature)?;

        let payload: ImportedPayload =
            serde_json::from_str(&envelope.data).map_err(|e| PostError::MalformedPayload {
                reason: e.to_string(),
            })?;
        if payload.id != id {
            return Err(PostError::IdMismatch {
                claimed: payload.id,
                derived: id,
            });
        }
        let created_at = DateTime::parse_from_rfc3339(&payload.date)
            .map_err(|e| PostError::MalformedPayload {
                reason: format!("date {:?}: {e}", payload.date),
            })?
            .with_timezone(&Utc);

        let post = Post {
            id: id.clone(),
            text: payload.text,
            latitude: payload.latitude,
            longitude: payload.longitude,
            public_key: envelope.public_key.clone(),
            private_key: None,
            created_at,
            imported_at: now,
            signature: envelope.signature.clone(),
            raw: envelope.data.clone(),
        };

        if !store.create_one(post.clone())? {
            return Ok(Verdict::Duplicate { id });
        }
        Ok(Verdict::Accepted(post))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SeededKeyGenerator;
    use crate::store::MemoryPostStore;
    use chrono::TimeZone;

    fn codec(seed: u64) -> PostCodec {
        PostCodec::new(Box::new(SeededKeyGenerator::new(seed)))
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn author_produces_self_certifying_envelope() {
        let store = MemoryPostStore::new();
        let authored = codec(1).author(40.0, -74.0, "hello", fixed_now(), &store).unwrap();

        let key = identity::read_public_key(&authored.envelope.public_key).unwrap();
        assert_eq!(authored.envelope.id, identity::fingerprint(&key));
        assert_eq!(authored.post.raw, authored.envelope.data);
        assert!(authored.post.is_local());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn canonical_payload_field_order() {
        let store = MemoryPostStore::new();
        let authored = codec(2).author(40.5, -74.25, "hi", fixed_now(), &store).unwrap();
        let expected = format!(
            r#"{{"id":"{}","text":"hi","latitude":40.5,"date":"2024-05-01T12:00:00.000Z","longitude":-74.25}}"#,
            authored.envelope.id
        );
        assert_eq!(authored.envelope.data, expected);
    }

    #[test]
    fn envelope_wire_format() {
        let envelope = Envelope {
            signature: "s".into(),
            public_key: "k".into(),
            id: "i".into(),
            data: "{}".into(),
        };
        assert_eq!(
            envelope.to_json().unwrap(),
            r#"{"signature":"s","publicKey":"k","id":"i","data":"{}"}"#
        );
        assert_eq!(Envelope::from_json(&envelope.to_json().unwrap()).unwrap(), envelope);
        assert!(Envelope::from_json(r#"{"signature":"s"}"#).is_err());
    }

    #[test]
    fn identities_are_never_reused() {
        let store = MemoryPostStore::new();
        let mut codec = codec(3);
        let a = codec.author(1.0, 1.0, "a", fixed_now(), &store).unwrap();
        let b = codec.author(1.0, 1.0, "a", fixed_now(), &store).unwrap();
        assert_ne!(a.envelope.public_key, b.envelope.public_key);
        assert_ne!(a.envelope.id, b.envelope.id);
    }

    #[test]
    fn verify_accepts_and_stores() {
        let author_store = MemoryPostStore::new();
        let authored = codec(4).author(40.0, -74.0, "hello", fixed_now(), &author_store).unwrap();

        let store = MemoryPostStore::new();
        let later = fixed_now() + chrono::Duration::minutes(3);
        let verdict = codec(99).verify(&authored.envelope, later, &store).unwrap();
        let Verdict::Accepted(post) = verdict else {
            panic!("expected Accepted, got {verdict:?}");
        };
        assert_eq!(post.id, authored.envelope.id);
        assert_eq!(post.text, "hello");
        assert_eq!(post.latitude, "40.0");
        assert_eq!(post.longitude, "-74.0");
        assert_eq!(post.created_at, fixed_now());
        assert_eq!(post.imported_at, later);
        assert_eq!(post.raw, authored.envelope.data);
        assert!(post.private_key.is_none());
        assert_eq!(post.envelope(), authored.envelope);
    }

    #[test]
    fn verify_twice_is_idempotent() {
        let authored = codec(5)
            .author(1.0, 2.0, "twice", fixed_now(), &MemoryPostStore::new())
            .unwrap();
        let store = MemoryPostStore::new();
        let verifier = codec(0);
        assert!(matches!(verifier.verify(&authored.envelope, fixed_now(), &store), Ok(Verdict::Accepted(_))));
        assert!(matches!(verifier.verify(&authored.envelope, fixed_now(), &store), Ok(Verdict::Duplicate { .. })));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn tampered_data_is_rejected() {
        let mut envelope = codec(6)
            .author(1.0, 2.0, "original", fixed_now(), &MemoryPostStore::new())
            .unwrap()
            .envelope;
        envelope.data = envelope.data.replace("original", "forged!!");
        let store = MemoryPostStore::new();
        let err = codec(0).verify(&envelope, fixed_now(), &store).unwrap_err();
        assert!(matches!(err, PostError::InvalidSignature));
        assert!(err.is_peer_fault());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn claimed_id_must_match_key() {
        let mut envelope = codec(7)
            .author(1.0, 2.0, "x", fixed_now(), &MemoryPostStore::new())
            .unwrap()
            .envelope;
        envelope.id = "0".repeat(40);
        let err = codec(0).verify(&envelope, fixed_now(), &MemoryPostStore::new()).unwrap_err();
        assert!(matches!(err, PostError::IdMismatch { .. }));
    }

    #[test]
    fn signed_garbage_payload_is_peer_fault() {
        let mut keys = SeededKeyGenerator::new(8);
        let key = keys.generate();
        let id = identity::fingerprint(&key.verifying_key());
        let data = "not json at all".to_string();
        let envelope = Envelope {
            signature: identity::sign(&key, data.as_bytes()),
            public_key: identity::armor_public_key(&key.verifying_key()),
            id,
            data,
        };
        let err = codec(0).verify(&envelope, fixed_now(), &MemoryPostStore::new()).unwrap_err();
        assert!(matches!(err, PostError::MalformedPayload { .. }));
        assert!(err.is_peer_fault());
    }

    #[test]
    fn string_coordinates_are_accepted() {
        let mut keys = SeededKeyGenerator::new(9);
        let key = keys.generate();
        let id = identity::fingerprint(&key.verifying_key());
        let data = format!(
            r#"{{"id":"{id}","text":"legacy","latitude":"40.7128","date":"2024-05-01T12:00:00.000Z","longitude":"-74.006"}}"#
        );
        let envelope = Envelope {
            signature: identity::sign(&key, data.as_bytes()),
            public_key: identity::armor_public_key(&key.verifying_key()),
            id,
            data,
        };
        let store = MemoryPostStore::new();
        let Verdict::Accepted(post) = codec(0).verify(&envelope, fixed_now(), &store).unwrap() else {
            panic!("expected Accepted");
        };
        assert_eq!(post.latitude, "40.7128");
        assert_eq!(post.coordinates(), Some((40.7128, -74.006)));
    }

    #[test]
    fn non_finite_coordinates_are_refused() {
        let result = codec(10).author(f64::NAN, 0.0, "x", fixed_now(), &MemoryPostStore::new());
        assert!(result.is_err());
    }
}
