use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::constants::{KIND_EPHEMERAL, KIND_REPLACEABLE};
use crate::error::RecordError;
use crate::identity::{verify_signature, AuthorIdentity, AuthorPubkey};

/// Signed relay record.
///
/// `id` is the hex BLAKE3 hash of `[0, pubkey, created_at, kind, tags,
/// content]` serialized as compact JSON, and `sig` the hex Ed25519
/// signature over the id bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub pubkey: AuthorPubkey,
    pub created_at: i64,
    pub kind: u32,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Record {
    pub fn sign(
        identity: &AuthorIdentity,
        kind: u32,
        tags: Vec<Vec<String>>,
        content: String,
        created_at: i64,
    ) -> Self {
        let pubkey = identity.pubkey();
        let id = compute_id(&pubkey, created_at, kind, &tags, &content);
        let sig = hex::encode(identity.sign(id.as_bytes()).to_bytes());
        Self {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig,
        }
    }

    /// Replaceable record addressed by a `d` tag.
    pub fn replaceable(identity: &AuthorIdentity, d_tag: &str, content: String) -> Self {
        Self::sign(
            identity,
            KIND_REPLACEABLE,
            vec![vec!["d".into(), d_tag.into()]],
            content,
            now_secs(),
        )
    }

    pub fn ephemeral(identity: &AuthorIdentity, content: String) -> Self {
        Self::sign(identity, KIND_EPHEMERAL, Vec::new(), content, now_secs())
    }

    pub fn verify(&self) -> Result<(), RecordError> {
        let expected = compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        if expected != self.id {
            return Err(RecordError::IdMismatch);
        }
        let sig = hex::decode(&self.sig).map_err(|_| RecordError::BadSignature)?;
        verify_signature(&self.pubkey, self.id.as_bytes(), &sig)?;
        Ok(())
    }

    pub fn d_tag(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some("d"))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    pub fn is_replaceable(&self) -> bool {
        (30_000..40_000).contains(&self.kind)
    }

    pub fn is_ephemeral(&self) -> bool {
        (20_000..30_000).contains(&self.kind)
    }

    /// Replaceable ordering: newer `created_at` wins, ties go to the lower id.
    pub fn supersedes(&self, other: &Record) -> bool {
        match self.created_at.cmp(&other.created_at) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.id < other.id,
        }
    }

    /// Key under which a relay keeps only the latest replaceable record.
    pub fn replace_key(&self) -> (AuthorPubkey, u32, String) {
        (
            self.pubkey,
            self.kind,
            self.d_tag().unwrap_or_default().to_string(),
        )
    }
}

fn compute_id(
    pubkey: &AuthorPubkey,
    created_at: i64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> String {
    let canonical = serde_json::json!([0, pubkey.to_hex(), created_at, kind, tags, content]);
    blake3::hash(canonical.to_string().as_bytes())
        .to_hex()
        .to_string()
}

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Subscription filter. Absent fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<AuthorPubkey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(rename = "#d", default, skip_serializing_if = "Option::is_none")]
    pub d_tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
}

impl RecordFilter {
    pub fn author(pubkey: AuthorPubkey) -> Self {
        Self {
            authors: Some(vec![pubkey]),
            ..Self::default()
        }
    }

    pub fn kind(mut self, kind: u32) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn d_tag(mut self, tag: impl Into<String>) -> Self {
        self.d_tags.get_or_insert_with(Vec::new).push(tag.into());
        self
    }

    pub fn since(mut self, ts: i64) -> Self {
        self.since = Some(ts);
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        if let Some(authors) = &self.authors {
            if !authors.contains(&record.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&record.kind) {
                return false;
            }
        }
        if let Some(d_tags) = &self.d_tags {
            match record.d_tag() {
                Some(d) if d_tags.iter().any(|t| t == d) => {}
                _ => return false,
            }
        }
        if let Some(since) = self.since {
            if record.created_at < since {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncKey;

    fn identity() -> AuthorIdentity {
        AuthorIdentity::derive(&EncKey::from_bytes([9u8; 32]))
    }

    #[test]
    fn test_signed_record_verifies() {
        let record = Record::replaceable(&identity(), "abcd-efgh-ijkl:m", "payload".into());
        assert!(record.verify().is_ok());
        assert_eq!(record.d_tag(), Some("abcd-efgh-ijkl:m"));
        assert!(record.is_replaceable());
        assert!(!record.is_ephemeral());
    }

    #[test]
    fn test_tampered_content_rejected() {
        let mut record = Record::replaceable(&identity(), "x:m", "payload".into());
        record.content = "other".into();
        assert_eq!(record.verify(), Err(RecordError::IdMismatch));
    }

    #[test]
    fn test_forged_signature_rejected() {
        let other = AuthorIdentity::derive(&EncKey::from_bytes([1u8; 32]));
        let mut record = Record::replaceable(&identity(), "x:m", "payload".into());
        record.sig = hex::encode(other.sign(record.id.as_bytes()).to_bytes());
        assert_eq!(record.verify(), Err(RecordError::BadSignature));
    }

    #[test]
    fn test_supersedes_by_time_then_id() {
        let id = identity();
        let old = Record::sign(&id, KIND_REPLACEABLE, vec![], "a".into(), 100);
        let new = Record::sign(&id, KIND_REPLACEABLE, vec![], "b".into(), 200);
        assert!(new.supersedes(&old));
        assert!(!old.supersedes(&new));

        let tie_a = Record::sign(&id, KIND_REPLACEABLE, vec![], "c".into(), 300);
        let tie_b = Record::sign(&id, KIND_REPLACEABLE, vec![], "d".into(), 300);
        assert_ne!(tie_a.supersedes(&tie_b), tie_b.supersedes(&tie_a));
    }

    #[test]
    fn test_filter_matching() {
        let id = identity();
        let record = Record::replaceable(&id, "s:f:1", "x".into());

        assert!(RecordFilter::author(id.pubkey())
            .kind(KIND_REPLACEABLE)
            .matches(&record));
        assert!(!RecordFilter::author(id.pubkey())
            .kind(KIND_EPHEMERAL)
            .matches(&record));
        assert!(RecordFilter::default().d_tag("s:f:1").matches(&record));
        assert!(!RecordFilter::default().d_tag("s:f:2").matches(&record));
        assert!(!RecordFilter::default()
            .since(record.created_at + 10)
            .matches(&record));
    }

    #[test]
    fn test_filter_json_uses_hash_d() {
        let filter = RecordFilter::default().d_tag("g:keys");
        let json = serde_json::to_string(&filter).unwrap();
        assert_eq!(json, r##"{"#d":["g:keys"]}"##);
    }
}
