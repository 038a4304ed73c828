//! Nostr event model and validation.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// 32-byte x-only public key identifying an author.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PubKey(#[serde(with = "hex32")] pub [u8; 32]);

/// 32-byte event identifier (SHA-256 of the canonical serialization).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(#[serde(with = "hex32")] pub [u8; 32]);

/// 64-byte Schnorr signature.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sig(#[serde(with = "hex64")] pub [u8; 64]);

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", self)
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self)
    }
}

impl fmt::Debug for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sig({})", hex::encode(self.0))
    }
}

impl FromStr for PubKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PubKey(decode_fixed::<32>(s)?))
    }
}

impl FromStr for EventId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(EventId(decode_fixed::<32>(s)?))
    }
}

/// Decode a fixed-width hex string.
fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], ValidationError> {
    let bytes = hex::decode(s).map_err(|_| ValidationError::BadEncoding)?;
    let arr: [u8; N] = bytes
        .try_into()
        .map_err(|_| ValidationError::BadEncoding)?;
    Ok(arr)
}

mod hex32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(de)?;
        super::decode_fixed::<32>(&s).map_err(serde::de::Error::custom)
    }
}

mod hex64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 64], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 64], D::Error> {
        let s = String::deserialize(de)?;
        super::decode_fixed::<64>(&s).map_err(serde::de::Error::custom)
    }
}

/// Event kinds the engine routes; anything else is persisted untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Metadata,
    ShortTextNote,
    FollowList,
    EventDeletion,
    Repost,
    Reaction,
    Seal,
    GiftWrap,
    Comment,
    RelayListMetadata,
    PreferredDmRelays,
    Other(u16),
}

impl Kind {
    pub fn as_u16(self) -> u16 {
        match self {
            Kind::Metadata => 0,
            Kind::ShortTextNote => 1,
            Kind::FollowList => 3,
            Kind::EventDeletion => 5,
            Kind::Repost => 6,
            Kind::Reaction => 7,
            Kind::Seal => 13,
            Kind::GiftWrap => 1059,
            Kind::Comment => 1111,
            Kind::RelayListMetadata => 10002,
            Kind::PreferredDmRelays => 10050,
            Kind::Other(k) => k,
        }
    }
}

impl From<u16> for Kind {
    fn from(k: u16) -> Self {
        match k {
            0 => Kind::Metadata,
            1 => Kind::ShortTextNote,
            3 => Kind::FollowList,
            5 => Kind::EventDeletion,
            6 => Kind::Repost,
            7 => Kind::Reaction,
            13 => Kind::Seal,
            1059 => Kind::GiftWrap,
            1111 => Kind::Comment,
            10002 => Kind::RelayListMetadata,
            10050 => Kind::PreferredDmRelays,
            other => Kind::Other(other),
        }
    }
}

impl Serialize for Kind {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u16(self.as_u16())
    }
}

impl<'de> Deserialize<'de> for Kind {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        Ok(Kind::from(u16::deserialize(de)?))
    }
}

/// Tag variants, dispatched on the first array element. Tags carrying more
/// positions than the variant models stay `Other` so the canonical
/// serialization survives a round trip untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum Tag {
    Event {
        id: EventId,
        relay_hint: Option<String>,
        marker: Option<String>,
    },
    PubKey {
        key: PubKey,
        relay_hint: Option<String>,
        petname: Option<String>,
    },
    Relay {
        uri: String,
        marker: Option<String>,
    },
    Other(Vec<String>),
}

impl Tag {
    fn to_fields(&self) -> Vec<String> {
        match self {
            Tag::Event {
                id,
                relay_hint,
                marker,
            } => {
                let mut v = vec!["e".to_string(), id.to_string()];
                if let Some(r) = relay_hint {
                    v.push(r.clone());
                    if let Some(m) = marker {
                        v.push(m.clone());
                    }
                }
                v
            }
            Tag::PubKey {
                key,
                relay_hint,
                petname,
            } => {
                let mut v = vec!["p".to_string(), key.to_string()];
                if let Some(r) = relay_hint {
                    v.push(r.clone());
                    if let Some(p) = petname {
                        v.push(p.clone());
                    }
                }
                v
            }
            Tag::Relay { uri, marker } => {
                let mut v = vec!["r".to_string(), uri.clone()];
                if let Some(m) = marker {
                    v.push(m.clone());
                }
                v
            }
            Tag::Other(fields) => fields.clone(),
        }
    }

    fn from_fields(fields: Vec<String>) -> Tag {
        match fields.first().map(String::as_str) {
            Some("e") if (2..=4).contains(&fields.len()) => match fields[1].parse::<EventId>() {
                Ok(id) => Tag::Event {
                    id,
                    relay_hint: fields.get(2).cloned(),
                    marker: fields.get(3).cloned(),
                },
                Err(_) => Tag::Other(fields),
            },
            Some("p") if (2..=4).contains(&fields.len()) => match fields[1].parse::<PubKey>() {
                Ok(key) => Tag::PubKey {
                    key,
                    relay_hint: fields.get(2).cloned(),
                    petname: fields.get(3).cloned(),
                },
                Err(_) => Tag::Other(fields),
            },
            Some("r") if (2..=3).contains(&fields.len()) => Tag::Relay {
                uri: fields[1].clone(),
                marker: fields.get(2).cloned(),
            },
            _ => Tag::Other(fields),
        }
    }
}

impl Serialize for Tag {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        self.to_fields().serialize(ser)
    }
}

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        Ok(Tag::from_fields(Vec::<String>::deserialize(de)?))
    }
}

/// Core signed event as carried on the wire and persisted on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub pubkey: PubKey,
    pub created_at: i64,
    pub kind: Kind,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: Sig,
}

impl Event {
    /// Targets of every `p` tag, in tag order, deduplicated.
    pub fn p_tag_targets(&self) -> Vec<PubKey> {
        p_targets(&self.tags)
    }

    /// Ids of every `e` tag, in tag order.
    pub fn e_tag_ids(&self) -> Vec<EventId> {
        self.tags
            .iter()
            .filter_map(|t| match t {
                Tag::Event { id, .. } => Some(*id),
                _ => None,
            })
            .collect()
    }
}

fn p_targets(tags: &[Tag]) -> Vec<PubKey> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for tag in tags {
        if let Tag::PubKey { key, .. } = tag {
            if seen.insert(*key) {
                out.push(*key);
            }
        }
    }
    out
}

/// An event plus the set of relay URIs it has been observed on.
/// Re-observation union-merges the relay set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventWithRelays {
    pub event: Event,
    pub relays: BTreeSet<String>,
}

impl EventWithRelays {
    pub fn new(event: Event, relay: impl Into<String>) -> Self {
        EventWithRelays {
            event,
            relays: BTreeSet::from([relay.into()]),
        }
    }
}

/// Unsigned inner payload of a sealed direct message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rumor {
    pub pubkey: PubKey,
    pub created_at: i64,
    pub kind: Kind,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl Rumor {
    pub fn p_tag_targets(&self) -> Vec<PubKey> {
        p_targets(&self.tags)
    }
}

/// Profile fields carried in a kind-0 event's JSON content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
}

/// One entry of a follow list, in list order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Follow {
    pub target: PubKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub petname: Option<String>,
}

/// Declared purpose of a relay in an owner's relay lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayRole {
    InboxOnly,
    OutboxOnly,
    Both,
    DmRelay,
}

/// A relay URI with its declared role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relay {
    pub uri: String,
    pub role: RelayRole,
}

impl Relay {
    pub fn inbox_capable(&self) -> bool {
        matches!(self.role, RelayRole::InboxOnly | RelayRole::Both)
    }

    pub fn outbox_capable(&self) -> bool {
        matches!(self.role, RelayRole::OutboxOnly | RelayRole::Both)
    }
}

/// Normalize and validate a relay URI: `ws://` or `wss://` with a host.
pub fn parse_relay_uri(raw: &str) -> Result<String, ValidationError> {
    let url = Url::parse(raw.trim()).map_err(|_| ValidationError::BadRelayUri)?;
    match url.scheme() {
        "ws" | "wss" => {}
        _ => return Err(ValidationError::BadRelayUri),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ValidationError::BadRelayUri);
    }
    Ok(url.to_string())
}

/// Event acceptance failures.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("id does not match canonical hash")]
    IdMismatch,
    #[error("schnorr signature does not verify")]
    BadSignature,
    #[error("malformed hex field")]
    BadEncoding,
    #[error("relay uri must be ws:// or wss:// with a host")]
    BadRelayUri,
    #[error("canonical serialization failed: {0}")]
    Serialize(String),
}

/// Recompute the canonical event hash from its fields.
pub fn event_hash(
    pubkey: &PubKey,
    created_at: i64,
    kind: Kind,
    tags: &[Tag],
    content: &str,
) -> Result<[u8; 32], ValidationError> {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr).map_err(|e| ValidationError::Serialize(e.to_string()))?;
    Ok(Sha256::digest(&data).into())
}

/// Verify an event's id and Schnorr signature. Called on every externally
/// sourced event before any side-effect.
pub fn validate(ev: &Event) -> Result<(), ValidationError> {
    let hash = event_hash(&ev.pubkey, ev.created_at, ev.kind, &ev.tags, &ev.content)?;
    if hash != ev.id.0 {
        return Err(ValidationError::IdMismatch);
    }
    let sig = Signature::from_slice(&ev.sig.0).map_err(|_| ValidationError::BadEncoding)?;
    let pk = XOnlyPublicKey::from_slice(&ev.pubkey.0).map_err(|_| ValidationError::BadEncoding)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(&hash).map_err(|_| ValidationError::BadEncoding)?;
    secp.verify_schnorr(&sig, &msg, &pk)
        .map_err(|_| ValidationError::BadSignature)
}
