//! Subscription filters and the shapes the topology uses.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::event::{EventId, Kind, PubKey};

/// Nostr subscription filter. Absent fields impose no constraint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<BTreeSet<EventId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<BTreeSet<PubKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<BTreeSet<Kind>>,
    #[serde(rename = "#e", default, skip_serializing_if = "Option::is_none")]
    pub tag_e: Option<BTreeSet<EventId>>,
    #[serde(rename = "#p", default, skip_serializing_if = "Option::is_none")]
    pub tag_p: Option<BTreeSet<PubKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Replaceable-metadata kinds for a set of authors: profile, follow list,
/// and both relay lists.
pub fn profiles_filter(authors: impl IntoIterator<Item = PubKey>, since: Option<i64>) -> Filter {
    Filter {
        authors: Some(authors.into_iter().collect()),
        kinds: Some(BTreeSet::from([
            Kind::Metadata,
            Kind::FollowList,
            Kind::RelayListMetadata,
            Kind::PreferredDmRelays,
        ])),
        since,
        ..Filter::default()
    }
}

/// Notes, reposts, and deletions authored by a set of identities.
pub fn user_posts_filter(authors: impl IntoIterator<Item = PubKey>, since: Option<i64>) -> Filter {
    Filter {
        authors: Some(authors.into_iter().collect()),
        kinds: Some(BTreeSet::from([
            Kind::ShortTextNote,
            Kind::Repost,
            Kind::EventDeletion,
        ])),
        since,
        ..Filter::default()
    }
}

/// Events that mention the viewer.
pub fn mentions_filter(viewer: PubKey, since: Option<i64>) -> Filter {
    Filter {
        tag_p: Some(BTreeSet::from([viewer])),
        kinds: Some(BTreeSet::from([
            Kind::ShortTextNote,
            Kind::Repost,
            Kind::Comment,
            Kind::EventDeletion,
        ])),
        since,
        ..Filter::default()
    }
}

/// Gift-wrapped direct messages addressed to the viewer.
pub fn gift_wrap_filter(viewer: PubKey, since: Option<i64>) -> Filter {
    Filter {
        tag_p: Some(BTreeSet::from([viewer])),
        kinds: Some(BTreeSet::from([Kind::GiftWrap])),
        since,
        ..Filter::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::testutil::pubkey_of;

    #[test]
    fn filter_wire_shape() {
        let f = mentions_filter(pubkey_of(3), Some(99));
        let val = serde_json::to_value(&f).unwrap();
        assert_eq!(val["#p"][0], pubkey_of(3).to_string());
        assert_eq!(val["since"], 99);
        assert!(val.get("authors").is_none());
        assert!(val.get("until").is_none());
        let kinds: Vec<u64> = val["kinds"]
            .as_array()
            .unwrap()
            .iter()
            .map(|k| k.as_u64().unwrap())
            .collect();
        assert_eq!(kinds, vec![1, 5, 6, 1111]);
    }

    #[test]
    fn filter_round_trip() {
        let f = Filter {
            authors: Some(BTreeSet::from([pubkey_of(1), pubkey_of(2)])),
            kinds: Some(BTreeSet::from([Kind::Metadata, Kind::GiftWrap])),
            tag_e: Some(BTreeSet::from(["aa".repeat(32).parse().unwrap()])),
            since: Some(1),
            until: Some(2),
            limit: Some(10),
            ..Filter::default()
        };
        let json = serde_json::to_string(&f).unwrap();
        let back: Filter = serde_json::from_str(&json).unwrap();
        assert_eq!(back, f);
    }

    #[test]
    fn gift_wrap_filter_targets_viewer() {
        let f = gift_wrap_filter(pubkey_of(1), Some(10));
        assert_eq!(f.kinds, Some(BTreeSet::from([Kind::GiftWrap])));
        assert_eq!(f.tag_p, Some(BTreeSet::from([pubkey_of(1)])));
        assert_eq!(f.since, Some(10));
        assert!(f.authors.is_none());
    }

    #[test]
    fn profiles_filter_covers_metadata_kinds() {
        let f = profiles_filter([pubkey_of(1)], None);
        let kinds = f.kinds.unwrap();
        for k in [
            Kind::Metadata,
            Kind::FollowList,
            Kind::RelayListMetadata,
            Kind::PreferredDmRelays,
        ] {
            assert!(kinds.contains(&k));
        }
    }
}
