//! Event classification into store operations.
//!
//! The router is pure: it never touches the store or the network. The ingest
//! loop validates the event, unwraps gift wraps, calls `route`, and applies
//! the returned ops inside one store transaction.

use std::collections::BTreeSet;

use crate::event::{
    parse_relay_uri, validate, Event, Follow, Kind, Profile, PubKey, Relay, RelayRole, Rumor,
    Tag,
};
use crate::event::EventWithRelays;
use crate::store::StoreOp;

/// Result of routing one event.
#[derive(Debug, Default, PartialEq)]
pub struct Routed {
    pub ops: Vec<StoreOp>,
    /// Set when a metadata change requires the controller to recompute the
    /// relay topology.
    pub reconfigure: bool,
}

/// Classifies events for one viewing identity.
#[derive(Debug, Clone, Copy)]
pub struct Router {
    viewer: PubKey,
}

impl Router {
    pub fn new(viewer: PubKey) -> Router {
        Router { viewer }
    }

    /// Map a validated event (plus its decrypted rumor for gift wraps) to
    /// store ops. Gift wraps whose rumor is absent produce nothing.
    pub fn route(&self, relay: &str, event: &Event, rumor: Option<&Rumor>) -> Routed {
        let mut out = Routed::default();
        if event.kind == Kind::GiftWrap && rumor.is_none() {
            return out;
        }
        out.ops
            .push(StoreOp::PutEvent(EventWithRelays::new(event.clone(), relay)));

        match event.kind {
            Kind::ShortTextNote => out.ops.push(StoreOp::IndexPost {
                author: event.pubkey,
                created_at: event.created_at,
                id: event.id,
            }),
            Kind::Repost => {
                // embedded event must validate and the repost must reference it
                let inner: Option<Event> = serde_json::from_str(&event.content).ok();
                let inner_valid = inner.map_or(false, |ev| validate(&ev).is_ok());
                if inner_valid && !event.e_tag_ids().is_empty() {
                    out.ops.push(StoreOp::IndexPost {
                        author: event.pubkey,
                        created_at: event.created_at,
                        id: event.id,
                    });
                }
            }
            Kind::GiftWrap => {
                if let Some(rumor) = rumor {
                    out.ops.push(StoreOp::IndexChat {
                        participants: self.chat_participants(rumor),
                        created_at: rumor.created_at,
                        id: event.id,
                    });
                    for recipient in event.p_tag_targets() {
                        out.ops.push(StoreOp::TrackLatest {
                            key: recipient,
                            kind: Kind::GiftWrap,
                            created_at: event.created_at,
                        });
                    }
                }
            }
            Kind::EventDeletion => out.ops.push(StoreOp::ApplyDeletion {
                author: event.pubkey,
                targets: event.e_tag_ids(),
            }),
            Kind::Metadata => {
                if let Ok(profile) = serde_json::from_str::<Profile>(&event.content) {
                    out.ops.push(StoreOp::PutProfile {
                        author: event.pubkey,
                        profile,
                        created_at: event.created_at,
                        id: event.id,
                    });
                }
            }
            Kind::FollowList => {
                out.ops.push(StoreOp::PutFollows {
                    author: event.pubkey,
                    follows: follows_from(event),
                    created_at: event.created_at,
                    id: event.id,
                });
                if event.pubkey == self.viewer {
                    out.reconfigure = true;
                }
            }
            Kind::RelayListMetadata => {
                out.ops.push(StoreOp::PutGeneralRelays {
                    author: event.pubkey,
                    relays: general_relays_from(event),
                    created_at: event.created_at,
                    id: event.id,
                });
                out.reconfigure = true;
            }
            Kind::PreferredDmRelays => {
                out.ops.push(StoreOp::PutDmRelays {
                    author: event.pubkey,
                    relays: dm_relays_from(event),
                    created_at: event.created_at,
                    id: event.id,
                });
                if event.pubkey == self.viewer {
                    out.reconfigure = true;
                }
            }
            Kind::Reaction | Kind::Comment | Kind::Seal | Kind::Other(_) => {}
        }
        out
    }

    /// Participants of a decrypted rumor, sorted. A rumor we authored files
    /// under its recipients only; one from a peer files under everyone but
    /// the viewer.
    fn chat_participants(&self, rumor: &Rumor) -> Vec<PubKey> {
        let mut set: BTreeSet<PubKey> = rumor.p_tag_targets().into_iter().collect();
        if rumor.pubkey != self.viewer {
            set.insert(rumor.pubkey);
            set.remove(&self.viewer);
        }
        set.into_iter().collect()
    }
}

/// Follow entries from a follow list's `p` tags, list order preserved.
fn follows_from(event: &Event) -> Vec<Follow> {
    event
        .tags
        .iter()
        .filter_map(|tag| match tag {
            Tag::PubKey {
                key,
                relay_hint,
                petname,
            } => Some(Follow {
                target: *key,
                relay_hint: relay_hint.clone().filter(|s| !s.is_empty()),
                petname: petname.clone().filter(|s| !s.is_empty()),
            }),
            _ => None,
        })
        .collect()
}

/// Relays from a relay-list's `r` tags. Bad URIs and unknown markers are
/// rejected at ingress.
fn general_relays_from(event: &Event) -> Vec<Relay> {
    event
        .tags
        .iter()
        .filter_map(|tag| match tag {
            Tag::Relay { uri, marker } => {
                let uri = parse_relay_uri(uri).ok()?;
                let role = match marker.as_deref() {
                    None | Some("") => RelayRole::Both,
                    Some("read") => RelayRole::InboxOnly,
                    Some("write") => RelayRole::OutboxOnly,
                    Some(_) => return None,
                };
                Some(Relay { uri, role })
            }
            _ => None,
        })
        .collect()
}

/// Relays from a DM relay list's `relay` tags.
fn dm_relays_from(event: &Event) -> Vec<Relay> {
    event
        .tags
        .iter()
        .filter_map(|tag| match tag {
            Tag::Other(fields) if fields.len() >= 2 && fields[0] == "relay" => {
                let uri = parse_relay_uri(&fields[1]).ok()?;
                Some(Relay {
                    uri,
                    role: RelayRole::DmRelay,
                })
            }
            _ => None,
        })
        .collect()
}
