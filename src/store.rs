//! Transactional event store with derived timeline indexes.
//!
//! One LMDB environment per viewer. Writes that span tables run in a single
//! transaction behind a process-wide write lock; reads take their own
//! snapshot transaction per call and never block writers.

use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, Mutex};

use heed::types::{Bytes, SerdeJson};
use heed::{Database, Env, EnvOpenOptions, RwTxn};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::event::{EventId, EventWithRelays, Follow, Kind, Profile, PubKey, Relay};

const MAP_SIZE: usize = 500 * 1024 * 1024 * 1024;
const MAX_READERS: u32 = 126;
const MAX_DBS: u32 = 8;

/// Store failures. The ingest loop aborts the current batch on these and
/// surfaces "store unavailable" when they repeat.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(#[from] heed::Error),
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
}

/// A write the router asks the store to perform. One event's ops are applied
/// inside one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Upsert into `events`, union-merging relay sets, and advance the
    /// author's per-kind watermark.
    PutEvent(EventWithRelays),
    /// Insert a post-timeline entry for an author.
    IndexPost {
        author: PubKey,
        created_at: i64,
        id: EventId,
    },
    /// Insert a chat-timeline entry under each participant.
    IndexChat {
        participants: Vec<PubKey>,
        created_at: i64,
        id: EventId,
    },
    /// Advance a per-(key, kind) watermark without touching `events`.
    TrackLatest {
        key: PubKey,
        kind: Kind,
        created_at: i64,
    },
    /// Remove targets owned by `author`; foreign targets are left alone.
    ApplyDeletion {
        author: PubKey,
        targets: Vec<EventId>,
    },
    PutProfile {
        author: PubKey,
        profile: Profile,
        created_at: i64,
        id: EventId,
    },
    PutFollows {
        author: PubKey,
        follows: Vec<Follow>,
        created_at: i64,
        id: EventId,
    },
    PutGeneralRelays {
        author: PubKey,
        relays: Vec<Relay>,
        created_at: i64,
        id: EventId,
    },
    PutDmRelays {
        author: PubKey,
        relays: Vec<Relay>,
        created_at: i64,
        id: EventId,
    },
}

/// Which timeline table to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeline {
    Posts,
    Chats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredProfile {
    profile: Profile,
    created_at: i64,
    id: EventId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredFollows {
    follows: Vec<Follow>,
    created_at: i64,
    id: EventId,
}

/// Both replaceable relay lists for one identity share a row; each half is
/// last-writer-wins on its own timestamp.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredRelayLists {
    general: Vec<Relay>,
    general_at: i64,
    general_id: Option<EventId>,
    dm: Vec<Relay>,
    dm_at: i64,
    dm_id: Option<EventId>,
}

#[derive(Clone, Copy)]
struct Tables {
    events: Database<Bytes, SerdeJson<EventWithRelays>>,
    profiles: Database<Bytes, SerdeJson<StoredProfile>>,
    follows: Database<Bytes, SerdeJson<StoredFollows>>,
    relay_lists: Database<Bytes, SerdeJson<StoredRelayLists>>,
    latest: Database<Bytes, Bytes>,
    post_timeline: Database<Bytes, Bytes>,
    chat_timeline: Database<Bytes, Bytes>,
}

/// Handle to the viewer's on-disk store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    env: Env,
    tables: Tables,
    write_lock: Arc<Mutex<()>>,
}

impl Store {
    /// Open (or create) the environment under `root`.
    pub fn open(root: &Path) -> Result<Store, StoreError> {
        std::fs::create_dir_all(root)?;
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(MAP_SIZE)
                .max_readers(MAX_READERS)
                .max_dbs(MAX_DBS)
                .open(root)?
        };
        let mut wtxn = env.write_txn()?;
        let tables = Tables {
            events: env.create_database(&mut wtxn, Some("events"))?,
            profiles: env.create_database(&mut wtxn, Some("profiles"))?,
            follows: env.create_database(&mut wtxn, Some("follows"))?,
            relay_lists: env.create_database(&mut wtxn, Some("relay_lists"))?,
            latest: env.create_database(&mut wtxn, Some("latest"))?,
            post_timeline: env.create_database(&mut wtxn, Some("post_timeline"))?,
            chat_timeline: env.create_database(&mut wtxn, Some("chat_timeline"))?,
        };
        wtxn.commit()?;
        Ok(Store {
            env,
            tables,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Apply a batch of ops in one write transaction.
    pub fn apply(&self, ops: &[StoreOp]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut wtxn = self.env.write_txn()?;
        for op in ops {
            self.apply_op(&mut wtxn, op)?;
        }
        wtxn.commit()?;
        Ok(())
    }

    fn apply_op(&self, wtxn: &mut RwTxn, op: &StoreOp) -> Result<(), StoreError> {
        let t = self.tables;
        match op {
            StoreOp::PutEvent(incoming) => {
                let ev = &incoming.event;
                let merged = match t.events.get(wtxn, &ev.id.0)? {
                    Some(mut existing) => {
                        existing.relays.extend(incoming.relays.iter().cloned());
                        existing
                    }
                    None => incoming.clone(),
                };
                t.events.put(wtxn, &ev.id.0, &merged)?;
                self.track_latest(wtxn, &ev.pubkey, ev.kind, ev.created_at)?;
            }
            StoreOp::IndexPost {
                author,
                created_at,
                id,
            } => {
                let key = timeline_key(author, *created_at, id);
                t.post_timeline.put(wtxn, &key, &id.0)?;
            }
            StoreOp::IndexChat {
                participants,
                created_at,
                id,
            } => {
                for participant in participants {
                    let key = timeline_key(participant, *created_at, id);
                    t.chat_timeline.put(wtxn, &key, &id.0)?;
                }
            }
            StoreOp::TrackLatest {
                key,
                kind,
                created_at,
            } => {
                self.track_latest(wtxn, key, *kind, *created_at)?;
            }
            StoreOp::ApplyDeletion { author, targets } => {
                for target in targets {
                    let Some(stored) = t.events.get(wtxn, &target.0)? else {
                        continue;
                    };
                    let ev = &stored.event;
                    if ev.pubkey != *author {
                        continue;
                    }
                    if matches!(ev.kind, Kind::ShortTextNote | Kind::Repost) {
                        let key = timeline_key(&ev.pubkey, ev.created_at, target);
                        t.post_timeline.delete(wtxn, &key)?;
                    }
                    t.events.delete(wtxn, &target.0)?;
                }
            }
            StoreOp::PutProfile {
                author,
                profile,
                created_at,
                id,
            } => {
                let keep = t
                    .profiles
                    .get(wtxn, &author.0)?
                    .map_or(true, |old| wins(*created_at, id, old.created_at, &old.id));
                if keep {
                    t.profiles.put(
                        wtxn,
                        &author.0,
                        &StoredProfile {
                            profile: profile.clone(),
                            created_at: *created_at,
                            id: *id,
                        },
                    )?;
                }
            }
            StoreOp::PutFollows {
                author,
                follows,
                created_at,
                id,
            } => {
                let keep = t
                    .follows
                    .get(wtxn, &author.0)?
                    .map_or(true, |old| wins(*created_at, id, old.created_at, &old.id));
                if keep {
                    t.follows.put(
                        wtxn,
                        &author.0,
                        &StoredFollows {
                            follows: follows.clone(),
                            created_at: *created_at,
                            id: *id,
                        },
                    )?;
                }
            }
            StoreOp::PutGeneralRelays {
                author,
                relays,
                created_at,
                id,
            } => {
                let mut lists = t.relay_lists.get(wtxn, &author.0)?.unwrap_or_default();
                let keep = match lists.general_id {
                    Some(old_id) => wins(*created_at, id, lists.general_at, &old_id),
                    None => true,
                };
                if keep {
                    lists.general = relays.clone();
                    lists.general_at = *created_at;
                    lists.general_id = Some(*id);
                    t.relay_lists.put(wtxn, &author.0, &lists)?;
                }
            }
            StoreOp::PutDmRelays {
                author,
                relays,
                created_at,
                id,
            } => {
                let mut lists = t.relay_lists.get(wtxn, &author.0)?.unwrap_or_default();
                let keep = match lists.dm_id {
                    Some(old_id) => wins(*created_at, id, lists.dm_at, &old_id),
                    None => true,
                };
                if keep {
                    lists.dm = relays.clone();
                    lists.dm_at = *created_at;
                    lists.dm_id = Some(*id);
                    t.relay_lists.put(wtxn, &author.0, &lists)?;
                }
            }
        }
        Ok(())
    }

    fn track_latest(
        &self,
        wtxn: &mut RwTxn,
        key: &PubKey,
        kind: Kind,
        created_at: i64,
    ) -> Result<(), StoreError> {
        let k = latest_key(key, kind);
        let advance = match self.tables.latest.get(wtxn, &k)? {
            Some(raw) => decode_ts(raw).map_or(true, |old| created_at > old),
            None => true,
        };
        if advance {
            self.tables.latest.put(wtxn, &k, &created_at.to_be_bytes())?;
        }
        Ok(())
    }

    pub fn get_event(&self, id: &EventId) -> Result<Option<EventWithRelays>, StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(read_tolerant(self.tables.events.get(&rtxn, &id.0), "events"))
    }

    /// Stored profile, or an empty one at timestamp 0 when absent.
    pub fn get_profile(&self, pk: &PubKey) -> Result<(Profile, i64), StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(read_tolerant(self.tables.profiles.get(&rtxn, &pk.0), "profiles")
            .map(|p| (p.profile, p.created_at))
            .unwrap_or_default())
    }

    pub fn get_follows(&self, pk: &PubKey) -> Result<Vec<Follow>, StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(read_tolerant(self.tables.follows.get(&rtxn, &pk.0), "follows")
            .map(|f| f.follows)
            .unwrap_or_default())
    }

    pub fn get_general_relays(&self, pk: &PubKey) -> Result<Vec<Relay>, StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(
            read_tolerant(self.tables.relay_lists.get(&rtxn, &pk.0), "relay_lists")
                .map(|l| l.general)
                .unwrap_or_default(),
        )
    }

    pub fn get_dm_relays(&self, pk: &PubKey) -> Result<Vec<Relay>, StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(
            read_tolerant(self.tables.relay_lists.get(&rtxn, &pk.0), "relay_lists")
                .map(|l| l.dm)
                .unwrap_or_default(),
        )
    }

    /// Whether a general / DM relay list has ever been stored for `pk`.
    pub fn has_relay_lists(&self, pk: &PubKey) -> Result<(bool, bool), StoreError> {
        let rtxn = self.env.read_txn()?;
        let lists =
            read_tolerant(self.tables.relay_lists.get(&rtxn, &pk.0), "relay_lists")
                .unwrap_or_default();
        Ok((lists.general_id.is_some(), lists.dm_id.is_some()))
    }

    /// Newest-first event ids for one author. Timeline keys carry the
    /// inverted big-endian timestamp, so a plain cursor walk over the author
    /// prefix is already newest-first.
    pub fn get_timeline_ids(
        &self,
        timeline: Timeline,
        author: &PubKey,
        limit: usize,
    ) -> Result<Vec<EventId>, StoreError> {
        let db = match timeline {
            Timeline::Posts => self.tables.post_timeline,
            Timeline::Chats => self.tables.chat_timeline,
        };
        let rtxn = self.env.read_txn()?;
        let mut low = [0u8; 72];
        let mut high = [0xffu8; 72];
        low[..32].copy_from_slice(&author.0);
        high[..32].copy_from_slice(&author.0);
        let range = (Bound::Included(&low[..]), Bound::Included(&high[..]));
        let mut out = Vec::new();
        for item in db.range(&rtxn, &range)? {
            let (_, value) = item?;
            match <[u8; 32]>::try_from(value) {
                Ok(bytes) => out.push(EventId(bytes)),
                Err(_) => {
                    warn!(len = value.len(), "skipping undecodable timeline value");
                    continue;
                }
            }
            if out.len() == limit {
                break;
            }
        }
        Ok(out)
    }

    /// Minimum over authors of the maximum stored `created_at` for the given
    /// kinds. `None` when any author has nothing stored for any of the
    /// kinds, so a fresh identity forces a full backfill.
    pub fn latest_timestamp(
        &self,
        pks: &[PubKey],
        kinds: &[Kind],
    ) -> Result<Option<i64>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let mut overall: Option<i64> = None;
        for pk in pks {
            let mut best: Option<i64> = None;
            for kind in kinds {
                if let Some(raw) = self.tables.latest.get(&rtxn, &latest_key(pk, *kind))? {
                    if let Some(ts) = decode_ts(raw) {
                        best = Some(best.map_or(ts, |b| b.max(ts)));
                    }
                }
            }
            let Some(best) = best else {
                return Ok(None);
            };
            overall = Some(overall.map_or(best, |o| o.min(best)));
        }
        Ok(overall)
    }

    /// Every stored event, undecodable rows skipped. Used by index rebuilds
    /// and diagnostics.
    pub fn all_events(&self) -> Result<Vec<EventWithRelays>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for item in self.tables.events.iter(&rtxn)? {
            match item {
                Ok((_, ev)) => out.push(ev),
                Err(e) => {
                    warn!(error = %e, "skipping undecodable event row");
                }
            }
        }
        Ok(out)
    }

    /// Drop every derived table so a replay of `events` can rebuild them.
    pub fn clear_derived(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut wtxn = self.env.write_txn()?;
        self.tables.profiles.clear(&mut wtxn)?;
        self.tables.follows.clear(&mut wtxn)?;
        self.tables.relay_lists.clear(&mut wtxn)?;
        self.tables.latest.clear(&mut wtxn)?;
        self.tables.post_timeline.clear(&mut wtxn)?;
        self.tables.chat_timeline.clear(&mut wtxn)?;
        wtxn.commit()?;
        Ok(())
    }
}

/// Newer timestamp wins; equal timestamps resolve to the lower id so
/// replicas converge.
fn wins(new_ts: i64, new_id: &EventId, old_ts: i64, old_id: &EventId) -> bool {
    new_ts > old_ts || (new_ts == old_ts && new_id < old_id)
}

fn read_tolerant<T>(res: Result<Option<T>, heed::Error>, table: &'static str) -> Option<T> {
    match res {
        Ok(v) => v,
        Err(e) => {
            warn!(table, error = %e, "skipping undecodable row");
            None
        }
    }
}

fn inverted_ts(created_at: i64) -> u64 {
    i64::MAX.saturating_sub(created_at.max(0)) as u64
}

/// pubkey ‖ inverted big-endian timestamp ‖ event id.
fn timeline_key(author: &PubKey, created_at: i64, id: &EventId) -> [u8; 72] {
    let mut key = [0u8; 72];
    key[..32].copy_from_slice(&author.0);
    key[32..40].copy_from_slice(&inverted_ts(created_at).to_be_bytes());
    key[40..].copy_from_slice(&id.0);
    key
}

/// pubkey ‖ big-endian kind.
fn latest_key(pk: &PubKey, kind: Kind) -> [u8; 34] {
    let mut key = [0u8; 34];
    key[..32].copy_from_slice(&pk.0);
    key[32..].copy_from_slice(&kind.as_u16().to_be_bytes());
    key
}

fn decode_ts(raw: &[u8]) -> Option<i64> {
    <[u8; 8]>::try_from(raw).ok().map(i64::from_be_bytes)
}
