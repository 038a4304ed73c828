//! Top-level controller: derives the relay topology from the local store,
//! realizes it over live connections, and owns the ingest loop.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use anyhow::Result;
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::crypto;
use crate::event::{validate, Event, EventId, Kind, PubKey, Relay, RelayRole, Rumor};
use crate::filter::{gift_wrap_filter, mentions_filter, profiles_filter, user_posts_filter};
use crate::keys::Identity;
use crate::relay::{ConnState, ConnectOptions, ConnectedGauge, RelayConnection};
use crate::router::Router;
use crate::store::{Store, StoreError, StoreOp};
use crate::subscription::{IngestReceiver, SubscriptionEvent, SubscriptionManager};

const COLD_START_DEADLINE: Duration = Duration::from_secs(10);
const OUTBOX_RELAYS_PER_FOLLOW: usize = 3;
const MAX_CONSECUTIVE_STORE_ERRORS: u32 = 3;

/// What one relay should be doing for us.
#[derive(Debug, Clone, Default, PartialEq)]
struct RelayPlan {
    /// Gift-wrap subscription for the viewer (a preferred DM relay).
    dm: bool,
    /// Mentions subscription (a viewer inbox relay).
    mentions: bool,
    /// Followed identities whose outbox this relay serves.
    authors: BTreeSet<PubKey>,
}

impl RelayPlan {
    fn is_empty(&self) -> bool {
        !self.dm && !self.mentions && self.authors.is_empty()
    }
}

/// Desired set of (relay, plan) pairs.
#[derive(Debug, Clone, Default, PartialEq)]
struct Topology {
    relays: BTreeMap<String, RelayPlan>,
}

/// Derive the desired topology from the store: the viewer's DM and inbox
/// relays, plus up to three outbox relays per followed identity with the
/// viewer's own inbox relays ranked first so one socket serves both sides.
fn derive_topology(store: &Store, viewer: PubKey) -> Result<Topology, StoreError> {
    let follows = store.get_follows(&viewer)?;
    let dm_relays = store.get_dm_relays(&viewer)?;
    let inbox: Vec<String> = store
        .get_general_relays(&viewer)?
        .into_iter()
        .filter(|r| r.inbox_capable())
        .map(|r| r.uri)
        .collect();
    let inbox_set: BTreeSet<&str> = inbox.iter().map(String::as_str).collect();

    let mut topo = Topology::default();
    for relay in &dm_relays {
        topo.relays.entry(relay.uri.clone()).or_default().dm = true;
    }
    for uri in &inbox {
        topo.relays.entry(uri.clone()).or_default().mentions = true;
    }
    for follow in &follows {
        let mut outbox: Vec<String> = Vec::new();
        for relay in store.get_general_relays(&follow.target)? {
            if relay.outbox_capable() && !outbox.contains(&relay.uri) {
                outbox.push(relay.uri);
            }
        }
        let mut ranked: Vec<&String> = outbox
            .iter()
            .filter(|u| inbox_set.contains(u.as_str()))
            .collect();
        ranked.extend(outbox.iter().filter(|u| !inbox_set.contains(u.as_str())));
        for uri in ranked.into_iter().take(OUTBOX_RELAYS_PER_FOLLOW) {
            topo.relays
                .entry(uri.clone())
                .or_default()
                .authors
                .insert(follow.target);
        }
    }
    topo.relays.retain(|_, plan| !plan.is_empty());
    Ok(topo)
}

/// A connected relay plus the subscriptions realized on it.
struct LiveRelay {
    conn: RelayConnection,
    plan: RelayPlan,
    dm_sub: Option<String>,
    mentions_sub: Option<String>,
    author_subs: Vec<String>,
}

impl LiveRelay {
    fn new(conn: RelayConnection) -> LiveRelay {
        LiveRelay {
            conn,
            plan: RelayPlan::default(),
            dm_sub: None,
            mentions_sub: None,
            author_subs: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct RelayStats {
    invalid_events: u64,
    decrypt_failures: u64,
}

struct Controller {
    cfg: Settings,
    store: Store,
    identity: Identity,
    router: Router,
    subs: SubscriptionManager,
    queue_rx: IngestReceiver,
    pool: HashMap<String, LiveRelay>,
    gauge: ConnectedGauge,
    opts: ConnectOptions,
    shutdown_rx: watch::Receiver<bool>,
    stats: HashMap<String, RelayStats>,
    store_errors: u32,
}

/// Public handle to the engine.
pub struct InboxModel {
    task: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    connected_rx: watch::Receiver<usize>,
}

impl InboxModel {
    /// Bootstrap (cold-starting an empty store), realize the topology, and
    /// launch the ingest loop. Errors here are fatal: bad key material,
    /// unusable store, or no relay reachable.
    pub async fn start(cfg: Settings, store: Store, identity: Identity) -> Result<InboxModel> {
        let (subs, queue_rx) = SubscriptionManager::new();
        let (gauge, connected_rx) = ConnectedGauge::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let opts = ConnectOptions {
            connect_timeout: cfg.connect_timeout,
            socks_proxy: cfg.socks_proxy.clone(),
        };
        let router = Router::new(identity.public_key());
        let mut controller = Controller {
            cfg,
            store,
            identity,
            router,
            subs,
            queue_rx,
            pool: HashMap::new(),
            gauge,
            opts,
            shutdown_rx,
            stats: HashMap::new(),
            store_errors: 0,
        };
        controller.bootstrap().await?;
        let task = tokio::spawn(controller.run());
        Ok(InboxModel {
            task: Some(task),
            shutdown_tx,
            connected_rx,
        })
    }

    /// True once at least one relay is connected, or false after `wait`.
    pub async fn await_at_least_one_connected(&self, wait: Duration) -> bool {
        let mut rx = self.connected_rx.clone();
        timeout(wait, async move {
            loop {
                if *rx.borrow_and_update() > 0 {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    /// Stop the ingest loop first, then disconnect every relay.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(mut task) = self.task.take() {
            if timeout(Duration::from_secs(5), &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

impl Controller {
    async fn bootstrap(&mut self) -> Result<()> {
        let viewer = self.identity.public_key();
        info!(viewer = %viewer, "starting inbox engine");
        let (has_general, _) = self.store.has_relay_lists(&viewer)?;
        if !has_general {
            self.cold_start().await?;
        }
        self.ensure_default_relay_lists()?;
        let desired = derive_topology(&self.store, viewer)?;
        self.reconcile(desired).await;
        Ok(())
    }

    /// No stored relay metadata yet: ask the configured default relays for
    /// the viewer's own replaceable events, drain until every bootstrap
    /// subscription sees EOSE or the deadline passes, then tear the
    /// bootstrap subscriptions down again.
    async fn cold_start(&mut self) -> Result<()> {
        info!("no relay metadata stored, cold-starting from default relays");
        let viewer = self.identity.public_key();
        for uri in self.cfg.default_relays.clone() {
            self.add_relay(uri);
        }
        self.await_pool_connects().await;

        let mut pending: BTreeSet<String> = BTreeSet::new();
        for live in self.pool.values() {
            match self
                .subs
                .subscribe(&live.conn, vec![profiles_filter([viewer], None)])
            {
                Ok(sub_id) => {
                    pending.insert(sub_id);
                }
                Err(e) => warn!(error = %e, "bootstrap subscribe failed"),
            }
        }

        let deadline = Instant::now() + COLD_START_DEADLINE;
        while !pending.is_empty() {
            let Ok(next) = timeout_at(deadline, self.queue_rx.recv()).await else {
                warn!("cold start deadline reached before every EOSE");
                break;
            };
            let Some((relay, item)) = next else { break };
            match item {
                SubscriptionEvent::EventAppeared(event) => {
                    self.ingest_event(&relay, event);
                }
                SubscriptionEvent::Eose(sub_id) | SubscriptionEvent::Closed(sub_id, _) => {
                    pending.remove(&sub_id);
                }
            }
        }
        for live in self.pool.values() {
            self.subs.stop_all(&live.conn);
        }
        Ok(())
    }

    /// Write default relay lists, but only where none has ever been stored.
    fn ensure_default_relay_lists(&self) -> Result<(), StoreError> {
        let viewer = self.identity.public_key();
        let (has_general, has_dm) = self.store.has_relay_lists(&viewer)?;
        let mut ops = Vec::new();
        if !has_general {
            ops.push(StoreOp::PutGeneralRelays {
                author: viewer,
                relays: self
                    .cfg
                    .default_relays
                    .iter()
                    .map(|uri| Relay {
                        uri: uri.clone(),
                        role: RelayRole::Both,
                    })
                    .collect(),
                created_at: 0,
                id: EventId([0u8; 32]),
            });
        }
        if !has_dm {
            ops.push(StoreOp::PutDmRelays {
                author: viewer,
                relays: self
                    .cfg
                    .default_relays
                    .iter()
                    .map(|uri| Relay {
                        uri: uri.clone(),
                        role: RelayRole::DmRelay,
                    })
                    .collect(),
                created_at: 0,
                id: EventId([0u8; 32]),
            });
        }
        if !ops.is_empty() {
            info!("writing default relay lists for the viewer");
            self.store.apply(&ops)?;
        }
        Ok(())
    }

    /// Single consumer of the shared queue: block for one item, drain the
    /// rest, apply, then run at most one coalesced reconcile.
    async fn run(mut self) {
        info!("ingest loop running");
        let mut reconfigure_pending = false;
        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    // a dropped handle counts as shutdown
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                next = self.queue_rx.recv() => {
                    let Some(first) = next else { break };
                    let mut batch = vec![first];
                    while let Ok(more) = self.queue_rx.try_recv() {
                        batch.push(more);
                    }
                    for (relay, item) in batch {
                        match item {
                            SubscriptionEvent::EventAppeared(event) => {
                                if self.ingest_event(&relay, event) {
                                    reconfigure_pending = true;
                                }
                            }
                            SubscriptionEvent::Eose(sub_id) => {
                                if let Some(entry) = self.subs.registry().get(&sub_id) {
                                    debug!(
                                        relay,
                                        sub_id,
                                        events = entry.event_count,
                                        bytes = entry.byte_count,
                                        "eose"
                                    );
                                }
                            }
                            SubscriptionEvent::Closed(sub_id, reason) => {
                                if self.handle_closed(&relay, &sub_id, &reason) {
                                    reconfigure_pending = true;
                                }
                            }
                        }
                        if self.store_errors >= MAX_CONSECUTIVE_STORE_ERRORS {
                            error!("store unavailable, halting ingest");
                            self.teardown().await;
                            return;
                        }
                    }
                    if reconfigure_pending {
                        reconfigure_pending = false;
                        match derive_topology(&self.store, self.identity.public_key()) {
                            Ok(desired) => self.reconcile(desired).await,
                            Err(e) => warn!(error = %e, "topology derivation failed"),
                        }
                    }
                }
            }
        }
        self.teardown().await;
    }

    /// Validate, unwrap when sealed, route, and apply in one transaction.
    /// Returns whether the router asked for a reconfigure.
    fn ingest_event(&mut self, relay: &str, event: Event) -> bool {
        if let Err(e) = validate(&event) {
            let stats = self.stats.entry(relay.to_string()).or_default();
            stats.invalid_events += 1;
            warn!(relay, error = %e, count = stats.invalid_events, "dropping invalid event");
            return false;
        }
        let rumor: Option<Rumor> = if event.kind == Kind::GiftWrap {
            match crypto::unwrap_gift_wrap(&event, &self.identity) {
                Ok(rumor) => Some(rumor),
                Err(e) => {
                    let stats = self.stats.entry(relay.to_string()).or_default();
                    stats.decrypt_failures += 1;
                    warn!(relay, error = %e, count = stats.decrypt_failures, "dropping sealed event");
                    return false;
                }
            }
        } else {
            None
        };
        let routed = self.router.route(relay, &event, rumor.as_ref());
        match self.store.apply(&routed.ops) {
            Ok(()) => {
                self.store_errors = 0;
                routed.reconfigure
            }
            Err(e) => {
                self.store_errors += 1;
                error!(error = %e, "store transaction failed, batch dropped");
                false
            }
        }
    }

    /// A relay closed one of our subscriptions. Permanent refusals stay
    /// closed; anything else is reopened by the next reconcile.
    fn handle_closed(&mut self, relay: &str, sub_id: &str, reason: &str) -> bool {
        warn!(relay, sub_id, reason, "subscription closed by relay");
        if is_permanent_close(reason) {
            return false;
        }
        self.subs.registry().remove(sub_id);
        if let Some(live) = self.pool.get_mut(relay) {
            if live.dm_sub.as_deref() == Some(sub_id) {
                live.dm_sub = None;
            }
            if live.mentions_sub.as_deref() == Some(sub_id) {
                live.mentions_sub = None;
            }
            live.author_subs.retain(|id| id != sub_id);
        }
        true
    }

    fn add_relay(&mut self, uri: String) -> &mut LiveRelay {
        let subs = self.subs.clone();
        let opts = self.opts.clone();
        let gauge = self.gauge.clone();
        self.pool.entry(uri.clone()).or_insert_with(|| {
            info!(relay = %uri, "connecting");
            LiveRelay::new(RelayConnection::spawn(
                uri,
                opts,
                subs.registry(),
                subs.queue_sender(),
                gauge,
            ))
        })
    }

    /// Wait for every pooled connection's first attempt, concurrently.
    /// Failures are logged by the connection tasks and do not abort.
    async fn await_pool_connects(&self) {
        let waits: Vec<_> = self
            .pool
            .values()
            .map(|live| live.conn.connect(self.opts.connect_timeout))
            .collect();
        join_all(waits).await;
    }

    /// Diff the desired topology against the live pool. Reconcile is scoped
    /// per purpose: author subscriptions move when a relay's pubkey set
    /// changes, the gift-wrap subscription only when the DM relay set
    /// changes, the mentions subscription only when the inbox set changes.
    async fn reconcile(&mut self, desired: Topology) {
        let viewer = self.identity.public_key();

        let stale: Vec<String> = self
            .pool
            .keys()
            .filter(|uri| !desired.relays.contains_key(*uri))
            .cloned()
            .collect();
        for uri in stale {
            if let Some(live) = self.pool.remove(&uri) {
                info!(relay = %uri, "disconnecting");
                self.subs.stop_all(&live.conn);
                live.conn.disconnect().await;
            }
        }

        for uri in desired.relays.keys() {
            self.add_relay(uri.clone());
        }
        self.await_pool_connects().await;

        let subs = self.subs.clone();
        let store = self.store.clone();
        for (uri, plan) in desired.relays {
            let Some(live) = self.pool.get_mut(&uri) else {
                continue;
            };
            if live.conn.state() != ConnState::Connected {
                warn!(relay = %uri, "not connected, subscriptions deferred to next reconcile");
                continue;
            }

            if !plan.dm {
                if let Some(sub_id) = live.dm_sub.take() {
                    subs.stop(&live.conn, &sub_id);
                }
            } else if live.dm_sub.is_none() {
                let since = store
                    .latest_timestamp(&[viewer], &[Kind::GiftWrap])
                    .unwrap_or(None);
                match subs.subscribe(&live.conn, vec![gift_wrap_filter(viewer, since)]) {
                    Ok(sub_id) => live.dm_sub = Some(sub_id),
                    Err(e) => warn!(relay = %uri, error = %e, "dm subscribe failed"),
                }
            }

            if !plan.mentions {
                if let Some(sub_id) = live.mentions_sub.take() {
                    subs.stop(&live.conn, &sub_id);
                }
            } else if live.mentions_sub.is_none() {
                let since = store
                    .latest_timestamp(
                        &[viewer],
                        &[
                            Kind::ShortTextNote,
                            Kind::Repost,
                            Kind::Comment,
                            Kind::EventDeletion,
                        ],
                    )
                    .unwrap_or(None);
                match subs.subscribe(&live.conn, vec![mentions_filter(viewer, since)]) {
                    Ok(sub_id) => live.mentions_sub = Some(sub_id),
                    Err(e) => warn!(relay = %uri, error = %e, "mentions subscribe failed"),
                }
            }

            let authors_changed = plan.authors != live.plan.authors;
            if (authors_changed || live.author_subs.is_empty()) && !plan.authors.is_empty() {
                for sub_id in live.author_subs.drain(..) {
                    subs.stop(&live.conn, &sub_id);
                }
                let authors: Vec<PubKey> = plan.authors.iter().copied().collect();
                let profile_since = store
                    .latest_timestamp(
                        &authors,
                        &[
                            Kind::RelayListMetadata,
                            Kind::PreferredDmRelays,
                            Kind::FollowList,
                        ],
                    )
                    .unwrap_or(None);
                let posts_since = store
                    .latest_timestamp(
                        &authors,
                        &[Kind::ShortTextNote, Kind::Repost, Kind::EventDeletion],
                    )
                    .unwrap_or(None);
                for filter in [
                    profiles_filter(authors.iter().copied(), profile_since),
                    user_posts_filter(authors.iter().copied(), posts_since),
                ] {
                    match subs.subscribe(&live.conn, vec![filter]) {
                        Ok(sub_id) => live.author_subs.push(sub_id),
                        Err(e) => warn!(relay = %uri, error = %e, "author subscribe failed"),
                    }
                }
            } else if plan.authors.is_empty() {
                for sub_id in live.author_subs.drain(..) {
                    subs.stop(&live.conn, &sub_id);
                }
            }

            live.plan = plan;
        }
    }

    async fn teardown(&mut self) {
        info!("disconnecting all relays");
        for (_, live) in self.pool.drain() {
            self.subs.stop_all(&live.conn);
            live.conn.disconnect().await;
        }
    }
}

/// NIP-01 machine-readable close reasons that will not succeed on retry.
fn is_permanent_close(reason: &str) -> bool {
    ["auth-required:", "restricted:", "invalid:"]
        .iter()
        .any(|prefix| reason.starts_with(prefix))
}

/// Rebuild every derived table by replaying the stored events. Gift wraps
/// that no longer decrypt keep their event row but lose their chat entries.
pub fn rebuild_indexes(store: &Store, identity: &Identity) -> Result<()> {
    store.clear_derived()?;
    let router = Router::new(identity.public_key());
    let mut replayed = 0usize;
    for stored in store.all_events()? {
        let event = stored.event.clone();
        if validate(&event).is_err() {
            warn!(id = %event.id, "skipping stored event that no longer validates");
            continue;
        }
        let rumor = if event.kind == Kind::GiftWrap {
            crypto::unwrap_gift_wrap(&event, identity).ok()
        } else {
            None
        };
        let relay = stored.relays.iter().next().cloned().unwrap_or_default();
        let mut routed = router.route(&relay, &event, rumor.as_ref());
        for op in &mut routed.ops {
            if let StoreOp::PutEvent(ewr) = op {
                ewr.relays = stored.relays.clone();
            }
        }
        store.apply(&routed.ops)?;
        replayed += 1;
    }
    info!(replayed, "rebuilt derived tables");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::testutil::gift_wrap;
    use crate::event::testutil::{pubkey_of, sign_event, signed_event};
    use crate::event::{Follow, Sig, Tag};
    use crate::filter::Filter;
    use crate::store::Timeline;
    use secp256k1::{Keypair, Secp256k1};
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message as TMsg;

    /// Minimal client-side view of what a relay would match.
    fn filter_matches(f: &Filter, ev: &Event) -> bool {
        if let Some(authors) = &f.authors {
            if !authors.contains(&ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &f.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if let Some(tag_p) = &f.tag_p {
            if !ev.p_tag_targets().iter().any(|pk| tag_p.contains(pk)) {
                return false;
            }
        }
        if let Some(since) = f.since {
            if ev.created_at < since {
                return false;
            }
        }
        true
    }

    /// Scripted relay: serves matching canned events then EOSE per REQ,
    /// streams broadcast events to matching live subscriptions, and records
    /// every frame it receives. Handles sequential reconnects.
    struct FakeRelay {
        uri: String,
        events: Arc<Mutex<Vec<Event>>>,
        log: Arc<Mutex<Vec<String>>>,
        live_tx: tokio::sync::broadcast::Sender<Event>,
    }

    impl FakeRelay {
        async fn start(events: Vec<Event>) -> FakeRelay {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let uri = format!("ws://{}/", listener.local_addr().unwrap());
            let events = Arc::new(Mutex::new(events));
            let log = Arc::new(Mutex::new(Vec::new()));
            let (live_tx, _) = tokio::sync::broadcast::channel::<Event>(64);
            let events_task = events.clone();
            let log_task = log.clone();
            let live_task = live_tx.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    let events = events_task.clone();
                    let log = log_task.clone();
                    let mut live_rx = live_task.subscribe();
                    tokio::spawn(async move {
                        let Ok(mut ws) = accept_async(stream).await else {
                            return;
                        };
                        use futures_util::{SinkExt, StreamExt};
                        let mut subs: std::collections::HashMap<String, Vec<Filter>> =
                            std::collections::HashMap::new();
                        loop {
                            tokio::select! {
                                msg = ws.next() => {
                                    let Some(Ok(msg)) = msg else { return };
                                    let TMsg::Text(text) = msg else { continue };
                                    log.lock().unwrap().push(text.clone());
                                    let Ok(v) = serde_json::from_str::<Value>(&text) else {
                                        continue;
                                    };
                                    if v[0] == "REQ" {
                                        let sub = v[1].as_str().unwrap_or_default().to_string();
                                        let filters: Vec<Filter> = v.as_array().unwrap()[2..]
                                            .iter()
                                            .filter_map(|f| serde_json::from_value(f.clone()).ok())
                                            .collect();
                                        let canned = events.lock().unwrap().clone();
                                        for ev in canned {
                                            if filters.iter().any(|f| filter_matches(f, &ev)) {
                                                let frame = json!(["EVENT", sub, ev]).to_string();
                                                if ws.send(TMsg::Text(frame)).await.is_err() {
                                                    return;
                                                }
                                            }
                                        }
                                        if ws
                                            .send(TMsg::Text(json!(["EOSE", sub]).to_string()))
                                            .await
                                            .is_err()
                                        {
                                            return;
                                        }
                                        subs.insert(sub, filters);
                                    } else if v[0] == "CLOSE" {
                                        if let Some(sub) = v[1].as_str() {
                                            subs.remove(sub);
                                        }
                                    }
                                }
                                ev = live_rx.recv() => {
                                    let Ok(ev) = ev else { continue };
                                    for (sub, filters) in &subs {
                                        if filters.iter().any(|f| filter_matches(f, &ev)) {
                                            let frame = json!(["EVENT", sub, ev]).to_string();
                                            if ws.send(TMsg::Text(frame)).await.is_err() {
                                                return;
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    });
                }
            });
            FakeRelay {
                uri,
                events,
                log,
                live_tx,
            }
        }

        fn push_event(&self, ev: Event) {
            self.events.lock().unwrap().push(ev);
        }

        /// Stream an event to currently open matching subscriptions.
        fn broadcast(&self, ev: Event) {
            let _ = self.live_tx.send(ev);
        }

        fn frames(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn req_count(&self) -> usize {
            self.frames().iter().filter(|f| f.contains("\"REQ\"")).count()
        }

        fn close_count(&self) -> usize {
            self.frames().iter().filter(|f| f.contains("\"CLOSE\"")).count()
        }
    }

    fn keypair(seed: u8) -> Keypair {
        Keypair::from_seckey_slice(&Secp256k1::new(), &[seed; 32]).unwrap()
    }

    fn identity(seed: u8) -> Identity {
        Identity::from_secret_hex(&hex::encode([seed; 32])).unwrap()
    }

    fn settings(dir: &TempDir, default_relays: Vec<String>) -> Settings {
        Settings {
            data_dir: PathBuf::from(dir.path()),
            default_relays,
            secret_key: None,
            key_file: None,
            socks_proxy: None,
            connect_timeout: Duration::from_secs(2),
        }
    }

    fn relay_list_event(seed: u8, created_at: i64, uris: &[&str]) -> Event {
        let tags = uris
            .iter()
            .map(|u| Tag::Relay {
                uri: (*u).to_string(),
                marker: None,
            })
            .collect();
        signed_event(seed, Kind::RelayListMetadata, created_at, tags, "")
    }

    fn follow_list_event(kp: &Keypair, created_at: i64, targets: &[PubKey]) -> Event {
        let tags = targets
            .iter()
            .map(|pk| Tag::PubKey {
                key: *pk,
                relay_hint: None,
                petname: None,
            })
            .collect();
        sign_event(kp, Kind::FollowList, created_at, tags, "")
    }

    async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            if Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    fn seed_viewer_relays(store: &Store, viewer: PubKey, general: &[&str], dm: &[&str]) {
        store
            .apply(&[
                StoreOp::PutGeneralRelays {
                    author: viewer,
                    relays: general
                        .iter()
                        .map(|u| Relay {
                            uri: (*u).to_string(),
                            role: RelayRole::Both,
                        })
                        .collect(),
                    created_at: 1,
                    id: EventId([1u8; 32]),
                },
                StoreOp::PutDmRelays {
                    author: viewer,
                    relays: dm
                        .iter()
                        .map(|u| Relay {
                            uri: (*u).to_string(),
                            role: RelayRole::DmRelay,
                        })
                        .collect(),
                    created_at: 1,
                    id: EventId([1u8; 32]),
                },
            ])
            .unwrap();
    }

    // ---- topology derivation ----

    #[test]
    fn topology_caps_outbox_fanout_and_prioritizes_viewer_inbox() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let viewer = pubkey_of(1);
        let friend = pubkey_of(2);
        seed_viewer_relays(&store, viewer, &["wss://in.example/"], &[]);
        store
            .apply(&[
                StoreOp::PutFollows {
                    author: viewer,
                    follows: vec![Follow {
                        target: friend,
                        relay_hint: None,
                        petname: None,
                    }],
                    created_at: 1,
                    id: EventId([1u8; 32]),
                },
                StoreOp::PutGeneralRelays {
                    author: friend,
                    relays: [
                        "wss://f1.example/",
                        "wss://f2.example/",
                        "wss://f3.example/",
                        "wss://in.example/",
                        "wss://f5.example/",
                    ]
                    .iter()
                    .map(|u| Relay {
                        uri: (*u).to_string(),
                        role: RelayRole::Both,
                    })
                    .collect(),
                    created_at: 1,
                    id: EventId([2u8; 32]),
                },
            ])
            .unwrap();

        let topo = derive_topology(&store, viewer).unwrap();
        // the shared inbox relay is taken first, then the first two others
        let with_friend: BTreeSet<&String> = topo
            .relays
            .iter()
            .filter(|(_, plan)| plan.authors.contains(&friend))
            .map(|(uri, _)| uri)
            .collect();
        assert_eq!(with_friend.len(), OUTBOX_RELAYS_PER_FOLLOW);
        assert!(with_friend.contains(&"wss://in.example/".to_string()));
        assert!(with_friend.contains(&"wss://f1.example/".to_string()));
        assert!(with_friend.contains(&"wss://f2.example/".to_string()));
        assert!(topo.relays["wss://in.example/"].mentions);
    }

    #[test]
    fn topology_marks_dm_relays_and_skips_unknown_outboxes() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let viewer = pubkey_of(1);
        seed_viewer_relays(
            &store,
            viewer,
            &["wss://in.example/"],
            &["wss://dm.example/"],
        );
        store
            .apply(&[StoreOp::PutFollows {
                author: viewer,
                follows: vec![Follow {
                    // nothing stored about this identity
                    target: pubkey_of(7),
                    relay_hint: None,
                    petname: None,
                }],
                created_at: 1,
                id: EventId([1u8; 32]),
            }])
            .unwrap();
        let topo = derive_topology(&store, viewer).unwrap();
        assert!(topo.relays["wss://dm.example/"].dm);
        assert!(!topo.relays["wss://dm.example/"].mentions);
        assert!(topo
            .relays
            .values()
            .all(|plan| plan.authors.is_empty()));
    }

    #[test]
    fn topology_read_only_relays_are_not_outboxes() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let viewer = pubkey_of(1);
        let friend = pubkey_of(2);
        seed_viewer_relays(&store, viewer, &[], &[]);
        store
            .apply(&[
                StoreOp::PutFollows {
                    author: viewer,
                    follows: vec![Follow {
                        target: friend,
                        relay_hint: None,
                        petname: None,
                    }],
                    created_at: 1,
                    id: EventId([1u8; 32]),
                },
                StoreOp::PutGeneralRelays {
                    author: friend,
                    relays: vec![
                        Relay {
                            uri: "wss://read.example/".into(),
                            role: RelayRole::InboxOnly,
                        },
                        Relay {
                            uri: "wss://write.example/".into(),
                            role: RelayRole::OutboxOnly,
                        },
                    ],
                    created_at: 1,
                    id: EventId([2u8; 32]),
                },
            ])
            .unwrap();
        let topo = derive_topology(&store, viewer).unwrap();
        assert_eq!(topo.relays.len(), 1);
        assert!(topo.relays["wss://write.example/"]
            .authors
            .contains(&friend));
    }

    // ---- end to end ----

    #[tokio::test(flavor = "multi_thread")]
    async fn cold_start_writes_defaults_once() {
        let relay = FakeRelay::start(vec![]).await;
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("db")).unwrap();
        let cfg = settings(&dir, vec![relay.uri.clone()]);
        let viewer_id = identity(1);
        let viewer = viewer_id.public_key();

        let mut model = InboxModel::start(cfg, store.clone(), viewer_id)
            .await
            .unwrap();
        assert!(model.await_at_least_one_connected(Duration::from_secs(2)).await);

        assert_eq!(store.has_relay_lists(&viewer).unwrap(), (true, true));
        let general = store.get_general_relays(&viewer).unwrap();
        assert_eq!(general.len(), 1);
        assert_eq!(general[0].uri, relay.uri);
        assert_eq!(general[0].role, RelayRole::Both);
        let dm = store.get_dm_relays(&viewer).unwrap();
        assert_eq!(dm[0].role, RelayRole::DmRelay);

        model.stop().await;
        assert!(!model.await_at_least_one_connected(Duration::from_millis(200)).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cold_start_persists_served_metadata_instead_of_defaults() {
        let other = FakeRelay::start(vec![]).await;
        let viewer_id = identity(1);
        let viewer = viewer_id.public_key();
        let served = relay_list_event(1, 50, &[&other.uri]);
        let bootstrap = FakeRelay::start(vec![served]).await;

        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("db")).unwrap();
        let cfg = settings(&dir, vec![bootstrap.uri.clone()]);
        let mut model = InboxModel::start(cfg, store.clone(), viewer_id)
            .await
            .unwrap();

        // the served relay list wins; only the dm default is injected
        let general = store.get_general_relays(&viewer).unwrap();
        assert_eq!(general.len(), 1);
        assert_eq!(general[0].uri, other.uri);
        let dm = store.get_dm_relays(&viewer).unwrap();
        assert_eq!(dm[0].uri, bootstrap.uri);

        model.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cold_start_follow_list_drives_the_connection_set() {
        let f1_outbox = FakeRelay::start(vec![]).await;
        let f2_outbox = FakeRelay::start(vec![]).await;
        let (f1, f2) = (pubkey_of(2), pubkey_of(3));

        let viewer_kp = keypair(1);
        let viewer_id = identity(1);
        let viewer = viewer_id.public_key();
        let bootstrap = FakeRelay::start(vec![]).await;
        bootstrap.push_event(relay_list_event(1, 50, &[&bootstrap.uri]));
        bootstrap.push_event(follow_list_event(&viewer_kp, 50, &[f1, f2]));

        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("db")).unwrap();
        // the follows' outboxes are already known; the viewer's own
        // metadata arrives through the cold-start drain
        store
            .apply(&[
                StoreOp::PutGeneralRelays {
                    author: f1,
                    relays: vec![Relay {
                        uri: f1_outbox.uri.clone(),
                        role: RelayRole::Both,
                    }],
                    created_at: 1,
                    id: EventId([2u8; 32]),
                },
                StoreOp::PutGeneralRelays {
                    author: f2,
                    relays: vec![Relay {
                        uri: f2_outbox.uri.clone(),
                        role: RelayRole::Both,
                    }],
                    created_at: 1,
                    id: EventId([3u8; 32]),
                },
            ])
            .unwrap();

        let cfg = settings(&dir, vec![bootstrap.uri.clone()]);
        let mut model = InboxModel::start(cfg, store.clone(), viewer_id)
            .await
            .unwrap();

        assert_eq!(store.get_follows(&viewer).unwrap().len(), 2);
        // each followed identity's outbox carries its author subscriptions
        wait_until("f1 outbox subscribed", || f1_outbox.req_count() >= 2).await;
        wait_until("f2 outbox subscribed", || f2_outbox.req_count() >= 2).await;
        model.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn notes_from_followed_authors_reach_the_post_timeline() {
        let friend_kp = keypair(2);
        let friend = pubkey_of(2);
        let outbox = FakeRelay::start(vec![]).await;
        let note = sign_event(&friend_kp, Kind::ShortTextNote, 40, vec![], "hi all");
        outbox.push_event(note.clone());
        outbox.push_event(relay_list_event(2, 30, &[&outbox.uri]));

        let viewer_id = identity(1);
        let viewer = viewer_id.public_key();
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("db")).unwrap();
        seed_viewer_relays(&store, viewer, &[&outbox.uri], &[]);
        store
            .apply(&[
                StoreOp::PutFollows {
                    author: viewer,
                    follows: vec![Follow {
                        target: friend,
                        relay_hint: None,
                        petname: None,
                    }],
                    created_at: 1,
                    id: EventId([1u8; 32]),
                },
                StoreOp::PutGeneralRelays {
                    author: friend,
                    relays: vec![Relay {
                        uri: outbox.uri.clone(),
                        role: RelayRole::Both,
                    }],
                    created_at: 1,
                    id: EventId([2u8; 32]),
                },
            ])
            .unwrap();

        let cfg = settings(&dir, vec![outbox.uri.clone()]);
        let mut model = InboxModel::start(cfg, store.clone(), viewer_id)
            .await
            .unwrap();

        let store_poll = store.clone();
        wait_until("note in post timeline", move || {
            store_poll
                .get_timeline_ids(Timeline::Posts, &friend, 10)
                .map(|ids| ids.contains(&note.id))
                .unwrap_or(false)
        })
        .await;
        model.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_events_never_reach_the_store() {
        let relay = FakeRelay::start(vec![]).await;
        let mut forged = signed_event(2, Kind::ShortTextNote, 40, vec![], "bad");
        forged.sig = Sig([0u8; 64]);
        relay.push_event(forged.clone());

        let viewer_id = identity(1);
        let viewer = viewer_id.public_key();
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("db")).unwrap();
        seed_viewer_relays(&store, viewer, &[&relay.uri], &[]);
        store
            .apply(&[
                StoreOp::PutFollows {
                    author: viewer,
                    follows: vec![Follow {
                        target: pubkey_of(2),
                        relay_hint: None,
                        petname: None,
                    }],
                    created_at: 1,
                    id: EventId([1u8; 32]),
                },
                StoreOp::PutGeneralRelays {
                    author: pubkey_of(2),
                    relays: vec![Relay {
                        uri: relay.uri.clone(),
                        role: RelayRole::Both,
                    }],
                    created_at: 1,
                    id: EventId([2u8; 32]),
                },
            ])
            .unwrap();

        let cfg = settings(&dir, vec![relay.uri.clone()]);
        let mut model = InboxModel::start(cfg, store.clone(), viewer_id)
            .await
            .unwrap();
        // give the ingest loop a moment with the forged event
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(store.get_event(&forged.id).unwrap().is_none());
        model.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn gift_wrap_lands_in_chat_timeline() {
        let dm_relay = FakeRelay::start(vec![]).await;
        let viewer_id = identity(1);
        let viewer = viewer_id.public_key();
        let sender_kp = keypair(2);
        let rumor = Rumor {
            pubkey: pubkey_of(2),
            created_at: 500,
            kind: Kind::ShortTextNote,
            tags: vec![Tag::PubKey {
                key: viewer,
                relay_hint: None,
                petname: None,
            }],
            content: "hey".into(),
        };
        let wrap = gift_wrap(&sender_kp, viewer, &rumor);
        dm_relay.push_event(wrap.clone());

        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("db")).unwrap();
        seed_viewer_relays(&store, viewer, &[], &[&dm_relay.uri]);

        let cfg = settings(&dir, vec![dm_relay.uri.clone()]);
        let mut model = InboxModel::start(cfg, store.clone(), viewer_id)
            .await
            .unwrap();

        let store_poll = store.clone();
        let sender = pubkey_of(2);
        wait_until("wrap in chat timeline", move || {
            store_poll
                .get_timeline_ids(Timeline::Chats, &sender, 10)
                .map(|ids| ids.contains(&wrap.id))
                .unwrap_or(false)
        })
        .await;
        assert!(store
            .get_timeline_ids(Timeline::Chats, &viewer, 10)
            .unwrap()
            .is_empty());
        model.stop().await;
    }

    fn seed_single_follow_setup(store: &Store, viewer: PubKey, friend: PubKey, outbox_uri: &str) {
        seed_viewer_relays(store, viewer, &[], &[]);
        store
            .apply(&[
                StoreOp::PutFollows {
                    author: viewer,
                    follows: vec![Follow {
                        target: friend,
                        relay_hint: None,
                        petname: None,
                    }],
                    created_at: 1,
                    id: EventId([1u8; 32]),
                },
                StoreOp::PutGeneralRelays {
                    author: friend,
                    relays: vec![Relay {
                        uri: outbox_uri.to_string(),
                        role: RelayRole::Both,
                    }],
                    created_at: 1,
                    id: EventId([2u8; 32]),
                },
            ])
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn relay_list_change_moves_author_subscriptions() {
        let old_outbox = FakeRelay::start(vec![]).await;
        let new_outbox = FakeRelay::start(vec![]).await;
        let friend = pubkey_of(2);

        let viewer_id = identity(1);
        let viewer = viewer_id.public_key();
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("db")).unwrap();
        seed_single_follow_setup(&store, viewer, friend, &old_outbox.uri);

        let cfg = settings(&dir, vec![old_outbox.uri.clone()]);
        let mut model = InboxModel::start(cfg, store.clone(), viewer_id)
            .await
            .unwrap();
        // profiles + posts on the friend's outbox
        wait_until("initial author subscriptions", || old_outbox.req_count() == 2).await;

        // the friend announces a new outbox through the live profiles sub
        old_outbox.broadcast(relay_list_event(2, 60, &[&new_outbox.uri]));

        let store_poll = store.clone();
        let new_uri = new_outbox.uri.clone();
        wait_until("friend outbox recorded", move || {
            store_poll
                .get_general_relays(&friend)
                .map(|rs| rs.iter().any(|r| r.uri == new_uri))
                .unwrap_or(false)
        })
        .await;
        // reconcile follows: author subscriptions land on the new outbox
        wait_until("author subscriptions on new outbox", || {
            new_outbox.req_count() >= 2
        })
        .await;
        model.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconcile_without_metadata_change_causes_no_churn() {
        let outbox = FakeRelay::start(vec![]).await;
        let friend = pubkey_of(2);

        let viewer_id = identity(1);
        let viewer = viewer_id.public_key();
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("db")).unwrap();
        seed_single_follow_setup(&store, viewer, friend, &outbox.uri);

        let cfg = settings(&dir, vec![outbox.uri.clone()]);
        let mut model = InboxModel::start(cfg, store.clone(), viewer_id)
            .await
            .unwrap();
        wait_until("initial author subscriptions", || outbox.req_count() == 2).await;

        // a fresh relay-list event naming the same outbox: the store updates
        // its timestamp, reconcile runs, and nothing moves
        let same_list = relay_list_event(2, 60, &[&outbox.uri]);
        outbox.broadcast(same_list.clone());
        let store_poll = store.clone();
        wait_until("relay list event ingested", move || {
            store_poll
                .get_event(&same_list.id)
                .map(|e| e.is_some())
                .unwrap_or(false)
        })
        .await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(outbox.req_count(), 2, "no resubscribes");
        assert_eq!(outbox.close_count(), 0, "no teardowns");
        model.stop().await;
    }
}
