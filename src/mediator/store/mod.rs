//! Coordination protocol on a hierarchical store.
//!
//! ## Node layout
//!
//! ```text
//! /rolling-tx/chain/<txId>                          -> "<group>|<peer>|<createdAtMillis>"
//! /rolling-tx/chain/<txId>/<group>/<peer>/<index>   -> join payload
//! /rolling-tx/state/<txId>                          -> "0" | "1" | "<method>[|failureType]"
//! ```
//!
//! Creation is idempotent: missing parents are created on the way down and
//! `NodeExists` from a concurrent creator is swallowed, which is what lets
//! two peers race to index 0 of the same chain.
//!
//! Each state node is watched at most once per process. Store watches are
//! one-shot, so the notification handler re-arms the watch before doing
//! anything else.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use super::{
    ChainEntry, Decision, ExpiryReport, MediatorClient, MediatorError, MediatorWatcher, Result,
    RollbackDetail, TransactionResult, CHAIN_ROOT, FIELD_SEPARATOR, STATE_COMMITTED,
    STATE_IN_PROGRESS, STATE_ROOT,
};
use crate::store::{
    join_path, node_name, parent_path, ConnectionEvent, CoordinationStore, NodeWatcher,
    StoreError, WatchedEvent, WatchedEventKind,
};

/// Escape a path segment so ids and peer names cannot introduce new levels.
fn encode_segment(segment: &str) -> String {
    segment.replace('%', "%25").replace('/', "%2F")
}

fn decode_segment(segment: &str) -> String {
    segment.replace("%2F", "/").replace("%25", "%")
}

fn chain_path(transaction_id: &str) -> String {
    join_path(CHAIN_ROOT, &encode_segment(transaction_id))
}

fn state_path(transaction_id: &str) -> String {
    join_path(STATE_ROOT, &encode_segment(transaction_id))
}

fn member_path(transaction_id: &str, group: &str, peer: &str, index: u32) -> String {
    format!(
        "{}/{}/{}/{}",
        chain_path(transaction_id),
        encode_segment(group),
        encode_segment(peer),
        index
    )
}

fn utf8(path: &str, data: Vec<u8>) -> Result<String> {
    String::from_utf8(data).map_err(|e| MediatorError::InvalidRecord {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

/// Parsed chain root payload.
struct ChainOrigin {
    group: String,
    peer: String,
    created_at_millis: Option<i64>,
}

impl ChainOrigin {
    fn encode(group: &str, peer: &str, created_at_millis: i64) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            group,
            peer,
            created_at_millis,
            sep = FIELD_SEPARATOR
        )
    }

    fn parse(data: &str) -> Self {
        let mut fields = data.splitn(3, FIELD_SEPARATOR);
        Self {
            group: fields.next().unwrap_or_default().to_string(),
            peer: fields.next().unwrap_or_default().to_string(),
            created_at_millis: fields.next().and_then(|t| t.parse().ok()),
        }
    }
}

/// `MediatorClient` over any `CoordinationStore`.
pub struct StoreMediator {
    store: Arc<dyn CoordinationStore>,
    listener: RwLock<Option<Arc<dyn MediatorWatcher>>>,
    watched: Mutex<HashSet<String>>,
    state_watch: Arc<StateWatch>,
}

impl StoreMediator {
    /// Create a mediator on `store` and start following its session events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(store: Arc<dyn CoordinationStore>) -> Arc<Self> {
        let mediator = Arc::new_cyclic(|me: &Weak<StoreMediator>| Self {
            store: Arc::clone(&store),
            listener: RwLock::new(None),
            watched: Mutex::new(HashSet::new()),
            state_watch: Arc::new(StateWatch {
                mediator: me.clone(),
            }),
        });
        Self::follow_session(Arc::downgrade(&mediator), store);
        mediator
    }

    /// Re-run `init` on every reconnect; re-arm all watches after the
    /// session (and with it every watch) was lost.
    fn follow_session(mediator: Weak<StoreMediator>, store: Arc<dyn CoordinationStore>) {
        let mut events = store.connection_events();
        drop(store);

        tokio::spawn(async move {
            let mut session_lost = false;
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed coordination session events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(mediator) = mediator.upgrade() else {
                    break;
                };
                match event {
                    ConnectionEvent::Disconnected => {
                        warn!("Coordination service disconnected");
                    }
                    ConnectionEvent::SessionExpired => {
                        warn!("Coordination session expired, watches will be re-armed");
                        session_lost = true;
                    }
                    ConnectionEvent::Connected => {
                        info!("Coordination service connected, re-initializing");
                        if let Err(e) = mediator.init().await {
                            error!(error = %e, "Re-initialization after reconnect failed");
                            continue;
                        }
                        if session_lost {
                            mediator.rearm_all().await;
                            session_lost = false;
                        }
                    }
                }
            }
        });
    }

    async fn rearm_all(&self) {
        let paths: Vec<String> = self
            .watched
            .lock()
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default();
        for path in paths {
            match self
                .store
                .watch(&path, Arc::clone(&self.state_watch) as Arc<dyn NodeWatcher>)
                .await
            {
                Ok(_) => debug!(path = %path, "Watch re-armed"),
                Err(StoreError::NoNode(_)) => self.forget_watch(&path),
                Err(e) => error!(path = %path, error = %e, "Failed to re-arm watch"),
            }
        }
    }

    /// Create `path` with `data`, creating missing ancestors with empty
    /// data. A node that already exists is not an error.
    async fn create_recursive(&self, path: &str, data: &str) -> Result<()> {
        let mut missing = Vec::new();
        let mut cursor = parent_path(path);
        while let Some(parent) = cursor {
            if self.store.exists(parent).await? {
                break;
            }
            missing.push(parent.to_string());
            cursor = parent_path(parent);
        }

        for ancestor in missing.iter().rev() {
            self.create_swallowing_exists(ancestor, "").await?;
        }
        self.create_swallowing_exists(path, data).await
    }

    async fn create_swallowing_exists(&self, path: &str, data: &str) -> Result<()> {
        match self.store.create(path, data.as_bytes()).await {
            Ok(()) => Ok(()),
            Err(StoreError::NodeExists(_)) => {
                debug!(path = %path, "Node already created by another participant");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_swallowing_missing(&self, path: &str) -> Result<()> {
        match self.store.delete_recursive(path).await {
            Ok(()) | Err(StoreError::NoNode(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Arm the state watch unless this process already holds one.
    ///
    /// Returns the state seen when the watch was armed, `None` if a watch
    /// was already in place.
    async fn ensure_watch(&self, path: &str) -> Result<Option<String>> {
        let first = self
            .watched
            .lock()
            .map(|mut w| w.insert(path.to_string()))
            .unwrap_or(false);
        if !first {
            return Ok(None);
        }
        match self
            .store
            .watch(path, Arc::clone(&self.state_watch) as Arc<dyn NodeWatcher>)
            .await
        {
            Ok(node) => {
                debug!(path = %path, "State watch armed");
                Ok(Some(String::from_utf8_lossy(&node.data).into_owned()))
            }
            Err(e) => {
                self.forget_watch(path);
                Err(e.into())
            }
        }
    }

    fn forget_watch(&self, path: &str) {
        if let Ok(mut watched) = self.watched.lock() {
            watched.remove(path);
        }
    }

    /// Whether this process currently watches the state of `transaction_id`.
    pub fn is_watching(&self, transaction_id: &str) -> bool {
        self.watched
            .lock()
            .map(|w| w.contains(&state_path(transaction_id)))
            .unwrap_or(false)
    }

    async fn read_decision(&self, path: &str) -> Result<(Decision, u64)> {
        let node = self.store.get_data(path).await?;
        let data = utf8(path, node.data)?;
        Ok((Decision::parse(&data), node.version))
    }

    /// Move the decision record out of "in progress". A final decision
    /// already recorded is left untouched and returned.
    async fn decide(&self, transaction_id: &str, target: Decision) -> Result<Decision> {
        let path = state_path(transaction_id);
        loop {
            let (current, version) = self.read_decision(&path).await?;
            if current.is_terminal() {
                return Ok(current);
            }
            match self
                .store
                .set_data(&path, target.encode().as_bytes(), Some(version))
                .await
            {
                Ok(_) => return Ok(target),
                Err(StoreError::BadVersion { .. }) => {
                    debug!(path = %path, "Decision raced with another participant, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn notify(&self, path: &str, data: &str) {
        let transaction_id = decode_segment(node_name(path));
        let decision = Decision::parse(data);
        let listener = self.listener.read().ok().and_then(|l| l.clone());
        match listener {
            Some(listener) => listener.change(&transaction_id, &decision).await,
            None => debug!(
                transaction_id = %transaction_id,
                decision = %decision,
                "Decision changed with no watcher registered"
            ),
        }
    }

    async fn read_chain(&self, transaction_id: &str) -> Result<Vec<ChainEntry>> {
        let root = chain_path(transaction_id);
        let mut entries = Vec::new();
        for group in self.store.children(&root).await? {
            let group_path = join_path(&root, &group);
            for peer in self.store.children(&group_path).await? {
                let peer_path = join_path(&group_path, &peer);
                for index in self.store.children(&peer_path).await? {
                    let entry_path = join_path(&peer_path, &index);
                    let Ok(index) = index.parse::<u32>() else {
                        warn!(path = %entry_path, "Skipping malformed chain entry");
                        continue;
                    };
                    let data = utf8(&entry_path, self.store.get_data(&entry_path).await?.data)?;
                    entries.push(ChainEntry {
                        group: decode_segment(&group),
                        peer: decode_segment(&peer),
                        index,
                        data,
                    });
                }
            }
        }
        entries.sort_by(|a, b| {
            (a.index, &a.group, &a.peer).cmp(&(b.index, &b.group, &b.peer))
        });
        Ok(entries)
    }
}

#[async_trait]
impl MediatorClient for StoreMediator {
    async fn init(&self) -> Result<()> {
        self.create_recursive(CHAIN_ROOT, "").await?;
        self.create_recursive(STATE_ROOT, "").await?;
        Ok(())
    }

    #[tracing::instrument(name = "mediator.join", skip_all, fields(transaction_id = %transaction_id, index = index))]
    async fn join_chain(
        &self,
        transaction_id: &str,
        group: &str,
        peer: &str,
        index: u32,
        data: Option<&str>,
    ) -> Result<()> {
        let chain = chain_path(transaction_id);
        let state = state_path(transaction_id);

        if index > 0 && !self.store.exists(&chain).await? {
            return Err(MediatorError::UnknownChain(transaction_id.to_string()));
        }
        if index == 0 {
            let origin = ChainOrigin::encode(group, peer, Utc::now().timestamp_millis());
            self.create_recursive(&chain, &origin).await?;
            self.create_recursive(&state, STATE_IN_PROGRESS).await?;
        }
        if let Some(data) = data {
            self.create_recursive(&member_path(transaction_id, group, peer, index), data)
                .await?;
        }
        let armed = self.ensure_watch(&state).await?;

        debug!(group = %group, peer = %peer, "Joined chain");

        // The watch only reports later changes; a decision written before
        // this process armed it is delivered here.
        if let Some(data) = armed {
            if Decision::parse(&data).is_terminal() {
                info!(
                    group = %group,
                    peer = %peer,
                    decision = %data,
                    "Joined a chain that is already decided"
                );
                self.notify(&state, &data).await;
            }
        }
        Ok(())
    }

    #[tracing::instrument(name = "mediator.rollback", skip_all, fields(transaction_id = %transaction_id))]
    async fn rollback(
        &self,
        transaction_id: &str,
        group: &str,
        peer: &str,
        detail: &RollbackDetail,
    ) -> Result<Decision> {
        let decision = self
            .decide(transaction_id, Decision::RolledBack(detail.clone()))
            .await?;
        match &decision {
            Decision::RolledBack(recorded) if recorded == detail => {
                info!(group = %group, peer = %peer, detail = %detail.encode(), "Rollback recorded");
            }
            other => {
                warn!(
                    group = %group,
                    peer = %peer,
                    decision = %other,
                    "Rollback not recorded, decision already final"
                );
            }
        }
        Ok(decision)
    }

    #[tracing::instrument(name = "mediator.commit", skip_all, fields(transaction_id = %transaction_id))]
    async fn commit(&self, transaction_id: &str, group: &str, peer: &str) -> Result<Decision> {
        let decision = self.decide(transaction_id, Decision::Committed).await?;
        if decision == Decision::Committed {
            info!(group = %group, peer = %peer, "Commit recorded");
        } else {
            warn!(
                group = %group,
                peer = %peer,
                decision = %decision,
                "Commit not recorded, decision already final"
            );
        }
        Ok(decision)
    }

    async fn transaction_exists(&self, transaction_id: &str) -> bool {
        match self.store.exists(&state_path(transaction_id)).await {
            Ok(exists) => exists,
            Err(e) => {
                debug!(transaction_id = %transaction_id, error = %e, "Existence probe failed");
                false
            }
        }
    }

    async fn transaction_result(&self, transaction_id: &str) -> Result<Option<TransactionResult>> {
        let chain = chain_path(transaction_id);
        let origin = match self.store.get_data(&chain).await {
            Ok(node) => ChainOrigin::parse(&utf8(&chain, node.data)?),
            Err(StoreError::NoNode(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let decision = match self.read_decision(&state_path(transaction_id)).await {
            Ok((decision, _)) => decision,
            Err(MediatorError::Store(StoreError::NoNode(_))) => Decision::InProgress,
            Err(e) => return Err(e),
        };

        Ok(Some(TransactionResult {
            transaction_id: transaction_id.to_string(),
            origin_group: origin.group,
            origin_peer: origin.peer,
            started_at: origin
                .created_at_millis
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            decision,
            chain: self.read_chain(transaction_id).await?,
        }))
    }

    fn add_watcher(&self, watcher: Arc<dyn MediatorWatcher>) {
        if let Ok(mut listener) = self.listener.write() {
            *listener = Some(watcher);
        }
    }

    async fn clear(&self, transaction_id: &str) -> Result<()> {
        let state = state_path(transaction_id);
        self.delete_swallowing_missing(&chain_path(transaction_id))
            .await?;
        self.delete_swallowing_missing(&state).await?;
        self.forget_watch(&state);
        info!(transaction_id = %transaction_id, "Coordination records cleared");
        Ok(())
    }

    async fn expire_abandoned(&self, ttl: Duration) -> Result<ExpiryReport> {
        let mut report = ExpiryReport::default();
        let now = Utc::now().timestamp_millis();
        let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        for segment in self.store.children(CHAIN_ROOT).await? {
            let transaction_id = decode_segment(&segment);
            let chain = join_path(CHAIN_ROOT, &segment);
            let origin = match self.store.get_data(&chain).await {
                Ok(node) => ChainOrigin::parse(&String::from_utf8_lossy(&node.data)),
                Err(StoreError::NoNode(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            let Some(created) = origin.created_at_millis else {
                warn!(transaction_id = %transaction_id, "Chain root without creation time");
                continue;
            };
            if now.saturating_sub(created) < ttl_millis {
                continue;
            }

            match self.read_decision(&state_path(&transaction_id)).await {
                Ok((Decision::InProgress, _)) => {
                    self.rollback(
                        &transaction_id,
                        &origin.group,
                        &origin.peer,
                        &RollbackDetail::lease_expired(),
                    )
                    .await?;
                    warn!(transaction_id = %transaction_id, "Lease expired, transaction rolled back");
                    report.rolled_back.push(transaction_id);
                }
                Ok(_) | Err(MediatorError::Store(StoreError::NoNode(_))) => {
                    self.clear(&transaction_id).await?;
                    report.cleared.push(transaction_id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    fn is_connected(&self) -> bool {
        self.store.is_connected()
    }

    async fn close(&self) {
        if let Ok(mut listener) = self.listener.write() {
            *listener = None;
        }
        if let Ok(mut watched) = self.watched.lock() {
            watched.clear();
        }
        self.store.close().await;
    }
}

/// One-shot watch target for state nodes.
struct StateWatch {
    mediator: Weak<StoreMediator>,
}

#[async_trait]
impl NodeWatcher for StateWatch {
    async fn process(&self, event: WatchedEvent) {
        let Some(mediator) = self.mediator.upgrade() else {
            return;
        };
        let path = event.path;

        if event.kind == WatchedEventKind::Deleted {
            mediator.forget_watch(&path);
            debug!(path = %path, "Watched state record removed");
            return;
        }

        // Re-arm before anything else so the next change is not missed.
        let rearmed = mediator
            .store
            .watch(&path, Arc::clone(&mediator.state_watch) as Arc<dyn NodeWatcher>)
            .await;
        let current = match rearmed {
            Ok(node) => Some(node.data),
            Err(StoreError::NoNode(_)) => {
                mediator.forget_watch(&path);
                None
            }
            Err(e) => {
                error!(path = %path, error = %e, "Failed to re-arm state watch");
                mediator.forget_watch(&path);
                None
            }
        };

        let Some(data) = event.data.or(current) else {
            warn!(path = %path, "State change without readable data");
            return;
        };
        let data = String::from_utf8_lossy(&data).into_owned();
        if data == STATE_COMMITTED {
            debug!(path = %path, "Commit observed");
        }
        mediator.notify(&path, &data).await;
    }
}
