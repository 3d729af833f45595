//! Local mirror of one server-owned collection.

use std::sync::{Arc, Mutex, Weak};

use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

use super::kind::CollectionKind;
use super::record::{Record, RecordId};
use crate::config::SyncTuning;
use crate::guard::{ActionGuard, RowGuard};
use crate::sync::{Reply, Requester, Subscription, SyncError, CONNECT_EVENT};
use crate::task::{lock, ScopedTask};

/// Guard key for refreshes.
const REFRESH_KEY: &str = "refresh";

/// Where the mirror stands relative to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Nothing requested yet
    Idle,
    /// A refresh is in flight
    Fetching,
    /// Showing a snapshot. `stale` when the last refresh never answered.
    Synced { stale: bool },
}

impl SyncPhase {
    pub fn is_fetching(&self) -> bool {
        matches!(self, SyncPhase::Fetching)
    }
}

/// A mutation waiting for its acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub key: RecordId,
    pub event: String,
    pub deadline: Instant,
    ack_id: u64,
}

/// How a mutation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(Option<String>),
    Failure(String),
    Timeout,
}

impl Outcome {
    pub fn from_result(result: Result<Option<String>, SyncError>) -> Self {
        match result {
            Ok(message) => Outcome::Success(message),
            Err(SyncError::Timeout) => Outcome::Timeout,
            Err(e) => Outcome::Failure(e.user_message()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn into_reply(self) -> Reply {
        match self {
            Outcome::Success(message) => Reply::success(message),
            Outcome::Failure(message) => Reply::failure(message),
            Outcome::Timeout => Reply::failure(SyncError::Timeout.user_message()),
        }
    }
}

/// Local effect applied to the target row as soon as a mutation is sent.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Optimistic {
    #[default]
    None,
    Remove,
    Patch(Map<String, Value>),
}

/// How a mutation reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Wait for the server's `{ok, message}`
    #[default]
    Acknowledged,
    /// Emit and assume success
    FireAndForget,
}

/// A change to one row.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub event: String,
    pub target: RecordId,
    pub payload: Value,
    pub effect: Optimistic,
    pub delivery: Delivery,
    /// Attach `usuario` and `token`
    pub with_actor: bool,
    /// Request a fresh snapshot once the server confirms
    pub refresh_on_success: bool,
}

impl Mutation {
    /// Builds a mutation whose payload starts as `{"id": target}`.
    pub fn new(event: impl Into<String>, target: impl Into<RecordId>) -> Self {
        let target = target.into();
        let mut payload = Map::new();
        payload.insert("id".to_string(), target.to_value());
        Self {
            event: event.into(),
            target,
            payload: Value::Object(payload),
            effect: Optimistic::None,
            delivery: Delivery::Acknowledged,
            with_actor: false,
            refresh_on_success: false,
        }
    }

    /// Adds a field to the payload.
    pub fn with_field(mut self, field: &str, value: impl Into<Value>) -> Self {
        if let Value::Object(map) = &mut self.payload {
            map.insert(field.to_string(), value.into());
        }
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn removing(mut self) -> Self {
        self.effect = Optimistic::Remove;
        self
    }

    pub fn patching(mut self, field: &str, value: impl Into<Value>) -> Self {
        let mut patch = match std::mem::take(&mut self.effect) {
            Optimistic::Patch(patch) => patch,
            _ => Map::new(),
        };
        patch.insert(field.to_string(), value.into());
        self.effect = Optimistic::Patch(patch);
        self
    }

    pub fn fire_and_forget(mut self) -> Self {
        self.delivery = Delivery::FireAndForget;
        self
    }

    pub fn with_actor(mut self) -> Self {
        self.with_actor = true;
        self
    }

    pub fn refresh_after(mut self) -> Self {
        self.refresh_on_success = true;
        self
    }

    /// Marks an order item as sent to the kitchen.
    pub fn confirm_order(order: &Record) -> Option<Self> {
        let id = order.id()?;
        Some(
            Self::new("confirmar_pedido", id)
                .with_field("comanda", order.get("comanda").cloned().unwrap_or(Value::Null))
                .patching("printed", 1)
                .with_actor()
                .fire_and_forget(),
        )
    }

    /// Deletes an order item.
    pub fn delete_order(order: &Record) -> Option<Self> {
        let id = order.id()?;
        Some(
            Self::new("excluir_pedido", id)
                .with_field("comanda", order.get("comanda").cloned().unwrap_or(Value::Null))
                .removing()
                .with_actor()
                .fire_and_forget(),
        )
    }

    /// Saves an edited order item.
    pub fn edit_order(order: &Record) -> Option<Self> {
        let id = order.id()?;
        let mut payload = Map::new();
        payload.insert("pedidoAlterado".to_string(), order.clone().into_value());
        let mut mutation = Self::new("atualizar_pedidos", id)
            .with_payload(Value::Object(payload))
            .with_actor()
            .fire_and_forget();
        mutation.effect = Optimistic::Patch(order.fields().clone());
        Some(mutation)
    }

    /// Grants a pending user access.
    pub fn approve_user(id: impl Into<RecordId>, numero: impl Into<Value>) -> Self {
        Self::new("permitir", id).with_field("numero", numero).refresh_after()
    }

    /// Changes a user's role.
    pub fn change_role(id: impl Into<RecordId>, username: &str, role: &str) -> Self {
        Self::new("editCargo", id)
            .with_payload(serde_json::json!({"usuario": username, "cargo": role}))
            .patching("cargo", role)
            .refresh_after()
    }

    pub fn delete_user(id: impl Into<RecordId>) -> Self {
        Self::new("Delete_user", id).refresh_after()
    }
}

#[derive(Debug)]
struct StoreState {
    records: Vec<Record>,
    /// Bumped whenever `records` is replaced
    records_version: u64,
    phase: SyncPhase,
    pending: Vec<PendingOperation>,
    refresh_timer: Option<ScopedTask>,
}

#[derive(Debug)]
struct Shared {
    kind: CollectionKind,
    requester: Requester,
    tuning: SyncTuning,
    state: Mutex<StoreState>,
    actions: ActionGuard,
    rows: RowGuard,
    revision: watch::Sender<u64>,
}

/// Mirror of one collection, kept in step with the server.
///
/// Opening a store registers its snapshot handlers on the session and starts
/// following connectivity. Dropping it releases every handler and timer.
#[derive(Debug)]
pub struct CollectionStore {
    shared: Arc<Shared>,
    _subscriptions: Vec<Subscription>,
    _online_watch: ScopedTask,
}

impl CollectionStore {
    /// Opens a store for `kind` and requests the first snapshot if the
    /// channel is already up.
    ///
    /// Must be called inside a tokio runtime.
    pub fn open(kind: CollectionKind, requester: Requester, tuning: SyncTuning) -> Self {
        let (revision, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            actions: ActionGuard::from_tuning(&tuning),
            rows: RowGuard::from_tuning(&tuning),
            kind,
            requester,
            tuning,
            state: Mutex::new(StoreState {
                records: Vec::new(),
                records_version: 0,
                phase: SyncPhase::Idle,
                pending: Vec::new(),
                refresh_timer: None,
            }),
            revision,
        });

        let session = shared.requester.session().clone();
        let mut subscriptions = Vec::new();
        for event in shared.kind.snapshot_events() {
            let weak = Arc::downgrade(&shared);
            subscriptions.push(session.on(event, move |payload| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_snapshot_push(payload);
                }
            }));
        }

        let weak = Arc::downgrade(&shared);
        subscriptions.push(session.on(CONNECT_EVENT, move |_| {
            if let Some(shared) = weak.upgrade() {
                tracing::debug!(collection = %shared.kind.name, "reconnected, refreshing");
                shared.resync();
            }
        }));

        let online_watch = spawn_online_watch(&shared);

        tracing::debug!(collection = %shared.kind.name, "store opened");
        if shared.requester.session().is_connected() {
            shared.refresh_quietly();
        }

        Self {
            shared,
            _subscriptions: subscriptions,
            _online_watch: online_watch,
        }
    }

    pub fn kind(&self) -> &CollectionKind {
        &self.shared.kind
    }

    /// Asks the server for a fresh snapshot.
    ///
    /// Suppressed (returns `Ok`) while another refresh is inside its
    /// cooldown. Fails without sending when offline or disconnected.
    pub fn request_refresh(&self) -> Result<(), SyncError> {
        self.shared.request_refresh()
    }

    /// Replaces the mirror with a server snapshot.
    pub fn on_snapshot_push(&self, payload: &Value) {
        self.shared.on_snapshot_push(payload);
    }

    /// Updates or removes the records matching `predicate`, in place.
    ///
    /// `transform` returns the new record, or `None` to remove it. Other
    /// records keep their positions. Returns how many records matched.
    ///
    /// Both closures run without the store locked, so they may read the
    /// store. If a snapshot lands meanwhile they run again on the new one.
    pub fn apply_optimistic<P, T>(&self, predicate: P, transform: T) -> usize
    where
        P: Fn(&Record) -> bool,
        T: FnMut(Record) -> Option<Record>,
    {
        self.shared.apply_optimistic(predicate, transform)
    }

    /// Sends a row mutation.
    ///
    /// Returns `None` when the row is still busy with a previous mutation.
    pub async fn mutate(&self, mutation: Mutation) -> Option<Reply> {
        let key = mutation.target.to_string();
        self.shared
            .rows
            .guard_async(&key, || self.shared.run_mutation(mutation))
            .await
    }

    /// Runs `f` unless `key` was used within the cooldown.
    pub fn guard<R>(&self, key: &str, f: impl FnOnce() -> R) -> Option<R> {
        self.shared.actions.guard(key, f)
    }

    /// Current records, in server order.
    pub fn records(&self) -> Vec<Record> {
        lock(&self.shared.state).records.clone()
    }

    pub fn get(&self, id: &RecordId) -> Option<Record> {
        lock(&self.shared.state)
            .records
            .iter()
            .find(|r| r.id().as_ref() == Some(id))
            .cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.state).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn phase(&self) -> SyncPhase {
        lock(&self.shared.state).phase
    }

    /// Mutations still waiting for their acknowledgment.
    pub fn pending(&self) -> Vec<PendingOperation> {
        lock(&self.shared.state).pending.clone()
    }

    /// Rows with a mutation in flight or in cooldown.
    pub fn busy_rows(&self) -> Vec<RecordId> {
        self.shared
            .rows
            .busy_ids()
            .into_iter()
            .map(RecordId::from)
            .collect()
    }

    /// Default category filter for the session's role.
    pub fn view_category(&self) -> Option<String> {
        let role = &self.shared.requester.context().role;
        self.shared.kind.category_for(role).map(str::to_string)
    }

    /// Bumps on every change to records or phase.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }
}

impl Drop for CollectionStore {
    fn drop(&mut self) {
        let timer = lock(&self.shared.state).refresh_timer.take();
        drop(timer);
        self.shared.actions.clear();
        self.shared.rows.clear();
        tracing::debug!(collection = %self.shared.kind.name, "store closed");
    }
}

impl Shared {
    fn notify(&self) {
        self.revision.send_modify(|r| *r = r.wrapping_add(1));
    }

    fn refresh_quietly(self: &Arc<Self>) {
        if let Err(e) = self.request_refresh() {
            tracing::debug!(collection = %self.kind.name, "refresh skipped: {}", e);
        }
    }

    /// Refresh after a reconnect or a return online. The fetch sent before
    /// the link dropped will never be answered, so the refresh cooldown
    /// does not apply.
    fn resync(self: &Arc<Self>) {
        self.actions.unlock(REFRESH_KEY);
        self.refresh_quietly();
    }

    fn request_refresh(self: &Arc<Self>) -> Result<(), SyncError> {
        self.actions
            .guard(REFRESH_KEY, || self.start_refresh())
            .unwrap_or(Ok(()))
    }

    fn start_refresh(self: &Arc<Self>) -> Result<(), SyncError> {
        let role = &self.requester.context().role;
        let event = self.kind.fetch_event_for(role);
        let payload = self
            .requester
            .context()
            .attach(self.kind.fetch_payload(role));

        let sent = self
            .requester
            .ensure_ready()
            .and_then(|()| self.requester.session().emit(event, payload));

        if let Err(e) = sent {
            let old_timer = {
                let mut state = lock(&self.state);
                if state.phase.is_fetching() {
                    state.phase = SyncPhase::Synced { stale: true };
                }
                state.refresh_timer.take()
            };
            drop(old_timer);
            self.notify();
            return Err(e);
        }

        tracing::debug!(collection = %self.kind.name, event, "refresh requested");
        let weak = Arc::downgrade(self);
        let timer = ScopedTask::spawn(refresh_timeout(weak, self.tuning.refresh_timeout()));
        let old_timer = {
            let mut state = lock(&self.state);
            state.phase = SyncPhase::Fetching;
            state.refresh_timer.replace(timer)
        };
        drop(old_timer);
        self.notify();
        Ok(())
    }

    fn refresh_timed_out(&self) {
        let timer = {
            let mut state = lock(&self.state);
            if !state.phase.is_fetching() {
                return;
            }
            state.phase = SyncPhase::Synced { stale: true };
            state.refresh_timer.take()
        };
        tracing::warn!(collection = %self.kind.name, "refresh timed out, showing stale data");
        self.notify();
        // This runs on the timer's own task; aborting it here is a no-op
        // beyond marking it finished.
        drop(timer);
    }

    fn on_snapshot_push(&self, payload: &Value) {
        let records = extract_records(&self.kind.payload_key, payload);
        let timer = {
            let mut state = lock(&self.state);
            match records {
                Some(records) => {
                    tracing::debug!(
                        collection = %self.kind.name,
                        count = records.len(),
                        "snapshot received"
                    );
                    state.records = records;
                    state.records_version += 1;
                    state.phase = SyncPhase::Synced { stale: false };
                }
                None => {
                    tracing::warn!(collection = %self.kind.name, "ignoring malformed snapshot");
                    if state.phase.is_fetching() {
                        state.phase = SyncPhase::Synced { stale: true };
                    }
                }
            }
            state.refresh_timer.take()
        };
        drop(timer);
        self.notify();
    }

    fn apply_optimistic<P, T>(&self, predicate: P, mut transform: T) -> usize
    where
        P: Fn(&Record) -> bool,
        T: FnMut(Record) -> Option<Record>,
    {
        loop {
            let (records, version) = {
                let state = lock(&self.state);
                (state.records.clone(), state.records_version)
            };

            let mut matched = 0;
            let updated: Vec<Record> = records
                .into_iter()
                .filter_map(|record| {
                    if predicate(&record) {
                        matched += 1;
                        transform(record)
                    } else {
                        Some(record)
                    }
                })
                .collect();
            if matched == 0 {
                return 0;
            }

            {
                let mut state = lock(&self.state);
                if state.records_version != version {
                    continue;
                }
                state.records = updated;
                state.records_version += 1;
            }
            self.notify();
            return matched;
        }
    }

    fn apply_effect(&self, target: &RecordId, effect: &Optimistic) {
        let is_target = |r: &Record| r.id().as_ref() == Some(target);
        match effect {
            Optimistic::None => {}
            Optimistic::Remove => {
                self.apply_optimistic(is_target, |_| None);
            }
            Optimistic::Patch(patch) => {
                self.apply_optimistic(is_target, |mut r| {
                    r.merge(patch);
                    Some(r)
                });
            }
        }
    }

    async fn run_mutation(self: &Arc<Self>, mutation: Mutation) -> Reply {
        let result = self.deliver(&mutation).await;
        let outcome = Outcome::from_result(result);

        match &outcome {
            Outcome::Success(_) => {
                tracing::info!(event = %mutation.event, target = %mutation.target, "mutation confirmed");
                if mutation.refresh_on_success {
                    self.refresh_quietly();
                }
            }
            Outcome::Failure(reason) => {
                tracing::warn!(event = %mutation.event, target = %mutation.target, "mutation failed: {}", reason);
            }
            Outcome::Timeout => {
                tracing::warn!(event = %mutation.event, target = %mutation.target, "mutation timed out");
            }
        }
        outcome.into_reply()
    }

    async fn deliver(self: &Arc<Self>, mutation: &Mutation) -> Result<Option<String>, SyncError> {
        let context = self.requester.context();
        let payload = if mutation.with_actor {
            context.attach_actor(mutation.payload.clone())
        } else {
            context.attach(mutation.payload.clone())
        };

        match mutation.delivery {
            Delivery::FireAndForget => {
                self.requester.ensure_ready()?;
                self.requester.session().emit(&mutation.event, payload)?;
                self.apply_effect(&mutation.target, &mutation.effect);
                Ok(None)
            }
            Delivery::Acknowledged => {
                let pending = self.requester.send(&mutation.event, payload)?;
                let timeout = self.tuning.ack_timeout();
                let _tracked = PendingEntry::track(
                    self,
                    PendingOperation {
                        key: mutation.target.clone(),
                        event: mutation.event.clone(),
                        deadline: Instant::now() + timeout,
                        ack_id: pending.ack_id(),
                    },
                );
                self.apply_effect(&mutation.target, &mutation.effect);
                self.requester.wait(pending, timeout).await
            }
        }
    }
}

/// Keeps a [`PendingOperation`] listed for as long as it is alive.
struct PendingEntry {
    shared: Weak<Shared>,
    ack_id: u64,
}

impl PendingEntry {
    fn track(shared: &Arc<Shared>, op: PendingOperation) -> Self {
        let ack_id = op.ack_id;
        lock(&shared.state).pending.push(op);
        Self {
            shared: Arc::downgrade(shared),
            ack_id,
        }
    }
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            lock(&shared.state).pending.retain(|op| op.ack_id != self.ack_id);
        }
    }
}

async fn refresh_timeout(shared: Weak<Shared>, after: std::time::Duration) {
    sleep(after).await;
    if let Some(shared) = shared.upgrade() {
        shared.refresh_timed_out();
    }
}

fn spawn_online_watch(shared: &Arc<Shared>) -> ScopedTask {
    let weak = Arc::downgrade(shared);
    let mut online = shared.requester.connectivity().subscribe();
    let mut was_online = *online.borrow_and_update();
    ScopedTask::spawn(async move {
        while online.changed().await.is_ok() {
            let now_online = *online.borrow_and_update();
            if now_online && !was_online {
                let Some(shared) = weak.upgrade() else { return };
                tracing::debug!(collection = %shared.kind.name, "back online, refreshing");
                shared.resync();
            }
            was_online = now_online;
        }
    })
}

/// Pulls the records out of a snapshot: either a bare array or an object
/// holding the array under `key`. `None` if the payload has neither shape.
fn extract_records(key: &str, payload: &Value) -> Option<Vec<Record>> {
    let items = match payload {
        Value::Array(items) => items,
        Value::Object(map) => map.get(key)?.as_array()?,
        _ => return None,
    };
    let records: Vec<Record> = items
        .iter()
        .filter_map(|item| Record::from_value(item.clone()))
        .collect();
    if records.len() != items.len() {
        tracing::debug!(
            skipped = items.len() - records.len(),
            "snapshot contained non-object entries"
        );
    }
    Some(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::Connectivity;
    use crate::sync::loopback::Loopback;
    use crate::sync::{Packet, RequestContext};
    use serde_json::json;
    use std::time::Duration;

    fn open(lb: &Loopback, kind: CollectionKind, role: &str) -> (CollectionStore, Connectivity) {
        let connectivity = Connectivity::new(true);
        let requester = Requester::new(
            lb.session.clone(),
            connectivity.clone(),
            RequestContext::new("cart-1")
                .with_actor("ana", "tok")
                .with_role(role),
        );
        (
            CollectionStore::open(kind, requester, SyncTuning::default()),
            connectivity,
        )
    }

    fn ids(store: &CollectionStore) -> Vec<String> {
        store
            .records()
            .iter()
            .filter_map(|r| r.id())
            .map(|id| id.to_string())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_requests_snapshot() {
        let mut lb = Loopback::connected();
        let (store, _) = open(&lb, CollectionKind::orders(), "Garçom");

        let sent = lb.drain_events("getPedidos");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, json!({"emitir": false, "carrinho": "cart-1"}));
        assert_eq!(store.phase(), SyncPhase::Fetching);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kitchen_uses_role_variant() {
        let mut lb = Loopback::connected();
        let (store, _) = open(&lb, CollectionKind::orders(), "Cozinha");

        let sent = lb.drain_events("getPedidosCC");
        assert_eq!(sent[0].0, json!({"emitir": true, "carrinho": "cart-1"}));
        assert_eq!(store.view_category().as_deref(), Some("3"));

        lb.push("respostaPedidosCC", json!({"dataPedidos": [{"id": 1, "categoria": "3"}]}));
        assert_eq!(ids(&store), vec!["1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_replaces_optimistic_state() {
        let lb = Loopback::connected();
        let (store, _) = open(&lb, CollectionKind::orders(), "Garçom");

        lb.push("respostaPedidos", json!({"dataPedidos": [{"id": 1}, {"id": 2}, {"id": 3}]}));
        store.apply_optimistic(|r| r.id() == Some(RecordId::from(2)), |_| None);
        store.apply_optimistic(
            |r| r.id() == Some(RecordId::from(3)),
            |r| Some(r.with("printed", 1)),
        );
        assert_eq!(ids(&store), vec!["1", "3"]);

        let snapshot = json!([{"id": 9, "ordem": "0"}, {"id": 2, "ordem": "1"}]);
        lb.push("respostaPedidos", json!({"dataPedidos": snapshot}));

        let mirror: Vec<Value> = store.records().into_iter().map(Record::into_value).collect();
        assert_eq!(Value::Array(mirror), snapshot);
        assert_eq!(store.phase(), SyncPhase::Synced { stale: false });
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimistic_keeps_order() {
        let lb = Loopback::connected();
        let (store, _) = open(&lb, CollectionKind::users(), "Admin");
        lb.push("usuarios", json!({"users": [{"id": 1}, {"id": 2}, {"id": 3}]}));

        let n = store.apply_optimistic(
            |r| r.id() == Some(RecordId::from(2)),
            |r| Some(r.with("liberado", 1)),
        );
        assert_eq!(n, 1);
        assert_eq!(ids(&store), vec!["1", "2", "3"]);
        assert_eq!(
            store.get(&RecordId::from(2)).unwrap().get("liberado"),
            Some(&json!(1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_snapshot_keeps_records() {
        let lb = Loopback::connected();
        let (store, _) = open(&lb, CollectionKind::stock(), "Admin");
        lb.push("respostaEstoque", json!({"dataEstoque": [{"id": 1}]}));

        tokio::time::advance(Duration::from_millis(300)).await;
        store.request_refresh().unwrap();
        assert_eq!(store.phase(), SyncPhase::Fetching);

        lb.push("respostaEstoque", json!({"dataEstoque": "oops"}));
        assert_eq!(ids(&store), vec!["1"]);
        assert_eq!(store.phase(), SyncPhase::Synced { stale: true });
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_times_out_to_stale() {
        let lb = Loopback::connected();
        let (store, _) = open(&lb, CollectionKind::audit(), "Admin");
        assert_eq!(store.phase(), SyncPhase::Fetching);

        tokio::time::sleep(Duration::from_millis(10_001)).await;
        assert_eq!(store.phase(), SyncPhase::Synced { stale: true });
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_is_guarded() {
        let mut lb = Loopback::connected();
        let (store, _) = open(&lb, CollectionKind::users(), "Admin");
        lb.drain();

        // Open already refreshed; this one falls inside the cooldown.
        assert_eq!(store.request_refresh(), Ok(()));
        assert!(lb.drain_events("users").is_empty());

        tokio::time::advance(Duration::from_millis(281)).await;
        store.request_refresh().unwrap();
        assert_eq!(lb.drain_events("users").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_offline_reports_reason() {
        let mut lb = Loopback::connected();
        let (store, connectivity) = open(&lb, CollectionKind::users(), "Admin");
        lb.drain();
        connectivity.set_online(false);
        tokio::time::advance(Duration::from_millis(281)).await;

        assert_eq!(store.request_refresh(), Err(SyncError::NoConnectivity));
        assert!(lb.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_and_back_online_refresh() {
        let mut lb = Loopback::connected();
        let (_store, connectivity) = open(&lb, CollectionKind::users(), "Admin");
        lb.drain();

        tokio::time::advance(Duration::from_millis(281)).await;
        lb.reconnect();
        assert_eq!(lb.drain_events("users").len(), 1);

        tokio::time::advance(Duration::from_millis(281)).await;
        connectivity.set_online(false);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(lb.drain_events("users").is_empty());
        connectivity.set_online(true);
        // Let the watcher task observe the transition.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(lb.drain_events("users").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_inside_refresh_cooldown_still_refetches() {
        let mut lb = Loopback::connected();
        let (store, connectivity) = open(&lb, CollectionKind::users(), "Admin");
        assert_eq!(lb.drain_events("users").len(), 1);

        tokio::time::advance(Duration::from_millis(100)).await;
        lb.reconnect();
        assert_eq!(lb.drain_events("users").len(), 1);
        assert_eq!(store.phase(), SyncPhase::Fetching);

        // A user tap right after the resync is still debounced.
        assert!(store.request_refresh().is_ok());
        assert!(lb.drain_events("users").is_empty());

        connectivity.set_online(false);
        tokio::time::sleep(Duration::from_millis(1)).await;
        connectivity.set_online(true);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(lb.drain_events("users").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_optimistic_closures_can_read_store() {
        let lb = Loopback::connected();
        let (store, _) = open(&lb, CollectionKind::users(), "Admin");
        store.on_snapshot_push(&json!([{"id": 1, "nome": "Ana"}, {"id": 2, "nome": "Bia"}]));

        let matched = store.apply_optimistic(
            |r| r.int("id") == 1 && store.get(&RecordId::from(2)).is_some(),
            |mut r| {
                r.set("total", store.len() as i64);
                Some(r)
            },
        );

        assert_eq!(matched, 1);
        assert_eq!(store.get(&RecordId::from(1)).unwrap().int("total"), 2);
        assert_eq!(store.records()[1].text("nome").as_deref(), Some("Bia"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_rapid_taps_emit_one_mutation() {
        let mut lb = Loopback::connected();
        let (store, _) = open(&lb, CollectionKind::users(), "Admin");
        lb.drain();

        let block = || Mutation::new("permitir", 5).with_field("numero", 1);
        let first = store.mutate(block());
        let second = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            store.mutate(block()).await
        };
        let server = async {
            let Packet::Event { ack_id: Some(id), .. } = lb.next().await else {
                panic!("expected acknowledged event");
            };
            tokio::time::sleep(Duration::from_millis(150)).await;
            lb.ack(id, json!({"ok": true}));
        };

        let (first, second, ()) = tokio::join!(first, second, server);
        assert_eq!(first, Some(Reply::success(None)));
        assert_eq!(second, None);
        assert!(lb.drain_events("permitir").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rows_are_independent() {
        let mut lb = Loopback::connected();
        let (store, connectivity) = open(&lb, CollectionKind::users(), "Admin");
        lb.drain();
        connectivity.set_online(false);

        // Both fail fast, but each row was admitted.
        let a = store.mutate(Mutation::new("permitir", 5)).await;
        let b = store.mutate(Mutation::new("permitir", 6)).await;
        assert_eq!(a, Some(Reply::failure("no internet")));
        assert_eq!(b, Some(Reply::failure("no internet")));
        assert_eq!(
            store.busy_rows(),
            vec![RecordId::from(5), RecordId::from(6)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_and_forget_delete_is_optimistic() {
        let mut lb = Loopback::connected();
        let (store, _) = open(&lb, CollectionKind::orders(), "Garçom");
        lb.push("respostaPedidos", json!({"dataPedidos": [{"id": 1}, {"id": 2}]}));
        lb.drain();

        let reply = store
            .mutate(
                Mutation::new("excluir_pedido", 2)
                    .with_field("comanda", "mesa 4")
                    .removing()
                    .fire_and_forget()
                    .with_actor(),
            )
            .await;

        assert_eq!(reply, Some(Reply::success(None)));
        assert_eq!(ids(&store), vec!["1"]);
        let sent = lb.drain_events("excluir_pedido");
        assert_eq!(
            sent[0].0,
            json!({"id": 2, "comanda": "mesa 4", "carrinho": "cart-1", "usuario": "ana", "token": "tok"})
        );
        assert_eq!(sent[0].1, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_order_marks_printed() {
        let mut lb = Loopback::connected();
        let (store, _) = open(&lb, CollectionKind::orders(), "Garçom");
        lb.push(
            "respostaPedidos",
            json!({"dataPedidos": [{"id": 1, "comanda": "mesa 2", "printed": 0}]}),
        );
        lb.drain();

        let order = store.get(&RecordId::from(1)).unwrap();
        let reply = store.mutate(Mutation::confirm_order(&order).unwrap()).await;

        assert_eq!(reply, Some(Reply::success(None)));
        assert_eq!(store.get(&RecordId::from(1)).unwrap().int("printed"), 1);
        let sent = lb.drain_events("confirmar_pedido");
        assert_eq!(sent[0].0["comanda"], "mesa 2");
        assert_eq!(sent[0].0["usuario"], "ana");
        assert!(Mutation::confirm_order(&Record::new()).is_none());
    }

    #[test]
    fn test_user_mutation_presets() {
        let approve = Mutation::approve_user(5, 1);
        assert_eq!(approve.payload, json!({"id": 5, "numero": 1}));
        assert_eq!(approve.delivery, Delivery::Acknowledged);
        assert!(approve.refresh_on_success);

        let role = Mutation::change_role(5, "bia", "Cozinha");
        assert_eq!(role.payload, json!({"usuario": "bia", "cargo": "Cozinha"}));

        let order = Record::new().with("id", 9).with("pedido", "Suco");
        let edit = Mutation::edit_order(&order).unwrap();
        assert_eq!(edit.payload["pedidoAlterado"]["pedido"], "Suco");
        assert!(matches!(edit.effect, Optimistic::Patch(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_optimistic_delete_is_not_rolled_back() {
        let mut lb = Loopback::connected();
        let (store, _) = open(&lb, CollectionKind::users(), "Admin");
        lb.push("usuarios", json!({"users": [{"id": 3}, {"id": 4}]}));
        lb.drain();

        let call = store.mutate(Mutation::new("Delete_user", 3).removing());
        let server = async {
            let Packet::Event { ack_id: Some(id), .. } = lb.next().await else {
                panic!("expected acknowledged event");
            };
            lb.ack(id, json!({"ok": false, "message": "Sem permissão"}));
        };
        let (reply, ()) = tokio::join!(call, server);

        assert_eq!(reply, Some(Reply::failure("Sem permissão")));
        assert_eq!(ids(&store), vec!["4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_operation_lifecycle() {
        let mut lb = Loopback::connected();
        let (store, _) = open(&lb, CollectionKind::users(), "Admin");
        lb.drain();

        let call = store.mutate(Mutation::new("permitir", 7));
        let observer = async {
            let Packet::Event { .. } = lb.next().await else {
                panic!("expected event");
            };
            let pending = store.pending();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].key, RecordId::from(7));
            assert_eq!(pending[0].event, "permitir");
        };
        let (reply, ()) = tokio::join!(call, observer);

        assert_eq!(reply, Some(Reply::failure("no response")));
        assert!(store.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_refreshes_when_asked() {
        let mut lb = Loopback::connected();
        let (store, _) = open(&lb, CollectionKind::users(), "Admin");
        lb.drain();
        tokio::time::advance(Duration::from_millis(281)).await;

        let call = store.mutate(Mutation::new("permitir", 5).refresh_after());
        let server = async {
            let Packet::Event { ack_id: Some(id), .. } = lb.next().await else {
                panic!("expected acknowledged event");
            };
            lb.ack(id, Value::Null);
        };
        let (reply, ()) = tokio::join!(call, server);

        assert_eq!(reply, Some(Reply::success(None)));
        assert_eq!(lb.drain_events("users").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_handlers() {
        let lb = Loopback::connected();
        let (store, _) = open(&lb, CollectionKind::orders(), "Garçom");
        assert_eq!(lb.session.handler_count("respostaPedidos"), 1);
        assert_eq!(lb.session.handler_count("respostaPedidosCC"), 1);

        drop(store);
        assert_eq!(lb.session.handler_count("respostaPedidos"), 0);
        assert_eq!(lb.session.handler_count(CONNECT_EVENT), 0);
        lb.push("respostaPedidos", json!({"dataPedidos": []}));
    }

    #[test]
    fn test_extract_records() {
        assert_eq!(extract_records("users", &json!([{"id": 1}])).map(|r| r.len()), Some(1));
        assert_eq!(extract_records("users", &json!({"users": []})).map(|r| r.len()), Some(0));
        assert!(extract_records("users", &json!({"other": []})).is_none());
        assert!(extract_records("users", &json!("x")).is_none());
    }
}
