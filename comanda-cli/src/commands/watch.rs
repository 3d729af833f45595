use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use clap::Args;
use comanda_core::store::{Mutation, Record, SyncPhase};
use comanda_core::{
    CollectionKind, CollectionStore, NetworkPrinter, PermissionGate, PrintEvent, PrintQueue,
};
use tokio::sync::{mpsc, watch};

use super::{block_on, parse_kind, CommandError};
use crate::config::Config;
use crate::engine::{credential_store, Engine};

/// Follow a collection live
#[derive(Args)]
pub struct WatchCommand {
    /// Collection: orders, users, audit, stock, general-stock
    #[arg(value_parser = parse_kind)]
    collection: CollectionKind,

    /// Print kitchen tickets for new orders and confirm them once printed
    #[arg(long)]
    print: bool,

    /// Printer as "host" or "host:port"; defaults to printer.device
    #[arg(long, short)]
    device: Option<String>,
}

impl WatchCommand {
    pub fn run(&self, config: &Config) -> Result<(), CommandError> {
        block_on(self.watch(config))
    }

    async fn watch(&self, config: &Config) -> Result<(), CommandError> {
        let engine = Engine::start(config).await?;
        let store = engine.open(self.collection.clone());

        let (queue, events) = if self.print {
            let (queue, events) = self.print_queue(config)?;
            (Some(queue), events)
        } else {
            // Closed at once; the select below skips it.
            let (_, rx) = mpsc::unbounded_channel();
            (None, rx)
        };

        let expiry = credential_store(config)
            .load()
            .and_then(|c| c.expires_in(Utc::now()))
            .unwrap_or(Duration::MAX);

        println!("Watching {} (Ctrl-C to stop)", self.collection.name);
        let interrupted = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("could not listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        };
        follow(
            &store,
            engine.session().connection_changes(),
            events,
            queue.as_ref(),
            expiry,
            interrupted,
        )
        .await;
        Ok(())
    }

    fn print_queue(
        &self,
        config: &Config,
    ) -> Result<(PrintQueue, mpsc::UnboundedReceiver<PrintEvent>), CommandError> {
        let device = self
            .device
            .clone()
            .or_else(|| config.printer.device.clone())
            .ok_or_else(|| {
                CommandError::InvalidInput(
                    "No printer configured. Pass --device or set printer.device.".to_string(),
                )
            })?;
        let printer = NetworkPrinter::at(&device)?;
        Ok(PrintQueue::spawn(printer, PermissionGate::granted()))
    }
}

/// Reports changes until the session expires, the channel goes away, or
/// `stop` completes.
async fn follow(
    store: &CollectionStore,
    mut connection: watch::Receiver<bool>,
    mut events: mpsc::UnboundedReceiver<PrintEvent>,
    queue: Option<&PrintQueue>,
    expires_in: Duration,
    stop: impl Future<Output = ()>,
) {
    let mut changes = store.changes();
    let expired = tokio::time::sleep(expires_in);
    tokio::pin!(expired);
    tokio::pin!(stop);

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                report(store);
                if let Some(queue) = queue {
                    enqueue_new_orders(store, queue);
                }
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let up = *connection.borrow_and_update();
                println!("{}", if up { "connected" } else { "disconnected, retrying" });
            }
            Some(event) = events.recv() => {
                handle_print_event(store, event).await;
            }
            _ = &mut expired => {
                println!("Session expired. Run 'comanda login' again.");
                break;
            }
            _ = &mut stop => {
                break;
            }
        }
    }
}

fn report(store: &CollectionStore) {
    let phase = match store.phase() {
        SyncPhase::Idle => "idle",
        SyncPhase::Fetching => "fetching",
        SyncPhase::Synced { stale: false } => "synced",
        SyncPhase::Synced { stale: true } => "stale",
    };
    let pending = store.pending().len();
    if pending > 0 {
        println!("{}: {} records ({}, {} pending)", store.kind().name, store.len(), phase, pending);
    } else {
        println!("{}: {} records ({})", store.kind().name, store.len(), phase);
    }
}

/// Open orders not yet sent to the kitchen printer.
fn needs_printing(record: &Record) -> bool {
    record.int("printed") == 0 && !record.is_closed()
}

fn enqueue_new_orders(store: &CollectionStore, queue: &PrintQueue) {
    let category = store.view_category();
    for record in store.records() {
        if !needs_printing(&record) {
            continue;
        }
        if let Some(category) = &category {
            if record.text("categoria").as_deref() != Some(category.as_str()) {
                continue;
            }
        }
        if let Err(e) = queue.enqueue_record(&record) {
            tracing::warn!("could not queue ticket: {}", e);
        }
    }
}

async fn handle_print_event(store: &CollectionStore, event: PrintEvent) {
    match event {
        PrintEvent::Printed { order_ids, .. } => {
            for id in order_ids {
                let Some(mutation) = store.get(&id).as_ref().and_then(Mutation::confirm_order)
                else {
                    continue;
                };
                match store.mutate(mutation).await {
                    Some(reply) if reply.ok => println!("printed order {}", id),
                    Some(reply) => println!(
                        "printed order {} but could not confirm it: {}",
                        id,
                        reply.message.unwrap_or_default()
                    ),
                    None => tracing::debug!(%id, "confirmation already in flight"),
                }
            }
        }
        PrintEvent::Failed { order_ids, error, .. } => {
            let ids: Vec<String> = order_ids.iter().map(|id| id.to_string()).collect();
            println!("print failed for [{}]: {}", ids.join(", "), error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comanda_core::{ChannelSession, Connectivity, RequestContext, Requester, SyncTuning};
    use serde_json::json;

    fn offline_store() -> (CollectionStore, ChannelSession) {
        let session = ChannelSession::new();
        let requester = Requester::new(
            session.clone(),
            Connectivity::new(true),
            RequestContext::default(),
        );
        let store = CollectionStore::open(CollectionKind::orders(), requester, SyncTuning::default());
        (store, session)
    }

    #[tokio::test]
    async fn test_follow_stops_on_signal() {
        let (store, session) = offline_store();
        let (_, events) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let stop = async {
            let _ = stop_rx.await;
        };

        let following = follow(
            &store,
            session.connection_changes(),
            events,
            None,
            Duration::MAX,
            stop,
        );
        let signal = async {
            // Fires while the loop is already waiting.
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = stop_tx.send(());
        };

        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(following, signal)
        })
        .await;
        assert!(finished.is_ok());
    }

    #[tokio::test]
    async fn test_follow_stops_when_session_expires() {
        let (store, session) = offline_store();
        let (_, events) = mpsc::unbounded_channel();
        let finished = tokio::time::timeout(
            Duration::from_secs(5),
            follow(
                &store,
                session.connection_changes(),
                events,
                None,
                Duration::from_millis(10),
                std::future::pending::<()>(),
            ),
        )
        .await;
        assert!(finished.is_ok());
    }

    #[test]
    fn test_needs_printing() {
        let record = |v| Record::from_value(v).unwrap();
        assert!(needs_printing(&record(json!({"id": 1, "printed": 0, "ordem": 0}))));
        assert!(needs_printing(&record(json!({"id": 1}))));
        assert!(!needs_printing(&record(json!({"id": 1, "printed": "1"}))));
        assert!(!needs_printing(&record(json!({"id": 1, "printed": 0, "ordem": 2}))));
    }
}
