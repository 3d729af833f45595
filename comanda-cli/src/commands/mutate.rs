use std::time::Duration;

use clap::Args;
use comanda_core::store::{Mutation, RecordId};
use comanda_core::{CollectionKind, SyncError};

use super::{block_on, pair_value, parse_kind, parse_pair, wait_for_snapshot, CommandError};
use crate::config::Config;
use crate::engine::Engine;

/// Send a change for one row
#[derive(Args)]
pub struct MutateCommand {
    /// Collection the row belongs to
    #[arg(value_parser = parse_kind)]
    collection: CollectionKind,

    /// Server event name (e.g. permitir, excluir_pedido)
    event: String,

    /// Row id
    id: String,

    /// Payload field (FIELD=VALUE, JSON values accepted, repeatable)
    #[arg(long, value_parser = parse_pair)]
    set: Vec<(String, String)>,

    /// Remove the row locally as soon as the change is sent
    #[arg(long, conflicts_with = "patch")]
    remove: bool,

    /// Update a field locally as soon as the change is sent (repeatable)
    #[arg(long, value_parser = parse_pair)]
    patch: Vec<(String, String)>,

    /// Do not wait for an acknowledgment
    #[arg(long)]
    no_ack: bool,

    /// Attach the logged-in user and token
    #[arg(long)]
    actor: bool,

    /// Fetch a fresh snapshot after the server confirms
    #[arg(long)]
    refresh: bool,

    /// Seconds to wait for the connection
    #[arg(long, default_value = "10")]
    wait: u64,
}

impl MutateCommand {
    pub fn run(&self, config: &Config) -> Result<(), CommandError> {
        block_on(self.mutate(config))
    }

    fn mutation(&self) -> Mutation {
        let mut mutation = Mutation::new(self.event.clone(), RecordId::new(self.id.trim()));
        for (field, value) in &self.set {
            mutation = mutation.with_field(field, pair_value(value));
        }
        if self.remove {
            mutation = mutation.removing();
        }
        for (field, value) in &self.patch {
            mutation = mutation.patching(field, pair_value(value));
        }
        if self.no_ack {
            mutation = mutation.fire_and_forget();
        }
        if self.actor {
            mutation = mutation.with_actor();
        }
        if self.refresh {
            mutation = mutation.refresh_after();
        }
        mutation
    }

    async fn mutate(&self, config: &Config) -> Result<(), CommandError> {
        let engine = Engine::start(config).await?;
        let limit = Duration::from_secs(self.wait);
        if !engine.wait_connected(limit).await {
            return Err(SyncError::ChannelDisconnected.into());
        }

        let store = engine.open(self.collection.clone());
        if let Err(e) = wait_for_snapshot(&store, limit).await {
            tracing::warn!("sending without a snapshot: {}", e);
        }

        let Some(reply) = store.mutate(self.mutation()).await else {
            return Err(CommandError::InvalidInput(format!(
                "row {} is busy, try again",
                self.id
            )));
        };
        if !reply.ok {
            return Err(CommandError::InvalidInput(
                reply.message.unwrap_or_else(|| "request failed".to_string()),
            ));
        }

        match reply.message {
            Some(message) => println!("ok: {}", message),
            None => println!("ok"),
        }
        Ok(())
    }
}
