//! Acknowledged requests.
//!
//! A request is one emitted event plus exactly one acknowledgment, bounded
//! by a timeout. Whatever happens, the caller gets a [`Reply`]: failures are
//! encoded in `ok`, never raised.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{SyncError, GENERIC_REJECTION};
use super::session::{ChannelSession, PendingAck};
use crate::connectivity::Connectivity;

/// Uniform result of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Reply {
    pub fn success(message: Option<String>) -> Self {
        Self { ok: true, message }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: Some(message.into()),
        }
    }
}

impl From<Result<Option<String>, SyncError>> for Reply {
    fn from(result: Result<Option<String>, SyncError>) -> Self {
        match result {
            Ok(message) => Reply::success(message),
            Err(e) => Reply::failure(e.user_message()),
        }
    }
}

/// Fields attached to every outgoing payload.
///
/// Serialized with the server's field names: `carrinho` for the workspace,
/// `usuario` and `token` for the actor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Active workspace (the cart/venue the device is bound to)
    pub workspace_id: String,
    /// Staff role, used to pick role-specific wire events
    #[serde(default)]
    pub role: String,
    /// User performing mutations
    #[serde(default)]
    pub actor: Option<String>,
    /// Token proving the actor's identity
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl RequestContext {
    pub fn new(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            ..Default::default()
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>, auth_token: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self.auth_token = Some(auth_token.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Adds the workspace id to `payload`.
    ///
    /// Non-object payloads are replaced by an object carrying only the
    /// context.
    pub fn attach(&self, payload: Value) -> Value {
        let mut map = into_object(payload);
        map.insert(
            "carrinho".to_string(),
            Value::String(self.workspace_id.clone()),
        );
        Value::Object(map)
    }

    /// Adds the workspace id, actor and token to `payload`.
    pub fn attach_actor(&self, payload: Value) -> Value {
        let mut map = into_object(self.attach(payload));
        if let Some(actor) = &self.actor {
            map.insert("usuario".to_string(), Value::String(actor.clone()));
        }
        if let Some(token) = &self.auth_token {
            map.insert("token".to_string(), Value::String(token.clone()));
        }
        Value::Object(map)
    }
}

fn into_object(payload: Value) -> Map<String, Value> {
    match payload {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Sends acknowledged requests over a session.
#[derive(Debug, Clone)]
pub struct Requester {
    session: ChannelSession,
    connectivity: Connectivity,
    context: RequestContext,
}

impl Requester {
    pub fn new(
        session: ChannelSession,
        connectivity: Connectivity,
        context: RequestContext,
    ) -> Self {
        Self {
            session,
            connectivity,
            context,
        }
    }

    pub fn session(&self) -> &ChannelSession {
        &self.session
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// Fails fast when the request could not possibly be delivered.
    pub fn ensure_ready(&self) -> Result<(), SyncError> {
        if !self.connectivity.is_online() {
            return Err(SyncError::NoConnectivity);
        }
        if !self.session.is_connected() {
            return Err(SyncError::ChannelDisconnected);
        }
        Ok(())
    }

    /// Sends `event` and returns the pending acknowledgment.
    ///
    /// `payload` must already carry its context fields.
    pub fn send(&self, event: &str, payload: Value) -> Result<PendingAck, SyncError> {
        self.ensure_ready()?;
        let pending = self.session.emit_with_ack(event, payload)?;
        tracing::debug!(event, ack_id = pending.ack_id(), "request sent");
        Ok(pending)
    }

    /// Waits for `pending` for at most `timeout`.
    ///
    /// On timeout the correlation is dropped, so a late acknowledgment has
    /// no effect.
    pub async fn wait(
        &self,
        pending: PendingAck,
        timeout: Duration,
    ) -> Result<Option<String>, SyncError> {
        let ack_id = pending.ack_id();
        match tokio::time::timeout(timeout, pending.recv()).await {
            Ok(Ok(body)) => interpret_ack(body),
            Ok(Err(e)) => {
                tracing::debug!(ack_id, "connection lost before acknowledgment");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(ack_id, ?timeout, "request timed out");
                Err(SyncError::Timeout)
            }
        }
    }

    /// Sends `event` with the workspace id attached and waits for the
    /// acknowledgment.
    pub async fn try_request(
        &self,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Option<String>, SyncError> {
        let pending = self.send(event, self.context.attach(payload))?;
        self.wait(pending, timeout).await
    }

    /// Like [`Requester::try_request`], folded into a [`Reply`].
    pub async fn request(&self, event: &str, payload: Value, timeout: Duration) -> Reply {
        let result = self.try_request(event, payload, timeout).await;
        if let Err(e) = &result {
            tracing::info!(event, "request failed: {}", e);
        }
        Reply::from(result)
    }
}

#[derive(Deserialize)]
struct AckBody {
    ok: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Maps an acknowledgment body onto success or failure.
///
/// An empty acknowledgment means success. An object must carry a boolean
/// `ok`; anything else is malformed.
pub fn interpret_ack(body: Value) -> Result<Option<String>, SyncError> {
    if body.is_null() {
        return Ok(None);
    }
    let parsed: AckBody =
        serde_json::from_value(body).map_err(|e| SyncError::MalformedResponse(e.to_string()))?;
    if parsed.ok {
        Ok(parsed.message)
    } else {
        Err(SyncError::ServerRejected(
            parsed
                .message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| GENERIC_REJECTION.to_string()),
        ))
    }
}
