//! Websocket transport for a [`ChannelSession`].
//!
//! The transport owns the socket. It connects, completes the Engine.IO and
//! Socket.IO handshakes, pumps packets between the socket and the session,
//! and reconnects with jittered exponential backoff whenever the connection
//! drops. The session and its handlers are untouched by reconnects.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::error::SyncError;
use super::protocol::{Handshake, Packet};
use super::session::ChannelSession;
use crate::config::ReconnectPolicy;
use crate::connectivity::Connectivity;
use crate::task::ScopedTask;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Path of the Socket.IO endpoint, protocol version 4, websocket only.
const SOCKET_PATH: &str = "/socket.io/?EIO=4&transport=websocket";

/// Drives one session's socket.
#[derive(Debug, Clone)]
pub struct Transport {
    server_url: String,
    query: Vec<(String, String)>,
    policy: ReconnectPolicy,
    connectivity: Option<Connectivity>,
}

impl Transport {
    pub fn new(server_url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            server_url: server_url.into(),
            query: Vec::new(),
            policy,
            connectivity: None,
        }
    }

    /// Adds a query parameter to the connection URL.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Skips the remaining backoff as soon as the device comes back online.
    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Builds the websocket URL, converting http(s) to ws(s) if needed.
    pub fn build_ws_url(&self) -> String {
        let base_url = if let Some(rest) = self.server_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else if let Some(rest) = self.server_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if !self.server_url.starts_with("ws://") && !self.server_url.starts_with("wss://")
        {
            format!("ws://{}", self.server_url)
        } else {
            self.server_url.clone()
        };

        let mut url = format!("{}{}", base_url.trim_end_matches('/'), SOCKET_PATH);
        for (key, value) in &self.query {
            url.push('&');
            url.push_str(&urlencoding::encode(key));
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }
        url
    }

    /// Runs the connect/reconnect loop until the returned task is dropped.
    pub fn spawn(self, session: ChannelSession) -> ScopedTask {
        ScopedTask::spawn(async move { self.run(session).await })
    }

    /// Connects forever. Only returns when cancelled.
    pub async fn run(&self, session: ChannelSession) {
        let mut attempt: u32 = 0;
        loop {
            match self.establish().await {
                Ok((ws, handshake)) => {
                    attempt = 0;
                    tracing::info!(url = %self.server_url, sid = %handshake.sid, "connected");
                    let result = self.pump(ws, &handshake, &session).await;
                    session.mark_disconnected();
                    match result {
                        Ok(()) => tracing::info!("connection closed by server"),
                        Err(e) => tracing::warn!("connection lost: {}", e),
                    }
                }
                Err(e) => {
                    tracing::warn!(attempt, "connect failed: {}", e);
                    attempt = attempt.saturating_add(1);
                }
            }

            let delay = self.jittered_delay(attempt.saturating_sub(1));
            tracing::debug!(?delay, "reconnecting");
            self.wait_before_retry(delay).await;
        }
    }

    /// Connects and completes both handshakes within the connect timeout.
    async fn establish(&self) -> Result<(WsStream, Handshake), SyncError> {
        let url = self.build_ws_url();
        timeout(self.policy.connect_timeout(), async {
            let (mut ws, _) = connect_async(&url)
                .await
                .map_err(|e| SyncError::WebSocket(e.to_string()))?;
            let handshake = perform_handshake(&mut ws).await?;
            Ok((ws, handshake))
        })
        .await
        .map_err(|_| SyncError::Timeout)?
    }

    /// Moves packets between the socket and the session until either side
    /// closes or the server stops pinging.
    async fn pump(
        &self,
        ws: WsStream,
        handshake: &Handshake,
        session: &ChannelSession,
    ) -> Result<(), SyncError> {
        let (mut sender, mut receiver) = ws.split();
        let mut outbound = session.attach();
        session.mark_connected();

        let heartbeat = Duration::from_millis(handshake.ping_interval + handshake.ping_timeout);
        let mut deadline = Instant::now() + heartbeat;

        loop {
            tokio::select! {
                packet = outbound.recv() => {
                    // The sender lives in the session until mark_disconnected.
                    let Some(packet) = packet else { return Ok(()) };
                    send_packet(&mut sender, &packet).await?;
                }
                frame = receiver.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(SyncError::WebSocket(e.to_string())),
                    };
                    let packet = match Packet::decode(text.as_str()) {
                        Ok(packet) => packet,
                        Err(e) => {
                            tracing::warn!("dropping undecodable frame: {}", e);
                            continue;
                        }
                    };
                    match packet {
                        Packet::Ping => {
                            deadline = Instant::now() + heartbeat;
                            send_packet(&mut sender, &Packet::Pong).await?;
                        }
                        Packet::Close | Packet::Disconnect => {
                            let _ = sender.send(Message::Close(None)).await;
                            return Ok(());
                        }
                        other => session.handle_packet(other),
                    }
                }
                _ = sleep_until(deadline) => {
                    return Err(SyncError::Timeout);
                }
            }
        }
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.policy.base_delay(attempt);
        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor)
    }

    async fn wait_before_retry(&self, delay: Duration) {
        let Some(connectivity) = &self.connectivity else {
            sleep(delay).await;
            return;
        };

        let mut online = connectivity.subscribe();
        online.borrow_and_update();
        tokio::select! {
            _ = sleep(delay) => {}
            _ = async {
                loop {
                    if online.changed().await.is_err() {
                        // Sender gone: fall back to the plain delay.
                        std::future::pending::<()>().await;
                    }
                    if *online.borrow_and_update() {
                        break;
                    }
                }
            } => tracing::debug!("back online, retrying now"),
        }
    }
}

async fn send_packet<S>(sender: &mut S, packet: &Packet) -> Result<(), SyncError>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let frame = packet
        .encode()
        .map_err(|e| SyncError::Protocol(e.to_string()))?;
    sender
        .send(Message::Text(frame.into()))
        .await
        .map_err(|e| SyncError::WebSocket(e.to_string()))
}

/// Reads the Engine.IO open packet, then joins the default namespace.
async fn perform_handshake(ws: &mut WsStream) -> Result<Handshake, SyncError> {
    let handshake = loop {
        match next_packet(ws).await? {
            Packet::Open(handshake) => break handshake,
            Packet::Noop => continue,
            other => {
                return Err(SyncError::Protocol(format!(
                    "Expected open packet, got {:?}",
                    other
                )))
            }
        }
    };

    send_packet(ws, &Packet::Connect { data: None }).await?;

    loop {
        match next_packet(ws).await? {
            Packet::Connect { .. } => return Ok(handshake),
            Packet::Ping => send_packet(ws, &Packet::Pong).await?,
            Packet::ConnectError { data } => {
                return Err(SyncError::Protocol(format!("Connect refused: {}", data)))
            }
            other => tracing::trace!(packet = ?other, "ignoring packet during handshake"),
        }
    }
}

async fn next_packet(ws: &mut WsStream) -> Result<Packet, SyncError> {
    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                return Packet::decode(text.as_str()).map_err(|e| SyncError::Protocol(e.to_string()))
            }
            Ok(Message::Close(_)) => {
                return Err(SyncError::Protocol(
                    "Server closed connection during handshake".to_string(),
                ))
            }
            Ok(_) => {}
            Err(e) => return Err(SyncError::WebSocket(e.to_string())),
        }
    }
    Err(SyncError::Protocol(
        "Connection closed before handshake completed".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ws_url() {
        let policy = ReconnectPolicy::default();
        let cases = [
            ("http://localhost:5000", "ws://localhost:5000"),
            ("https://api.example.com/", "wss://api.example.com"),
            ("localhost:5000", "ws://localhost:5000"),
            ("wss://api.example.com", "wss://api.example.com"),
        ];
        for (input, base) in cases {
            assert_eq!(
                Transport::new(input, policy).build_ws_url(),
                format!("{}/socket.io/?EIO=4&transport=websocket", base)
            );
        }
    }

    #[test]
    fn test_query_is_encoded() {
        let url = Transport::new("http://localhost:5000", ReconnectPolicy::default())
            .with_query("carrinho", "Bar do Zé")
            .build_ws_url();
        assert!(url.ends_with("&carrinho=Bar%20do%20Z%C3%A9"));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let transport = Transport::new("localhost", ReconnectPolicy::default());
        for attempt in 0..8 {
            let base = ReconnectPolicy::default().base_delay(attempt);
            let delay = transport.jittered_delay(attempt);
            assert!(delay >= base.mul_f64(0.5));
            assert!(delay <= base.mul_f64(1.5));
        }
    }

    #[test]
    fn test_no_jitter() {
        let policy = ReconnectPolicy {
            jitter: 0.0,
            ..Default::default()
        };
        let transport = Transport::new("localhost", policy);
        assert_eq!(transport.jittered_delay(2), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_wakes_when_back_online() {
        let connectivity = Connectivity::new(false);
        let transport = Transport::new("localhost", ReconnectPolicy::default())
            .with_connectivity(connectivity.clone());

        let started = Instant::now();
        let wait = transport.wait_before_retry(Duration::from_secs(30));
        let flip = async {
            sleep(Duration::from_secs(2)).await;
            connectivity.set_online(true);
        };
        tokio::join!(wait, flip);

        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
