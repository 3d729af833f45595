//! Device reachability.
//!
//! [`Connectivity`] holds the latest known "online" flag. It starts from a
//! one-shot probe, then follows transitions reported by whatever watches the
//! network (a platform callback, or [`Connectivity::spawn_poller`]).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::sync::SyncError;
use crate::task::ScopedTask;

/// Timeout for a single reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that can tell whether the network is usable right now.
pub trait Probe: Send + Sync {
    /// `Ok(true)` if reachable, `Ok(false)` if clearly not, `Err` if the
    /// probe itself could not run.
    fn probe(&self) -> impl Future<Output = Result<bool, SyncError>> + Send;
}

/// The latest known online state, shared by every consumer.
#[derive(Debug, Clone)]
pub struct Connectivity {
    state: Arc<watch::Sender<bool>>,
}

impl Default for Connectivity {
    /// Starts optimistic, like a device that has not been told otherwise.
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self {
            state: Arc::new(state),
        }
    }

    /// Latest known state. Never blocks.
    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Records a reachability transition.
    ///
    /// Subscribers are only woken when the value actually changes.
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!(online, "connectivity changed");
        }
    }

    /// Watches transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Runs one probe and records its answer.
    ///
    /// A failing probe leaves the previous state untouched.
    pub async fn probe_with<P: Probe>(&self, probe: &P) -> bool {
        match probe.probe().await {
            Ok(online) => self.set_online(online),
            Err(e) => tracing::debug!("reachability probe failed: {}", e),
        }
        self.is_online()
    }

    /// Re-probes every `interval` until the returned task is dropped.
    pub fn spawn_poller<P>(&self, probe: P, interval: Duration) -> ScopedTask
    where
        P: Probe + 'static,
    {
        let connectivity = self.clone();
        ScopedTask::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                connectivity.probe_with(&probe).await;
            }
        })
    }
}

/// Probes reachability with a plain HTTP request to the sync server.
///
/// Any HTTP response counts as reachable; connect failures and timeouts
/// count as offline.
#[derive(Debug, Clone)]
pub struct ServerProbe {
    url: String,
    client: reqwest::Client,
}

impl ServerProbe {
    pub fn new(server_url: &str) -> Self {
        Self {
            url: http_url(server_url),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Probe for ServerProbe {
    async fn probe(&self) -> Result<bool, SyncError> {
        match self
            .client
            .get(&self.url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_connect() || e.is_timeout() => Ok(false),
            Err(e) => Err(SyncError::Http(e.to_string())),
        }
    }
}

/// Returns true if the server answers at all.
pub async fn check_server(server_url: &str) -> bool {
    matches!(ServerProbe::new(server_url).probe().await, Ok(true))
}

/// Converts a ws(s) or bare URL into its http(s) form.
pub fn http_url(server_url: &str) -> String {
    let base = if let Some(rest) = server_url.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else if let Some(rest) = server_url.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
        format!("http://{}", server_url)
    } else {
        server_url.to_string()
    };
    base.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        answers: Vec<Result<bool, SyncError>>,
        calls: AtomicUsize,
    }

    impl Probe for Scripted {
        async fn probe(&self) -> Result<bool, SyncError> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .get(i)
                .cloned()
                .unwrap_or(Err(SyncError::Http("exhausted".to_string())))
        }
    }

    #[tokio::test]
    async fn test_probe_failure_keeps_previous_state() {
        let connectivity = Connectivity::new(true);
        let probe = Scripted {
            answers: vec![Ok(false), Err(SyncError::Http("dns".to_string()))],
            calls: AtomicUsize::new(0),
        };

        assert!(!connectivity.probe_with(&probe).await);
        assert!(!connectivity.probe_with(&probe).await);
    }

    #[tokio::test]
    async fn test_subscribers_see_only_transitions() {
        let connectivity = Connectivity::new(true);
        let mut rx = connectivity.subscribe();

        connectivity.set_online(true);
        assert!(!rx.has_changed().unwrap());

        connectivity.set_online(false);
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_updates_state() {
        let connectivity = Connectivity::new(true);
        let probe = Scripted {
            answers: vec![Ok(false), Ok(false), Ok(true)],
            calls: AtomicUsize::new(0),
        };
        let mut rx = connectivity.subscribe();
        let _poller = connectivity.spawn_poller(probe, Duration::from_secs(1));

        rx.changed().await.unwrap();
        assert!(!connectivity.is_online());
        rx.changed().await.unwrap();
        assert!(connectivity.is_online());
    }

    #[test]
    fn test_http_url() {
        assert_eq!(http_url("ws://localhost:5000"), "http://localhost:5000");
        assert_eq!(http_url("wss://api.example.com/"), "https://api.example.com");
        assert_eq!(http_url("localhost:5000"), "http://localhost:5000");
        assert_eq!(http_url("https://api.example.com"), "https://api.example.com");
    }
}
