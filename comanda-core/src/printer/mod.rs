//! Receipt printing.
//!
//! A [`PrintQueue`] owns a worker task that prints jobs one at a time
//! through a [`PrinterDriver`]. Enqueueing never waits for the printer;
//! outcomes come back on an event channel so callers can surface failures
//! without blocking the order flow.

mod receipt;

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use crate::store::{Record, RecordId};
use crate::task::{lock, ScopedTask};

pub use receipt::{
    items_from_record, line_kv, order_ids, strip_meta_lines, wrap_words, Receipt, ReceiptItem,
    NARROW_WIDTH, WIDE_WIDTH,
};

/// Raw-socket port used by network thermal printers.
pub const DEFAULT_PRINTER_PORT: u16 = 9100;
const DEFAULT_PRINT_TIMEOUT: Duration = Duration::from_secs(10);
/// How many printed order ids are remembered for duplicate suppression.
const SEEN_CAPACITY: usize = 1000;

#[derive(Debug, Error)]
pub enum PrinterError {
    #[error("printer not configured")]
    NotConfigured,

    #[error("invalid printer address '{0}'")]
    InvalidDevice(String),

    #[error("printing not permitted on this device")]
    PermissionDenied,

    #[error("could not reach printer at {0}: {1}")]
    Connect(String, #[source] io::Error),

    #[error("printer at {0} failed: {1}")]
    Io(String, #[source] io::Error),

    #[error("printer at {0} did not respond")]
    Timeout(String),

    #[error("print queue stopped")]
    QueueClosed,
}

/// A device that prints rendered receipts.
pub trait PrinterDriver: Send + 'static {
    /// Points the driver at a device.
    fn select(&mut self, device: &str) -> Result<(), PrinterError>;

    /// The device currently selected, if any.
    fn selected(&self) -> Option<String>;

    /// Sends one rendered receipt.
    fn print(&mut self, bytes: &[u8]) -> impl Future<Output = Result<(), PrinterError>> + Send;
}

/// Thermal printer reached over raw TCP.
#[derive(Debug, Clone)]
pub struct NetworkPrinter {
    address: Option<String>,
    timeout: Duration,
}

impl NetworkPrinter {
    pub fn new() -> Self {
        Self {
            address: None,
            timeout: DEFAULT_PRINT_TIMEOUT,
        }
    }

    /// A printer at `host` or `host:port`.
    pub fn at(device: &str) -> Result<Self, PrinterError> {
        let mut printer = Self::new();
        printer.select(device)?;
        Ok(printer)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for NetworkPrinter {
    fn default() -> Self {
        Self::new()
    }
}

impl PrinterDriver for NetworkPrinter {
    fn select(&mut self, device: &str) -> Result<(), PrinterError> {
        let device = device.trim();
        if device.is_empty() || device.contains(char::is_whitespace) {
            return Err(PrinterError::InvalidDevice(device.to_string()));
        }
        let address = parse_address(device)
            .ok_or_else(|| PrinterError::InvalidDevice(device.to_string()))?;
        tracing::info!(printer = %address, "printer selected");
        self.address = Some(address);
        Ok(())
    }

    fn selected(&self) -> Option<String> {
        self.address.clone()
    }

    async fn print(&mut self, bytes: &[u8]) -> Result<(), PrinterError> {
        let address = self.address.clone().ok_or(PrinterError::NotConfigured)?;

        let mut stream = timeout(self.timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| PrinterError::Timeout(address.clone()))?
            .map_err(|e| PrinterError::Connect(address.clone(), e))?;

        timeout(self.timeout, async {
            stream.write_all(bytes).await?;
            stream.flush().await?;
            stream.shutdown().await
        })
        .await
        .map_err(|_| PrinterError::Timeout(address.clone()))?
        .map_err(|e| PrinterError::Io(address.clone(), e))?;

        tracing::debug!(printer = %address, bytes = bytes.len(), "receipt sent");
        Ok(())
    }
}

/// Normalizes `host`, `host:port`, a bare IPv6 address or `[v6]:port`
/// into a connectable `host:port`.
fn parse_address(device: &str) -> Option<String> {
    if let Ok(ip) = device.parse::<Ipv6Addr>() {
        return Some(format!("[{}]:{}", ip, DEFAULT_PRINTER_PORT));
    }
    if let Some(rest) = device.strip_prefix('[') {
        let (ip, port) = match rest.split_once(']') {
            Some((ip, "")) => (ip, DEFAULT_PRINTER_PORT),
            Some((ip, port)) => (ip, port.strip_prefix(':')?.parse().ok()?),
            None => return None,
        };
        let ip: Ipv6Addr = ip.parse().ok()?;
        return Some(format!("[{}]:{}", ip, port));
    }
    match device.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            port.parse::<u16>().ok()?;
            Some(device.to_string())
        }
        Some(_) => None,
        None => Some(format!("{}:{}", device, DEFAULT_PRINTER_PORT)),
    }
}

/// Asks for printing permission once, on first use, and remembers the
/// answer for the life of the gate.
pub struct PermissionGate {
    ask: Box<dyn Fn() -> bool + Send + Sync>,
    granted: OnceLock<bool>,
}

impl PermissionGate {
    pub fn new(ask: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self {
            ask: Box::new(ask),
            granted: OnceLock::new(),
        }
    }

    /// A gate that needs no permission.
    pub fn granted() -> Self {
        Self::new(|| true)
    }

    pub fn check(&self) -> bool {
        *self.granted.get_or_init(|| {
            let granted = (self.ask)();
            if !granted {
                tracing::warn!("printing permission denied");
            }
            granted
        })
    }

    /// Whether the question has been asked yet.
    pub fn is_decided(&self) -> bool {
        self.granted.get().is_some()
    }
}

impl fmt::Debug for PermissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionGate")
            .field("granted", &self.granted.get())
            .finish()
    }
}

/// A receipt waiting to print.
#[derive(Debug, Clone)]
pub struct PrintJob {
    pub id: Uuid,
    pub order_ids: Vec<RecordId>,
    pub receipt: Receipt,
}

/// Outcome of one job, reported by the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum PrintEvent {
    Printed { job: Uuid, order_ids: Vec<RecordId> },
    Failed { job: Uuid, order_ids: Vec<RecordId>, error: String },
}

/// Recently printed order ids, oldest evicted first.
#[derive(Debug, Default)]
struct SeenIds {
    order: VecDeque<RecordId>,
    set: HashSet<RecordId>,
}

impl SeenIds {
    fn contains_all(&self, ids: &[RecordId]) -> bool {
        !ids.is_empty() && ids.iter().all(|id| self.set.contains(id))
    }

    fn insert(&mut self, ids: &[RecordId]) {
        for id in ids {
            if self.set.insert(id.clone()) {
                self.order.push_back(id.clone());
            }
        }
        while self.order.len() > SEEN_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
    }

    fn remove(&mut self, ids: &[RecordId]) {
        for id in ids {
            if self.set.remove(id) {
                self.order.retain(|seen| seen != id);
            }
        }
    }
}

/// Sequential print queue backed by a worker task.
#[derive(Debug)]
pub struct PrintQueue {
    jobs: mpsc::UnboundedSender<PrintJob>,
    depth: Arc<AtomicUsize>,
    seen: Arc<Mutex<SeenIds>>,
    _worker: ScopedTask,
}

impl PrintQueue {
    /// Starts the worker. Dropping the queue stops it.
    pub fn spawn<D: PrinterDriver>(
        driver: D,
        gate: PermissionGate,
    ) -> (Self, mpsc::UnboundedReceiver<PrintEvent>) {
        let (jobs, rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(SeenIds::default()));

        let worker = ScopedTask::spawn(run_worker(
            driver,
            gate,
            rx,
            events_tx,
            depth.clone(),
            seen.clone(),
        ));

        let queue = Self {
            jobs,
            depth,
            seen,
            _worker: worker,
        };
        (queue, events)
    }

    /// Queues a receipt. Returns `None` when every order id on it was
    /// already queued, so repeated pushes of one order print once. Ids of a
    /// job that fails are forgotten, so the order can be queued again.
    pub fn enqueue(
        &self,
        receipt: Receipt,
        order_ids: Vec<RecordId>,
    ) -> Result<Option<Uuid>, PrinterError> {
        if receipt.is_empty() {
            tracing::debug!("skipping receipt without items");
            return Ok(None);
        }
        {
            let mut seen = lock(&self.seen);
            if seen.contains_all(&order_ids) {
                tracing::debug!(?order_ids, "order already queued");
                return Ok(None);
            }
            seen.insert(&order_ids);
        }

        let job = PrintJob {
            id: Uuid::new_v4(),
            order_ids,
            receipt,
        };
        let id = job.id;
        tracing::info!(job = %id, items = %job.receipt.summary(), "print job queued");

        self.depth.fetch_add(1, Ordering::SeqCst);
        self.jobs.send(job).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            PrinterError::QueueClosed
        })?;
        Ok(Some(id))
    }

    /// Queues the ticket for an order record.
    pub fn enqueue_record(&self, record: &Record) -> Result<Option<Uuid>, PrinterError> {
        self.enqueue(Receipt::from_record(record), order_ids(record))
    }

    /// Jobs accepted but not yet finished.
    pub fn queued(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

async fn run_worker<D: PrinterDriver>(
    mut driver: D,
    gate: PermissionGate,
    mut jobs: mpsc::UnboundedReceiver<PrintJob>,
    events: mpsc::UnboundedSender<PrintEvent>,
    depth: Arc<AtomicUsize>,
    seen: Arc<Mutex<SeenIds>>,
) {
    while let Some(job) = jobs.recv().await {
        let result = if gate.check() {
            driver.print(&job.receipt.render()).await
        } else {
            Err(PrinterError::PermissionDenied)
        };
        depth.fetch_sub(1, Ordering::SeqCst);

        let event = match result {
            Ok(()) => {
                tracing::info!(job = %job.id, "printed");
                PrintEvent::Printed {
                    job: job.id,
                    order_ids: job.order_ids,
                }
            }
            Err(e) => {
                tracing::warn!(job = %job.id, "print failed: {}", e);
                lock(&seen).remove(&job.order_ids);
                PrintEvent::Failed {
                    job: job.id,
                    order_ids: job.order_ids,
                    error: e.to_string(),
                }
            }
        };
        // Nobody listening is fine.
        let _ = events.send(event);
    }
}
