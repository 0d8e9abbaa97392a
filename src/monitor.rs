use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::settings::SupervisorSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortOutcome {
    Active { attempts: u32 },
    TimedOut { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub attempts: u32,
    pub connect_timeout: Duration,
    pub backoff: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            attempts: 10,
            connect_timeout: Duration::from_secs(2),
            backoff: Duration::from_secs(1),
        }
    }
}

impl From<&SupervisorSettings> for WatchOptions {
    fn from(settings: &SupervisorSettings) -> Self {
        Self {
            attempts: settings.port_check_attempts.max(1),
            connect_timeout: Duration::from_millis(settings.port_check_timeout_ms),
            backoff: Duration::from_millis(settings.port_check_backoff_ms),
        }
    }
}

type InFlight = Arc<Mutex<HashMap<u16, u64>>>;

fn lock_table(table: &InFlight) -> MutexGuard<'_, HashMap<u16, u64>> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

/// Marks a port as watched for as long as it lives.
///
/// Each marker carries its own token, so a guard only ever removes the entry
/// it inserted, even if the table was cleared and reused in between.
struct InFlightGuard {
    table: InFlight,
    port: u16,
    token: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut table = lock_table(&self.table);
        if table.get(&self.port) == Some(&self.token) {
            table.remove(&self.port);
        }
    }
}

/// Polls loopback ports until they accept connections.
#[derive(Clone)]
pub struct PortMonitor {
    in_flight: InFlight,
    next_token: Arc<AtomicU64>,
    options: WatchOptions,
}

impl PortMonitor {
    pub fn new(options: WatchOptions) -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_token: Arc::new(AtomicU64::new(1)),
            options,
        }
    }

    pub fn options(&self) -> &WatchOptions {
        &self.options
    }

    fn try_acquire(&self, port: u16) -> Option<InFlightGuard> {
        let mut table = lock_table(&self.in_flight);
        if table.contains_key(&port) {
            return None;
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        table.insert(port, token);
        Some(InFlightGuard {
            table: self.in_flight.clone(),
            port,
            token,
        })
    }

    /// Starts polling `port` in the background and calls `on_active` once it
    /// accepts a connection. Returns `None` if the port is already watched.
    ///
    /// Must be called from within a tokio runtime.
    pub fn watch_port<F>(&self, port: u16, on_active: F) -> Option<JoinHandle<PortOutcome>>
    where
        F: FnOnce(u16) + Send + 'static,
    {
        let Some(guard) = self.try_acquire(port) else {
            debug!("Port {} is already being watched", port);
            return None;
        };
        let options = self.options.clone();

        Some(tokio::spawn(async move {
            let _guard = guard;
            let outcome = poll_port(port, &options).await;
            match outcome {
                PortOutcome::Active { attempts } => {
                    info!("Port {} active after {} attempt(s)", port, attempts);
                    on_active(port);
                }
                PortOutcome::TimedOut { attempts } => {
                    warn!(
                        "Port {} did not become active after {} attempts",
                        port, attempts
                    );
                }
            }
            outcome
        }))
    }

    pub fn is_watching(&self, port: u16) -> bool {
        lock_table(&self.in_flight).contains_key(&port)
    }

    pub fn in_flight(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = lock_table(&self.in_flight).keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Drops the marker for `port` so a new watch can start right away. A loop
    /// still running for it finishes without touching the newer marker.
    pub fn release(&self, port: u16) {
        lock_table(&self.in_flight).remove(&port);
    }

    /// Forgets every in-flight marker. Loops already running finish on their
    /// own but no longer block new watches.
    pub fn clear(&self) {
        lock_table(&self.in_flight).clear();
    }
}

pub async fn check_port(port: u16, connect_timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(connect_timeout, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

async fn poll_port(port: u16, options: &WatchOptions) -> PortOutcome {
    let attempts = options.attempts.max(1);
    for attempt in 1..=attempts {
        if check_port(port, options.connect_timeout).await {
            return PortOutcome::Active { attempts: attempt };
        }
        debug!("Port {} not ready (attempt {}/{})", port, attempt, attempts);
        if attempt < attempts {
            tokio::time::sleep(options.backoff).await;
        }
    }
    PortOutcome::TimedOut { attempts }
}
