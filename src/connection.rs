//! Broker connection management.
//!
//! One long-lived AMQP connection per process, shared by every publisher and
//! consumer. Loss is detected through the connection's error callback, which
//! feeds a supervisor task that reconnects with exponential backoff. Channel
//! creation is the only thing the rest of the bus asks of this module.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::config::AmqpSettings;
use crate::{BusError, Result};

/// Delay schedule between connection attempts: 2, 4, 8, ... seconds.
///
/// Pure exponential, no cap; the attempt count bounds the schedule.
fn connect_delays(max_attempts: u32) -> impl Iterator<Item = Duration> {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(2))
        .with_factor(2.0)
        .with_max_times(max_attempts as usize)
        .build()
}

/// Owns the single shared broker connection.
///
/// `try_connect` is serialized by a mutex so a reconnect listener firing
/// while a caller is also reconnecting cannot race to create duplicate
/// connections. Disposal sets a guard flag checked by the supervisor so a
/// late loss signal cannot resurrect a disposed manager.
pub struct ConnectionManager {
    settings: AmqpSettings,
    connection: RwLock<Option<Arc<Connection>>>,
    connect_lock: Mutex<()>,
    disposed: AtomicBool,
    lost: mpsc::UnboundedSender<()>,
}

impl ConnectionManager {
    /// Create a manager and spawn its reconnect supervisor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(settings: AmqpSettings) -> Arc<Self> {
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            settings,
            connection: RwLock::new(None),
            connect_lock: Mutex::new(()),
            disposed: AtomicBool::new(false),
            lost: lost_tx,
        });

        spawn_supervisor(Arc::downgrade(&manager), lost_rx);

        manager
    }

    /// True only if the underlying connection reports open and the manager
    /// has not been disposed.
    pub async fn is_connected(&self) -> bool {
        if self.disposed.load(Ordering::SeqCst) {
            return false;
        }
        match self.connection.read().await.as_ref() {
            Some(conn) => conn.status().connected(),
            None => false,
        }
    }

    /// Attempt to establish the connection.
    ///
    /// Idempotent: returns `true` immediately if already connected. Otherwise
    /// tries up to the configured attempt count with `2^attempt` second
    /// delays between attempts. Exhaustion logs an error and returns `false`;
    /// a later call may retry again.
    pub async fn try_connect(&self) -> bool {
        if self.disposed.load(Ordering::SeqCst) {
            return false;
        }

        let _guard = self.connect_lock.lock().await;

        if self.is_connected().await {
            return true;
        }

        let max_attempts = self.settings.max_connect_attempts.max(1);
        let mut delays = connect_delays(max_attempts);

        for attempt in 1..=max_attempts {
            match Connection::connect(&self.settings.url, ConnectionProperties::default()).await {
                Ok(conn) => {
                    let lost = self.lost.clone();
                    conn.on_error(move |e| {
                        error!(error = %e, "Broker connection errored");
                        let _ = lost.send(());
                    });

                    *self.connection.write().await = Some(Arc::new(conn));

                    info!(
                        url = %self.settings.url,
                        attempt = attempt,
                        "Connected to broker"
                    );
                    return true;
                }
                Err(e) => {
                    warn!(
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %e,
                        "Broker connection attempt failed"
                    );

                    if attempt == max_attempts {
                        break;
                    }
                    if let Some(delay) = delays.next() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        error!(
            attempts = max_attempts,
            url = %self.settings.url,
            "Could not connect to broker, giving up for this call"
        );
        false
    }

    /// Ask the live connection for a new channel.
    pub async fn create_channel(&self) -> Result<Channel> {
        let conn = {
            let guard = self.connection.read().await;
            match guard.as_ref() {
                Some(conn) if !self.disposed.load(Ordering::SeqCst) && conn.status().connected() => {
                    Arc::clone(conn)
                }
                _ => return Err(BusError::NotConnected),
            }
        };

        conn.create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
    }

    /// Close the connection and stop self-healing.
    ///
    /// Safe to call once; subsequent operations fail with `NotConnected`
    /// rather than panicking on a disposed handle.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let conn = self.connection.write().await.take();
        if let Some(conn) = conn {
            if let Err(e) = conn.close(200, "disposed").await {
                warn!(error = %e, "Error closing broker connection");
            }
        }

        info!("Broker connection manager disposed");
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// Consume loss signals and reconnect.
///
/// Holds only a weak reference so a dropped manager ends the task; the
/// disposed guard covers the explicit-dispose case.
fn spawn_supervisor(manager: Weak<ConnectionManager>, mut lost: mpsc::UnboundedReceiver<()>) {
    tokio::spawn(async move {
        while lost.recv().await.is_some() {
            let Some(manager) = manager.upgrade() else {
                break;
            };
            if manager.is_disposed() {
                break;
            }

            warn!("Broker connection lost, reconnecting");
            manager.try_connect().await;
        }
    });
}
