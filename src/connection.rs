// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! Owns the current connection/channel pair and is the single place where it gets
//! replaced. Every dial produces a new *generation*; callers that saw a broken
//! channel hand the generation they observed to [`ConnectionManager::reconnect`],
//! which lets concurrent callers share one reconnect instead of racing each other.
//!
//! Publishing and topology declaration run under a read guard of the session, so a
//! reconnect (write guard) never tears a channel down while it is in use.

use crate::{
    broker::{BrokerChannel, BrokerConnection, ConnectionPair, DialOptions, Dialer},
    errors::AmqpError,
    metadata::PubSubMetadata,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The current connection/channel pair and the generation it belongs to.
#[derive(Default)]
pub struct Session {
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
    generation: u64,
}

impl Session {
    pub fn channel(&self) -> Result<&Arc<dyn BrokerChannel>, AmqpError> {
        self.channel
            .as_ref()
            .ok_or_else(|| AmqpError::ChannelError("no open channel".to_owned()))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn install(&mut self, (connection, channel): ConnectionPair) {
        self.connection = Some(connection);
        self.channel = Some(channel);
        self.generation += 1;
    }

    /// Closes the channel, then the connection. Both closes are attempted even if
    /// the broker already dropped them.
    async fn release(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(err) = channel.close().await {
                debug!(error = err.to_string(), "error closing channel");
            }
        }

        if let Some(connection) = self.connection.take() {
            if let Err(err) = connection.close().await {
                debug!(error = err.to_string(), "error closing connection");
            }
        }
    }
}

pub struct ConnectionManager {
    dialer: Arc<dyn Dialer>,
    opts: DialOptions,
    reconnect_wait: Duration,
    max_retries: u32,
    publisher_confirm: bool,
    session: RwLock<Session>,
    /// Holds the error of the last failed reconnect, cleared on success.
    reconnect_lock: Mutex<Option<AmqpError>>,
    /// Number of reconnects that gave up.
    failures: AtomicU64,
    closed: AtomicBool,
    shutdown: CancellationToken,
    attempts: AtomicU64,
}

impl ConnectionManager {
    /// Creates a manager that dials through `dialer`. Nothing is dialed until
    /// [`ConnectionManager::open`].
    ///
    /// # Parameters
    /// * `dialer` - Opens connection/channel pairs
    /// * `metadata` - Component metadata providing the dial options and the
    ///   reconnect wait, retries and publisher confirm settings
    pub fn new(dialer: Arc<dyn Dialer>, metadata: &PubSubMetadata) -> ConnectionManager {
        ConnectionManager {
            dialer,
            opts: metadata.dial_options(),
            reconnect_wait: metadata.reconnect_wait,
            max_retries: metadata.reconnect_max_retries,
            publisher_confirm: metadata.publisher_confirm,
            session: RwLock::new(Session::default()),
            reconnect_lock: Mutex::new(None),
            failures: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            attempts: AtomicU64::new(0),
        }
    }

    /// Dials the broker once and returns a fresh pair. Callers must discard any pair
    /// they held before.
    pub async fn connect(&self) -> Result<ConnectionPair, AmqpError> {
        let (connection, channel) = self.dialer.dial(&self.opts).await?;

        if self.publisher_confirm {
            if let Err(err) = channel.confirm_select().await {
                let _ = channel.close().await;
                let _ = connection.close().await;
                return Err(err);
            }
        }

        Ok((connection, channel))
    }

    /// Initial dial, performed once by `init`.
    pub async fn open(&self) -> Result<(), AmqpError> {
        let pair = self.connect().await?;
        let mut session = self.session.write().await;
        session.install(pair);
        info!(generation = session.generation, "connected to rabbitmq");
        Ok(())
    }

    /// Read access to the current session. Hold it only for the duration of one
    /// broker operation.
    pub async fn session(&self) -> RwLockReadGuard<'_, Session> {
        self.session.read().await
    }

    /// Replaces the pair of generation `observed` with a new one.
    ///
    /// Callers queued behind an in-flight reconnect for the same `observed`
    /// generation get that attempt's result without dialing again. Fails
    /// immediately once the manager is closed, and with a connection error after
    /// `1 + max_retries` failed dials.
    ///
    /// # Parameters
    /// * `observed` - Generation of the pair the caller found broken
    ///
    /// # Returns
    /// The generation of the replacement pair
    pub async fn reconnect(&self, observed: u64) -> Result<u64, AmqpError> {
        let failures = self.failures.load(Ordering::SeqCst);
        let mut last_failure = self.reconnect_lock.lock().await;

        if self.is_closed() {
            debug!("reconnect requested after close");
            return Err(AmqpError::ClosedError);
        }

        {
            let session = self.session.read().await;
            if session.generation != observed && session.channel.is_some() {
                debug!(
                    generation = session.generation,
                    "connection already replaced by another task"
                );
                return Ok(session.generation);
            }

            if self.failures.load(Ordering::SeqCst) != failures {
                if let Some(err) = last_failure.as_ref() {
                    debug!(
                        generation = session.generation,
                        "reconnect already failed for this generation"
                    );
                    return Err(err.clone());
                }
            }
        }

        let mut session = self.session.write().await;
        session.release().await;

        let mut last_err = AmqpError::ConnectionError("no dial attempted".to_owned());

        for attempt in 0..=self.max_retries {
            self.attempts.fetch_add(1, Ordering::SeqCst);

            if !self.reconnect_wait.is_zero() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(AmqpError::ClosedError),
                    _ = tokio::time::sleep(self.reconnect_wait) => {}
                }
            }

            if self.is_closed() {
                return Err(AmqpError::ClosedError);
            }

            match self.connect().await {
                Ok(pair) => {
                    *last_failure = None;
                    session.install(pair);
                    info!(generation = session.generation, "reconnected to rabbitmq");
                    return Ok(session.generation);
                }
                Err(err) => {
                    warn!(error = err.to_string(), attempt, "reconnect attempt failed");
                    last_err = err;
                }
            }
        }

        error!(
            error = last_err.to_string(),
            retries = self.max_retries,
            "giving up reconnecting to rabbitmq"
        );

        let err = match last_err {
            AmqpError::ConnectionError(msg) => AmqpError::ConnectionError(msg),
            other => AmqpError::ConnectionError(other.to_string()),
        };
        *last_failure = Some(err.clone());
        self.failures.fetch_add(1, Ordering::SeqCst);

        Err(err)
    }

    /// Closes the channel and the connection and disables any further reconnect.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown.cancel();

        let mut session = self.session.write().await;
        session.release().await;
        info!("rabbitmq connection closed");

        Ok(())
    }

    /// Whether [`ConnectionManager::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Health check of the current connection.
    pub async fn is_connected(&self) -> bool {
        let session = self.session.read().await;
        session
            .connection
            .as_ref()
            .map(|c| c.is_open())
            .unwrap_or(false)
    }

    /// Cancelled when the manager is closed.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of dials performed by reconnects.
    pub fn reconnect_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}
