/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::decode::{decode_datagram, DecodeError};
use crate::events::ConntrackEvent;
use crate::metrics::Metrics;
use crate::netutils::{parse_node_ip, Cidr, ExternalGate};
use crate::plugin::Plugin;
use crate::store::ConnectionStore;
use crate::subscriber::{ConntrackSource, NetlinkSubscriber, Subscribe};
use crate::{Error, Result};

pub const PLUGIN_NAME: &str = "conntrack";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MonitorState {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
}

/// Builds connection accounting from kernel conntrack notifications.
pub struct ConntrackMonitor<S: Subscribe = NetlinkSubscriber> {
    config: Config,
    subscriber: S,
    metrics: Metrics,
    store: Arc<ConnectionStore>,
    gate: Option<ExternalGate>,
    state: MonitorState,
    tasks: JoinSet<()>,
}

impl ConntrackMonitor<NetlinkSubscriber> {
    pub fn new(config: Config, metrics: Metrics) -> Self {
        ConntrackMonitor::with_subscriber(config, metrics, NetlinkSubscriber)
    }
}

impl<S: Subscribe> ConntrackMonitor<S> {
    pub fn with_subscriber(config: Config, metrics: Metrics, subscriber: S) -> Self {
        ConntrackMonitor {
            config,
            subscriber,
            store: Arc::new(ConnectionStore::new(metrics.clone())),
            metrics,
            gate: None,
            state: MonitorState::Uninitialized,
            tasks: JoinSet::new(),
        }
    }

    pub fn store(&self) -> Arc<ConnectionStore> {
        self.store.clone()
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }
}

fn required_cidr(name: &str, value: Option<&str>) -> Result<Cidr> {
    value
        .ok_or_else(|| Error::InvalidConfigError(format!("{} is not set", name)))?
        .parse()
}

#[async_trait]
impl<S: Subscribe + 'static> Plugin for ConntrackMonitor<S> {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn init(&mut self) -> Result<()> {
        let pod_cidr = required_cidr("pod cidr", self.config.pod_cidr.as_deref())?;
        let service_cidr = required_cidr("service cidr", self.config.service_cidr.as_deref())?;
        let node_ip = parse_node_ip(self.config.node_ip.as_deref())?;

        if self.config.metrics_interval.is_zero() {
            return Err(Error::InvalidConfigError(
                "metrics interval must be positive".to_string(),
            ));
        }
        if self.config.decode_workers == 0 || self.config.event_queue_capacity == 0 {
            return Err(Error::InvalidConfigError(
                "decode workers and event queue capacity must be positive".to_string(),
            ));
        }

        self.gate = Some(ExternalGate::new(pod_cidr, service_cidr, node_ip));
        self.state = MonitorState::Initialized;
        info!(%pod_cidr, %service_cidr, %node_ip, "initialized conntrack monitor");
        Ok(())
    }

    async fn start(&mut self, cancel: CancellationToken) -> Result<()> {
        let gate = self.gate.ok_or(Error::NotInitializedError(PLUGIN_NAME))?;
        let source = self.subscriber.subscribe().map_err(Error::SubscribeError)?;
        info!("subscribed to conntrack events");
        self.state = MonitorState::Running;

        let capacity = self.config.event_queue_capacity;
        let (raw_tx, raw_rx) = mpsc::channel::<Vec<u8>>(capacity);
        let (event_tx, event_rx) = mpsc::channel::<ConntrackEvent>(capacity);
        let (error_tx, error_rx) = mpsc::channel::<DecodeError>(capacity);
        let (lost_tx, lost_rx) = oneshot::channel();
        let token = cancel.child_token();

        self.tasks.spawn(read_datagrams(
            source,
            raw_tx,
            lost_tx,
            self.metrics.clone(),
            token.clone(),
        ));

        let raw_rx = Arc::new(Mutex::new(raw_rx));
        for worker in 0..self.config.decode_workers {
            self.tasks.spawn(decode_datagrams(
                worker,
                raw_rx.clone(),
                event_tx.clone(),
                error_tx.clone(),
                self.metrics.clone(),
                token.clone(),
            ));
        }
        drop(event_tx);
        drop(error_tx);

        self.tasks.spawn(dispatch_events(
            event_rx,
            self.store.clone(),
            gate,
            token.clone(),
        ));
        self.tasks.spawn(log_decode_errors(error_rx, token.clone()));
        self.tasks.spawn(flush_periodically(
            self.store.clone(),
            self.config.metrics_interval,
            token.clone(),
        ));

        let lost = tokio::select! {
            _ = cancel.cancelled() => None,
            Ok(err) = lost_rx => Some(err),
        };
        token.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                error!(%err, "conntrack monitor task failed");
            }
        }

        self.state = MonitorState::Stopped;
        info!("conntrack monitor stopped");
        match lost {
            Some(err) => Err(Error::SubscriptionLostError(err)),
            None => Ok(()),
        }
    }

    async fn stop(&mut self) -> Result<()> {
        // Aborting the reader drops the subscription and closes the socket.
        self.tasks.shutdown().await;
        if self.state == MonitorState::Running {
            self.state = MonitorState::Stopped;
        }
        Ok(())
    }
}

/// Applies one event to the accounting store.
///
/// New and destroy events are only accounted for external destinations.
/// Expectations and unknown messages are ignored.
pub fn dispatch(store: &ConnectionStore, gate: &ExternalGate, event: ConntrackEvent) {
    match event {
        ConntrackEvent::New(conn) => {
            if gate.is_external(&conn.flow.dst_addr) {
                store.record_new(&conn.flow, conn.tcp_state);
            }
        }
        ConntrackEvent::Destroy(conn) => {
            if gate.is_external(&conn.flow.dst_addr) {
                store.record_destroy(&conn.flow, conn.tcp_state);
            }
        }
        ConntrackEvent::Update(conn) => store.record_update(&conn.flow, conn.tcp_state),
        ConntrackEvent::ExpectNew | ConntrackEvent::ExpectDestroy | ConntrackEvent::Unknown(_) => {}
    }
}

async fn read_datagrams<T: ConntrackSource>(
    mut source: T,
    raw_tx: Sender<Vec<u8>>,
    lost_tx: oneshot::Sender<std::io::Error>,
    metrics: Metrics,
    token: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = token.cancelled() => break,
            received = source.recv() => received,
        };

        match received {
            Ok(datagram) => match raw_tx.try_send(datagram) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    metrics.events_dropped.inc();
                    debug!("decode queue full, dropping conntrack datagram");
                }
                Err(TrySendError::Closed(_)) => break,
            },
            Err(err) if err.raw_os_error() == Some(libc::ENOBUFS) => {
                warn!("conntrack socket overrun, kernel dropped events");
            }
            Err(err) => {
                error!(%err, "conntrack subscription failed, monitor stopping");
                let _ = lost_tx.send(err);
                break;
            }
        }
    }
    info!("closing conntrack subscription");
}

async fn decode_datagrams(
    worker: usize,
    raw_rx: Arc<Mutex<Receiver<Vec<u8>>>>,
    event_tx: Sender<ConntrackEvent>,
    error_tx: Sender<DecodeError>,
    metrics: Metrics,
    token: CancellationToken,
) {
    loop {
        let datagram = {
            let mut raw_rx = raw_rx.lock().await;
            tokio::select! {
                _ = token.cancelled() => return,
                datagram = raw_rx.recv() => datagram,
            }
        };
        let Some(datagram) = datagram else {
            return;
        };

        for decoded in decode_datagram(&datagram) {
            match decoded {
                Ok(event) => match event_tx.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        metrics.events_dropped.inc();
                        debug!(worker, "event queue full, dropping conntrack event");
                    }
                    Err(TrySendError::Closed(_)) => return,
                },
                Err(err) => {
                    metrics.decode_errors.inc();
                    if error_tx.try_send(err).is_err() {
                        debug!(worker, "decode error queue full");
                    }
                }
            }
        }
    }
}

async fn dispatch_events(
    mut event_rx: Receiver<ConntrackEvent>,
    store: Arc<ConnectionStore>,
    gate: ExternalGate,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return,
            event = event_rx.recv() => event,
        };
        match event {
            Some(event) => dispatch(&store, &gate, event),
            None => return,
        }
    }
}

async fn log_decode_errors(mut error_rx: Receiver<DecodeError>, token: CancellationToken) {
    loop {
        let err = tokio::select! {
            _ = token.cancelled() => return,
            err = error_rx.recv() => err,
        };
        match err {
            Some(err) => warn!(%err, "failed to decode conntrack message"),
            None => return,
        }
    }
}

async fn flush_periodically(store: Arc<ConnectionStore>, period: Duration, token: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; there is nothing to flush yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => store.flush_and_reset(),
        }
    }
}
