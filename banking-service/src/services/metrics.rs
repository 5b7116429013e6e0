//! Audit and metrics events.
//!
//! Components receive an [`EventSink`] at construction; nothing here is
//! process-global. [`PrometheusEventSink`] owns its own registry.

use crate::models::{BankingSyncStatus, ConnectionStatus, ProviderKind};
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum BankingEvent {
    LinkStarted {
        connection_id: Uuid,
        provider: ProviderKind,
    },
    ConnectionTransition {
        connection_id: Uuid,
        provider: ProviderKind,
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
    CallbackRejected {
        reason: &'static str,
    },
    SyncCompleted {
        account_id: Uuid,
        provider: ProviderKind,
        status: BankingSyncStatus,
        duration: Duration,
        inserted: i32,
        updated: i32,
    },
    SyncRejected {
        account_id: Uuid,
        reason: &'static str,
    },
    ProviderFailure {
        provider: ProviderKind,
        operation: &'static str,
        code: &'static str,
    },
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: &BankingEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn record(&self, _event: &BankingEvent) {}
}

/// Keeps events in memory for inspection.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<BankingEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BankingEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn transitions(&self) -> Vec<(ConnectionStatus, ConnectionStatus)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                BankingEvent::ConnectionTransition { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingEventSink {
    fn record(&self, event: &BankingEvent) {
        let mut events = self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        events.push(event.clone());
    }
}

/// Prometheus counters and histograms in a sink-owned registry.
#[derive(Clone)]
pub struct PrometheusEventSink {
    registry: Registry,
    links_started: CounterVec,
    transitions: CounterVec,
    callbacks_rejected: CounterVec,
    sync_cycles: CounterVec,
    sync_duration: HistogramVec,
    transactions_written: CounterVec,
    syncs_rejected: CounterVec,
    provider_failures: CounterVec,
}

impl PrometheusEventSink {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let links_started = CounterVec::new(
            Opts::new("banking_links_started_total", "OAuth link flows started"),
            &["provider"],
        )?;
        let transitions = CounterVec::new(
            Opts::new("banking_connection_transitions_total", "Connection status transitions"),
            &["provider", "from", "to"],
        )?;
        let callbacks_rejected = CounterVec::new(
            Opts::new("banking_callbacks_rejected_total", "OAuth callbacks rejected"),
            &["reason"],
        )?;
        let sync_cycles = CounterVec::new(
            Opts::new("banking_sync_cycles_total", "Account sync cycles by outcome"),
            &["provider", "status"],
        )?;
        let sync_duration = HistogramVec::new(
            HistogramOpts::new("banking_sync_duration_seconds", "Account sync duration in seconds")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["provider"],
        )?;
        let transactions_written = CounterVec::new(
            Opts::new("banking_transactions_written_total", "Transactions inserted or updated by sync"),
            &["kind"],
        )?;
        let syncs_rejected = CounterVec::new(
            Opts::new("banking_sync_rejected_total", "Sync requests refused before starting"),
            &["reason"],
        )?;
        let provider_failures = CounterVec::new(
            Opts::new("banking_provider_failures_total", "Provider call failures by class"),
            &["provider", "operation", "code"],
        )?;

        registry.register(Box::new(links_started.clone()))?;
        registry.register(Box::new(transitions.clone()))?;
        registry.register(Box::new(callbacks_rejected.clone()))?;
        registry.register(Box::new(sync_cycles.clone()))?;
        registry.register(Box::new(sync_duration.clone()))?;
        registry.register(Box::new(transactions_written.clone()))?;
        registry.register(Box::new(syncs_rejected.clone()))?;
        registry.register(Box::new(provider_failures.clone()))?;

        Ok(Self {
            registry,
            links_started,
            transitions,
            callbacks_rejected,
            sync_cycles,
            sync_duration,
            transactions_written,
            syncs_rejected,
            provider_failures,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in Prometheus text format.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl EventSink for PrometheusEventSink {
    fn record(&self, event: &BankingEvent) {
        match event {
            BankingEvent::LinkStarted { provider, .. } => {
                self.links_started.with_label_values(&[provider.as_str()]).inc();
            }
            BankingEvent::ConnectionTransition { provider, from, to, .. } => {
                self.transitions
                    .with_label_values(&[provider.as_str(), from.as_str(), to.as_str()])
                    .inc();
            }
            BankingEvent::CallbackRejected { reason } => {
                self.callbacks_rejected.with_label_values(&[*reason]).inc();
            }
            BankingEvent::SyncCompleted {
                provider,
                status,
                duration,
                inserted,
                updated,
                ..
            } => {
                self.sync_cycles
                    .with_label_values(&[provider.as_str(), status.as_str()])
                    .inc();
                self.sync_duration
                    .with_label_values(&[provider.as_str()])
                    .observe(duration.as_secs_f64());
                self.transactions_written
                    .with_label_values(&["inserted"])
                    .inc_by(f64::from(*inserted));
                self.transactions_written
                    .with_label_values(&["updated"])
                    .inc_by(f64::from(*updated));
            }
            BankingEvent::SyncRejected { reason, .. } => {
                self.syncs_rejected.with_label_values(&[*reason]).inc();
            }
            BankingEvent::ProviderFailure {
                provider,
                operation,
                code,
            } => {
                self.provider_failures
                    .with_label_values(&[provider.as_str(), *operation, *code])
                    .inc();
            }
        }
    }
}
