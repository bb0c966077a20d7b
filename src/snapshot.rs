//! The last good reading of every setpoint, and the refresh cycle that produces it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, warn};

use crate::catalog::{self, Catalog};
use crate::connection::{self, RegisterReader};
use crate::decode::{self, CLOCK_REGISTERS, ClockReading, DecodedValue};
use crate::profile::ClockBlock;
use crate::ranges::{self, RegisterRange};

#[derive(thiserror::Error, Debug)]
pub enum RefreshError {
    #[error("reading registers {range} failed")]
    Transport {
        range: String,
        #[source]
        source: connection::Error,
    },
    #[error("could not decode setpoint `{name}`")]
    Decode {
        name: String,
        #[source]
        source: decode::Error,
    },
    #[error("reading the clock block failed")]
    ClockRead(#[source] connection::Error),
    #[error("could not decode the clock block")]
    ClockDecode(#[source] decode::Error),
    #[error("register range refers to an unknown setpoint")]
    Catalog(#[from] catalog::LookupError),
}

/// Refresh outcomes are shared between all the callers that waited on the same cycle.
pub type SharedRefreshError = Arc<RefreshError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("setpoint `{0}` is not in the catalog")]
    Unknown(String),
    #[error("no snapshot has been taken yet")]
    NotPopulated,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct Snapshot {
    pub values: BTreeMap<String, DecodedValue>,
    pub clock: Option<ClockReading>,
    pub refreshed_at: jiff::Timestamp,
}

type Outcome = Result<Arc<Snapshot>, SharedRefreshError>;

pub struct SnapshotStore<R> {
    reader: R,
    catalog: Catalog,
    ranges: Vec<RegisterRange>,
    clock: Option<ClockBlock>,
    /// Held for the duration of a refresh cycle; contains the outcome of the latest one.
    cycle: Mutex<Option<Outcome>>,
    /// Number of refresh cycles that have finished.
    completed: AtomicU64,
    current: watch::Sender<Option<Arc<Snapshot>>>,
}

impl<R: RegisterReader> SnapshotStore<R> {
    pub fn new(reader: R, catalog: Catalog, clock: Option<ClockBlock>) -> Self {
        let ranges = ranges::coalesce(catalog.iter());
        debug!(message = "coalesced registers", setpoints = catalog.len(), ranges = ranges.len());
        Self {
            reader,
            catalog,
            ranges,
            clock,
            cycle: Mutex::new(None),
            completed: AtomicU64::new(0),
            current: watch::channel(None).0,
        }
    }

    #[cfg(test)]
    pub(crate) fn reader(&self) -> &R {
        &self.reader
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn ranges(&self) -> &[RegisterRange] {
        &self.ranges
    }

    /// Read every register range and the clock, then replace the current snapshot.
    ///
    /// Nothing is committed unless all of the reads and decodes succeed. If another refresh is
    /// already in progress, this waits for it and returns its outcome instead of reading the
    /// device again.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>, SharedRefreshError> {
        let seen = self.completed.load(Ordering::Acquire);
        let mut last = self.cycle.lock().await;
        if self.completed.load(Ordering::Acquire) != seen {
            if let Some(outcome) = &*last {
                debug!(message = "reusing the outcome of a concurrent refresh");
                return outcome.clone();
            }
        }
        let outcome: Outcome = self.read_cycle().await.map(Arc::new).map_err(Arc::new);
        match &outcome {
            Ok(snapshot) => {
                debug!(message = "refreshed", values = snapshot.values.len());
                self.current.send_replace(Some(Arc::clone(snapshot)));
            }
            Err(e) => {
                warn!(
                    message = "refresh failed, keeping the previous snapshot",
                    error = (&**e as &dyn std::error::Error)
                );
            }
        }
        *last = Some(outcome.clone());
        self.completed.fetch_add(1, Ordering::Release);
        outcome
    }

    async fn read_cycle(&self) -> Result<Snapshot, RefreshError> {
        let mut values = BTreeMap::new();
        for range in &self.ranges {
            let transport = |source| RefreshError::Transport { range: range.to_string(), source };
            let words = self
                .reader
                .read_registers(range.start(), range.count(), range.access())
                .await
                .map_err(transport)?;
            if words.len() != usize::from(range.count()) {
                return Err(transport(connection::Error::ResponseLength {
                    expected: range.count(),
                    actual: words.len(),
                }));
            }
            for (name, raw) in range.names().iter().zip(words) {
                let spec = self.catalog.get(name)?;
                let value = decode::decode(&spec.kind, raw)
                    .map_err(|source| RefreshError::Decode { name: name.clone(), source })?;
                values.insert(name.clone(), value);
            }
        }
        let clock = match self.clock {
            None => None,
            Some(block) => {
                let words = self
                    .reader
                    .read_registers(block.address, CLOCK_REGISTERS, block.access)
                    .await
                    .map_err(RefreshError::ClockRead)?;
                if words.len() != usize::from(CLOCK_REGISTERS) {
                    return Err(RefreshError::ClockRead(connection::Error::ResponseLength {
                        expected: CLOCK_REGISTERS,
                        actual: words.len(),
                    }));
                }
                Some(ClockReading::decode(&words).map_err(RefreshError::ClockDecode)?)
            }
        };
        Ok(Snapshot { values, clock, refreshed_at: jiff::Timestamp::now() })
    }

    /// The last committed snapshot. Never touches the device.
    pub fn get(&self) -> Option<Arc<Snapshot>> {
        self.current.borrow().clone()
    }

    pub fn lookup(&self, name: &str) -> Result<DecodedValue, LookupError> {
        if !self.catalog.contains(name) {
            return Err(LookupError::Unknown(name.to_string()));
        }
        let snapshot = self.get().ok_or(LookupError::NotPopulated)?;
        snapshot.values.get(name).cloned().ok_or(LookupError::NotPopulated)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.current.subscribe()
    }
}

impl<R: RegisterReader + 'static> SnapshotStore<R> {
    /// Refresh the store every `period` until the returned handle is dropped.
    pub fn spawn_poller(self: &Arc<Self>, period: Duration) -> AbortOnDropHandle<()> {
        let store = Arc::clone(self);
        AbortOnDropHandle::new(tokio::task::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                // Failures are logged by `refresh` and the previous snapshot stays in place.
                let _ = store.refresh().await;
            }
        }))
    }
}
