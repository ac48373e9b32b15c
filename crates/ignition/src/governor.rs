//! Job concurrency governor
//!
//! Caps live jobs per client identity (remote address) and globally.
//! Admission is non-blocking: a request over either cap is rejected
//! immediately so the client can retry, not queued. Tickets decrement their
//! counters on drop, which makes leaks impossible as long as the ticket is
//! kept alive for the duration of the job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum GovernorError {
    #[error("client '{0}' is at its concurrent job limit")]
    ClientSaturated(String),

    #[error("engine is at its global concurrent job limit")]
    Saturated,
}

#[derive(Debug, Default)]
struct Counts {
    total: usize,
    per_client: HashMap<String, usize>,
}

#[derive(Debug)]
struct Inner {
    per_client_cap: usize,
    global_cap: usize,
    counts: Mutex<Counts>,
}

/// Keyed concurrency limiter
#[derive(Debug, Clone)]
pub struct Governor {
    inner: Arc<Inner>,
}

impl Governor {
    pub fn new(per_client_cap: usize, global_cap: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                per_client_cap,
                global_cap,
                counts: Mutex::new(Counts::default()),
            }),
        }
    }

    /// Try to admit a job for `client`. Never blocks.
    pub fn try_enter(&self, client: &str) -> Result<Ticket, GovernorError> {
        let mut counts = self
            .inner
            .counts
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        if counts.total >= self.inner.global_cap {
            return Err(GovernorError::Saturated);
        }
        let per_client = counts.per_client.entry(client.to_owned()).or_insert(0);
        if *per_client >= self.inner.per_client_cap {
            return Err(GovernorError::ClientSaturated(client.to_owned()));
        }

        *per_client += 1;
        counts.total += 1;
        debug!(client, live = counts.total, "job admitted");

        Ok(Ticket {
            client: client.to_owned(),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Current number of live jobs
    pub fn live(&self) -> usize {
        self.inner
            .counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .total
    }
}

/// Proof of admission; dropping it frees the job's concurrency budget
#[derive(Debug)]
pub struct Ticket {
    client: String,
    inner: Arc<Inner>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut counts = self
            .inner
            .counts
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        counts.total = counts.total.saturating_sub(1);
        if let Some(count) = counts.per_client.get_mut(&self.client) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.per_client.remove(&self.client);
            }
        }
    }
}
