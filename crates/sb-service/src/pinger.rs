//! The healthcheck coordinator role.
//!
//! Any service worker may run the coordinator loop: broadcast a `ping`,
//! collect `pong` replies for `ping_timeout`, then broadcast the
//! authoritative `ping-result` map.  Every service (the coordinator
//! included) answers pings and learns its peers exclusively from the
//! result broadcasts.

use sb_proto::envelope::{listener_id, Body, WorkerCounters, HEALTHCHECK_CHANNEL};
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::service::Service;

/// The in-flight collection state of one ping round.
pub(crate) struct PingRound {
    pub(crate) ping_id: String,
    pub(crate) pings: HashMap<String, WorkerCounters>,
}

impl Service {
    /// Spawn the coordinator loop on this worker.
    ///
    /// One round per `ping_delay`: publish `ping`, collect pongs for
    /// `ping_timeout`, broadcast `ping-result`.
    pub fn spawn_ping_coordinator(&self) -> JoinHandle<()> {
        let service = self.clone();
        info!(listener = %service.listener_id(), "running healthcheck coordinator");
        tokio::spawn(async move {
            loop {
                let ping_id = Uuid::new_v4().simple().to_string();
                *service.inner.ping_round.lock().expect("ping round lock") = Some(PingRound {
                    ping_id: ping_id.clone(),
                    pings: HashMap::new(),
                });

                if let Err(err) = service
                    .publish_envelope(HEALTHCHECK_CHANNEL, Body::Ping { ping_id })
                    .await
                {
                    warn!(error = %err, "failed to broadcast ping");
                }

                sleep(service.inner.infra.ping_timeout).await;

                let round = service
                    .inner
                    .ping_round
                    .lock()
                    .expect("ping round lock")
                    .take();
                if let Some(round) = round {
                    debug!(answered = round.pings.len(), "ping round complete");
                    let result = Body::PingResult { pings: round.pings };
                    if let Err(err) = service.publish_envelope(HEALTHCHECK_CHANNEL, result).await {
                        warn!(error = %err, "failed to broadcast ping-result");
                    }
                }

                sleep(
                    service
                        .inner
                        .infra
                        .ping_delay
                        .saturating_sub(service.inner.infra.ping_timeout),
                )
                .await;
            }
        })
    }

    /// Record a pong for the active round; stale ping ids are discarded.
    pub(crate) fn record_pong(
        &self,
        source: &str,
        worker: u32,
        ping_id: &str,
        counters: WorkerCounters,
    ) {
        let mut round = self.inner.ping_round.lock().expect("ping round lock");
        match round.as_mut() {
            Some(round) if round.ping_id == ping_id => {
                round.pings.insert(listener_id(source, worker), counters);
            }
            _ => debug!(source, worker, "pong for a stale ping round"),
        }
    }
}
