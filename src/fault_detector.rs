// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Fault Detector
//!
//! Periodically reaps sessions that have gone silent for longer than the
//! heartbeat timeout. This is the only path that reclaims connections whose
//! transport died without a close frame.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::router::MessageRouter;

pub struct FaultDetector {
    router: Arc<MessageRouter>,
    interval: Duration,
    timeout: Duration,
}

impl FaultDetector {
    pub fn new(router: Arc<MessageRouter>, interval: Duration, timeout: Duration) -> Self {
        FaultDetector {
            router,
            interval,
            timeout,
        }
    }

    /// Disconnects every stale session. Returns how many were reaped.
    ///
    /// Runs the same cleanup as a clean close. A session that a worker
    /// already tore down (or that reconnected) is skipped, so a connection
    /// is never cleaned twice.
    pub fn sweep(&self) -> usize {
        let mut reaped = 0;
        for (username, connection) in self.router.sessions().stale(self.timeout) {
            if self.router.disconnect(&username, connection) {
                info!(
                    "{} timed out after {}s without a heartbeat",
                    username,
                    self.timeout.as_secs()
                );
                self.router.metrics().heartbeat_timeouts.inc();
                reaped += 1;
            }
        }
        reaped
    }

    /// Sweeps forever at the configured interval.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.sweep();
        }
    }
}
