//! Config-channel health watchdog
//!
//! Counts consecutive configd failures. After the limit the watchdog
//! publishes a SysError on the bus and asks MCP to crash configd so it
//! restarts with diagnostics.

use crate::bus::BusClient;
use crate::events::{topics, EventSysError};
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Consecutive failures before the watchdog trips
const FAILURE_LIMIT: u32 = 5;

/// Shared failure counter for one daemon's config channel
#[derive(Clone)]
pub struct CfgWatchdog {
    sender_name: String,
    consecutive: Arc<AtomicU32>,
    bus: BusClient,
    /// Receives the daemon name MCP should crash
    crash_tx: mpsc::UnboundedSender<String>,
}

impl CfgWatchdog {
    pub fn new(
        sender_name: &str,
        bus: BusClient,
        crash_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            sender_name: sender_name.to_string(),
            consecutive: Arc::new(AtomicU32::new(0)),
            bus,
            crash_tx,
        }
    }

    /// A config call succeeded; reset the streak
    pub fn record_ok(&self) {
        self.consecutive.store(0, Ordering::Relaxed);
    }

    /// A config call failed; trip after the limit
    pub fn record_error(&self, context: &str) {
        let streak = self.consecutive.fetch_add(1, Ordering::Relaxed) + 1;
        warn!("configd error #{}: {}", streak, context);

        if streak == FAILURE_LIMIT {
            error!("configd failed {} consecutive times, requesting crash", streak);
            let event = EventSysError {
                timestamp: Utc::now(),
                sender: self.sender_name.clone(),
                reason: "CONFIG_CHANNEL_DOWN".to_string(),
                message: format!("{} consecutive configd failures: {}", streak, context),
            };
            if let Err(e) = self.bus.publish(topics::ERROR, &event) {
                warn!("Failed to publish SysError: {}", e);
            }
            if self.crash_tx.send("configd".to_string()).is_err() {
                warn!("Crash channel closed; configd crash request dropped");
            }
        }
    }

    /// Current streak, for tests and metrics
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Broker;

    #[tokio::test]
    async fn test_trips_once_at_limit() {
        let broker = Broker::bind("127.0.0.1:0").await.unwrap();
        let addr = broker.local_addr().unwrap().to_string();
        tokio::spawn(broker.run());

        let bus = BusClient::connect(&addr, "test").await.unwrap();
        let (crash_tx, mut crash_rx) = mpsc::unbounded_channel();
        let watchdog = CfgWatchdog::new("test", bus, crash_tx);

        for _ in 0..4 {
            watchdog.record_error("timeout");
        }
        assert!(crash_rx.try_recv().is_err());

        watchdog.record_error("timeout");
        assert_eq!(crash_rx.try_recv().unwrap(), "configd");

        // Further errors past the limit do not re-trip
        watchdog.record_error("timeout");
        assert!(crash_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_success_resets_streak() {
        let broker = Broker::bind("127.0.0.1:0").await.unwrap();
        let addr = broker.local_addr().unwrap().to_string();
        tokio::spawn(broker.run());

        let bus = BusClient::connect(&addr, "test").await.unwrap();
        let (crash_tx, mut crash_rx) = mpsc::unbounded_channel();
        let watchdog = CfgWatchdog::new("test", bus, crash_tx);

        for _ in 0..4 {
            watchdog.record_error("timeout");
        }
        watchdog.record_ok();
        assert_eq!(watchdog.consecutive_errors(), 0);

        watchdog.record_error("timeout");
        assert!(crash_rx.try_recv().is_err());
    }
}
