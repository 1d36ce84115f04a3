//! Backpressure flag between the sink writer and the channel reader
//!
//! The controller side is held by whoever can tell the sink is unhealthy; the
//! signal side is cloned into the reader, which checks it before every poll.

use tokio::sync::watch;

/// Create a released controller/signal pair
pub fn channel() -> (BackpressureController, BackpressureSignal) {
    let (tx, rx) = watch::channel(false);
    (BackpressureController { tx }, BackpressureSignal { rx })
}

#[derive(Debug, Clone)]
pub struct BackpressureController {
    tx: watch::Sender<bool>,
}

impl BackpressureController {
    /// Returns true if this call changed the state
    pub fn engage(&self) -> bool {
        let changed = self.tx.send_if_modified(|engaged| !std::mem::replace(engaged, true));
        if changed {
            log::warn!("🛑 Backpressure ENGAGED (sink unavailable, pausing intake)");
        }
        changed
    }

    /// Returns true if this call changed the state
    pub fn release(&self) -> bool {
        let changed = self.tx.send_if_modified(|engaged| std::mem::replace(engaged, false));
        if changed {
            log::info!("✅ Backpressure released (sink recovered, resuming intake)");
        }
        changed
    }

    pub fn is_engaged(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> BackpressureSignal {
        BackpressureSignal { rx: self.tx.subscribe() }
    }
}

#[derive(Debug, Clone)]
pub struct BackpressureSignal {
    rx: watch::Receiver<bool>,
}

impl BackpressureSignal {
    pub fn is_engaged(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until released; returns immediately when not engaged
    ///
    /// Also returns if the controller is dropped, so a dead sink cannot wedge
    /// the reader forever.
    pub async fn wait_released(&mut self) {
        let _ = self.rx.wait_for(|engaged| !*engaged).await;
    }
}
