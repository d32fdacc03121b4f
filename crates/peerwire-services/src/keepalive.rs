//! Keep-alive pings for initialized sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use peerwire_core::wire::Packet;

use crate::transport::OutboundGate;

/// Enable keep-alive on the gate and spawn a task that pings every `period`.
///
/// The task stops on its own once the gate disables keep-alive. Returns
/// `None` outside a tokio runtime.
pub fn spawn(gate: Arc<OutboundGate>, ping: Packet, period: Duration) -> Option<JoinHandle<()>> {
    let handle = tokio::runtime::Handle::try_current().ok()?;
    gate.set_keep_alive(true);

    Some(handle.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately.
        interval.tick().await;

        loop {
            interval.tick().await;
            if !gate.send_keep_alive(ping.clone()) {
                break;
            }
        }
    }))
}
