use std::time::Duration;

use tokio::task::JoinHandle;

use super::Registry;

/// Periodically sweeps `registry` for connections that have been idle
/// longer than `idle_timeout`, closing their upstream and forgetting
/// them. Runs until the returned handle is aborted.
pub(super) fn spawn(registry: Registry, idle_timeout: Duration) -> JoinHandle<()> {
    let tick = (idle_timeout / 2).max(Duration::from_millis(50));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reaped = registry.sweep_idle(idle_timeout);
            if reaped > 0 {
                log::debug!(target: "enhttp::server::reaper", "reaped {reaped} idle connection(s)");
            }
        }
    })
}
