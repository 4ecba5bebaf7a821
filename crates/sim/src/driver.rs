//! Fixed-timestep tick loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::engine::Engine;

/// Drives the engine at a fixed timestep until `shutdown` is set.
///
/// Missed ticks are skipped rather than burst: the world advances by
/// one interval per executed tick, so a stalled host slows the game
/// down instead of teleporting everything forward.
pub async fn run_tick_loop(
    state: Arc<RwLock<Engine>>,
    tick_interval_ms: u64,
    shutdown: Arc<AtomicBool>,
) {
    let period = Duration::from_millis(tick_interval_ms);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let dt = tick_interval_ms as f32;
    let budget_ms = tick_interval_ms as f64 * 0.9;
    let mut tick_count: u64 = 0;

    loop {
        ticker.tick().await;
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let mut engine = state.write().await;
        let started = std::time::Instant::now();
        let stats = engine.tick(dt);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        drop(engine);

        tick_count += 1;
        if elapsed_ms > budget_ms {
            warn!(
                "slow tick #{}: {:.3}ms (budget {:.1}ms), {} cells, {} collisions",
                tick_count, elapsed_ms, budget_ms, stats.cells, stats.collisions
            );
        }
    }

    info!("tick loop stopped after {} ticks", tick_count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn quiet_config() -> Config {
        let mut config = Config::default();
        config.engine.threads = 1;
        config.pellet.count = 10;
        config.virus.count = 0;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn loop_ticks_and_stops() {
        let state = Arc::new(RwLock::new(Engine::new(quiet_config())));
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(run_tick_loop(
            Arc::clone(&state),
            50,
            Arc::clone(&shutdown),
        ));

        // Paused time auto-advances whenever the runtime is idle, so a
        // short real yield lets several intervals fire.
        tokio::time::sleep(Duration::from_millis(260)).await;
        shutdown.store(true, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.await.expect("loop task should join");

        let engine = state.read().await;
        assert_eq!(engine.cell_count(), 10);
    }
}
