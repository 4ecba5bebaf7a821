//! Headless arena runner: a full simulation with scripted players,
//! useful for soak-testing the tick engine and the wire encoder
//! without a network frontend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use sim::{Config, Engine, Rect, Viewer};

const BOT_COUNT: u8 = 8;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sim=debug")),
        )
        .init();

    info!("petri v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    let tick_interval_ms = config.engine.tick_interval_ms;
    let world = Rect::new(
        0.0,
        0.0,
        config.world.half_width,
        config.world.half_height,
    );

    let mut engine = Engine::new(config);
    for id in 0..BOT_COUNT {
        engine.add_player(id);
        engine.request_spawn(id);
    }

    let state = Arc::new(RwLock::new(engine));
    let shutdown = Arc::new(AtomicBool::new(false));

    let ticker = tokio::spawn(sim::run_tick_loop(
        Arc::clone(&state),
        tick_interval_ms,
        Arc::clone(&shutdown),
    ));
    let bots = tokio::spawn(drive_bots(Arc::clone(&state), world, Arc::clone(&shutdown)));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.store(true, Ordering::Relaxed);
    ticker.await?;
    bots.await?;
    Ok(())
}

/// Steers the scripted players and pulls spectator frames, the same
/// traffic a connected client would generate.
async fn drive_bots(state: Arc<RwLock<Engine>>, world: Rect, shutdown: Arc<AtomicBool>) {
    let mut ticker = interval(Duration::from_millis(500));
    let mut spectator = Viewer::spectator(world);
    let mut since_report = 0u32;

    loop {
        ticker.tick().await;
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let mut engine = state.write().await;
        let mut rng = rand::rng();
        for id in 0..BOT_COUNT {
            if !engine.is_alive(id) {
                engine.request_spawn(id);
                continue;
            }
            let x = rng.random_range(-world.hw..world.hw);
            let y = rng.random_range(-world.hh..world.hh);
            engine.set_mouse(id, x, y);
            if rng.random_bool(0.05) {
                engine.split(id);
            }
            if rng.random_bool(0.05) {
                engine.eject(id);
            }
        }

        let frame = spectator.build_frame(&engine);
        if let Ok(decoded) = protocol::UpdateFrame::decode(frame.clone()) {
            debug!(
                "spectator frame: {} bytes, +{} ~{} x{} -{}",
                frame.len(),
                decoded.adds.len(),
                decoded.updates.len(),
                decoded.eats.len(),
                decoded.deletes.len()
            );
        }

        since_report += 1;
        if since_report >= 10 {
            since_report = 0;
            report_leaderboard(&engine);
        }
    }
}

fn report_leaderboard(engine: &Engine) {
    let board = engine.leaderboard();
    let line = board
        .iter()
        .take(5)
        .map(|(id, score)| format!("#{id}:{score:.0}"))
        .collect::<Vec<_>>()
        .join(" ");
    info!("{} cells, top: {}", engine.cell_count(), line);
}
