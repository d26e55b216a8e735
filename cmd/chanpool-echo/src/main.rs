//! Channel pool echo server
//!
//! Every byte a client sends is written back on the same channel. When a
//! channel's outbound side backs up, reading from it pauses until it
//! drains (`WritableAgain`), so a slow reader cannot grow memory.
//!
//! Usage:
//!     cargo build --release -p chanpool-echo
//!     ./target/release/chanpool-echo [port] [max_conns]
//!
//! Pool settings come from `CHANPOOL_*` environment variables; log level
//! from `RUST_LOG` (default `info`).
//!
//! Test with:
//!     echo "hello" | nc localhost 9999

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use chanpool::{
    ChannelEvent, ChannelEventKind, ChannelPool, ClockId, DataEvent, Handler, ListenOptions,
    PoolConfig, PoolError, PoolEvent,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

static RUNNING: AtomicBool = AtomicBool::new(true);

const STATS_CLOCK: ClockId = ClockId(1);
const STATS_PERIOD: Duration = Duration::from_secs(5);

struct Echo {
    pool: OnceLock<Weak<ChannelPool>>,
}

impl Echo {
    fn pool(&self) -> Option<Arc<ChannelPool>> {
        self.pool.get().and_then(Weak::upgrade)
    }
}

impl Handler for Echo {
    fn channel_state(&self, event: &ChannelEvent) {
        match event.kind {
            ChannelEventKind::Up => debug!(channel = %event.channel_id, "client connected"),
            ChannelEventKind::Down { reason, discarded } => {
                debug!(channel = %event.channel_id, ?reason, discarded, "client gone")
            }
            ChannelEventKind::WritableAgain => {
                if let Some(pool) = self.pool() {
                    if let Err(e) = pool.enable_read(event.channel_id) {
                        debug!(channel = %event.channel_id, error = %e, "enable_read failed");
                    }
                }
            }
            _ => {}
        }
    }

    fn data(&self, event: DataEvent<'_>) -> usize {
        let pool = match self.pool() {
            Some(pool) => pool,
            None => return 0,
        };
        let bytes = event.data.to_vec();
        match pool.write(event.channel_id, &bytes) {
            Ok(()) => bytes.len(),
            Err(PoolError::Backpressure(id)) => {
                // Keep the bytes buffered and stop reading until the
                // outbound side drains.
                if let Err(e) = pool.disable_read(id) {
                    debug!(channel = %id, error = %e, "disable_read failed");
                }
                0
            }
            Err(e) => {
                warn!(channel = %event.channel_id, error = %e, "echo write failed");
                bytes.len()
            }
        }
    }

    fn pool_state(&self, event: &PoolEvent) {
        warn!(?event, "pool event");
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);
    let max_conns: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(1024);

    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
        libc::signal(libc::SIGTERM, handle_sigint as usize);
    }

    if let Err(e) = run(port, max_conns) {
        error!(error = %e, "chanpool-echo failed");
        std::process::exit(1);
    }
}

fn run(port: u16, max_conns: usize) -> Result<(), PoolError> {
    let config = PoolConfig::from_env().max_connections(Some(max_conns));
    let handler = Arc::new(Echo {
        pool: OnceLock::new(),
    });
    let pool = Arc::new(ChannelPool::start(config, handler.clone())?);
    let _ = handler.pool.set(Arc::downgrade(&pool));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    pool.listen(addr, 1024, ListenOptions::default())?;
    info!(%addr, max_conns, managers = pool.config().num_event_managers, "listening");

    let stats_pool = Arc::downgrade(&pool);
    let started = Instant::now();
    pool.register_clock(STATS_CLOCK, Instant::now() + STATS_PERIOD, Some(STATS_PERIOD), None, move |_| {
        if let Some(pool) = stats_pool.upgrade() {
            let stats = pool.stats();
            let secs = started.elapsed().as_secs_f64();
            info!(
                channels = stats.num_channels,
                opened = stats.channels_opened,
                bytes_in = stats.bytes_read,
                bytes_out = stats.bytes_written,
                mb_per_sec = stats.bytes_written as f64 / secs / 1e6,
                "stats"
            );
        }
    })?;

    while RUNNING.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("shutting down");
    pool.stop();
    let stats = pool.stats();
    info!(
        opened = stats.channels_opened,
        bytes_in = stats.bytes_read,
        bytes_out = stats.bytes_written,
        "done"
    );
    Ok(())
}

extern "C" fn handle_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}
