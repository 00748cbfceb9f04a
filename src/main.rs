use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use anyhow::anyhow;
#[cfg(unix)]
use nix::fcntl::{flock, FlockArg};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use ptptimesync::client::PtpClient;
use ptptimesync::clock::SystemMillis;
use ptptimesync::config::ClientConfig;
use ptptimesync::net::{self, MulticastPtpNetwork};
use ptptimesync::smooth_loop::SmoothTimeLoop;
use ptptimesync::traits::MillisClock;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Network interface to join multicast on (default: first usable)
    #[arg(short, long)]
    interface: Option<String>,

    /// PTP domain filter (overrides the config file)
    #[arg(short, long)]
    domain: Option<u8>,

    /// Optional JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write a JSON status snapshot here every status interval
    #[arg(long)]
    status_file: Option<PathBuf>,
}

fn load_config(path: Option<&Path>) -> ClientConfig {
    let Some(path) = path else {
        return ClientConfig::default();
    };

    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<ClientConfig>(&content) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("ignoring malformed config {}: {}", path.display(), e);
                ClientConfig::default()
            }
        },
        Err(e) => {
            warn!("cannot read config {}: {}", path.display(), e);
            ClientConfig::default()
        }
    }
}

fn acquire_singleton_lock() -> Result<File> {
    #[cfg(unix)]
    {
        let lock_path = "/var/run/ptptimesync.lock";
        let file = File::create(lock_path)
            .map_err(|e| anyhow!("Failed to create lock file {}: {}", lock_path, e))?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(_) => Ok(file),
            Err(nix::errno::Errno::EAGAIN) => Err(anyhow!(
                "Another instance of ptptimesync is already running! (Lockfile: {})",
                lock_path
            )),
            Err(e) => Err(e.into()),
        }
    }
    #[cfg(not(unix))]
    {
        let file = File::create("ptptimesync.lock")?;
        Ok(file)
    }
}

fn log_status<C, N>(
    client: &PtpClient<C, N>,
    smooth: &mut SmoothTimeLoop,
    raw_clock: &SystemMillis,
    status_file: Option<&Path>,
) where
    C: MillisClock,
    N: ptptimesync::traits::PtpNetwork,
{
    let status = client.status();
    let phase = smooth.cycle_position(client.millis(), raw_clock.millis());

    if status.epoch_valid {
        let when = chrono::DateTime::from_timestamp_millis(status.epoch_millis as i64)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
            .unwrap_or_else(|| "?".to_string());
        info!(
            "{} | {} | pps {} | phase {}ms",
            status.summary, when, status.raw_pps, phase
        );
    } else {
        info!(
            "{} | pps {} | phase {}ms",
            status.summary, status.raw_pps, phase
        );
    }

    if client.master().has_valid_source() {
        info!(
            "master {} (two-step: {}, healthy: {})",
            client.master().port_id().to_hex_string(),
            client.master().is_two_step(),
            client.master().healthy()
        );
    }

    if let Some(path) = status_file {
        match serde_json::to_string_pretty(&status) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    warn!("cannot write status file {}: {}", path.display(), e);
                }
            }
            Err(e) => warn!("cannot serialize status: {}", e),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .format_timestamp_millis()
        .format_target(false)
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    info!("ptptimesync v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(args.config.as_deref());
    let domain = args.domain.unwrap_or(config.domain);

    let _lock_file = match acquire_singleton_lock() {
        Ok(f) => f,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    // wait until some interface is usable
    let iface_ip = loop {
        match net::interface_ip(args.interface.as_deref()) {
            Ok(ip) => break ip,
            Err(e) => {
                if !running.load(Ordering::SeqCst) {
                    return Ok(());
                }
                warn!("Waiting for network interface... ({})", e);
                thread::sleep(Duration::from_secs(5));
            }
        }
    };
    info!("Listening on {} (domain {})", iface_ip, domain);

    let network = MulticastPtpNetwork::new(iface_ip);
    let mut client = PtpClient::new(SystemMillis::new(), network);
    client.set_domain(domain);

    while !client.begin() {
        if !running.load(Ordering::SeqCst) {
            return Ok(());
        }
        warn!("Multicast join failed, retrying in 5s...");
        thread::sleep(Duration::from_secs(5));
    }

    let raw_clock = SystemMillis::new();
    let mut smooth = SmoothTimeLoop::new(
        config.loop_clock.cycle_millis,
        config.loop_clock.max_percent_adjustment,
    );

    let mut last_log = Instant::now();

    while running.load(Ordering::SeqCst) {
        if let Err(e) = client.poll() {
            warn!("Error in loop: {:#}", e);
        }

        if last_log.elapsed() >= Duration::from_secs(10) {
            last_log = Instant::now();
            log_status(&client, &mut smooth, &raw_clock, args.status_file.as_deref());
        }

        thread::sleep(Duration::from_millis(1));
    }

    client.quit();
    info!("Exiting.");
    Ok(())
}
