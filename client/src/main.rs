use clap::{Parser, Subcommand};
use client::{
    AdapterState, GameSession, LocalAdapter, LocalConfig, NetworkAdapter, RendezvousAdapter,
    RendezvousConfig, TickOutcome,
};
use log::info;
use shared::{GameMessage, Host, DEFAULT_DISCOVERY_PORT, DEFAULT_HOST_TIMEOUT_SECS, DEFAULT_RENDEZVOUS_PORT};
use std::error::Error;
use std::f32::consts::TAU;
use std::thread;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_micros(16_667);
/// Time the transport gets to flush the last lines before exit
const LINGER: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Rendezvous server host
    #[arg(short = 's', long, default_value = "127.0.0.1")]
    server: String,

    /// Rendezvous server port
    #[arg(short = 'p', long, default_value_t = DEFAULT_RENDEZVOUS_PORT)]
    port: u16,

    /// Find peers on the local network instead of through the server
    #[arg(long)]
    lan: bool,

    /// Port used for LAN discovery
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    discovery_port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the joinable hosts
    List {
        /// How long to keep looking
        #[arg(long, default_value_t = 3)]
        seconds: u64,
    },
    /// Offer a session and play once a guest joins
    Host {
        #[arg(short, long)]
        nick: String,

        /// Seconds the session stays listed without a sign of life
        #[arg(short, long, default_value_t = DEFAULT_HOST_TIMEOUT_SECS)]
        timeout: u32,

        /// Game data handed to the guest, e.g. "LEVEL_1 arena.map"
        #[arg(short, long, default_value = "")]
        data: String,

        /// Seconds to play before dying
        #[arg(long, default_value_t = 10)]
        duration: u64,
    },
    /// Join a host by nickname, or the first one found
    Join {
        #[arg(long)]
        host: Option<String>,

        /// Seconds to look for the host
        #[arg(long, default_value_t = 10)]
        search: u64,

        /// Seconds to play before dying
        #[arg(long, default_value_t = 10)]
        duration: u64,
    },
}

fn build_adapter(args: &Args) -> std::io::Result<Box<dyn NetworkAdapter>> {
    if args.lan {
        let config = LocalConfig {
            discovery_port: args.discovery_port,
            ..LocalConfig::default()
        };
        Ok(Box::new(LocalAdapter::new(config)?))
    } else {
        let config = RendezvousConfig::new(&args.server, args.port);
        Ok(Box::new(RendezvousAdapter::new(config)?))
    }
}

fn check_failure(adapter: &dyn NetworkAdapter) -> Result<(), Box<dyn Error>> {
    if adapter.state() == AdapterState::Failure {
        let reason = adapter.failure_reason().unwrap_or("unknown");
        return Err(format!("network failure: {}", reason).into());
    }
    Ok(())
}

/// Ticks until `pick` selects a host or time runs out.
fn find_host<F>(adapter: &mut dyn NetworkAdapter, search: Duration, pick: F) -> Result<Option<Host>, Box<dyn Error>>
where
    F: Fn(&[Host]) -> Option<Host>,
{
    adapter.update_hosts();
    let started = Instant::now();
    let mut hosts = Vec::new();

    while started.elapsed() < search {
        adapter.update_state(TICK.as_secs_f32());
        check_failure(adapter)?;

        adapter.get_hosts(&mut hosts);
        if let Some(host) = pick(&hosts) {
            adapter.stop_host_update();
            return Ok(Some(host));
        }
        thread::sleep(TICK);
    }

    adapter.get_hosts(&mut hosts);
    adapter.stop_host_update();
    Ok(pick(&hosts))
}

/// Runs the frame loop: waits for the game, then plays a scripted avatar
/// circling the arena until `duration` is over or the session ends.
fn play(adapter: Box<dyn NetworkAdapter>, duration: Duration) -> Result<(), Box<dyn Error>> {
    let mut session = GameSession::new(adapter);
    let mut game_started: Option<Instant> = None;
    let mut frame: u64 = 0;

    loop {
        let outcome = session.tick(TICK.as_secs_f32());
        check_failure(session.adapter().as_ref())?;
        if outcome != TickOutcome::Continue {
            info!("Game over: {:?}", outcome);
            return Ok(());
        }

        if session.adapter().state() == AdapterState::Game {
            let started = *game_started.get_or_insert_with(|| {
                info!("Game started with data {:?}", session.adapter().data());
                Instant::now()
            });
            let t = started.elapsed().as_secs_f32();
            frame += 1;

            if frame % 6 == 0 {
                session.send(&GameMessage::PlayerPos {
                    x: 400.0 + 100.0 * t.cos(),
                    y: 300.0 + 100.0 * t.sin(),
                    angle: t % TAU,
                });
            }
            if frame % 120 == 0 {
                session.send(&GameMessage::PlayerShot);
                let remote = session.remote();
                info!(
                    "Peer at ({:.1}, {:.1}), {} shots fired, {} hits taken",
                    remote.x, remote.y, remote.shots_fired, remote.hits_taken
                );
            }

            if started.elapsed() >= duration {
                info!("Time is up, dying");
                session.send(&GameMessage::PlayerDead);
                session.disconnect();
                thread::sleep(LINGER);
                return Ok(());
            }
        }

        thread::sleep(TICK);
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let mut adapter = build_adapter(&args)?;

    match &args.command {
        Command::List { seconds } => {
            find_host(adapter.as_mut(), Duration::from_secs(*seconds), |_| None)?;
            let mut hosts = Vec::new();
            adapter.get_hosts(&mut hosts);

            if hosts.is_empty() {
                println!("No hosts found");
            }
            for host in hosts {
                println!("{}\t{}\t{}", host.nickname(), host.connection_cookie(), host.data());
            }
        }
        Command::Host {
            nick,
            timeout,
            data,
            duration,
        } => {
            info!("Hosting as {}", nick);
            adapter.register(nick, *timeout, data);
            play(adapter, Duration::from_secs(*duration))?;
        }
        Command::Join {
            host,
            search,
            duration,
        } => {
            let wanted = host.clone();
            let found = find_host(adapter.as_mut(), Duration::from_secs(*search), |hosts| {
                hosts
                    .iter()
                    .find(|h| wanted.as_deref().map_or(true, |name| h.nickname() == name))
                    .cloned()
            })?;

            let Some(found) = found else {
                return Err("no host to join".into());
            };
            info!("Joining {}", found.nickname());
            adapter.connect(&found);
            play(adapter, Duration::from_secs(*duration))?;
        }
    }

    Ok(())
}
