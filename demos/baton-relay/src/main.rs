//! baton-relay: run one end of a ping-pong exchange over a baton channel.
//!
//! # Usage
//!
//! ```bash
//! baton-relay serve --name demo --rounds 1000 &
//! baton-relay join --name demo
//! baton-relay inspect --name demo
//! baton-relay clean --prefix demo
//! ```
//!
//! Set `RUST_LOG=baton=debug` to see segment and resize activity.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use baton::{Channel, ChannelConfig, ErrorKind, Namespace, PollStrategy, Side};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Counter shared by both ends.
const COUNTER_OFFSET: usize = 0;
/// Who wrote last ("ping" or "pong").
const LABEL_OFFSET: usize = 4;

#[derive(Parser, Debug)]
#[command(name = "baton-relay")]
#[command(about = "Ping-pong over a memory-mapped baton channel")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Location {
    /// Namespace directory (defaults to the shared temp namespace)
    #[arg(long)]
    dir: Option<PathBuf>,
}

impl Location {
    fn namespace(&self) -> Namespace {
        match &self.dir {
            Some(dir) => Namespace::at(dir),
            None => Namespace::temp(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the channel and drive the exchange
    Serve {
        #[arg(long)]
        name: String,
        /// Initial data segment size in bytes
        #[arg(long, default_value_t = 64)]
        capacity: usize,
        #[arg(long, default_value_t = 100)]
        rounds: u32,
        /// Seconds to wait for the peer; zero waits forever
        #[arg(long, default_value_t = 30.0)]
        timeout: f64,
        /// Yield the thread while waiting instead of spinning
        #[arg(long)]
        polite: bool,
        #[command(flatten)]
        location: Location,
    },
    /// Join an existing channel and answer every ping
    Join {
        #[arg(long)]
        name: String,
        #[arg(long, default_value_t = 30.0)]
        timeout: f64,
        #[arg(long)]
        polite: bool,
        #[command(flatten)]
        location: Location,
    },
    /// Print the control block of a channel
    Inspect {
        #[arg(long)]
        name: String,
        #[command(flatten)]
        location: Location,
    },
    /// Delete every file whose name starts with a prefix
    Clean {
        #[arg(long)]
        prefix: String,
        #[command(flatten)]
        location: Location,
    },
}

fn poll_strategy(polite: bool) -> PollStrategy {
    if polite {
        PollStrategy::Yield
    } else {
        PollStrategy::Spin
    }
}

fn serve(ns: &Namespace, name: &str, rounds: u32, config: ChannelConfig) -> baton::Result<()> {
    let mut chan = Channel::new(ns, name, config)?.delete_on_drop();
    tracing::info!(channel = name, capacity = chan.capacity(), rounds, "serving");

    chan.write_i32(COUNTER_OFFSET, 0)?;
    let started = Instant::now();

    for round in 0..rounds {
        if round > 0 && round == rounds / 2 {
            let grown = chan.capacity() * 2;
            chan.resize(grown)?;
            tracing::info!(round, capacity = grown, "resized");
        }

        let (count, next) = chan.read_i32(COUNTER_OFFSET)?;
        chan.write_i32(COUNTER_OFFSET, count + 1)?;
        chan.write_string(next, "ping")?;
        chan.give_control(true)?;

        let (label, _) = chan.read_string(LABEL_OFFSET)?;
        tracing::debug!(round, %label, "peer answered");
    }

    let (count, _) = chan.read_i32(COUNTER_OFFSET)?;
    let elapsed = started.elapsed();
    tracing::info!(
        count,
        ?elapsed,
        per_round = ?elapsed.checked_div(rounds.max(1)).unwrap_or_default(),
        "done"
    );
    Ok(())
}

fn join(ns: &Namespace, name: &str, config: ChannelConfig) -> baton::Result<()> {
    let mut chan = Channel::new(ns, name, config)?;
    tracing::info!(channel = name, capacity = chan.capacity(), "joined");

    let mut answered = 0u64;
    loop {
        let step = chan
            .read_i32(COUNTER_OFFSET)
            .and_then(|(count, next)| {
                chan.write_i32(COUNTER_OFFSET, count + 1)?;
                chan.write_string(next, "pong")
            })
            .and_then(|_| chan.give_control(true));

        match step {
            Ok(()) => answered += 1,
            Err(e) if e.kind() == ErrorKind::PeerClosed => {
                tracing::info!(answered, "peer finished");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

fn run(command: Command) -> baton::Result<()> {
    match command {
        Command::Serve {
            name,
            capacity,
            rounds,
            timeout,
            polite,
            location,
        } => {
            let config = ChannelConfig::create(capacity)
                .with_timeout_secs(timeout)
                .with_poll(poll_strategy(polite));
            serve(&location.namespace(), &name, rounds, config)
        }
        Command::Join {
            name,
            timeout,
            polite,
            location,
        } => {
            let config = ChannelConfig::join()
                .with_side(Side::Secondary)
                .with_timeout_secs(timeout)
                .with_poll(poll_strategy(polite));
            join(&location.namespace(), &name, config)
        }
        Command::Inspect { name, location } => {
            let ns = location.namespace();
            let snapshot = Channel::inspect(&ns, &name)?;
            println!("{}: {}", ns.control_path(&name).display(), snapshot);
            Ok(())
        }
        Command::Clean { prefix, location } => {
            let removed = location.namespace().delete_files(&prefix)?;
            println!("removed {} file(s)", removed);
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    // Output goes to stderr so `inspect` stays pipeable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "relay failed");
            ExitCode::FAILURE
        }
    }
}
