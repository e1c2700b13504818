//!
//! # Operating model
//!
//! - One process per side. `--listen` makes this the server (accepting
//!   streams); `--target` makes it the client (driving connections).
//!
//! - The socket broker owns the connection lifecycle: it pends connections
//!   up to the configured limits, recycles finished ones, and signals the
//!   done event when the run's work is exhausted.
//!
//! - Receive work is serviced by shards: each shard owns one socket (bound
//!   with SO_REUSEPORT when several share a listen address), a completion
//!   channel, and a small worker pool, optionally pinned to CPUs.
//!
//! - The main thread just waits: on the done event, on ctrl-c, or on the
//!   status interval to print a throughput snapshot.
//!

mod args;

use std::fs;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use jitterpump_engine::stats::TotalsSnapshot;
use jitterpump_engine::{clock, Context, EngineError, SocketBroker};
use tracing::{debug, error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{filter, Layer};

use crate::args::Args;

const EXIT_CLEAN: u8 = 0;
const EXIT_CANCELED: u8 = 1;
const EXIT_CONFIG: u8 = 2;

fn main() -> ExitCode {
    clock::init();

    let args = Args::parse();
    enable_logging(&args);
    debug!("{args:?}");

    let settings = args.to_settings();
    if let Err(e) = settings.validate() {
        error!("{e}");
        return ExitCode::from(EXIT_CONFIG);
    }

    let ctx = Context::new(settings);
    set_ctrlc_handler(&ctx);

    let broker = match SocketBroker::new(&ctx) {
        Ok(broker) => broker,
        Err(e @ EngineError::AffinityUnsupported) => {
            error!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        }
        Err(e) => {
            error!("broker startup failed: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // bind the listener set up front so a failing shard aborts the run
    // instead of failing each accept
    if ctx.settings.role == jitterpump_engine::Role::Accept {
        match ctx.server_instance() {
            Ok(server) => {
                for address in server.listener_addresses() {
                    info!(%address, "listening");
                }
            }
            Err(e) => {
                error!("listener startup failed: {e}");
                return ExitCode::from(EXIT_CONFIG);
            }
        }
    }

    broker.start();
    info!(
        pending = broker.pending_sockets(),
        "run started; waiting for completion"
    );

    let interval = Duration::from_secs(args.status_interval.max(1));
    let mut previous = TotalsSnapshot::default();
    while !broker.wait(interval) {
        previous = print_status(&args, &ctx, previous);
    }

    let canceled = ctx.cancel.is_set() && !broker.is_done();
    print_status(&args, &ctx, previous);

    broker.shutdown();
    ctx.shutdown();

    if canceled {
        info!("run canceled");
        ExitCode::from(EXIT_CANCELED)
    } else {
        info!("run complete");
        ExitCode::from(EXIT_CLEAN)
    }
}

/// Log a throughput delta since the last snapshot and optionally write the
/// cumulative totals as JSON.
fn print_status(args: &Args, ctx: &Context, previous: TotalsSnapshot) -> TotalsSnapshot {
    let totals = ctx.totals.snapshot();

    info!(
        bits_received = totals.bits_received - previous.bits_received,
        successful_frames = totals.successful_frames - previous.successful_frames,
        dropped_frames = totals.dropped_frames - previous.dropped_frames,
        duplicate_frames = totals.duplicate_frames - previous.duplicate_frames,
        error_frames = totals.error_frames - previous.error_frames,
        "status"
    );

    if let Some(path) = &args.status_output {
        match serde_json::to_vec_pretty(&totals) {
            Ok(json) => {
                if let Err(e) = fs::write(path, json) {
                    error!("writing status snapshot to {path}: {e}");
                }
            }
            Err(e) => error!("serializing status snapshot: {e}"),
        }
    }

    totals
}

fn set_ctrlc_handler(ctx: &std::sync::Arc<Context>) {
    let ctx = std::sync::Arc::clone(ctx);
    ctrlc::set_handler(move || {
        info!("received ctrl-c, exiting...");
        ctx.request_cancel();
    })
    .expect("error setting ctrl-c handler");
}

fn enable_logging(args: &Args) {
    let verbosity = if args.quiet {
        tracing::Level::ERROR
    } else {
        match args.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            2.. => tracing::Level::TRACE,
        }
    };

    let filters = filter::Targets::new()
        .with_target("mio", tracing::Level::WARN)
        .with_default(verbosity);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_filter(filters);

    tracing_subscriber::registry().with(fmt_layer).init();
}
