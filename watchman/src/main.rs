/*
 * Copyright (c) Watchman Contributors.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Command-line front end.
//!
//! ```text
//! watchman <PID> <ADDR> <SIZE> [<ADDR> <SIZE>]...
//! ```
//!
//! Attaches to `PID`, watches up to four addresses for writes, and delivers
//! SIGUSR2 to the target on every hit. Ctrl-C detaches cleanly and (unless
//! `--no-resume` is given) lets the target run on.

use std::process::ExitCode;

use anyhow::Context;
use anyhow::ensure;
use clap::Parser;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;
use watchman::Engine;
use watchman::RunOutcome;
use watchman::cancel::CancelToken;
use watchman::shutdown::shutdown;
use watchman::trace::Pid;
use watchman::watch::WatchDescriptor;
use watchman::watch::WatchRegistry;
use watchman::watch::WatchSize;

#[derive(Parser, Debug)]
#[command(name = "watchman", about = "Watches process memory for writes using hardware watchpoints")]
struct Args {
    /// Process to attach to.
    pid: i32,

    /// Alternating address/size pairs, up to four. Addresses accept a 0x
    /// prefix; sizes are 1, 2, 4 or 8 bytes.
    #[arg(value_name = "ADDR SIZE", required = true, num_args = 1..)]
    watches: Vec<String>,

    /// Leave the target stopped after detaching instead of resuming it.
    #[arg(long)]
    no_resume: bool,
}

fn parse_address(arg: &str) -> anyhow::Result<u64> {
    let parsed = if let Some(hex) = arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        arg.parse()
    };
    parsed.with_context(|| format!("invalid address {:?}", arg))
}

fn parse_watches(args: &[String]) -> anyhow::Result<WatchRegistry> {
    ensure!(
        args.len() % 2 == 0,
        "watchpoints come in ADDR SIZE pairs, got {} trailing argument(s)",
        args.len() % 2
    );

    let mut watches = Vec::new();
    for pair in args.chunks_exact(2) {
        let addr = parse_address(&pair[0])?;
        let size: u64 = pair[1]
            .parse()
            .with_context(|| format!("invalid size {:?}", pair[1]))?;
        watches.push(WatchDescriptor::new(addr, WatchSize::new(size)?)?);
    }
    Ok(WatchRegistry::new(watches)?)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let registry = match parse_watches(&args.watches) {
        Ok(registry) => registry,
        Err(err) => {
            error!("{:#}", err);
            return ExitCode::FAILURE;
        }
    };
    for (slot, desc) in registry.slots() {
        info!(
            slot,
            addr = format_args!("{:#x}", desc.addr),
            size = %desc.size,
            "watching"
        );
    }

    let cancel = match CancelToken::install() {
        Ok(cancel) => cancel,
        Err(err) => {
            error!(%err, "could not install the Ctrl-C handler");
            return ExitCode::FAILURE;
        }
    };

    let pid = Pid::from_raw(args.pid);
    let mut engine = match Engine::attach_all(pid, registry) {
        Ok(engine) => engine,
        Err(err) => {
            error!("{:#}", anyhow::Error::from(err));
            return ExitCode::FAILURE;
        }
    };

    let outcome = engine.run(&cancel);

    // From here on Ctrl-C is acknowledged but ignored; the teardown below
    // runs exactly once.
    cancel.latch_shutdown();

    match outcome {
        RunOutcome::TargetExited(status) => info!(%status, "target exited"),
        RunOutcome::TargetLost => info!("lost the target, cleaning up what remains"),
        RunOutcome::Cancelled => {}
    }

    // Teardown runs unconditionally. Even when the dispatcher saw the lead
    // thread exit, sibling threads may not have been reaped yet, and their
    // registers and queued traps must still be cleaned up; against a target
    // that is fully gone the pass is a no-op.
    shutdown(pid, !args.no_resume);

    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn addresses_parse_hex_and_decimal() {
        assert_eq!(parse_address("0x7fff0000").unwrap(), 0x7fff_0000);
        assert_eq!(parse_address("0XABCD").unwrap(), 0xabcd);
        assert_eq!(parse_address("4096").unwrap(), 4096);
        assert!(parse_address("0xzz").is_err());
        assert!(parse_address("").is_err());
        assert!(parse_address("-1").is_err());
    }

    #[test]
    fn watch_pairs_parse() {
        let registry = parse_watches(&strings(&["0x1000", "4", "0x2000", "8"])).unwrap();
        assert_eq!(registry.len(), 2);
        let first = registry.get(0).unwrap();
        assert_eq!(first.addr, 0x1000);
        assert_eq!(first.size.bytes(), 4);
    }

    #[test]
    fn dangling_address_is_rejected() {
        assert!(parse_watches(&strings(&["0x1000", "4", "0x2000"])).is_err());
    }

    #[test]
    fn invalid_sizes_are_rejected() {
        assert!(parse_watches(&strings(&["0x1000", "3"])).is_err());
        assert!(parse_watches(&strings(&["0x1000", "0"])).is_err());
        assert!(parse_watches(&strings(&["0x1000", "four"])).is_err());
    }

    #[test]
    fn misaligned_watch_is_rejected() {
        assert!(parse_watches(&strings(&["0x1001", "4"])).is_err());
    }

    #[test]
    fn cli_shape() {
        use clap::CommandFactory;
        Args::command().debug_assert();

        let args = Args::parse_from(["watchman", "1234", "0x1000", "4", "--no-resume"]);
        assert_eq!(args.pid, 1234);
        assert_eq!(args.watches, strings(&["0x1000", "4"]));
        assert!(args.no_resume);
    }
}
