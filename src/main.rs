// SPDX-FileCopyrightText: 2023 Linutronix GmbH
// SPDX-License-Identifier: GPL-3.0-or-later

//! Main executable of tsn-txrx
// we do not want to panic or exit, see explanation in main()
#![cfg_attr(
    not(test),
    deny(
        clippy::panic,
        clippy::panic_in_result_fn,
        clippy::expect_used,
        clippy::exit,
        clippy::unwrap_used,
        clippy::indexing_slicing,
        clippy::modulo_arithmetic, // % 0 panics - use checked_rem
        clippy::integer_division,  // / 0 panics - use checked_div
        clippy::unreachable,
        clippy::unwrap_in_result,
    )
)]
#![allow(clippy::unnecessary_wraps)] // wraps are necessary for certain combinations of feature flags

use anyhow::{anyhow, Context, Error, Result};
use clap::Parser;
use eui48::MacAddress;

use std::fs::File;
use std::io::{self, BufWriter, StdoutLock};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use tsn_txrx::classifier::{Classifier, DummyClassifier};
use tsn_txrx::clock::{Clock, ClockKind, SystemClock};
use tsn_txrx::configuration::{read_yaml, Mode, Operation, Session, SessionOptions, Transport};
use tsn_txrx::engine::packet::{PacketReceiver, PacketTransmitter};
use tsn_txrx::engine::xsk::{ForwardOptions, XskForwarder, XskReceiver, XskTransmitter};
use tsn_txrx::engine::{receive, transmit, IdleStrategy, RunControl, RxProcessor, WriterSink};
use tsn_txrx::scheduler::LaunchScheduler;
use tsn_txrx::socket::packet::PacketSocket;
use tsn_txrx::socket::xsk::{XdpMode, XskRx, XskSocket, XskTx};
use tsn_txrx::socket::SocketDoorbell;

/// Granularity of the interruptible settle wait
const SETTLE_STEP: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Network interface
    #[arg(short, long, value_name = "NAME")]
    interface: Option<String>,

    /// Transport [default: zero-copy-ring]
    #[arg(long, value_enum)]
    transport: Option<Transport>,

    /// Operating mode
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Binding of the AF_XDP socket [default: zero-copy]
    #[arg(long, value_enum)]
    zero_copy_mode: Option<XdpMode>,

    /// Queue id, also used as socket priority (0-7) [default: 0]
    #[arg(short, long)]
    queue: Option<u32>,

    /// Priority code point of the VLAN tag (0-7) [default: queue]
    #[arg(long)]
    vlan_priority: Option<u8>,

    /// VLAN id (0-4095) [default: 3]
    #[arg(long)]
    vlan_id: Option<u16>,

    /// On-wire size of the frames without FCS (64-1500) [default: 64]
    #[arg(short = 'l', long, value_name = "BYTES")]
    packet_size: Option<usize>,

    /// Cycle time (25000-50000000) [default: 100000]
    #[arg(short = 'y', long, value_name = "NSEC")]
    cycle_time: Option<u64>,

    /// Frames to send, or sequence of the last expected frame [default: 1000]
    #[arg(short = 'n', long)]
    frame_count: Option<u32>,

    /// Phase of the transmission grid [default: 0]
    #[arg(short = 'o', long, value_name = "NSEC")]
    tx_offset: Option<u64>,

    /// Wake up this long before the deadline [default: 100000]
    #[arg(short = 'e', long, value_name = "NSEC")]
    early_wake_offset: Option<u64>,

    /// Minimum time between arrival and retransmission when forwarding [default: 50000]
    #[arg(long, value_name = "NSEC")]
    turnaround: Option<u64>,

    /// Destination MAC address [default: 22:bb:22:bb:22:bb]
    #[arg(short, long, value_name = "ADDR", value_parser = parse_mac)]
    dest_mac: Option<MacAddress>,

    /// Source MAC address [default: aa:00:aa:00:aa:00]
    #[arg(long, value_name = "ADDR", value_parser = parse_mac)]
    src_mac: Option<MacAddress>,

    /// Size of each UMEM frame, power of two (2048-4096) [default: 4096]
    #[arg(long, value_name = "BYTES")]
    frame_size: Option<u32>,

    /// Number of UMEM frames and size of every ring, power of two (64-16384) [default: 4096]
    #[arg(long)]
    ring_size: Option<u32>,

    /// Clock for timestamps and launch times [default: realtime]
    #[arg(long, value_enum)]
    clock: Option<ClockKind>,

    /// Wait after binding before zero-copy transmission starts [default: 7000]
    #[arg(long, value_name = "MSEC")]
    settle_time: Option<u64>,

    /// Maximum time to block in poll() [default: 1000]
    #[arg(long, value_name = "MSEC")]
    poll_timeout: Option<u64>,

    /// Let the kernel hold every frame until its deadline
    #[arg(short = 'T', long)]
    enable_launch_time: bool,

    /// Enable hardware timestamps
    #[arg(short = 'H', long)]
    enable_hw_timestamps: bool,

    /// Block in poll() instead of yielding when idle, same as --idle block
    #[arg(short, long)]
    poll: bool,

    /// What to do while the rings are empty or full [default: yield]
    #[arg(long, value_enum)]
    idle: Option<IdleStrategy>,

    /// Only notify the kernel when it asks for it (XDP_USE_NEED_WAKEUP)
    #[arg(short, long)]
    wakeup_mode: bool,

    /// Skip installing the XDP program, redirection has to be set up externally
    #[arg(long)]
    no_classifier: bool,

    /// Enable debug output
    #[arg(short, long)]
    verbose: bool,

    /// YAML session file, command line arguments take precedence
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn parse_mac(s: &str) -> Result<MacAddress, String> {
    MacAddress::parse_str(s).map_err(|e| format!("{s}: {e}"))
}

impl Cli {
    /// Options given on the command line, flags that are not set stay unset
    fn options(&self) -> SessionOptions {
        SessionOptions {
            interface: self.interface.clone(),
            transport: self.transport,
            mode: self.mode,
            xdp_mode: self.zero_copy_mode,
            queue: self.queue,
            vlan_priority: self.vlan_priority,
            vlan_id: self.vlan_id,
            packet_size: self.packet_size,
            cycle_time_ns: self.cycle_time,
            frame_count: self.frame_count,
            tx_offset_ns: self.tx_offset,
            early_wake_offset_ns: self.early_wake_offset,
            turnaround_ns: self.turnaround,
            destination: self.dest_mac,
            source: self.src_mac,
            frame_size: self.frame_size,
            ring_size: self.ring_size,
            clock: self.clock,
            settle_time_ms: self.settle_time,
            poll_timeout_ms: self.poll_timeout,
            launch_time: self.enable_launch_time.then_some(true),
            hw_timestamps: self.enable_hw_timestamps.then_some(true),
            poll: self.poll.then_some(true),
            idle: self.idle,
            need_wakeup: self.wakeup_mode.then_some(true),
            classifier: self.no_classifier.then_some(false),
        }
    }
}

/// Main function of `txrx-tsn`
///
/// # Errors
/// Will return `Err` if the configuration is invalid, the socket
/// can not be set up or any engine fails. The error chain is printed
/// on stderr. panic! is disencouraged in this codebase, so that the
/// socket and the classifier are always released.
pub fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.verbose { "debug" } else { "info" }),
    )
    .init();

    let file_options = match &cli.config {
        Some(path) => read_yaml(
            File::open(path).with_context(|| format!("Opening {}", path.display()))?,
        )?,
        None => SessionOptions::default(),
    };
    let session = cli.options().merge(file_options).resolve()?;
    log::debug!("{session:#?}");

    let run = RunControl::new();
    let signal_run = run.clone();
    ctrlc::set_handler(move || {
        if signal_run.stop() {
            log::info!("Stopping");
        }
    })
    .context("Installing signal handler")?;

    let clock = SystemClock::new(session.clock);
    log::info!(
        "Running {:?} on {} queue {} via {:?}",
        session.mode,
        session.interface,
        session.queue,
        session.transport
    );

    match session.transport {
        Transport::ZeroCopyRing => run_zero_copy(&session, &clock, &run),
        Transport::RawSocket => run_raw_socket(&session, &clock, &run),
    }
}

fn run_zero_copy(session: &Session, clock: &SystemClock, run: &RunControl) -> Result<()> {
    let classifier = if session.classifier {
        new_xdp_classifier(session.xdp_mode)?
    } else {
        Box::new(DummyClassifier)
    };
    let (tx, rx, guard) = XskSocket::bind(&session.xsk_config(), classifier)?.split();

    // both halves are released inside, the guard deregisters afterwards
    let result = run_rings(session, clock, run, tx, rx);
    drop(guard);
    result
}

fn run_rings(
    session: &Session,
    clock: &SystemClock,
    run: &RunControl,
    tx: XskTx<SocketDoorbell>,
    rx: XskRx<SocketDoorbell>,
) -> Result<()> {
    let backoff = session.backoff();

    match session.operation() {
        Operation::Transmit { frame_count } => {
            let mut sender =
                XskTransmitter::new(tx, &session.frame_template()?, session.launch_time, backoff)?;
            settle(session, run);
            let mut scheduler = new_scheduler(session, clock)?;
            transmit(
                clock,
                &mut scheduler,
                &mut sender,
                frame_count,
                session.queue,
                run,
            )?;
        }
        Operation::Receive { frame_count } => {
            let mut receiver = XskReceiver::new(rx, backoff);
            receive(processor(clock, frame_count), &mut receiver, run)?;
        }
        Operation::Forward {
            frame_count,
            turnaround,
        } => {
            let options = ForwardOptions {
                turnaround,
                launch_time: session.launch_time,
                frame_count,
            };
            let scheduler = new_scheduler(session, clock)?;
            XskForwarder::new(clock, scheduler, tx, rx, options, backoff).run(run)?;
        }
        Operation::Bidirectional { frame_count } => {
            let mut sender =
                XskTransmitter::new(tx, &session.frame_template()?, session.launch_time, backoff)?;
            let mut receiver = XskReceiver::new(rx, backoff);
            settle(session, run);
            let mut scheduler = new_scheduler(session, clock)?;

            thread::scope(|s| -> Result<()> {
                let tx_thread = s.spawn(|| {
                    let result = transmit(
                        clock,
                        &mut scheduler,
                        &mut sender,
                        frame_count,
                        session.queue,
                        run,
                    );
                    if result.is_err() {
                        run.stop();
                    }
                    result
                });

                let rx_result = receive(processor(clock, frame_count), &mut receiver, run);
                if rx_result.is_err() {
                    run.stop();
                }
                tx_thread
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("Transmit thread panicked")))?;
                rx_result?;
                Ok(())
            })?;
        }
    }
    Ok(())
}

fn run_raw_socket(session: &Session, clock: &SystemClock, run: &RunControl) -> Result<()> {
    let config = session.packet_config();
    let backoff = session.backoff();

    match session.operation() {
        Operation::Transmit { frame_count } => {
            let mut sender = PacketTransmitter::new(
                PacketSocket::open_tx(&config)?,
                &session.frame_template()?,
                session.launch_time,
                session.hw_timestamps,
                backoff,
            )?;
            let mut scheduler = new_scheduler(session, clock)?;
            transmit(
                clock,
                &mut scheduler,
                &mut sender,
                frame_count,
                session.queue,
                run,
            )?;
            Ok(())
        }
        Operation::Receive { frame_count } => {
            let mut receiver = PacketReceiver::new(PacketSocket::open_rx(&config)?, backoff);
            receive(processor(clock, frame_count), &mut receiver, run)?;
            Ok(())
        }
        Operation::Forward { .. } | Operation::Bidirectional { .. } => Err(anyhow!(
            "{:?} mode is not available on the raw socket transport",
            session.mode
        )),
    }
}

fn new_scheduler(session: &Session, clock: &SystemClock) -> Result<LaunchScheduler> {
    let scheduler = LaunchScheduler::new(
        clock.now_ns()?,
        session.cycle_time,
        session.tx_offset,
        session.early_wake_offset,
    )?;
    log::debug!("{scheduler:?}");
    Ok(scheduler)
}

/// Records go to stdout, one line per frame
fn processor(
    clock: &SystemClock,
    frame_count: u32,
) -> RxProcessor<'_, SystemClock, WriterSink<BufWriter<StdoutLock<'static>>>> {
    RxProcessor::new(
        clock,
        WriterSink::new(BufWriter::new(io::stdout().lock())),
        frame_count,
    )
}

/// Give the link time to come up again after binding reset the queue
fn settle(session: &Session, run: &RunControl) {
    if session.settle_time.is_zero() {
        return;
    }

    log::info!("Waiting {:?} for the link to settle", session.settle_time);
    let start = Instant::now();
    while run.is_running() {
        let remaining = session.settle_time.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            break;
        }
        thread::sleep(remaining.min(SETTLE_STEP));
    }
}

#[allow(dead_code)] // will not be used if ALL features are enabled
fn feature_missing_error(feature: &str, alternative: &str) -> Error {
    anyhow!("{} feature is not built in!\nYou can still use {} if appropriate for your use case or rebuild with the feature enabled!", feature, alternative)
}

#[cfg(feature = "bpf")]
use tsn_txrx::classifier::XdpClassifier;
#[cfg(feature = "bpf")]
fn new_xdp_classifier(mode: XdpMode) -> Result<Box<dyn Classifier + Send>> {
    Ok(Box::new(XdpClassifier::new(mode)))
}

#[cfg(not(feature = "bpf"))]
fn new_xdp_classifier(_mode: XdpMode) -> Result<Box<dyn Classifier + Send>> {
    Err(feature_missing_error(
        "bpf",
        "--no-classifier or --transport raw-socket",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_short_flags() -> Result<()> {
        let cli = Cli::try_parse_from([
            "txrx-tsn", "-i", "eth0", "--mode", "transmit", "-q", "3", "-l", "1500", "-y",
            "1000000", "-n", "10", "-o", "250000", "-e", "50000", "-d", "01:1b:19:00:00:00",
            "-T", "-H", "-p", "-w", "-v",
        ])?;
        assert!(cli.verbose);

        let session = cli.options().resolve()?;
        assert_eq!(session.queue, 3);
        assert_eq!(session.vlan_priority, 3);
        assert_eq!(session.packet_size, 1500);
        assert_eq!(session.cycle_time, 1_000_000);
        assert_eq!(session.tx_offset, 250_000);
        assert_eq!(session.early_wake_offset, 50_000);
        assert_eq!(
            session.destination,
            MacAddress::new([0x01, 0x1b, 0x19, 0, 0, 0])
        );
        assert!(session.launch_time);
        assert!(session.hw_timestamps);
        assert_eq!(session.idle, IdleStrategy::Block);
        assert!(session.need_wakeup);
        assert_eq!(session.operation(), Operation::Transmit { frame_count: 10 });
        Ok(())
    }

    #[test]
    fn test_unset_flags_do_not_override_file() -> Result<()> {
        let cli = Cli::try_parse_from(["txrx-tsn", "--mode", "receive"])?;
        let file = SessionOptions {
            interface: Some("eth2".to_owned()),
            mode: Some(Mode::Transmit),
            hw_timestamps: Some(true),
            classifier: Some(false),
            ..SessionOptions::default()
        };

        let session = cli.options().merge(file).resolve()?;
        assert_eq!(session.mode, Mode::Receive);
        assert!(session.hw_timestamps);
        assert!(!session.classifier);
        Ok(())
    }

    #[test]
    fn test_idle_flag() -> Result<()> {
        let cli = Cli::try_parse_from([
            "txrx-tsn", "-i", "eth0", "--mode", "receive", "--idle", "spin",
        ])?;
        assert_eq!(cli.options().resolve()?.idle, IdleStrategy::Spin);

        let file = SessionOptions {
            idle: Some(IdleStrategy::Block),
            ..SessionOptions::default()
        };
        let cli = Cli::try_parse_from(["txrx-tsn", "-i", "eth0", "--mode", "receive"])?;
        assert_eq!(cli.options().merge(file).resolve()?.idle, IdleStrategy::Block);

        assert!(Cli::try_parse_from(["txrx-tsn", "--idle", "sleep"]).is_err());
        Ok(())
    }

    #[test]
    fn test_invalid_mac_rejected() {
        assert!(Cli::try_parse_from(["txrx-tsn", "-d", "01:02"]).is_err());
    }
}
