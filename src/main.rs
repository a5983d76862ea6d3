//! rawlink - capture and inject raw Ethernet frames from the command line.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rawlink::capture::{list_interfaces, SystemCaptureFactory};
use rawlink::reporter::{ConsoleReporter, FrameReporter};
use rawlink::{compile_filter, Config, Dispatcher, FrameCallback};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rawlink")]
#[command(about = "Raw link-layer frame capture and injection")]
#[command(version)]
struct Cli {
    /// Config file (default: $RAWLINK_CONFIG or /etc/rawlink.conf)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging and longer frame previews
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List network interfaces
    List,
    /// Print a summary of every frame received on the given interfaces
    Capture {
        /// Interface to capture on; repeat for several
        #[arg(short = 'i', long = "interface", required = true)]
        interfaces: Vec<String>,
        /// Filter expression, e.g. "arp or udp port 67"
        #[arg(short, long)]
        filter: Option<String>,
        /// Stop after this many frames
        #[arg(short = 'c', long)]
        count: Option<u64>,
    },
    /// Transmit a hex-encoded frame
    Send {
        #[arg(short = 'i', long = "interface")]
        interface: String,
        /// Frame bytes as hex; ':', '-' and spaces are ignored
        frame: String,
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
    /// Compile a filter expression and print its BPF program
    Filter {
        #[arg(required = true, num_args = 1..)]
        expression: Vec<String>,
        /// Hex-encoded frame to test against the filter
        #[arg(long)]
        frame: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::List => {
            for iface in list_interfaces() {
                println!("{}", iface);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Capture {
            interfaces,
            filter,
            count,
        } => {
            let config = load_config(cli.config, cli.verbose)?;
            capture(config, &interfaces, filter.as_deref(), count)
        }
        Commands::Send {
            interface,
            frame,
            repeat,
        } => {
            let config = load_config(cli.config, cli.verbose)?;
            let frame = parse_hex(&frame)?;
            send(config, &interface, &frame, repeat)
        }
        Commands::Filter { expression, frame } => {
            let expression = expression.join(" ");
            let filter = compile_filter(&expression)
                .with_context(|| format!("Invalid filter \"{}\"", expression))?;
            for (pc, insn) in filter.program().iter().enumerate() {
                println!("({:03}) {}", pc, insn);
            }
            if let Some(frame) = frame {
                let frame = parse_hex(&frame)?;
                if filter.matches(&frame) {
                    println!("match");
                } else {
                    println!("no match");
                    return Ok(ExitCode::from(1));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: Option<PathBuf>, verbose: bool) -> Result<Config> {
    let mut config = Config::load(path.as_deref()).context("Failed to load configuration")?;
    config.verbose |= verbose;
    Ok(config)
}

fn capture(
    config: Config,
    interfaces: &[String],
    filter: Option<&str>,
    count: Option<u64>,
) -> Result<ExitCode> {
    let filter = filter
        .map(compile_filter)
        .transpose()
        .context("Invalid filter expression")?;

    let reporter = Arc::new(ConsoleReporter::new().with_verbose(config.verbose));
    let dispatcher = Dispatcher::with_factory(Arc::new(SystemCaptureFactory), config)
        .context("Failed to create dispatcher")?;

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let ctrlc_tx = stop_tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send(());
    })
    .context("Failed to set Ctrl+C handler")?;

    let seen = Arc::new(AtomicU64::new(0));
    for name in interfaces {
        let reporter = Arc::clone(&reporter);
        let seen = Arc::clone(&seen);
        let stop_tx = stop_tx.clone();
        let interface = name.clone();
        let on_frame: FrameCallback = Arc::new(move |frame: &[u8]| {
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            if count.is_some_and(|limit| n > limit) {
                return;
            }
            reporter.report(&interface, frame);
            if count == Some(n) {
                let _ = stop_tx.send(());
            }
        });
        dispatcher
            .open(name, on_frame, filter.clone(), false, true)
            .with_context(|| format!("Failed to open {}", name))?;
    }
    drop(stop_tx);

    dispatcher.start().context("Failed to start capture")?;
    reporter.on_start(&dispatcher.interfaces());

    let _ = stop_rx.recv();

    let stats: Vec<_> = dispatcher
        .interfaces()
        .into_iter()
        .filter_map(|name| dispatcher.statistics(&name).map(|s| (name, s)))
        .collect();
    dispatcher.stop(Some(Duration::from_secs(2)));
    reporter.on_stop(&stats);

    Ok(ExitCode::SUCCESS)
}

fn send(config: Config, interface: &str, frame: &[u8], repeat: u32) -> Result<ExitCode> {
    let dispatcher = Dispatcher::with_factory(Arc::new(SystemCaptureFactory), config)
        .context("Failed to create dispatcher")?;
    let ignore: FrameCallback = Arc::new(|_frame: &[u8]| {});
    dispatcher
        .open(interface, ignore, None, false, true)
        .with_context(|| format!("Failed to open {}", interface))?;

    let mut failed = false;
    for _ in 0..repeat {
        match dispatcher.send(interface, frame) {
            Ok(n) => println!("sent {} bytes on {}", n, interface),
            Err(e) => {
                eprintln!("error: {}", e);
                failed = true;
            }
        }
    }

    if let Some(stats) = dispatcher.statistics(interface) {
        println!("{}: {}", interface, stats);
    }
    dispatcher.stop(None);

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Decode a hex string, ignoring `:`, `-`, `.` and whitespace between bytes.
fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.') && !c.is_whitespace())
        .collect();
    if digits.is_empty() {
        bail!("Empty frame");
    }
    if digits.len() % 2 != 0 {
        bail!("Odd number of hex digits in frame");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("Invalid hex byte \"{}\"", &digits[i..i + 2]))
        })
        .collect()
}
