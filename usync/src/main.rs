use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand};

use common::{CopyConfig, CopyStats};

#[derive(Parser, Debug)]
#[command(
    name = "usync",
    version,
    args_conflicts_with_subcommands = true,
    about = "High-throughput copier for large file trees, built on io_uring.

Copies locally by default; `send` and `recv` stream a tree to a peer over
TCP with pre-shared-secret authentication and optional kernel-TLS
encryption."
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Source and destination (local copy mode)
    #[arg(value_name = "PATH")]
    paths: Vec<String>,

    /// Number of worker threads; 1 is usually right for a single fast
    /// local disk, more helps on networked filesystems
    #[arg(short = 'j', long, default_value_t = 1)]
    workers: usize,

    /// Ring depth: in-flight files, buffers and pipes per worker
    #[arg(short = 'q', long, default_value_t = 64)]
    queue_depth: usize,

    /// Chunk size (e.g. "256KiB"); unset picks one from the scanned size
    /// distribution
    #[arg(short = 'c', long)]
    chunk_size: Option<bytesize::ByteSize>,

    /// Buffered read/write instead of the zero-copy splice path
    #[arg(long)]
    no_splice: bool,

    /// Blocking per-file copy loop (better for some network filesystems)
    #[arg(long)]
    sync: bool,

    /// -v INFO / -vv DEBUG / -vvv TRACE (default: WARN)
    #[arg(short = 'v', long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// No progress line, no summary
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream a file or directory tree to a receiver
    Send {
        /// Source file or directory
        src: PathBuf,
        /// Receiver address, host:port
        target: String,
        /// Pre-shared authentication secret
        #[arg(long, default_value = "")]
        secret: String,
        /// Zero-copy file->pipe->socket data path
        #[arg(long)]
        splice: bool,
        /// Kernel-TLS encryption (requires --secret)
        #[arg(long)]
        tls: bool,
        /// Pipelined engine on the ring (plaintext only)
        #[arg(long)]
        uring: bool,
        /// Files kept in the open/stat/read pipeline
        #[arg(short = 'q', long, default_value_t = 64)]
        queue_depth: usize,
        /// Chunk size; unset picks one from the scanned size distribution
        #[arg(short = 'c', long)]
        chunk_size: Option<bytesize::ByteSize>,
    },
    /// Receive a tree into a destination directory
    Recv {
        /// Destination root
        dst: PathBuf,
        /// TCP port to bind
        #[arg(short = 'l', long)]
        listen: u16,
        /// Pre-shared authentication secret
        #[arg(long, default_value = "")]
        secret: String,
        /// Kernel-TLS encryption (requires --secret)
        #[arg(long)]
        tls: bool,
        /// Pipelined engine on the ring (plaintext only)
        #[arg(long)]
        uring: bool,
        /// Receive buffer size
        #[arg(short = 'c', long)]
        chunk_size: Option<bytesize::ByteSize>,
    },
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_host_port(s: &str) -> Result<(String, u16)> {
    let colon = s
        .rfind(':')
        .ok_or_else(|| anyhow!("expected host:port, got {:?}", s))?;
    let host = s[..colon].trim_start_matches('[').trim_end_matches(']');
    let port: u16 = s[colon + 1..]
        .parse()
        .with_context(|| format!("invalid port in {:?}", s))?;
    if host.is_empty() || port == 0 {
        return Err(anyhow!("expected host:port, got {:?}", s));
    }
    Ok((host.to_string(), port))
}

/// Periodic single-line progress on stderr; returns a handle that stops
/// the printer and cleans up the line.
fn spawn_progress(stats: Arc<CopyStats>) -> (Arc<AtomicBool>, std::thread::JoinHandle<()>) {
    let done = Arc::new(AtomicBool::new(false));
    let done_flag = done.clone();
    let handle = std::thread::spawn(move || {
        while !done_flag.load(Ordering::SeqCst) {
            std::thread::sleep(std::time::Duration::from_millis(200));
            let snap = stats.snapshot();
            let pct = if snap.bytes_total > 0 {
                100.0 * snap.bytes_copied as f64 / snap.bytes_total as f64
            } else {
                0.0
            };
            eprint!("\r{} ({:.1}%)        ", snap, pct);
        }
        eprint!("\r                                                  \r");
    });
    (done, handle)
}

fn print_summary(stats: &CopyStats, started: Instant) {
    let snap = stats.snapshot();
    let secs = started.elapsed().as_secs_f64();
    let rate = if secs > 0.0 {
        snap.bytes_copied as f64 / secs
    } else {
        0.0
    };
    let files_rate = if secs > 0.0 {
        snap.files_completed as f64 / secs
    } else {
        0.0
    };
    eprintln!("{} in {:.2}s", snap, secs);
    eprintln!(
        "throughput: {}/s, {:.0} files/s",
        bytesize::ByteSize(rate as u64),
        files_rate
    );
}

fn exit_code(stats: &CopyStats) -> i32 {
    if stats.snapshot().files_failed > 0 {
        1
    } else {
        0
    }
}

fn run_local(args: &Args) -> Result<i32> {
    if args.paths.len() != 2 {
        return Err(anyhow!(
            "expected a source and a destination; see --help for usage"
        ));
    }
    let src = PathBuf::from(&args.paths[0]);
    let dst = PathBuf::from(&args.paths[1]);
    let stats = Arc::new(CopyStats::new());
    let started = Instant::now();

    let outcome = common::scan(&src, &dst, &stats)
        .with_context(|| format!("scanning {}", src.display()))?;
    if outcome.items.is_empty() {
        return Err(anyhow!("no files to copy under {}", src.display()));
    }

    let chunk_size = match args.chunk_size {
        Some(bytes) => bytes.0 as usize,
        None => {
            let picked = outcome.sizes.pick_chunk_size();
            tracing::info!(
                "auto-tuned chunk size {} from {} sampled sizes",
                bytesize::ByteSize(picked as u64),
                outcome.sizes.sample_count()
            );
            picked
        }
    };
    let cfg = CopyConfig {
        workers: args.workers,
        queue_depth: args.queue_depth,
        chunk_size,
        use_splice: !args.no_splice && !args.sync,
        sync_mode: args.sync,
    };
    tracing::info!(
        "{} files, {} workers (queue depth {}, chunk {}{})",
        outcome.items.len(),
        cfg.workers,
        cfg.queue_depth,
        bytesize::ByteSize(cfg.chunk_size as u64),
        if cfg.sync_mode { ", sync" } else { "" }
    );

    let progress = (!args.quiet).then(|| spawn_progress(stats.clone()));
    let result = if cfg.sync_mode {
        common::sync_copy::run_sync(&cfg, outcome.items, &stats)
    } else {
        common::engine::run_local(&cfg, outcome.items, &stats)
    };
    if let Some((done, handle)) = progress {
        done.store(true, Ordering::SeqCst);
        let _ = handle.join();
    }
    result.context("copy engine failed")?;

    if !args.quiet {
        print_summary(&stats, started);
    }
    Ok(exit_code(&stats))
}

#[allow(clippy::too_many_arguments)]
fn run_send(
    args: &Args,
    src: PathBuf,
    target: &str,
    secret: String,
    splice: bool,
    tls: bool,
    uring: bool,
    queue_depth: usize,
    chunk_size: Option<bytesize::ByteSize>,
) -> Result<i32> {
    if tls && secret.is_empty() {
        return Err(anyhow!("--tls requires --secret"));
    }
    if tls && uring {
        return Err(anyhow!("--tls cannot be combined with --uring"));
    }
    let (host, port) = parse_host_port(target)?;
    let cfg = remote::SendConfig {
        src,
        host,
        port,
        secret,
        use_splice: splice,
        tls,
        queue_depth,
        chunk_size: chunk_size.map(|b| b.0 as usize),
    };
    let stats = Arc::new(CopyStats::new());
    let started = Instant::now();
    let progress = (!args.quiet).then(|| spawn_progress(stats.clone()));
    let result = if uring {
        remote::uring_net::run_uring_sender(&cfg, &stats)
    } else {
        remote::run_sender(&cfg, &stats)
    };
    if let Some((done, handle)) = progress {
        done.store(true, Ordering::SeqCst);
        let _ = handle.join();
    }
    result.context("send failed")?;
    if !args.quiet {
        print_summary(&stats, started);
    }
    Ok(exit_code(&stats))
}

fn run_recv(
    args: &Args,
    dst: PathBuf,
    listen: u16,
    secret: String,
    tls: bool,
    uring: bool,
    chunk_size: Option<bytesize::ByteSize>,
) -> Result<i32> {
    if tls && secret.is_empty() {
        return Err(anyhow!("--tls requires --secret"));
    }
    if tls && uring {
        return Err(anyhow!("--tls cannot be combined with --uring"));
    }
    let cfg = remote::RecvConfig {
        dst,
        port: listen,
        secret,
        tls,
        chunk_size: chunk_size.map(|b| b.0 as usize),
    };
    let stats = Arc::new(CopyStats::new());
    let started = Instant::now();
    let result = if uring {
        remote::uring_net::run_uring_receiver(&cfg, &stats)
    } else {
        remote::run_receiver(cfg, &stats)
    };
    result.context("receive failed")?;
    if !args.quiet {
        print_summary(&stats, started);
    }
    Ok(exit_code(&stats))
}

fn run(args: Args) -> Result<i32> {
    match args.command {
        None => run_local(&args),
        Some(Command::Send {
            ref src,
            ref target,
            ref secret,
            splice,
            tls,
            uring,
            queue_depth,
            chunk_size,
        }) => run_send(
            &args,
            src.clone(),
            target,
            secret.clone(),
            splice,
            tls,
            uring,
            queue_depth,
            chunk_size,
        ),
        Some(Command::Recv {
            ref dst,
            listen,
            ref secret,
            tls,
            uring,
            chunk_size,
        }) => run_recv(
            &args,
            dst.clone(),
            listen,
            secret.clone(),
            tls,
            uring,
            chunk_size,
        ),
    }
}

fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);
    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("usync: {:#}", error);
            std::process::exit(1);
        }
    }
}
