use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::Parser;
use daemon::{build_context, Daemon};

/// The storage daemon. Hosts the object, kv and db backends assigned to
/// this host and port by the configuration.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Path of the configuration file.
    #[arg(long, env = "JULEA_CONFIG")]
    config: PathBuf,

    /// Override the host name used to match this daemon against the
    /// configured server lists.
    #[arg(long)]
    host: Option<String>,

    /// Override the listening port.
    #[arg(long)]
    port: Option<u16>,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = config::Configuration::load(&cli.config)
        .with_context(|| format!("could not load {}", cli.config.display()))?;

    let host = match cli.host {
        Some(host) => host,
        None => hostname()?,
    };
    let port = cli.port.unwrap_or_else(|| config.port());

    let context = build_context(&config, &host, port)?;

    if context.object.is_none() && context.kv.is_none() && context.db.is_none() {
        tracing::warn!(host, port, "no backend assigned to this daemon");
    }

    let daemon = Daemon::bind(context, port)?;
    let handle = daemon.handle();

    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }

    // The handler only flips the flag; this thread turns it into a clean
    // stop of the accept loop.
    std::thread::spawn(move || loop {
        if SHUTDOWN.load(Ordering::SeqCst) {
            handle.stop();
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(200));
    });

    daemon.serve()
}

fn hostname() -> anyhow::Result<String> {
    let mut buf = [0u8; 256];

    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    anyhow::ensure!(rc == 0, "could not determine the host name");

    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}
