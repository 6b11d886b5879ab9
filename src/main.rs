//! x11os - connection core of an X11 server
//!
//! Accepts clients on the usual X11 sockets, runs the setup handshake with
//! cookie or host based authorization, frames requests and keeps busy
//! clients from starving quiet ones. Only a tiny protocol surface is
//! implemented on top: enough to connect, sync, grab and enable big
//! requests.
//!
//! ```text
//! x11os cookie -d :1          → adds a cookie to ~/.Xauthority
//! x11os serve -d :1 --auth ~/.Xauthority
//! DISPLAY=:1 xdpyinfo
//! ```

mod config;
mod server;
mod signal;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use rand::RngCore;
use server::Server;
use signal::Shutdown;
use std::net::IpAddr;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use x11os_core::{AuthorityEntry, ConnectionManager, EventLoop, UnixListenTransport};

#[derive(Parser)]
#[command(name = "x11os")]
#[command(about = "X11 server connection core")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a display until interrupted
    Serve {
        /// Display to serve (e.g., :1)
        #[arg(short, long)]
        display: Option<String>,

        /// Also listen on TCP port 6000 + display at this address
        #[arg(long)]
        tcp: Option<IpAddr>,

        /// Do not open the Unix socket
        #[arg(long)]
        no_unix: bool,

        /// Authority file with the cookies clients must present
        #[arg(long)]
        auth: Option<PathBuf>,

        /// Client slots
        #[arg(long)]
        max_clients: Option<usize>,

        /// Reset the server each time the last client leaves
        #[arg(long)]
        reset: bool,

        /// Also accept on this inherited, listening Unix socket
        #[arg(long = "listen-fd", value_name = "FD")]
        listen_fd: Vec<RawFd>,

        /// Admit clients on inherited sockets without authorization
        #[arg(long, requires = "listen_fd")]
        trusted: bool,
    },

    /// Generate a cookie and add it to an authority file
    Cookie {
        /// Display the cookie is for
        #[arg(short, long, default_value = ":0")]
        display: String,

        /// Authority file (defaults to $XAUTHORITY or ~/.Xauthority)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.filter))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve {
            display,
            tcp,
            no_unix,
            auth,
            max_clients,
            reset,
            listen_fd,
            trusted,
        } => {
            if let Some(display) = display {
                config.display.number = parse_display(&display)?;
            }
            if tcp.is_some() {
                config.listen.tcp = tcp;
            }
            if no_unix {
                config.listen.unix_dir = None;
            }
            if auth.is_some() {
                config.auth.file = auth;
            }
            if let Some(max) = max_clients {
                config.os.max_clients = max;
            }
            config.display.reset |= reset;
            run_serve(&config, &listen_fd, trusted)
        }
        Commands::Cookie { display, file } => run_cookie(&display, file),
    }
}

fn parse_display(display: &str) -> Result<u32> {
    display
        .trim_start_matches(':')
        .split('.')
        .next()
        .unwrap_or_default()
        .parse()
        .context("invalid display number")
}

/// Build the connection manager and open the display's listeners.
/// Inherited sockets in `fds` are adopted first; with some of them the
/// well-known sockets are optional.
fn open_display(config: &Config, fds: &[RawFd], trusted: bool) -> Result<ConnectionManager> {
    let number = config.display.number;
    let mut os = ConnectionManager::new(config.os.clone()).with_host_access(config.host_list());
    load_authority(&mut os, config)?;

    for &fd in fds {
        // SAFETY: the descriptor was handed to us to own on the command line
        let listener = unsafe { UnixListenTransport::from_raw_fd(fd, trusted) }
            .with_context(|| format!("fd {} is not a listening Unix socket", fd))?;
        info!("accepting on inherited fd {}", fd);
        os.listen_on_open_fd(Box::new(listener));
    }

    let opts = config.listen_options();
    if fds.is_empty() || opts.unix_dir.is_some() || opts.tcp.is_some() {
        os.create_well_known_sockets(number, &opts)
            .with_context(|| format!("cannot serve display :{}", number))?;
    }
    Ok(os)
}

fn run_serve(config: &Config, fds: &[RawFd], trusted: bool) -> Result<()> {
    let number = config.display.number;
    let mut os = open_display(config, fds, trusted)?;

    let shutdown = Shutdown::install()?;
    shutdown.register(&mut os)?;
    info!("serving display :{}", number);

    let mut ev = EventLoop::new(os, Server::new());
    let mut had_clients = false;
    while !shutdown.requested() {
        ev.run_once(None)?;
        if ev.os().client_count() > 0 {
            had_clients = true;
        } else if had_clients && config.display.reset {
            had_clients = false;
            info!("last client gone, resetting");
            ev.os_mut().reset();
            load_authority(ev.os_mut(), config)?;
        }
    }

    info!(
        "shutting down after {} clients",
        ev.dispatcher().gone() + ev.os().client_count()
    );
    ev.os_mut().close_well_known_connections();
    Ok(())
}

/// Replace the server's cookies with those in the configured authority
/// file. Without a file only host access admits clients.
fn load_authority(os: &mut ConnectionManager, config: &Config) -> Result<()> {
    let auth = os.authorization_mut();
    auth.reset();
    let Some(path) = &config.auth.file else {
        return Ok(());
    };
    let added = auth
        .load_file(path)
        .with_context(|| format!("cannot load authority file {}", path.display()))?;
    if added == 0 {
        warn!("no usable entries in {}", path.display());
    }
    Ok(())
}

fn run_cookie(display: &str, file: Option<PathBuf>) -> Result<()> {
    let number = parse_display(display)?;
    let path = match file {
        Some(path) => path,
        None => default_authority_file()?,
    };

    let mut cookie = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut cookie);
    let entry = AuthorityEntry::local(&hostname(), number, &cookie);
    entry
        .merge_into_file(&path)
        .with_context(|| format!("cannot write {}", path.display()))?;

    eprintln!("added cookie for :{} to {}", number, path.display());
    println!("{}", hex::encode(cookie));
    Ok(())
}

fn default_authority_file() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os("XAUTHORITY") {
        return Ok(PathBuf::from(path));
    }
    let home = std::env::var_os("HOME").context("neither XAUTHORITY nor HOME is set")?;
    Ok(Path::new(&home).join(".Xauthority"))
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .or_else(|_| std::fs::read_to_string("/etc/hostname"))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "localhost".into())
}
