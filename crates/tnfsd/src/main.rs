use {
    clap::Parser,
    log::info,
    std::{
        fs,
        path::{Path, PathBuf},
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    },
    tnfs::{
        event::BackendKind,
        io_err, res,
        srv::{Config, Server},
    },
    tokio::signal::unix::{SignalKind, signal},
};

mod utils;

mod dirlist;
mod glob;
mod hostfs;
mod jail;

use crate::hostfs::HostFs;

#[derive(Debug, clap::Parser)]
#[command(version, about)]
struct Cli {
    /// Directory to serve
    root: PathBuf,

    /// UDP and TCP port
    #[arg(short, long, default_value_t = tnfs::TNFSD_PORT, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Refuse every command which modifies the filesystem
    #[arg(short, long)]
    read_only: bool,

    /// Readiness mechanism: epoll | kqueue | poll | select
    #[arg(long, default_value_t = BackendKind::default())]
    backend: BackendKind,

    /// Maximum number of TCP connections
    #[arg(long, default_value_t = 256)]
    max_connections: usize,

    /// Seconds after which an idle TCP connection is closed
    #[arg(long, default_value_t = 600)]
    conn_timeout: u64,

    /// Seconds after which an idle session is destroyed
    #[arg(long, default_value_t = 6 * 60 * 60)]
    session_timeout: u64,

    /// Seconds between statistics log lines, 0 disables them
    #[arg(long, default_value_t = 60)]
    stats_interval: u64,

    /// Chroot into ROOT and run as this user
    #[arg(short, long, requires = "group")]
    user: Option<String>,

    /// Group to run as, together with --user
    #[arg(short, long, requires = "user")]
    group: Option<String>,
}

impl Cli {
    fn config(&self) -> Config {
        Config {
            port: self.port,
            read_only: self.read_only,
            backend: self.backend,
            max_connections: self.max_connections,
            conn_timeout: Duration::from_secs(self.conn_timeout),
            session_timeout: Duration::from_secs(self.session_timeout),
            stats_interval: Duration::from_secs(self.stats_interval),
            ..Default::default()
        }
    }
}

async fn tnfsd_main(cli: Cli) -> tnfs::Result<i32> {
    if !fs::metadata(&cli.root)?.is_dir() {
        return res!(io_err!(Other, "root must be a directory"));
    }

    let root = cli.root.canonicalize()?;
    let root = match (&cli.user, &cli.group) {
        (Some(user), Some(group)) => {
            jail::jail(&root, user, group)?;
            PathBuf::from("/")
        }
        _ => {
            jail::warn_if_root();
            root
        }
    };

    serve(&root, cli.config()).await.and(Ok(0))
}

/// Run the reactor on a blocking thread until it fails or a signal arrives.
async fn serve(root: &Path, config: Config) -> tnfs::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let running = Arc::new(AtomicBool::new(true));
    let fs = HostFs::new(root);
    info!("Serving {:?}", root);

    let mut reactor = {
        let running = running.clone();
        tokio::task::spawn_blocking(move || {
            let mut server = Server::bind(fs, config)?;
            server.run(&running)
        })
    };

    let joined = tokio::select! {
        res = &mut reactor => res,
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
            running.store(false, Ordering::SeqCst);
            (&mut reactor).await
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully");
            running.store(false, Ordering::SeqCst);
            (&mut reactor).await
        }
    };

    joined.map_err(|e| tnfs::Error::Io(std::io::Error::other(e)))?
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let exit_code = tnfsd_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        -1
    });

    std::process::exit(exit_code);
}
