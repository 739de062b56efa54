use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use fuser::SessionUnmounter;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::Cli;
use crate::config::Settings;
use crate::control::ControlServer;
use crate::fs::ClunkerFs;
use crate::mount::{mount_options, ClunkerMount, OobThreads};

/// The mount directory, removed on every teardown path.
struct MountDir {
    path: PathBuf,
}

impl MountDir {
    fn create(path: &Path) -> Result<Self> {
        if !path.exists() {
            std::fs::create_dir_all(path)
                .with_context(|| format!("creating mount directory {}", path.display()))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for MountDir {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir(&self.path) {
            warn!(
                "failed to remove mount directory {}: {}",
                self.path.display(),
                err
            );
        }
    }
}

/// Mount the filesystem, run the bridge loop on this thread and the
/// control server on its own thread, and tear both down on signal or
/// unmount. Returns the process exit code: the bridge's status.
pub fn run(cli: Cli) -> Result<i32> {
    let settings = Settings::from_env()?;
    let mount_dir = MountDir::create(&cli.mount_path)?;

    let filesystem = Arc::new(ClunkerFs::new());
    let oob = Arc::new(OobThreads::new());
    let shutdown = CancellationToken::new();

    let mut session = fuser::Session::new(
        ClunkerMount::new(Arc::clone(&filesystem), Arc::clone(&oob)),
        &cli.mount_path,
        &mount_options(),
    )
    .with_context(|| format!("mounting filesystem at {}", cli.mount_path.display()))?;
    let unmounter = session.unmount_callable();
    info!("mounted at {}", cli.mount_path.display());

    let control_thread = spawn_control_thread(
        Arc::clone(&filesystem),
        oob,
        cli.mount_path.clone(),
        settings.control_port,
        shutdown.clone(),
        unmounter,
    )?;

    // Bridge loop until the session exits (signal-driven unmount or
    // external umount).
    let bridge_result = session.run();

    shutdown.cancel();
    match control_thread.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("control thread failed: {:#}", err),
        Err(_) => error!("control thread panicked"),
    }
    drop(session);
    drop(mount_dir);

    match bridge_result {
        Ok(()) => Ok(0),
        Err(err) => {
            error!("bridge loop failed: {}", err);
            Ok(1)
        }
    }
}

/// The control thread: registers its OS thread id in the out-of-band set
/// before the listener exists (and therefore before any self-induced
/// syscall can be issued), then drives a current-thread runtime so every
/// control callback runs on that registered thread.
fn spawn_control_thread(
    filesystem: Arc<ClunkerFs>,
    oob: Arc<OobThreads>,
    mount_path: PathBuf,
    port: u16,
    shutdown: CancellationToken,
    unmounter: SessionUnmounter,
) -> Result<JoinHandle<Result<()>>> {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();

    let handle = std::thread::Builder::new()
        .name("clunker-control".to_string())
        .spawn(move || -> Result<()> {
            oob.register_current();

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .enable_time()
                .build()
                .context("building control runtime")?;

            runtime.block_on(async move {
                let server =
                    match ControlServer::bind(filesystem, mount_path, port).await {
                        Ok(server) => {
                            let _ = ready_tx.send(Ok(()));
                            server
                        }
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return Ok(());
                        }
                    };

                tokio::spawn(watch_signals(shutdown.clone(), unmounter));

                server.serve(shutdown).await
            })
        })
        .context("spawning control thread")?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(err)) => {
            let _ = handle.join();
            Err(anyhow!(err).context("binding control server"))
        }
        Err(_) => {
            let result = handle.join();
            Err(match result {
                Ok(Err(err)) => err.context("control thread exited during startup"),
                _ => anyhow!("control thread exited before reporting readiness"),
            })
        }
    }
}

async fn watch_signals(shutdown: CancellationToken, mut unmounter: SessionUnmounter) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut interrupt, mut terminate, mut hangup) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(i), Ok(t), Ok(h)) => (i, t, h),
        _ => {
            error!("failed to install signal handlers");
            return;
        }
    };

    tokio::select! {
        _ = interrupt.recv() => info!("caught SIGINT, shutting down"),
        _ = terminate.recv() => info!("caught SIGTERM, shutting down"),
        _ = hangup.recv() => info!("caught SIGHUP, shutting down"),
        _ = shutdown.cancelled() => return,
    }

    shutdown.cancel();
    if let Err(err) = unmounter.unmount() {
        warn!("unmount failed: {}", err);
    }
}
