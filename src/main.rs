use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use zeroize::Zeroizing;

use mailfs::config::MountConfig;
use mailfs::crypto::hkdf::derive_mount_keys;
use mailfs::fuse::MailFs;
use mailfs::store::{MemoryMailbox, StoreEngine};
use mailfs::sync::SyncDaemon;

/// Mount an encrypted file tree kept in one mailbox.
///
/// This build has no network transport; it mounts a scratch in-memory
/// mailbox whose contents are lost on unmount.
#[derive(Parser, Debug)]
#[command(name = "mailfs", version)]
struct Args {
    /// Where to mount (default: ~/MailFs)
    #[arg(env = "MAILFS_MOUNT_POINT")]
    mount_point: Option<PathBuf>,

    /// Passphrase every key is derived from
    #[arg(long, env = "MAILFS_PASSPHRASE", hide_env_values = true)]
    passphrase: String,

    /// Mailbox holding the tree
    #[arg(long, env = "MAILFS_MAILBOX", default_value = "INBOX")]
    mailbox: String,

    /// PBKDF2 rounds applied to the passphrase; must match every earlier mount
    #[arg(long, env = "MAILFS_KDF_ROUNDS")]
    kdf_rounds: Option<u32>,

    /// Chunk size in bytes for newly written files
    #[arg(long, env = "MAILFS_CHUNK_SIZE")]
    chunk_size: Option<u32>,

    /// Seconds an entry learned from remote search is trusted
    #[arg(long, env = "MAILFS_STALENESS")]
    staleness: Option<u64>,

    /// Memory budget for decrypted chunks, in MiB
    #[arg(long, env = "MAILFS_CACHE_MB")]
    cache_mb: Option<usize>,

    /// Seconds between orphan sweeps
    #[arg(long, env = "MAILFS_SWEEP_INTERVAL")]
    sweep_interval: Option<u64>,

    /// Skip the orphan sweep at mount time
    #[arg(long, env = "MAILFS_NO_SWEEP")]
    no_sweep: bool,
}

impl Args {
    fn into_config(self) -> MountConfig {
        let mut config = MountConfig {
            passphrase: Zeroizing::new(self.passphrase),
            mailbox: self.mailbox,
            sweep_on_mount: !self.no_sweep,
            mount_point: self.mount_point,
            ..MountConfig::default()
        };
        if let Some(rounds) = self.kdf_rounds {
            config.kdf_rounds = rounds;
        }
        if let Some(size) = self.chunk_size {
            config.chunk_size = size;
        }
        if let Some(secs) = self.staleness {
            config.staleness = Duration::from_secs(secs);
        }
        if let Some(mb) = self.cache_mb {
            config.content_cache_bytes = mb * 1024 * 1024;
        }
        if let Some(secs) = self.sweep_interval {
            config.sweep_interval = Duration::from_secs(secs);
        }
        config
    }
}

fn main() {
    let _ = dotenvy::dotenv();
    env_logger::init();

    let config = Args::parse().into_config();
    if let Err(e) = run(config) {
        log::error!("{}", e);
        eprintln!("mailfs: {}", e);
        std::process::exit(1);
    }
}

fn run(config: MountConfig) -> Result<(), String> {
    config.validate().map_err(|e| e.to_string())?;
    log::info!("mailfs starting: {:?}", config);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("mailfs-rt")
        .build()
        .map_err(|e| format!("Failed to start runtime: {}", e))?;

    let keys = derive_mount_keys(
        config.passphrase.as_bytes(),
        &config.mailbox,
        config.kdf_rounds,
    )
    .map_err(|e| e.to_string())?;
    log::warn!("No network transport in this build; mounting a scratch in-memory mailbox");
    let store = Arc::new(MemoryMailbox::new().with_max_message_size(config.max_message_size));
    let engine = Arc::new(StoreEngine::new(store, keys, &config));

    let fs = Arc::new(
        MailFs::mount(engine, &config, rt.handle().clone())
            .map_err(|e| format!("Mount failed: {}", e))?,
    );
    let daemon = SyncDaemon::new(Arc::clone(&fs), &config).spawn(rt.handle());

    // Unmounting runs `MailFs::shutdown`, which flushes and logs out.
    let served = serve(fs, &config);
    rt.block_on(daemon.stop());
    served
}

#[cfg(feature = "fuse")]
fn serve(fs: Arc<MailFs<MemoryMailbox>>, config: &MountConfig) -> Result<(), String> {
    let mount_point = config.mount_point().map_err(|e| e.to_string())?;
    let handle = mailfs::fuse::mount_filesystem(fs, mount_point)?;
    handle
        .join()
        .map_err(|_| "FUSE thread panicked".to_string())
}

#[cfg(not(feature = "fuse"))]
fn serve(fs: Arc<MailFs<MemoryMailbox>>, _config: &MountConfig) -> Result<(), String> {
    if let Err(e) = fs.shutdown() {
        log::warn!("Shutdown: {}", e);
    }
    Err("Built without the `fuse` feature; nothing to mount".to_string())
}
