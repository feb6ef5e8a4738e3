//! The authoritative world server.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

// The common configuration and tuning constants.
pub mod config;

// The network modules: net is the transport, proto the protocol.
pub mod net;
pub mod proto;

// These modules use each other; the world is too entangled for a strict
// layering and it is easier to maintain like this.
pub mod player;
pub mod monster;
pub mod activator;
pub mod commands;

// Persistence adapter and the schedulers.
pub mod db;
pub mod ticks;

// This module links the previous ones into one running server.
pub mod server;

use crate::config::{Config, ConfigFile};
use crate::db::FileStore;
use crate::server::Server;

/// Set by the signal handler, watched by the main loop.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Parser)]
#[command(version, about = "The authoritative voxel world server")]
struct Args {
    /// Address and port to listen on.
    #[arg(short = 'i', long, default_value = "0.0.0.0:57862")]
    listen: String,
    /// Folder for chunk files.
    #[arg(long, default_value = "DB")]
    chunk_folder: PathBuf,
    /// Folder for super chunk files.
    #[arg(long, default_value = "SDB")]
    super_folder: PathBuf,
    /// Folder for the player document store.
    #[arg(long, default_value = "PDB")]
    player_folder: PathBuf,
    /// General configuration file.
    #[arg(long, default_value = "config.json")]
    configfile: PathBuf,
    /// Verbosity; repeat for more.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
    /// Write the CPU profile to this file.
    #[arg(long)]
    cpuprofile: Option<PathBuf>,
    /// Allow test users named testN to connect without a password.
    #[arg(long)]
    testuser: bool,
    /// Only load modified chunks, generate air, and save no changes.
    #[arg(long)]
    nocreate: bool,
    /// Log file name.
    #[arg(long, default_value = "worldserver.log")]
    log: PathBuf,
    /// Send the log to standard output instead of the log file.
    #[arg(short = 's', long)]
    stdout: bool,
    /// The file displayed to players at login.
    #[arg(long, default_value = "welcome.txt")]
    welcome: PathBuf,
    /// Run the self test suite and terminate.
    #[arg(long)]
    dotest: bool,
}

fn main() -> ExitCode {

    let args = Args::parse();

    if let Err(e) = init_tracing(&args) {
        eprintln!("log setup failed: {e}");
        return ExitCode::FAILURE;
    }

    if args.cpuprofile.is_some() {
        warn!("cpu profiling is handled by external tooling, flag ignored");
    }

    if args.dotest {
        return self_test();
    }

    let file_cfg = match ConfigFile::load(&args.configfile) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("config file {}: {e}", args.configfile.display());
            return ExitCode::FAILURE;
        }
    };

    let cfg = Config {
        listen_addr: args.listen,
        chunk_folder: args.chunk_folder,
        super_chunk_folder: args.super_folder,
        player_folder: args.player_folder.clone(),
        allow_test_user: args.testuser,
        test_ip_list: file_cfg.test_ip,
        inhibit_create: args.nocreate,
        welcome_file: args.welcome,
        password_salt: file_cfg.password_salt,
    };

    let store = match FileStore::new(&args.player_folder) {
        Ok(store) => Box::new(store),
        Err(e) => {
            error!("player store: {e}");
            return ExitCode::FAILURE;
        }
    };

    let server = match Server::new(cfg, store) {
        Ok(server) => server,
        Err(e) => {
            error!("startup: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = ctrlc::set_handler(|| SHUTDOWN.store(true, Ordering::Relaxed)) {
        error!("signal handler: {e}");
        return ExitCode::FAILURE;
    }

    ticks::spawn_schedulers(&server);

    if let Err(e) = net::spawn_listener(Arc::clone(&server)) {
        error!("listener: {e}");
        return ExitCode::FAILURE;
    }

    info!("server up");
    while server.running() && !SHUTDOWN.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(500));
    }

    server.shutdown();
    ExitCode::SUCCESS

}

/// Initialize tracing to the console or the log file, the verbosity flag
/// setting the default filter.
fn init_tracing(args: &Args) -> anyhow::Result<()> {

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let default = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default))?;

    if args.stdout {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false);
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    } else {
        let file = Arc::new(std::fs::File::options()
            .create(true)
            .append(true)
            .open(&args.log)?);
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .with_writer(move || Arc::clone(&file));
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    }

    Ok(())

}

/// A handful of quick invariant checks runnable in production builds; the
/// real coverage lives in `cargo test`.
fn self_test() -> ExitCode {

    use voxworld::chunk::{decode_rle, encode_rle};
    use voxworld::gen::TerrainGenerator;
    use voxworld::util::rc4::Rc4;

    let mut failed = 0;
    let mut check = |what: &str, ok: bool| {
        if ok {
            info!("ok: {what}");
        } else {
            error!("FAILED: {what}");
            failed += 1;
        }
    };

    let mut data = b"Plaintext".to_vec();
    Rc4::new(b"Key").apply(&mut data);
    check("rc4 vector", data == [0xBB, 0xF3, 0x16, 0xE8, 0xD9, 0x40, 0xAF, 0x0A, 0xD3]);

    let chunk = TerrainGenerator::new(false).generate(glam::IVec3::new(0, 0, 4));
    let decoded = decode_rle(chunk.compressed());
    check("chunk codec round trip", encode_rle(&decoded[..]) == chunk.compressed());

    let again = TerrainGenerator::new(false).generate(glam::IVec3::new(0, 0, 4));
    check("generation determinism", again.checksum == chunk.checksum);

    if failed == 0 {
        info!("self test passed");
        ExitCode::SUCCESS
    } else {
        error!("{failed} self tests failed");
        ExitCode::FAILURE
    }

}
