use anyhow::{bail, Context, Result};
use clap::Parser;
use otpval_core::clients::ClientTable;
use otpval_core::device::{DeviceHandle, SoftDevice};
use otpval_core::lexical;
use otpval_core::params::EnabledModes;
use otpval_server::dispatcher::Dispatcher;
use otpval_server::http::{self, AppState};
use otpval_store::OathStore;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_CLIENTS_FILE: &str = "/var/lib/otpval/clients.conf";

/// Budget for one device round-trip sequence.
const DEVICE_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Validate credentials whose secrets live in a hardware trust device.
#[derive(Debug, Parser)]
#[command(name = "otpval-server", version, about)]
struct Args {
    /// Trust device to use ("soft" for the in-memory software device)
    #[arg(short = 'D', long, default_value = "soft")]
    device: String,

    /// Base URL for the validation web service
    #[arg(short = 'U', long, default_value = "/otpval/validate?")]
    serve_url: String,

    /// Enable verbose operation
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Enable debug operation
    #[arg(long)]
    debug: bool,

    /// Port to listen on
    #[arg(long, default_value_t = 8003, value_name = "PORT")]
    port: u16,

    /// Address to bind to
    #[arg(long, default_value = "127.0.0.1", value_name = "ADDR")]
    addr: String,

    /// Key handle to use for creating HMAC-SHA1 hashes
    #[arg(long = "hmac-kh", default_value = "0", value_name = "KEY_HANDLE")]
    hmac_kh: String,

    /// Enable event-OTP validation (KSM style response)
    #[arg(long = "short-otp")]
    mode_short_otp: bool,

    /// Enable event-OTP validation 2.0
    #[arg(long = "otp")]
    mode_otp: bool,

    /// Enable OATH-HOTP validation
    #[arg(long = "hotp")]
    mode_hotp: bool,

    /// Enable OATH-TOTP validation
    #[arg(long = "totp")]
    mode_totp: bool,

    /// Enable password hash validation
    #[arg(long = "pwhash")]
    mode_pwhash: bool,

    /// Database file with per-identity records for --hotp and --totp
    #[arg(long = "db-file", default_value = "/var/lib/otpval/records.db", value_name = "FILENAME")]
    db_file: PathBuf,

    /// File with validation clients' shared secrets, for --otp
    #[arg(long = "clients-file", value_name = "FILENAME")]
    clients_file: Option<PathBuf>,

    /// Number of OATH-HOTP codes to search
    #[arg(long = "hotp-window", default_value_t = 5, value_name = "NUM")]
    hotp_window: u64,

    /// Timeframe in seconds for a valid OATH-TOTP code
    #[arg(long = "totp-interval", default_value_t = 30, value_name = "NUM")]
    totp_interval: u64,

    /// Tolerance in time-steps for a valid OATH-TOTP code
    #[arg(long = "totp-tolerance", default_value_t = 1, value_name = "NUM")]
    totp_tolerance: u64,

    /// PID file
    #[arg(long = "pid-file", value_name = "FILENAME")]
    pid_file: Option<PathBuf>,
}

impl Args {
    fn enabled_modes(&self) -> EnabledModes {
        EnabledModes {
            short_otp: self.mode_short_otp,
            otp: self.mode_otp,
            hotp: self.mode_hotp,
            totp: self.mode_totp,
            pwhash: self.mode_pwhash,
        }
    }
}

fn init_tracing(args: &Args) {
    let default_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Load the client table, distinguishing an explicitly named file (must
/// load) from the default location (tolerated missing).
fn load_clients(args: &Args) -> Result<ClientTable> {
    if let Some(path) = &args.clients_file {
        if !args.mode_otp {
            bail!("clients file should only be used with --otp");
        }
        let table = ClientTable::load(path)
            .with_context(|| format!("failed loading clients file {}", path.display()))?;
        if table.is_empty() {
            bail!("no client entries in {}", path.display());
        }
        Ok(table)
    } else {
        match ClientTable::load(Path::new(DEFAULT_CLIENTS_FILE)) {
            Ok(table) => {
                tracing::info!(
                    path = DEFAULT_CLIENTS_FILE,
                    entries = table.len(),
                    "loaded default clients file"
                );
                Ok(table)
            }
            Err(_) => Ok(ClientTable::default()),
        }
    }
}

fn write_pid_file(path: &Option<PathBuf>) -> Result<()> {
    let Some(path) = path else { return Ok(()) };
    if path.as_os_str().is_empty() {
        // init scripts sometimes pass an empty argument
        return Ok(());
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("failed writing PID file {}", path.display()))
}

fn build_device(args: &Args) -> Result<DeviceHandle> {
    if args.device == "soft" {
        Ok(DeviceHandle::new(
            Box::new(SoftDevice::new()),
            DEVICE_OP_TIMEOUT,
        ))
    } else {
        bail!(
            "unknown device '{}'; hardware transports attach behind the trust-device \
             gateway and only 'soft' is built in",
            args.device
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let modes = args.enabled_modes();
    if !modes.any() {
        bail!("no validation mode enabled");
    }
    if lexical::parse_key_handle(&args.hmac_kh).is_none() {
        bail!("bad key handle '{}'", args.hmac_kh);
    }

    let clients = load_clients(&args)?;
    let device = build_device(&args)?;
    let store = if modes.hotp || modes.totp {
        Some(
            OathStore::open(&args.db_file)
                .await
                .with_context(|| format!("failed opening {}", args.db_file.display()))?,
        )
    } else {
        None
    };

    write_pid_file(&args.pid_file)?;

    let dispatcher = Dispatcher {
        modes,
        clients,
        store,
        device,
        hotp_window: args.hotp_window,
        totp_interval: args.totp_interval,
        totp_tolerance: args.totp_tolerance,
    };
    let state = Arc::new(AppState {
        dispatcher,
        serve_url: args.serve_url.clone(),
    });

    let bind: SocketAddr = format!("{}:{}", args.addr, args.port)
        .parse()
        .with_context(|| format!("bad listen address {}:{}", args.addr, args.port))?;
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(
        "serving requests to 'http://{}{}' (device: '{}')",
        bind,
        args.serve_url,
        args.device
    );

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("server error")?;
    Ok(())
}
