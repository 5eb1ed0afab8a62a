//! Corridor - browser shell routed through a VLESS/REALITY tunnel.
//!
//! This is the main binary:
//! - Loads settings and the connection URI
//! - Brings up the Xray-backed local SOCKS proxy in the background
//! - Opens the first frontend that starts
//! - Stops the proxy on Ctrl-C

use std::panic;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use corridor_app::frontend::{launch_first, FrontendContext, FrontendKind};
use corridor_app::logs_dir;
use corridor_app::settings::AppSettings;
use corridor_core::{
    ConnectionDescriptor, Layout, SupervisorConfig, UriSource, VpnService, VpnStatus,
};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Corridor - browser shell routed through a VLESS/REALITY tunnel
#[derive(Parser, Debug)]
#[command(name = "corridor", version, about)]
struct Args {
    /// Run without starting the VPN
    #[arg(long)]
    no_vpn: bool,

    /// Path to the settings file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Do not open a browser, only provide the local proxy
    #[arg(long)]
    headless: bool,
}

/// Initialize logging with file rotation.
fn init_logging(
    args: &Args,
    settings: &AppSettings,
    layout: &Layout,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug {
        "debug"
    } else {
        args.log_level.as_deref().unwrap_or(&settings.logging.level)
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "corridor={0},corridor_app={0},corridor_core={0},xray={0},warn",
            log_level
        ))
    });

    if let Some(log_dir) = logs_dir(layout) {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(settings.logging.max_files.max(1))
                .filename_prefix("corridor")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                if args.debug || args.headless {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(fmt::layer().with_writer(std::io::stdout))
                        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                        .init();
                } else {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                        .init();
                }

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Starts the VPN in the background and waits a bounded time for it.
async fn start_vpn(
    layout: &Layout,
    settings: &AppSettings,
) -> anyhow::Result<(Arc<VpnService>, VpnStatus)> {
    let (source, uri) = UriSource::discover(&layout.uri_files());
    tracing::info!("Connection URI source: {}", source);
    let descriptor = ConnectionDescriptor::parse_with_base(&uri, &settings.vpn);

    let service = Arc::new(VpnService::for_layout(layout, SupervisorConfig::default()));
    if let Some(interval) = settings.proxy.watchdog_interval() {
        service.supervisor().spawn_watchdog(interval);
    }

    // Publishing happens here, on the main task, before any frontend starts
    let rx = Arc::clone(&service).spawn(descriptor);
    match service.await_startup(rx, settings.proxy.ready_timeout()).await {
        Ok(status) => Ok((service, status)),
        Err(e) => {
            service.shutdown().await;
            Err(e).context("VPN startup failed")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let layout = Layout::detect().context("Failed to resolve application directories")?;
    let settings_path = args
        .config
        .clone()
        .unwrap_or_else(|| layout.settings_path());
    let (settings, settings_warning) = AppSettings::load_or_create(&settings_path);

    // Keep the guard alive for the duration of the program
    let _log_guard = init_logging(&args, &settings, &layout);

    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        tracing::error!("PANIC: {}", panic_info);
        default_hook(panic_info);
    }));

    tracing::info!("Starting Corridor v{}...", env!("CARGO_PKG_VERSION"));
    tracing::info!("Args: {:?}", args);
    tracing::info!("Settings: {:?}", settings_path);
    if let Some(warning) = settings_warning {
        tracing::warn!("{}", warning);
    }

    let (service, status) = if args.no_vpn || !settings.proxy.enabled {
        tracing::info!("VPN disabled, browsing directly");
        (None, VpnStatus::Disabled)
    } else {
        let (service, status) = start_vpn(&layout, &settings).await?;
        (Some(service), status)
    };
    tracing::info!("VPN status: {:?}", status);

    let ctx = FrontendContext {
        title: settings.browser.title.clone(),
        home_url: settings.browser.home_url.clone(),
        proxy_url: match &status {
            VpnStatus::Ready { proxy_url, .. } => Some(proxy_url.clone()),
            _ => None,
        },
    };

    let frontend = match launch_first(&FrontendKind::chain(args.headless), &ctx) {
        Ok(kind) => kind,
        Err(e) => {
            if let Some(service) = &service {
                service.shutdown().await;
            }
            return Err(e.into());
        }
    };
    tracing::info!("Frontend {} started, press Ctrl-C to exit", frontend);
    if !frontend.routes_through_proxy() {
        if let Some(url) = &ctx.proxy_url {
            tracing::info!("Local proxy for other applications: {}", url);
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
    }

    tracing::info!("Shutting down...");
    if let Some(service) = &service {
        service.shutdown().await;
    }

    Ok(())
}
