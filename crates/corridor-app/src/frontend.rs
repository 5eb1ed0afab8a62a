//! Presentation frontends, tried in order until one starts.

use std::fmt;

/// Frontend errors.
#[derive(Debug, thiserror::Error)]
pub enum FrontendError {
    /// Every configured frontend failed to start.
    #[error("no frontend could be started (tried: {tried})")]
    Exhausted { tried: String },
}

/// What a frontend needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontendContext {
    pub title: String,
    pub home_url: String,
    /// Published proxy address, when the VPN is ready.
    pub proxy_url: Option<String>,
}

/// Available frontends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendKind {
    /// Opens the home page in the desktop's default browser.
    SystemBrowser,
    /// No window; the local proxy is the product.
    Headless,
}

impl fmt::Display for FrontendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrontendKind::SystemBrowser => f.write_str("system-browser"),
            FrontendKind::Headless => f.write_str("headless"),
        }
    }
}

impl FrontendKind {
    /// Fallback order for the given mode.
    pub fn chain(headless: bool) -> Vec<FrontendKind> {
        if headless {
            vec![FrontendKind::Headless]
        } else {
            vec![FrontendKind::SystemBrowser, FrontendKind::Headless]
        }
    }

    /// Whether traffic of this frontend goes through the published proxy.
    ///
    /// The system browser is a separate program and ignores the proxy
    /// variables of this process.
    pub fn routes_through_proxy(&self) -> bool {
        match self {
            FrontendKind::SystemBrowser => false,
            FrontendKind::Headless => true,
        }
    }

    /// Starts this frontend, returning whether it came up.
    pub fn start(&self, ctx: &FrontendContext) -> bool {
        match self {
            FrontendKind::SystemBrowser => {
                if ctx.home_url.trim().is_empty() {
                    tracing::warn!("No home page configured for {}", ctx.title);
                    return false;
                }
                match open::that(&ctx.home_url) {
                    Ok(()) => {
                        tracing::info!("Opened {} in the system browser", ctx.home_url);
                        if let Some(url) = &ctx.proxy_url {
                            tracing::warn!(
                                "System browser is not routed through the VPN; configure it to use {}",
                                url
                            );
                        }
                        true
                    }
                    Err(e) => {
                        tracing::warn!("Failed to open system browser: {}", e);
                        false
                    }
                }
            }
            FrontendKind::Headless => match &ctx.proxy_url {
                Some(url) => {
                    tracing::info!("{} running headless, proxy available at {}", ctx.title, url);
                    true
                }
                None => {
                    tracing::warn!("Headless mode needs a running proxy");
                    false
                }
            },
        }
    }
}

/// Starts the first frontend in `kinds` that comes up.
pub fn launch_first(kinds: &[FrontendKind], ctx: &FrontendContext) -> Result<FrontendKind, FrontendError> {
    launch_with(kinds, |kind| kind.start(ctx))
}

fn launch_with<F>(kinds: &[FrontendKind], mut start: F) -> Result<FrontendKind, FrontendError>
where
    F: FnMut(FrontendKind) -> bool,
{
    for &kind in kinds {
        tracing::debug!("Trying {} frontend", kind);
        if start(kind) {
            return Ok(kind);
        }
    }

    let tried = kinds
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    tracing::error!("All frontends failed: {}", tried);
    Err(FrontendError::Exhausted { tried })
}
