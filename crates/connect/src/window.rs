use crate::types::WindowId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

static NEXT_WINDOW_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_window_id() -> WindowId {
    WindowId(NEXT_WINDOW_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowFeatures {
    pub width: u32,
    pub height: u32,
}

impl Default for WindowFeatures {
    fn default() -> Self {
        Self {
            width: 500,
            height: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowAccessError {
    /// The window lives under another origin or outside our process and
    /// cannot be inspected.
    #[error("window state is not accessible")]
    Opaque,

    #[error("window operation failed: {0}")]
    Failed(String),
}

/// Handle to a window opened for an authorization flow.
pub trait PopupWindow: Send + Sync {
    fn id(&self) -> WindowId;

    fn is_closed(&self) -> Result<bool, WindowAccessError>;

    fn close(&self) -> Result<(), WindowAccessError>;
}

pub trait PopupLauncher: Send + Sync {
    /// Returns `None` when the host refused to open a window.
    fn open(&self, url: &str, features: &WindowFeatures) -> Option<Arc<dyn PopupWindow>>;
}

/// Full-page navigation used in redirect mode.
pub trait Navigator: Send + Sync {
    fn navigate(&self, url: &str) -> Result<(), WindowAccessError>;
}

/// Opens the authorization URL in the user's default browser.
///
/// A browser tab is outside this process: it can neither be inspected nor
/// closed, so the handle reports [`WindowAccessError::Opaque`] and completion
/// is detected by status polling alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowserLauncher;

struct SystemBrowserWindow {
    id: WindowId,
}

impl PopupWindow for SystemBrowserWindow {
    fn id(&self) -> WindowId {
        self.id
    }

    fn is_closed(&self) -> Result<bool, WindowAccessError> {
        Err(WindowAccessError::Opaque)
    }

    fn close(&self) -> Result<(), WindowAccessError> {
        Err(WindowAccessError::Opaque)
    }
}

impl PopupLauncher for SystemBrowserLauncher {
    fn open(&self, url: &str, features: &WindowFeatures) -> Option<Arc<dyn PopupWindow>> {
        match open::that_detached(url) {
            Ok(()) => {
                let id = next_window_id();
                info!(
                    %id,
                    width = features.width,
                    height = features.height,
                    "Opened authorization window"
                );
                Some(Arc::new(SystemBrowserWindow { id }))
            }
            Err(e) => {
                warn!("Could not open browser: {}", e);
                None
            }
        }
    }
}

/// Redirect-mode navigation for processes without a page of their own:
/// hands the URL to the default browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowserNavigator;

impl Navigator for SystemBrowserNavigator {
    fn navigate(&self, url: &str) -> Result<(), WindowAccessError> {
        info!("Redirecting to authorization URL");
        open::that_detached(url).map_err(|e| WindowAccessError::Failed(e.to_string()))
    }
}
