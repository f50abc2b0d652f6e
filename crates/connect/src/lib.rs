pub mod api;
pub mod coordinator;
pub mod error;
pub mod message;
pub mod mode;
pub mod poller;
pub mod types;
pub mod window;

pub use api::{BackendClient, ConnectionsBackend};
pub use coordinator::{
    AttemptState, ConnectFlow, ConnectSettings, ConnectionAttempt, RaceCoordinator,
};
pub use error::{ApiError, ApiResult, ConnectError};
pub use message::{CallbackMessage, MessageBus, MessageListener, WindowMessage};
pub use mode::{LaunchMode, ModePreference, ModeSelector, RuntimeEnvironment};
pub use types::*;
pub use window::{
    Navigator, PopupLauncher, PopupWindow, SystemBrowserLauncher, SystemBrowserNavigator,
    WindowAccessError, WindowFeatures,
};
