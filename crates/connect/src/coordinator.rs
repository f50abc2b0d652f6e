//! Drives one OAuth connection attempt from authorization request to a
//! single [`ConnectionOutcome`].
//!
//! Two unreliable channels report completion: a callback message posted by
//! the authorization window and a status poll against the backend. The first
//! success wins. A failure on one channel is held until the other channel has
//! also settled, so a late success is still honoured; the hard deadline
//! guarantees the attempt ends either way.

use crate::api::ConnectionsBackend;
use crate::error::ConnectError;
use crate::message::{MessageBus, MessageListener};
use crate::mode::{LaunchMode, ModePreference, ModeSelector, RuntimeEnvironment};
use crate::poller::{PollerHandle, StatusPoller, MIN_INTERVAL};
use crate::types::{ChannelResult, ConnectionOutcome, ConnectionRequest};
use crate::window::{Navigator, PopupLauncher, PopupWindow, WindowFeatures};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub closed_check_interval: Duration,
    pub window: WindowFeatures,
    pub mode: ModePreference,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
            closed_check_interval: Duration::from_millis(500),
            window: WindowFeatures::default(),
            mode: ModePreference::Auto,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFlow {
    /// The page navigated away; the callback route picks things up later.
    Redirected { authorization_url: String },
    Completed(ConnectionOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Idle,
    Requesting,
    Launched,
    Racing,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Message,
    Poll,
}

pub struct RaceCoordinator {
    backend: Arc<dyn ConnectionsBackend>,
    launcher: Arc<dyn PopupLauncher>,
    navigator: Arc<dyn Navigator>,
    bus: MessageBus,
    settings: ConnectSettings,
}

impl RaceCoordinator {
    pub fn new(
        backend: Arc<dyn ConnectionsBackend>,
        launcher: Arc<dyn PopupLauncher>,
        navigator: Arc<dyn Navigator>,
        bus: MessageBus,
    ) -> Self {
        Self {
            backend,
            launcher,
            navigator,
            bus,
            settings: ConnectSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ConnectSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Channel the host feeds with messages from the windows it opened.
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub async fn connect(
        &self,
        request: &ConnectionRequest,
        env: &RuntimeEnvironment,
    ) -> ConnectFlow {
        let mut state = AttemptState::Idle;
        transition(request, &mut state, AttemptState::Requesting);

        let grant = match self.backend.authorize(request).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!(%request, "Authorization request failed: {}", e);
                return failed(request, ConnectError::AuthInitiation(e.to_string()));
            }
        };
        if let Err(e) = Url::parse(&grant.authorization_url) {
            warn!(%request, "Backend returned an invalid authorization URL: {}", e);
            return failed(
                request,
                ConnectError::AuthInitiation(format!("invalid authorization URL: {e}")),
            );
        }

        let mode = ModeSelector::new(self.settings.mode).select(env);
        if mode == LaunchMode::Redirect {
            info!(%request, "Using redirect mode");
            if let Err(e) = self.navigator.navigate(&grant.authorization_url) {
                warn!(%request, "Navigation reported an error: {}", e);
            }
            return ConnectFlow::Redirected {
                authorization_url: grant.authorization_url,
            };
        }

        let subscription = self.bus.subscribe();
        let Some(window) = self
            .launcher
            .open(&grant.authorization_url, &self.settings.window)
        else {
            warn!(%request, "Popup was blocked");
            return failed(request, ConnectError::PopupBlocked);
        };
        transition(request, &mut state, AttemptState::Launched);

        let listener = MessageListener::new(subscription, window.id(), request.provider.clone());
        let attempt = ConnectionAttempt::start(
            request.clone(),
            window,
            listener,
            self.backend.clone(),
            &self.settings,
        );
        ConnectFlow::Completed(attempt.race(self.settings.closed_check_interval).await)
    }
}

fn failed(request: &ConnectionRequest, error: ConnectError) -> ConnectFlow {
    ConnectFlow::Completed(ConnectionOutcome::failed(request.provider.clone(), error))
}

fn transition(request: &ConnectionRequest, state: &mut AttemptState, next: AttemptState) {
    debug!(%request, from = ?*state, to = ?next, "Attempt state change");
    *state = next;
}

/// Live record of one attempt while it races.
///
/// The outcome slot is written once; every later write is rejected. Teardown
/// of the listener, the poller and the window happens in the same step as
/// that write.
pub struct ConnectionAttempt {
    request: ConnectionRequest,
    window: Arc<dyn PopupWindow>,
    deadline: Instant,
    timeout: Duration,
    listener: MessageListener,
    poller: PollerHandle,
    state: AttemptState,
    outcome: Option<ConnectionOutcome>,
    message_failure: Option<ConnectError>,
    poll_failure: Option<ConnectError>,
    message_settled: bool,
    poll_settled: bool,
    window_closed: bool,
    torn_down: bool,
}

impl ConnectionAttempt {
    pub fn start(
        request: ConnectionRequest,
        window: Arc<dyn PopupWindow>,
        listener: MessageListener,
        backend: Arc<dyn ConnectionsBackend>,
        settings: &ConnectSettings,
    ) -> Self {
        let deadline = Instant::now() + settings.timeout;
        let poller = StatusPoller::new(
            backend,
            request.clone(),
            settings.poll_interval,
            settings.timeout,
        )
        .with_deadline(deadline)
        .spawn();
        info!(
            %request,
            window = %window.id(),
            "Racing callback message against status poll"
        );
        Self {
            request,
            window,
            deadline,
            timeout: settings.timeout,
            listener,
            poller,
            state: AttemptState::Launched,
            outcome: None,
            message_failure: None,
            poll_failure: None,
            message_settled: false,
            poll_settled: false,
            window_closed: false,
            torn_down: false,
        }
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn outcome(&self) -> Option<&ConnectionOutcome> {
        self.outcome.as_ref()
    }

    pub async fn race(mut self, closed_check_interval: Duration) -> ConnectionOutcome {
        transition(&self.request, &mut self.state, AttemptState::Racing);
        let closed_check_interval = closed_check_interval.max(MIN_INTERVAL);
        let mut watcher = time::interval_at(
            Instant::now() + closed_check_interval,
            closed_check_interval,
        );
        watcher.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = time::sleep_until(self.deadline);
        tokio::pin!(deadline);

        loop {
            if let Some(outcome) = &self.outcome {
                return outcome.clone();
            }
            tokio::select! {
                biased;
                result = self.listener.next(), if !self.message_settled => {
                    self.settle(Channel::Message, result);
                }
                result = self.poller.settled(), if !self.poll_settled => {
                    self.settle(Channel::Poll, result);
                }
                _ = watcher.tick(), if !self.window_closed => self.check_window(),
                _ = &mut deadline => self.expire(),
            }
        }
    }

    fn settle(&mut self, channel: Channel, result: ChannelResult) {
        match result {
            ChannelResult::Success { email } => {
                info!(request = %self.request, ?channel, "Connection succeeded");
                self.resolve(ConnectionOutcome::succeeded(self.request.provider.clone(), email));
            }
            ChannelResult::Failure(error) => {
                info!(request = %self.request, ?channel, %error, "Channel settled with failure");
                match channel {
                    Channel::Message => {
                        self.message_settled = true;
                        self.message_failure = Some(error);
                        self.listener.unsubscribe();
                    }
                    Channel::Poll => {
                        self.poll_settled = true;
                        self.poll_failure = Some(error);
                    }
                }
                if self.message_settled && self.poll_settled {
                    let error = self
                        .reported_failure()
                        .unwrap_or(ConnectError::Timeout(self.timeout));
                    self.resolve(ConnectionOutcome::failed(self.request.provider.clone(), error));
                }
            }
        }
    }

    fn check_window(&mut self) {
        match self.window.is_closed() {
            Ok(true) => self.on_window_closed(),
            Ok(false) => {}
            // cross-origin windows refuse inspection while on the provider's pages
            Err(e) => debug!(window = %self.window.id(), "Cannot inspect window: {}", e),
        }
    }

    fn on_window_closed(&mut self) {
        if self.window_closed {
            return;
        }
        self.window_closed = true;
        info!(request = %self.request, "Authorization window closed");
        if !self.poll_settled {
            self.poller.request_final_check();
        }
        if !self.message_settled {
            self.settle(Channel::Message, ChannelResult::Failure(ConnectError::WindowClosed));
        }
    }

    fn expire(&mut self) {
        let error = self
            .reported_failure()
            .unwrap_or(ConnectError::Timeout(self.timeout));
        warn!(request = %self.request, %error, "Connection attempt hit its deadline");
        self.resolve(ConnectionOutcome::failed(self.request.provider.clone(), error));
    }

    fn reported_failure(&self) -> Option<ConnectError> {
        [&self.message_failure, &self.poll_failure]
            .into_iter()
            .flatten()
            .min_by_key(|e| e.precedence())
            .cloned()
    }

    /// Writes the outcome if none has been written yet, then tears down.
    /// Returns whether this call won.
    pub fn resolve(&mut self, outcome: ConnectionOutcome) -> bool {
        if self.outcome.is_some() {
            debug!(
                request = %self.request,
                "Ignoring outcome for an already resolved attempt"
            );
            return false;
        }
        self.outcome = Some(outcome);
        transition(&self.request, &mut self.state, AttemptState::Resolved);
        self.cleanup();
        true
    }

    /// Releases the listener, the poller and the window. Idempotent.
    pub fn cleanup(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.listener.unsubscribe();
        self.poller.stop();
        if !matches!(self.window.is_closed(), Ok(true)) {
            if let Err(e) = self.window.close() {
                debug!(window = %self.window.id(), "Could not close window: {}", e);
            }
        }
    }
}

impl Drop for ConnectionAttempt {
    fn drop(&mut self) {
        self.cleanup();
    }
}
