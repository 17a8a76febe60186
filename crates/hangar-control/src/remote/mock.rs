//! In-process transport for tests and platform-less runs.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use super::{CommandOutput, RemoteSession, RemoteTransport};
use crate::error::{ControlError, ControlResult};

static UNIT_FILE_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"cat > /etc/systemd/system/([A-Za-z0-9_.@-]+\.service)").ok()
});

/// How a [`MockTransport`] answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockTransportMode {
    /// Accept every connection; every command succeeds.
    Accept,
    /// Refuse every connection.
    Refuse,
    /// Accept connections; commands containing the pattern exit non-zero.
    FailCommand(String),
}

#[derive(Debug)]
struct MockState {
    mode: MockTransportMode,
    connect_delay: Duration,
    connect_attempts: usize,
    commands: Vec<(String, String)>,
    units: HashMap<String, BTreeSet<String>>,
}

/// Transport that records commands instead of running them.
///
/// Unit files written by a command are tracked per address, so a test can
/// tell how many services a guest would have registered.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a mock transport.
    #[must_use]
    pub fn new(mode: MockTransportMode) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                mode,
                connect_delay: Duration::ZERO,
                connect_attempts: 0,
                commands: Vec::new(),
                units: HashMap::new(),
            })),
        }
    }

    /// Change how the transport answers.
    pub fn set_mode(&self, mode: MockTransportMode) {
        if let Ok(mut state) = self.state.lock() {
            state.mode = mode;
        }
    }

    /// Delay every connection attempt by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.connect_delay = delay;
        }
    }

    /// Connection attempts so far.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().map(|s| s.connect_attempts).unwrap_or(0)
    }

    /// Commands run so far, as `(address, script)` pairs.
    #[must_use]
    pub fn commands(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .map(|s| s.commands.clone())
            .unwrap_or_default()
    }

    /// Service units registered on `address`.
    #[must_use]
    pub fn units(&self, address: &str) -> BTreeSet<String> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.units.get(address).cloned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn connect(&self, address: &str) -> ControlResult<Box<dyn RemoteSession>> {
        let (delay, mode) = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| ControlError::internal("lock poisoned"))?;
            state.connect_attempts += 1;
            (state.connect_delay, state.mode.clone())
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if mode == MockTransportMode::Refuse {
            return Err(ControlError::internal(format!(
                "connection to {address} refused"
            )));
        }

        Ok(Box::new(MockSession {
            address: address.to_owned(),
            transport: self.clone(),
        }))
    }
}

struct MockSession {
    address: String,
    transport: MockTransport,
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn run(&self, script: &str) -> ControlResult<CommandOutput> {
        let mut state = self
            .transport
            .state
            .lock()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        state
            .commands
            .push((self.address.clone(), script.to_owned()));

        if let MockTransportMode::FailCommand(pattern) = &state.mode {
            if script.contains(pattern.as_str()) {
                return Ok(CommandOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: format!("mock failure on {pattern}"),
                });
            }
        }

        let units: Vec<String> = UNIT_FILE_PATTERN
            .as_ref()
            .map(|re| {
                re.captures_iter(script)
                    .filter_map(|c| c.get(1).map(|m| m.as_str().to_owned()))
                    .collect()
            })
            .unwrap_or_default();
        state
            .units
            .entry(self.address.clone())
            .or_default()
            .extend(units);

        Ok(CommandOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}
