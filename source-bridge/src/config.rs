//! Configuration structures for clients and handshakes.

use crate::messaging::Counterpart;
use std::time::Duration;

/// Configuration of one transport client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Label used in log lines (e.g. `"host"`, `"guest"`).
    pub label: String,

    /// The only context this client exchanges envelopes with.
    pub counterpart: Counterpart,
}

impl ClientConfig {
    /// Configuration talking to `counterpart`, labelled `"bridge"`.
    pub fn new(counterpart: Counterpart) -> Self {
        Self {
            label: "bridge".to_string(),
            counterpart,
        }
    }

    /// Set the log label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Deadlines the host enforces on the guest handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Time allowed between `boot()` and the guest's `hello`.
    pub hello_timeout: Duration,

    /// Time allowed between `boot()` and the guest's `ready`.
    ///
    /// Measured from boot, not from `hello`, so it normally exceeds
    /// `hello_timeout`.
    pub ready_timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            hello_timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(15),
        }
    }
}

impl HandshakeConfig {
    /// Create a configuration with explicit deadlines.
    pub fn new(hello_timeout: Duration, ready_timeout: Duration) -> Self {
        Self {
            hello_timeout,
            ready_timeout,
        }
    }

    /// Set the hello deadline.
    pub fn with_hello_timeout(mut self, timeout: Duration) -> Self {
        self.hello_timeout = timeout;
        self
    }

    /// Set the ready deadline.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }
}
