//! Link configuration.
//!
//! [`PeripheralConfiguration`] is the static map from service to required
//! characteristics for a deployment profile, built once from the fixed
//! UUID set. [`LinkConfig`] carries the tunable timeouts and policies of a
//! running link.

use std::time::Duration;

use uuid::Uuid;

use glucolink_types::uuid::{
    AUTHENTICATION, BACKFILL, COMMUNICATION, CONTROL, SENSOR_NAME_PREFIX, SENSOR_SERVICE,
};

use crate::error::{Error, Result};

/// Default bound on a single command's callback wait.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Default bound on the authentication handshake, which waits on the
/// sensor's own challenge cycle rather than an immediate response.
const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default pause before rescanning after an unplanned disconnect.
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// One service and the characteristics the link requires from it.
#[derive(Debug, Clone)]
pub struct ServiceConfiguration {
    /// The service UUID.
    pub service: Uuid,
    /// Characteristics that must be discovered under this service.
    pub characteristics: Vec<Uuid>,
    /// Subset of `characteristics` that must be subscribed for
    /// notifications as part of base configuration.
    pub notifying: Vec<Uuid>,
}

/// Static service/characteristic requirements for a sensor generation.
///
/// Immutable once constructed; the session applies it idempotently, only
/// discovering what is not already known.
#[derive(Debug, Clone)]
pub struct PeripheralConfiguration {
    services: Vec<ServiceConfiguration>,
}

impl PeripheralConfiguration {
    /// The fixed profile for the supported sensor hardware generation.
    ///
    /// The communication characteristic notifies for the life of the
    /// connection; authentication, control and backfill notifications are
    /// enabled individually as the protocol sequence advances.
    pub fn sensor_default() -> Self {
        Self {
            services: vec![ServiceConfiguration {
                service: SENSOR_SERVICE,
                characteristics: vec![COMMUNICATION, CONTROL, AUTHENTICATION, BACKFILL],
                notifying: vec![COMMUNICATION],
            }],
        }
    }

    /// Build a configuration from explicit service requirements.
    pub fn new(services: Vec<ServiceConfiguration>) -> Self {
        Self { services }
    }

    /// The configured services.
    pub fn services(&self) -> &[ServiceConfiguration] {
        &self.services
    }

    /// Whether `characteristic` is part of the base notifying set.
    pub fn requires_notify(&self, characteristic: Uuid) -> bool {
        self.services
            .iter()
            .any(|s| s.notifying.contains(&characteristic))
    }

    /// Validate internal consistency: every notifying characteristic must
    /// also be listed for discovery.
    pub fn validate(&self) -> Result<()> {
        for service in &self.services {
            for notifying in &service.notifying {
                if !service.characteristics.contains(notifying) {
                    return Err(Error::InvalidConfiguration(format!(
                        "notifying characteristic {notifying} not listed for service {}",
                        service.service
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for PeripheralConfiguration {
    fn default() -> Self {
        Self::sensor_default()
    }
}

/// Tunable parameters of a sensor link.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use glucolink_core::config::LinkConfig;
///
/// let config = LinkConfig::default()
///     .command_timeout(Duration::from_secs(5))
///     .reconnect_delay(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Bound on a single command's callback wait.
    pub command_timeout: Duration,
    /// Bound on the authentication handshake wait.
    pub auth_timeout: Duration,
    /// Pause before rescanning after an unplanned disconnect.
    pub reconnect_delay: Duration,
    /// Advertised-name prefix a peripheral must carry to be considered.
    pub name_prefix: String,
    /// Capacity of the broadcast event channel.
    pub event_buffer: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            name_prefix: SENSOR_NAME_PREFIX.to_string(),
            event_buffer: 64,
        }
    }
}

impl LinkConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-command timeout.
    #[must_use]
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the authentication handshake timeout.
    #[must_use]
    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Set the delay before rescanning after an unplanned disconnect.
    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the advertised-name prefix to match.
    #[must_use]
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Set the broadcast event channel capacity.
    #[must_use]
    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout.is_zero() {
            return Err(Error::InvalidConfiguration(
                "command_timeout must be > 0".to_string(),
            ));
        }
        if self.name_prefix.is_empty() {
            return Err(Error::InvalidConfiguration(
                "name_prefix must not be empty".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(Error::InvalidConfiguration(
                "event_buffer must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
