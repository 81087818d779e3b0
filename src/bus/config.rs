//! Bus configuration with validation and builder support
//!
//! All tunable values are validated domain types; durations are stored as
//! bounded millisecond values with [`Duration`] accessors.

use nutype::nutype;
use std::time::Duration;
use thiserror::Error;

use super::domain_types::{ApplicationName, InstanceName};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed domain validation
    #[error("invalid configuration: {field} - {reason}")]
    ValidationError {
        /// The offending field
        field: String,
        /// Why the value was rejected
        reason: String,
    },

    /// A required field was not provided
    #[error("missing configuration: {field}")]
    MissingField {
        /// The absent field
        field: String,
    },
}

/// Maximum number of deliveries attempted before a message is dead-lettered
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 5
)]
pub struct MaxDeliveryAttempts(u32);

impl MaxDeliveryAttempts {
    /// The raw attempt limit
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Default timeout for namespace operations, in milliseconds
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10_000
)]
pub struct DefaultTimeoutMs(u64);

impl DefaultTimeoutMs {
    /// Converts to a [`Duration`]
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Default window a request waits for its reply, in milliseconds
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10_000
)]
pub struct DefaultResponseTimeoutMs(u64);

impl DefaultResponseTimeoutMs {
    /// Converts to a [`Duration`]
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Default time-to-live stamped on outgoing envelopes, in milliseconds
#[nutype(
    validate(greater_or_equal = 1_000, less_or_equal = 86_400_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 600_000
)]
pub struct MessageTimeToLiveMs(u64);

impl MessageTimeToLiveMs {
    /// Converts to a [`Duration`]
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Peek-lock duration requested on provisioned entities, in milliseconds
#[nutype(
    validate(greater_or_equal = 1_000, less_or_equal = 300_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30_000
)]
pub struct MessageLockDurationMs(u64);

impl MessageLockDurationMs {
    /// Converts to a [`Duration`]
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Idle window after which provisioned entities may be auto-deleted,
/// in milliseconds
#[nutype(
    validate(greater_or_equal = 60_000, less_or_equal = 86_400_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct AutoDeleteOnIdleMs(u64);

impl AutoDeleteOnIdleMs {
    /// Converts to a [`Duration`]
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Namespace prefix prepended to every routed path
#[nutype(
    sanitize(trim, lowercase),
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct GlobalPrefix(String);

/// Complete bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Logical application this instance belongs to
    pub application_name: ApplicationName,
    /// This instance's name within the application
    pub instance_name: InstanceName,
    /// Namespace prefix for all routed paths
    pub global_prefix: GlobalPrefix,
    /// Delivery-count ceiling before dead-lettering
    pub max_delivery_attempts: MaxDeliveryAttempts,
    /// TTL stamped on outgoing envelopes
    pub default_message_time_to_live: MessageTimeToLiveMs,
    /// Idle auto-delete window for provisioned entities, if enabled
    pub auto_delete_on_idle: Option<AutoDeleteOnIdleMs>,
    /// Timeout for namespace operations (bulk fetches, entity creation waits)
    pub default_timeout: DefaultTimeoutMs,
    /// Peek-lock duration requested on provisioned entities
    pub default_message_lock_duration: MessageLockDurationMs,
    /// Whether expired messages should be dead-lettered by the transport
    pub enable_dead_lettering_on_message_expiration: bool,
    /// Window a request waits for its reply when no explicit timeout is given
    pub default_response_timeout: DefaultResponseTimeoutMs,
}

impl BusConfig {
    /// Creates a configuration with defaults for the given identity
    pub fn for_application(
        application: &str,
        instance: &str,
    ) -> Result<Self, ConfigError> {
        Self::builder()
            .application_name(application)
            .instance_name(instance)
            .build()
    }

    /// Starts a configuration builder
    #[must_use]
    pub fn builder() -> BusConfigBuilder {
        BusConfigBuilder::new()
    }
}

/// Builder for [`BusConfig`]
#[derive(Debug, Default)]
pub struct BusConfigBuilder {
    application_name: Option<String>,
    instance_name: Option<String>,
    global_prefix: Option<String>,
    max_delivery_attempts: Option<u32>,
    default_message_time_to_live: Option<Duration>,
    auto_delete_on_idle: Option<Duration>,
    default_timeout: Option<Duration>,
    default_message_lock_duration: Option<Duration>,
    enable_dead_lettering_on_message_expiration: bool,
    default_response_timeout: Option<Duration>,
}

fn validation(field: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl BusConfigBuilder {
    /// Creates an empty builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the application name (required)
    #[must_use]
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Sets the instance name (required)
    #[must_use]
    pub fn instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = Some(name.into());
        self
    }

    /// Sets the namespace prefix (default `nimbus`)
    #[must_use]
    pub fn global_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.global_prefix = Some(prefix.into());
        self
    }

    /// Sets the delivery-count ceiling (default 5)
    #[must_use]
    pub fn max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = Some(attempts);
        self
    }

    /// Sets the default envelope TTL (default 10 minutes)
    #[must_use]
    pub fn default_message_time_to_live(mut self, ttl: Duration) -> Self {
        self.default_message_time_to_live = Some(ttl);
        self
    }

    /// Enables entity auto-delete after the given idle window
    #[must_use]
    pub fn auto_delete_on_idle(mut self, idle: Duration) -> Self {
        self.auto_delete_on_idle = Some(idle);
        self
    }

    /// Sets the namespace operation timeout (default 10 seconds)
    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Sets the peek-lock duration (default 30 seconds)
    #[must_use]
    pub fn default_message_lock_duration(mut self, duration: Duration) -> Self {
        self.default_message_lock_duration = Some(duration);
        self
    }

    /// Asks the transport to dead-letter expired messages
    #[must_use]
    pub fn enable_dead_lettering_on_message_expiration(mut self, enable: bool) -> Self {
        self.enable_dead_lettering_on_message_expiration = enable;
        self
    }

    /// Sets the default reply window for requests (default 10 seconds)
    #[must_use]
    pub fn default_response_timeout(mut self, timeout: Duration) -> Self {
        self.default_response_timeout = Some(timeout);
        self
    }

    /// Validates and builds the configuration
    pub fn build(self) -> Result<BusConfig, ConfigError> {
        let application_name = self
            .application_name
            .ok_or(ConfigError::MissingField {
                field: "application_name".to_string(),
            })
            .and_then(|raw| {
                ApplicationName::try_new(raw).map_err(|e| validation("application_name", e))
            })?;

        let instance_name = self
            .instance_name
            .ok_or(ConfigError::MissingField {
                field: "instance_name".to_string(),
            })
            .and_then(|raw| {
                InstanceName::try_new(raw).map_err(|e| validation("instance_name", e))
            })?;

        let global_prefix = match self.global_prefix {
            Some(raw) => GlobalPrefix::try_new(raw).map_err(|e| validation("global_prefix", e))?,
            None => GlobalPrefix::try_new("nimbus".to_string()).map_err(|e| validation("global_prefix", e))?,
        };

        let max_delivery_attempts = match self.max_delivery_attempts {
            Some(raw) => MaxDeliveryAttempts::try_new(raw)
                .map_err(|e| validation("max_delivery_attempts", e))?,
            None => MaxDeliveryAttempts::default(),
        };

        let default_message_time_to_live = match self.default_message_time_to_live {
            Some(raw) => MessageTimeToLiveMs::try_new(millis(raw))
                .map_err(|e| validation("default_message_time_to_live", e))?,
            None => MessageTimeToLiveMs::default(),
        };

        let auto_delete_on_idle = match self.auto_delete_on_idle {
            Some(raw) => Some(
                AutoDeleteOnIdleMs::try_new(millis(raw))
                    .map_err(|e| validation("auto_delete_on_idle", e))?,
            ),
            None => None,
        };

        let default_timeout = match self.default_timeout {
            Some(raw) => DefaultTimeoutMs::try_new(millis(raw))
                .map_err(|e| validation("default_timeout", e))?,
            None => DefaultTimeoutMs::default(),
        };

        let default_message_lock_duration = match self.default_message_lock_duration {
            Some(raw) => MessageLockDurationMs::try_new(millis(raw))
                .map_err(|e| validation("default_message_lock_duration", e))?,
            None => MessageLockDurationMs::default(),
        };

        let default_response_timeout = match self.default_response_timeout {
            Some(raw) => DefaultResponseTimeoutMs::try_new(millis(raw))
                .map_err(|e| validation("default_response_timeout", e))?,
            None => DefaultResponseTimeoutMs::default(),
        };

        Ok(BusConfig {
            application_name,
            instance_name,
            global_prefix,
            max_delivery_attempts,
            default_message_time_to_live,
            auto_delete_on_idle,
            default_timeout,
            default_message_lock_duration,
            enable_dead_lettering_on_message_expiration: self
                .enable_dead_lettering_on_message_expiration,
            default_response_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = BusConfig::for_application("orders", "orders-1").unwrap();
        assert_eq!(config.max_delivery_attempts.as_u32(), 5);
        assert_eq!(
            config.default_timeout.as_duration(),
            Duration::from_secs(10)
        );
        assert_eq!(
            config.default_response_timeout.as_duration(),
            Duration::from_secs(10)
        );
        assert_eq!(
            config.default_message_time_to_live.as_duration(),
            Duration::from_secs(600)
        );
        assert!(config.auto_delete_on_idle.is_none());
        assert!(!config.enable_dead_lettering_on_message_expiration);
        assert_eq!(config.global_prefix.as_ref(), "nimbus");
    }

    #[test]
    fn builder_rejects_missing_identity() {
        let result = BusConfig::builder().build();
        assert!(matches!(result, Err(ConfigError::MissingField { .. })));
    }

    #[test]
    fn builder_rejects_out_of_range_timeout() {
        let result = BusConfig::builder()
            .application_name("orders")
            .instance_name("orders-1")
            .default_timeout(Duration::from_millis(1))
            .build();
        assert!(matches!(result, Err(ConfigError::ValidationError { .. })));
    }

    #[test]
    fn prefix_is_lowercased() {
        let config = BusConfig::builder()
            .application_name("orders")
            .instance_name("orders-1")
            .global_prefix("Orders.Bus")
            .build()
            .unwrap();
        assert_eq!(config.global_prefix.as_ref(), "orders.bus");
    }
}
