//! Options accepted by connect and the create/send operations.

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{BridgeError, BridgeResult};
use crate::native::{LoginRequest, MessageForm, Qos, Timestamp};
use crate::session::SaturationPolicy;

pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_GD_MAX_OUTSTANDING: u32 = 1000;

/// Options for [`connect`](crate::session::connect).
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub username: String,
    pub password: String,
    pub primary_tmx: String,
    pub secondary_tmx: Option<String>,
    pub timeout: Duration,
    /// Enables guaranteed delivery when set.
    pub gd_client_name: Option<String>,
    /// Capacity of the GD ack window.
    pub gd_max_outstanding: u32,
    pub gd_saturation: SaturationPolicy,
}

impl ConnectOptions {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        primary_tmx: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            primary_tmx: primary_tmx.into(),
            secondary_tmx: None,
            timeout: DEFAULT_LOGIN_TIMEOUT,
            gd_client_name: None,
            gd_max_outstanding: DEFAULT_GD_MAX_OUTSTANDING,
            gd_saturation: SaturationPolicy::default(),
        }
    }

    pub fn with_secondary_tmx(mut self, tmx: impl Into<String>) -> Self {
        self.secondary_tmx = Some(tmx.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_guaranteed_delivery(
        mut self,
        client_name: impl Into<String>,
        max_outstanding: u32,
    ) -> Self {
        self.gd_client_name = Some(client_name.into());
        self.gd_max_outstanding = max_outstanding;
        self
    }

    pub fn with_saturation_policy(mut self, policy: SaturationPolicy) -> Self {
        self.gd_saturation = policy;
        self
    }

    pub fn gd_enabled(&self) -> bool {
        self.gd_client_name.is_some()
    }

    pub(crate) fn validate(&self) -> BridgeResult<()> {
        if self.username.is_empty() || self.password.is_empty() || self.primary_tmx.is_empty() {
            return Err(BridgeError::invalid_argument(
                "Incomplete options: username, password and primaryTmx are required",
            ));
        }
        if let Some(name) = &self.gd_client_name {
            if name.is_empty() {
                return Err(BridgeError::invalid_argument("GD client name must not be empty"));
            }
            if self.gd_max_outstanding == 0 {
                return Err(BridgeError::invalid_argument(
                    "GD max outstanding must be at least 1",
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn login_request(&self) -> LoginRequest {
        LoginRequest {
            username: self.username.clone(),
            password: self.password.clone(),
            primary_tmx: self.primary_tmx.clone(),
            secondary_tmx: self.secondary_tmx.clone().filter(|tmx| !tmx.is_empty()),
            timeout: self.timeout,
        }
    }
}

/// Acknowledgment mode of a GD subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// Acknowledge after every "message" listener ran
    #[default]
    Auto,
    /// The application calls `Subscription::acknowledge`
    Manual,
}

impl FromStr for AckMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(AckMode::Auto),
            "manual" => Ok(AckMode::Manual),
            _ => Err(BridgeError::invalid_argument(format!(
                "Invalid ack mode '{s}' (expected auto or manual)"
            ))),
        }
    }
}

/// Options for `Session::create_subscription`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionOptions {
    pub qos: Qos,
    /// Durable subscription name, required for GD.
    pub name: Option<String>,
    pub ack_mode: AckMode,
}

impl SubscriptionOptions {
    pub fn best_effort() -> Self {
        Self {
            qos: Qos::BestEffort,
            ..Self::default()
        }
    }

    pub fn guaranteed_delivery(name: impl Into<String>, ack_mode: AckMode) -> Self {
        Self {
            qos: Qos::GuaranteedDelivery,
            name: Some(name.into()),
            ack_mode,
        }
    }

    pub(crate) fn validate(&self) -> BridgeResult<()> {
        if self.qos.is_guaranteed_delivery()
            && self.name.as_deref().is_none_or(str::is_empty)
        {
            return Err(BridgeError::invalid_argument(
                "Incomplete options: GD subscriptions require a name",
            ));
        }
        Ok(())
    }

    /// Native cache period for non-GD subscriptions.
    pub(crate) fn cache_period_ms(&self) -> u32 {
        match self.qos {
            Qos::BestEffort => 50,
            _ => 3000,
        }
    }
}

/// Time range of a replay, `[start_time, end_time)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOptions {
    pub start_time: Timestamp,
    pub end_time: Timestamp,
}

impl ReplayOptions {
    pub fn new(start_time: Timestamp, end_time: Timestamp) -> Self {
        Self {
            start_time,
            end_time,
        }
    }

    pub(crate) fn validate(&self) -> BridgeResult<()> {
        if self.end_time < self.start_time {
            return Err(BridgeError::invalid_argument(
                "Replay endTime must not precede startTime",
            ));
        }
        Ok(())
    }
}

/// Options for `Publication::send_message`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub form: MessageForm,
}

impl SendOptions {
    pub fn self_describing() -> Self {
        Self {
            form: MessageForm::SelfDescribing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_requires_credentials_and_primary() {
        assert!(ConnectOptions::new("u", "p", "tmx1").validate().is_ok());
        for options in [
            ConnectOptions::new("", "p", "tmx1"),
            ConnectOptions::new("u", "", "tmx1"),
            ConnectOptions::new("u", "p", ""),
        ] {
            assert!(matches!(
                options.validate(),
                Err(BridgeError::InvalidArgument { .. })
            ));
        }
    }

    #[test]
    fn connect_defaults() {
        let options = ConnectOptions::new("u", "p", "tmx1");
        assert_eq!(options.timeout, Duration::from_secs(30));
        assert_eq!(options.gd_max_outstanding, 1000);
        assert!(!options.gd_enabled());
    }

    #[test]
    fn gd_window_must_not_be_empty() {
        let options = ConnectOptions::new("u", "p", "tmx1").with_guaranteed_delivery("client", 0);
        assert!(options.validate().is_err());
    }

    #[test]
    fn empty_secondary_is_not_sent_to_login() {
        let options = ConnectOptions::new("u", "p", "tmx1").with_secondary_tmx("");
        assert_eq!(options.login_request().secondary_tmx, None);
    }

    #[test]
    fn gd_subscription_requires_name() {
        let mut options = SubscriptionOptions::guaranteed_delivery("durable", AckMode::Auto);
        assert!(options.validate().is_ok());
        options.name = None;
        assert!(options.validate().is_err());
        options.name = Some(String::new());
        assert!(options.validate().is_err());
    }

    #[test]
    fn cache_period_depends_on_qos() {
        assert_eq!(SubscriptionOptions::best_effort().cache_period_ms(), 50);
        assert_eq!(SubscriptionOptions::default().cache_period_ms(), 3000);
    }

    #[test]
    fn ack_mode_parses() {
        assert_eq!("Manual".parse::<AckMode>().unwrap(), AckMode::Manual);
        assert!("later".parse::<AckMode>().is_err());
    }

    #[test]
    fn replay_range_must_be_ordered() {
        let early = Timestamp::from_millis(1);
        let late = Timestamp::from_millis(2);
        assert!(ReplayOptions::new(early, late).validate().is_ok());
        assert!(ReplayOptions::new(late, early).validate().is_err());
    }
}
