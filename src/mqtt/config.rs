use rumqttc::MqttOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Username/password pair sent with CONNECT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Credentials are only used when both parts are present and non-empty.
    pub fn from_parts(username: Option<&str>, password: Option<&str>) -> Option<Self> {
        match (username, password) {
            (Some(user), Some(pw)) if !user.is_empty() && !pw.is_empty() => Some(Self {
                username: user.to_string(),
                password: pw.to_string(),
            }),
            _ => None,
        }
    }
}

/// Everything the transport needs to open a session against one broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub keepalive_secs: u64,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    /// Capacity of the request queue between client handle and event loop
    pub request_capacity: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            keepalive_secs: 60,
            client_id: default_client_id(),
            credentials: None,
            request_capacity: 100,
        }
    }
}

impl BrokerSettings {
    pub fn to_mqtt_options(&self) -> MqttOptions {
        // rumqttc rejects ids that are empty or start with whitespace
        let client_id = match self.client_id.trim() {
            "" => default_client_id(),
            id => id.to_string(),
        };
        let mut mqtt_options = MqttOptions::new(client_id, self.host.clone(), self.port);
        mqtt_options.set_keep_alive(Duration::from_secs(self.keepalive_secs.max(1)));
        if let Some(credentials) = &self.credentials {
            mqtt_options.set_credentials(
                credentials.username.clone(),
                credentials.password.clone(),
            );
        }
        mqtt_options
    }
}

pub fn default_client_id() -> String {
    format!("mqttdash-{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_need_both_parts() {
        assert!(Credentials::from_parts(Some("user"), None).is_none());
        assert!(Credentials::from_parts(None, Some("pw")).is_none());
        assert!(Credentials::from_parts(Some(""), Some("pw")).is_none());
        let creds = Credentials::from_parts(Some("user"), Some("pw")).unwrap();
        assert_eq!(creds.username, "user");
    }

    #[test]
    fn test_mqtt_options_carry_settings() {
        let settings = BrokerSettings {
            host: "broker.local".to_string(),
            port: 8883,
            keepalive_secs: 30,
            credentials: Credentials::from_parts(Some("u"), Some("p")),
            ..Default::default()
        };
        let opts = settings.to_mqtt_options();
        assert_eq!(opts.broker_address(), ("broker.local".to_string(), 8883));
        assert_eq!(opts.keep_alive(), Duration::from_secs(30));
        assert!(opts.client_id().starts_with("mqttdash-"));
    }

    #[test]
    fn test_blank_client_id_falls_back_to_default() {
        let settings = BrokerSettings {
            client_id: "   ".to_string(),
            ..Default::default()
        };
        assert_eq!(settings.to_mqtt_options().client_id(), default_client_id());
    }
}
