use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    pub address: String,
    pub friendly_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub app_id: String,
    pub app_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedMatch {
    pub app_id: String,
    pub app_name: String,
    /// Percentage, rounded to two decimals.
    pub similarity: f64,
}

/// Result of one `connect` call as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    AlreadyConnected,
    Connected,
    Unauthorized,
    TimedOut,
    InternalError(String),
}

impl ConnectOutcome {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::AlreadyConnected | Self::Connected => 200,
            Self::Unauthorized => 401,
            Self::TimedOut => 402,
            Self::InternalError(_) => 500,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::AlreadyConnected => "ADB is already connected to the device.".to_string(),
            Self::Connected => "ADB connection successful.".to_string(),
            Self::Unauthorized => {
                "ADB connection unauthorized. Please allow access on the device.".to_string()
            }
            Self::TimedOut => {
                "Connection attempt timed out. Please check your device and network.".to_string()
            }
            Self::InternalError(detail) => format!("Error: {detail}"),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::AlreadyConnected | Self::Connected)
    }

    pub fn to_response(&self) -> ConnectResponse {
        ConnectResponse {
            status_code: self.status_code(),
            message: self.message(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectResponse {
    pub status_code: u16,
    pub message: String,
}

/// Reply frame of the raw key-command channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawCommandReply {
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl RawCommandReply {
    pub fn ok() -> Self {
        Self {
            status_code: 200,
            error_message: None,
        }
    }

    pub fn invalid_command() -> Self {
        Self {
            status_code: 400,
            error_message: Some("Invalid command.".to_string()),
        }
    }

    pub fn failed(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code,
            error_message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TextRequest {
    #[serde(default)]
    pub text: String,
}

/// Reply frame of the free-text channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TextReply {
    Launched {
        text: String,
        matches: Vec<ResolvedMatch>,
        message: String,
    },
    LaunchFailed {
        text: String,
        matches: Vec<ResolvedMatch>,
        error: String,
    },
    Command {
        text: String,
        command: String,
        output: String,
    },
    CommandFailed {
        text: String,
        command: String,
        error: String,
    },
    NoMatch {
        text: String,
        matches: Vec<ResolvedMatch>,
        message: String,
    },
    Error {
        error: String,
    },
}

impl TextReply {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovered_device_uses_camel_case_keys() {
        let device = DiscoveredDevice {
            address: "192.168.1.20:5555".to_string(),
            friendly_name: Some("Living Room".to_string()),
        };
        let json = serde_json::to_value(&device).unwrap();
        assert_eq!(json["address"], "192.168.1.20:5555");
        assert_eq!(json["friendlyName"], "Living Room");
    }

    #[test]
    fn connect_outcomes_map_to_distinct_codes() {
        assert_eq!(ConnectOutcome::AlreadyConnected.status_code(), 200);
        assert_eq!(ConnectOutcome::Connected.status_code(), 200);
        assert_eq!(ConnectOutcome::Unauthorized.status_code(), 401);
        assert_eq!(ConnectOutcome::TimedOut.status_code(), 402);
        assert_eq!(
            ConnectOutcome::InternalError("boom".to_string()).status_code(),
            500
        );
        assert!(ConnectOutcome::AlreadyConnected.is_connected());
        assert!(!ConnectOutcome::TimedOut.is_connected());
    }

    #[test]
    fn raw_reply_omits_missing_error() {
        let ok = serde_json::to_string(&RawCommandReply::ok()).unwrap();
        assert_eq!(ok, r#"{"status_code":200}"#);
        let bad = serde_json::to_value(RawCommandReply::invalid_command()).unwrap();
        assert_eq!(bad["status_code"], 400);
        assert_eq!(bad["error_message"], "Invalid command.");
    }

    #[test]
    fn text_reply_serializes_without_variant_tag() {
        let reply = TextReply::Command {
            text: "volume up".to_string(),
            command: "volume up".to_string(),
            output: String::new(),
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["command"], "volume up");
        assert!(json.get("Command").is_none());

        let err = serde_json::to_value(TextReply::error("No text provided.")).unwrap();
        assert_eq!(err, serde_json::json!({ "error": "No text provided." }));
    }

    #[test]
    fn text_request_defaults_missing_text() {
        let req: TextRequest = serde_json::from_str("{}").unwrap();
        assert!(req.text.is_empty());
    }
}
