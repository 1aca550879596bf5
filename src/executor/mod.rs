use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// An instruction the device can carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// `input keyevent <code>`; numeric or `KEYCODE_*` names.
    KeyEvent(&'static str),
    /// `am start -n <package/activity>`
    StartComponent(&'static str),
    /// `am start -a <intent action>`
    StartIntent(&'static str),
    /// Launch an installed package by id.
    LaunchApp(String),
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyEvent(code) => write!(f, "keyevent {code}"),
            Self::StartComponent(component) => write!(f, "start {component}"),
            Self::StartIntent(intent) => write!(f, "intent {intent}"),
            Self::LaunchApp(app_id) => write!(f, "launch {app_id}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("{diagnostic}")]
    Failed {
        exit_code: Option<i32>,
        diagnostic: String,
    },
    #[error("ADB command timed out after {}s.", .0.as_secs())]
    Timeout(Duration),
    #[error("failed to run command: {0}")]
    Spawn(#[from] std::io::Error),
}

impl ActionError {
    pub fn failed(exit_code: Option<i32>, stderr: &str) -> Self {
        let diagnostic = stderr.trim();
        Self::Failed {
            exit_code,
            diagnostic: if diagnostic.is_empty() {
                "Unknown error occurred".to_string()
            } else {
                diagnostic.to_string()
            },
        }
    }

    /// Status code used when the failure is reported on a channel.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Failed {
                exit_code: Some(code),
                ..
            } if *code > 0 && *code < 1000 => *code as u16,
            _ => 500,
        }
    }
}

/// Performs actions against the device. Returns the command's trimmed output.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn perform(&self, action: &Action) -> Result<String, ActionError>;
}
