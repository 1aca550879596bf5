use crate::catalog::PackageInspector;
use crate::executor::{Action, ActionError, ActionExecutor};
use crate::session::{DeviceStatus, Transport};
use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const LAUNCHER_CATEGORY: &str = "android.intent.category.LAUNCHER";

/// Launch activities for packages whose launcher entry `monkey` cannot find.
const EXPLICIT_ACTIVITIES: &[(&str, &str)] = &[
    (
        "com.amazon.firebat",
        "com.amazon.firebat/com.amazon.firebatcore.deeplink.DeepLinkRoutingActivity",
    ),
    ("com.sonyliv", "com.sonyliv/.ui.splash.SplashActivity"),
];

/// Talks to devices through the `adb` and `aapt` binaries.
#[derive(Debug, Clone)]
pub struct AdbClient {
    adb: String,
    aapt: String,
    timeout: Duration,
}

impl AdbClient {
    pub fn new(adb: impl Into<String>, aapt: impl Into<String>, timeout: Duration) -> Self {
        Self {
            adb: adb.into(),
            aapt: aapt.into(),
            timeout,
        }
    }

    async fn adb<I, S>(&self, args: I) -> Result<String, ActionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        run(&self.adb, args, self.timeout).await
    }

    async fn shell(&self, args: &[&str]) -> Result<String, ActionError> {
        self.adb(std::iter::once("shell").chain(args.iter().copied())).await
    }

    async fn open_app(&self, app_id: &str) -> Result<String, ActionError> {
        let monkey = self
            .shell(&["monkey", "-p", app_id, "-c", LAUNCHER_CATEGORY, "1"])
            .await;
        if let Err(err) = monkey {
            tracing::debug!(app_id, error = %err, "monkey launch failed, trying explicit activity");
            let activity = explicit_activity(app_id);
            self.shell(&["am", "start", "-n", activity.as_str()])
                .await
                .map_err(|err| match err {
                    ActionError::Failed {
                        exit_code,
                        diagnostic,
                    } => ActionError::Failed {
                        exit_code,
                        diagnostic: format!("Failed to launch app {app_id}: {diagnostic}"),
                    },
                    other => other,
                })?;
        }
        Ok(format!("App {app_id} opened successfully."))
    }
}

async fn run<I, S>(program: &str, args: I, timeout: Duration) -> Result<String, ActionError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| ActionError::Timeout(timeout))??;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(ActionError::failed(
            output.status.code(),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }
}

pub fn explicit_activity(app_id: &str) -> String {
    EXPLICIT_ACTIVITIES
        .iter()
        .find(|(id, _)| *id == app_id)
        .map(|(_, activity)| activity.to_string())
        .unwrap_or_else(|| format!("{app_id}/.MainActivity"))
}

/// Reads `address`'s state out of `adb devices` output.
pub fn parse_device_status(devices_output: &str, address: &str) -> DeviceStatus {
    devices_output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some((fields.next()?, fields.next()?))
        })
        .find(|(serial, _)| *serial == address)
        .map(|(_, state)| match state {
            "device" => DeviceStatus::Device,
            "unauthorized" => DeviceStatus::Unauthorized,
            _ => DeviceStatus::Offline,
        })
        .unwrap_or(DeviceStatus::Absent)
}

/// Package ids from `pm list packages` output.
pub fn parse_package_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

/// `ApplicationLabel` value from `dumpsys package <id>` output.
pub fn parse_dumpsys_label(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.contains("ApplicationLabel"))
        .and_then(|line| line.rsplit(':').next())
        .map(|label| label.trim().to_string())
        .filter(|label| !label.is_empty())
}

/// First APK path from `pm path <id>` output.
pub fn parse_apk_path(output: &str) -> Option<String> {
    output
        .lines()
        .next()
        .and_then(|line| line.trim().strip_prefix("package:"))
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
}

/// `application-label` value from `aapt dump badging` output.
pub fn parse_badging_label(output: &str) -> Option<String> {
    let line = output
        .lines()
        .find(|line| line.starts_with("application-label:"))
        .or_else(|| output.lines().find(|line| line.contains("application-label")))?;
    let label = line.split_once(':')?.1.trim().trim_matches('\'').trim();
    (!label.is_empty()).then(|| label.to_string())
}

#[async_trait]
impl Transport for AdbClient {
    async fn reset(&self) -> Result<(), ActionError> {
        if let Err(err) = self.adb(["kill-server"]).await {
            tracing::debug!(error = %err, "adb kill-server failed");
        }
        self.adb(["start-server"]).await.map(|_| ())
    }

    async fn request_connect(&self, address: &str) -> Result<(), ActionError> {
        let output = self.adb(["connect", address]).await?;
        tracing::debug!(address, output = %output, "adb connect");
        Ok(())
    }

    async fn request_disconnect(&self, address: &str) -> Result<(), ActionError> {
        self.adb(["disconnect", address]).await.map(|_| ())
    }

    async fn status(&self, address: &str) -> Result<DeviceStatus, ActionError> {
        let output = self.adb(["devices"]).await?;
        Ok(parse_device_status(&output, address))
    }
}

#[async_trait]
impl ActionExecutor for AdbClient {
    async fn perform(&self, action: &Action) -> Result<String, ActionError> {
        match action {
            Action::KeyEvent(code) => self.shell(&["input", "keyevent", *code]).await,
            Action::StartComponent(component) => {
                self.shell(&["am", "start", "-n", *component]).await
            }
            Action::StartIntent(intent) => self.shell(&["am", "start", "-a", *intent]).await,
            Action::LaunchApp(app_id) => self.open_app(app_id).await,
        }
    }
}

#[async_trait]
impl PackageInspector for AdbClient {
    async fn list_packages(&self, third_party_only: bool) -> Result<Vec<String>, ActionError> {
        let mut args = vec!["pm", "list", "packages"];
        if third_party_only {
            args.push("-3");
        }
        let output = self.shell(&args).await?;
        Ok(parse_package_list(&output))
    }

    async fn application_label(&self, app_id: &str) -> Result<Option<String>, ActionError> {
        let output = self.shell(&["dumpsys", "package", app_id]).await?;
        Ok(parse_dumpsys_label(&output))
    }

    async fn apk_path(&self, app_id: &str) -> Result<Option<String>, ActionError> {
        let output = self.shell(&["pm", "path", app_id]).await?;
        Ok(parse_apk_path(&output))
    }

    async fn pull_apk(&self, remote_path: &str, local_path: &Path) -> Result<(), ActionError> {
        self.adb([OsStr::new("pull"), OsStr::new(remote_path), local_path.as_os_str()])
            .await
            .map(|_| ())
    }

    async fn badging_label(&self, local_path: &Path) -> Result<Option<String>, ActionError> {
        let output = run(
            &self.aapt,
            [OsStr::new("dump"), OsStr::new("badging"), local_path.as_os_str()],
            self.timeout,
        )
        .await?;
        Ok(parse_badging_label(&output))
    }
}
