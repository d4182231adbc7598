//! Thin wrappers around the iscsiadm command, one function per operation
//! the connector needs.

use std::env;

use regex::Regex;
use tokio::process::Command;

use super::DeviceError;

/// ISCSI_ERR_NO_OBJS_FOUND: no session or node record matched.
const NO_OBJS_FOUND: i32 = 21;

pub(super) struct IscsiAdmin;

impl IscsiAdmin {
    pub(super) async fn find_session(
        portal: &str,
        iqn: &str,
    ) -> Result<bool, DeviceError> {
        const ARGS: [&str; 2] = ["--mode", "session"];

        let output = IscsiAdmin::run(&ARGS).await?;

        if output.status.success() {
            return Ok(IscsiAdmin::find_target(portal, iqn, &output.stdout));
        }

        if output.status.code() == Some(NO_OBJS_FOUND) {
            // no sessions at all
            return Ok(false);
        }

        Err(IscsiAdmin::stderr(output))
    }

    pub(super) async fn discover(
        portal: &str,
        iqn: &str,
        iface: &str,
    ) -> Result<(), DeviceError> {
        let args = [
            "--mode",
            "discovery",
            "--type",
            "sendtargets",
            "--portal",
            portal,
            "--interface",
            iface,
        ];

        let output = IscsiAdmin::run(&args).await?;

        if output.status.success() {
            if IscsiAdmin::find_target(portal, iqn, &output.stdout) {
                return Ok(());
            }

            return Err(DeviceError::from(format!(
                "no record for target {}",
                iqn
            )));
        }

        Err(IscsiAdmin::stderr(output))
    }

    pub(super) async fn login(
        portal: &str,
        iqn: &str,
        iface: &str,
    ) -> Result<(), DeviceError> {
        let args = [
            "--mode",
            "node",
            "--targetname",
            iqn,
            "--portal",
            portal,
            "--interface",
            iface,
            "--login",
        ];
        IscsiAdmin::execute(&args, false).await
    }

    /// Logging out of a target we have no session with succeeds.
    pub(super) async fn logout(
        portal: &str,
        iqn: &str,
    ) -> Result<(), DeviceError> {
        let args = [
            "--mode",
            "node",
            "--targetname",
            iqn,
            "--portal",
            portal,
            "--logout",
        ];
        IscsiAdmin::execute(&args, true).await
    }

    /// Deleting a node record which does not exist succeeds.
    pub(super) async fn delete(
        portal: &str,
        iqn: &str,
        iface: &str,
    ) -> Result<(), DeviceError> {
        let args = [
            "--mode",
            "node",
            "--targetname",
            iqn,
            "--portal",
            portal,
            "--interface",
            iface,
            "--op",
            "delete",
        ];
        IscsiAdmin::execute(&args, true).await
    }

    async fn execute(
        args: &[&str],
        missing_ok: bool,
    ) -> Result<(), DeviceError> {
        let output = IscsiAdmin::run(args).await?;

        if output.status.success()
            || (missing_ok && output.status.code() == Some(NO_OBJS_FOUND))
        {
            return Ok(());
        }

        Err(IscsiAdmin::stderr(output))
    }

    async fn run(args: &[&str]) -> Result<std::process::Output, DeviceError> {
        let iscsiadm = IscsiAdmin::get_binary()?;

        debug!(target: "iscsi", "iscsiadm {:?}", args);

        let output = Command::new(iscsiadm).args(args).output().await?;

        trace!(
            target: "iscsi",
            status = ?output.status,
            stdout = %String::from_utf8_lossy(&output.stdout),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "iscsiadm finished"
        );
        Ok(output)
    }

    fn stderr(output: std::process::Output) -> DeviceError {
        DeviceError::from(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        )
    }

    fn find_target(portal: &str, iqn: &str, data: &[u8]) -> bool {
        lazy_static! {
            static ref PATTERN: Regex = Regex::new(r"(?P<portal>[^ ,]+:[[:digit:]]+),[[:digit:]]+ +(?P<target>iqn\.[^ ]+)").unwrap();
        }

        String::from_utf8_lossy(data).lines().any(|line| {
            PATTERN.captures(line).map_or(false, |captures| {
                &captures["portal"] == portal && &captures["target"] == iqn
            })
        })
    }

    fn get_binary() -> Result<&'static str, DeviceError> {
        lazy_static! {
            static ref ISCSIADM: String = match env::var("ISCSIADM") {
                Ok(path) => {
                    debug!("using environment: ISCSIADM={}", &path);
                    path
                }
                _ => match which::which("iscsiadm") {
                    Ok(path) => {
                        debug!("using PATH: {:?}", path);
                        String::from("iscsiadm")
                    }
                    _ => {
                        debug!("iscsiadm binary not found");
                        String::new()
                    }
                },
            };
        }

        if ISCSIADM.is_empty() {
            return Err(DeviceError::new("iscsiadm binary not found"));
        }

        Ok(&ISCSIADM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSIONS: &str = "\
tcp: [1] 10.0.0.7:3260,1 iqn.2016-09.com.openebs.jiva:pvc-1 (non-flash)
tcp: [2] 10.0.0.8:3260,1 iqn.2016-09.com.openebs.jiva:pvc-2 (non-flash)
";

    #[test]
    fn finds_session_for_portal_and_target() {
        assert!(IscsiAdmin::find_target(
            "10.0.0.7:3260",
            "iqn.2016-09.com.openebs.jiva:pvc-1",
            SESSIONS.as_bytes()
        ));
        assert!(IscsiAdmin::find_target(
            "10.0.0.8:3260",
            "iqn.2016-09.com.openebs.jiva:pvc-2",
            SESSIONS.as_bytes()
        ));
    }

    #[test]
    fn ignores_other_sessions() {
        // right target, wrong portal
        assert!(!IscsiAdmin::find_target(
            "10.0.0.8:3260",
            "iqn.2016-09.com.openebs.jiva:pvc-1",
            SESSIONS.as_bytes()
        ));
        assert!(!IscsiAdmin::find_target(
            "10.0.0.7:3260",
            "iqn.2016-09.com.openebs.jiva:pvc-3",
            SESSIONS.as_bytes()
        ));
        assert!(!IscsiAdmin::find_target("10.0.0.7:3260", "iqn.x", b""));
    }

    #[test]
    fn parses_discovery_output() {
        let discovery =
            "10.0.0.7:3260,1 iqn.2016-09.com.openebs.jiva:pvc-1\n";
        assert!(IscsiAdmin::find_target(
            "10.0.0.7:3260",
            "iqn.2016-09.com.openebs.jiva:pvc-1",
            discovery.as_bytes()
        ));
    }
}
