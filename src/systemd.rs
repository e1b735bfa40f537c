//! systemd-backed service status source.
//!
//! All registered units are queried with a single `systemctl show`
//! invocation per scrape.

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::error::GateError;
use crate::gate::ServiceStatus;

const SYSTEMCTL: &str = "systemctl";
const UNIT_SUFFIXES: [&str; 6] = [
    ".service", ".socket", ".target", ".timer", ".mount", ".path",
];

/// Queries unit states through `systemctl`.
#[derive(Debug, Clone)]
pub struct SystemdStatus {
    program: String,
    timeout: Duration,
}

impl SystemdStatus {
    /// Verifies that `systemctl` can be executed.
    pub async fn connect(timeout: Duration) -> Result<Self, GateError> {
        Self::with_program(SYSTEMCTL, timeout).await
    }

    pub async fn with_program(program: &str, timeout: Duration) -> Result<Self, GateError> {
        let status = Self {
            program: program.to_string(),
            timeout,
        };
        status.run(&["--version".to_string()]).await?;
        debug!("systemd status source available via '{}'", program);
        Ok(status)
    }

    async fn run(&self, args: &[String]) -> Result<String, GateError> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.program).args(args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| {
            GateError::ServiceQuery(format!(
                "{} timed out after {:?}",
                self.program, self.timeout
            ))
        })?
        .map_err(|e| GateError::ServiceQuery(format!("running {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(GateError::ServiceQuery(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ServiceStatus for SystemdStatus {
    #[instrument(skip(self))]
    async fn get_states(&self, names: &[String]) -> Result<HashMap<String, String>, GateError> {
        let mut args = vec![
            "show".to_string(),
            "--property=Id,ActiveState".to_string(),
            "--".to_string(),
        ];
        args.extend(names.iter().map(|n| unit_name(n)));

        let stdout = self.run(&args).await?;
        Ok(parse_show_output(names, &stdout))
    }
}

/// Appends `.service` unless the name already carries a unit suffix.
pub fn unit_name(name: &str) -> String {
    if UNIT_SUFFIXES.iter().any(|s| name.ends_with(s)) {
        name.to_string()
    } else {
        format!("{}.service", name)
    }
}

/// Parses `systemctl show` output into name → ActiveState.
///
/// Blocks are printed in argument order, which also covers aliased units
/// whose `Id` differs from the requested name. When the block count does
/// not match, blocks are matched by `Id` instead.
pub fn parse_show_output(names: &[String], stdout: &str) -> HashMap<String, String> {
    let mut blocks: Vec<(Option<String>, Option<String>)> = Vec::new();
    let mut current: (Option<String>, Option<String>) = (None, None);

    for line in stdout.lines().map(str::trim) {
        if line.is_empty() {
            if current.0.is_some() || current.1.is_some() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some(id) = line.strip_prefix("Id=") {
            current.0 = Some(id.to_string());
        } else if let Some(state) = line.strip_prefix("ActiveState=") {
            current.1 = Some(state.to_string());
        }
    }
    if current.0.is_some() || current.1.is_some() {
        blocks.push(current);
    }

    let mut states = HashMap::new();
    if blocks.len() == names.len() {
        for (name, (_, state)) in names.iter().zip(blocks) {
            if let Some(state) = state {
                states.insert(name.clone(), state);
            }
        }
        return states;
    }

    for (id, state) in blocks {
        let (Some(id), Some(state)) = (id, state) else {
            continue;
        };
        if let Some(name) = names.iter().find(|n| unit_name(n) == id) {
            states.insert(name.clone(), state);
        }
    }
    states
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unit_name() {
        assert_eq!(unit_name("redis"), "redis.service");
        assert_eq!(unit_name("php-fpm.socket"), "php-fpm.socket");
    }

    #[test]
    fn test_parse_positional() {
        let out = "Id=redis-server.service\nActiveState=active\n\n\
                   Id=nginx.service\nActiveState=inactive\n";
        let states = parse_show_output(&names(&["redis", "nginx"]), out);
        assert_eq!(states.get("redis").map(String::as_str), Some("active"));
        assert_eq!(states.get("nginx").map(String::as_str), Some("inactive"));
    }

    #[test]
    fn test_parse_by_id_when_counts_differ() {
        let out = "Id=nginx.service\nActiveState=reloading\n";
        let states = parse_show_output(&names(&["redis", "nginx"]), out);
        assert_eq!(states.get("nginx").map(String::as_str), Some("reloading"));
        assert!(!states.contains_key("redis"));
    }

    #[test]
    fn test_parse_empty_output() {
        let states = parse_show_output(&names(&["redis"]), "");
        assert!(states.is_empty());
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let result =
            SystemdStatus::with_program("/nonexistent/systemctl", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(GateError::ServiceQuery(_))));
    }
}
