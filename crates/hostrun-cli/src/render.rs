//! Human and JSON rendering of group results

use std::fmt::Write as _;

use hostrun_exec::{CommandResult, ExecError, GroupResult, TargetId};
use serde::Serialize;

/// One host in `--json` output
#[derive(Debug, Serialize)]
struct HostReport<'a> {
    target: String,
    ok: bool,
    exited: Option<i32>,
    stdout: &'a str,
    stderr: &'a str,
    pty: bool,
    duration_ms: Option<u128>,
    error: Option<String>,
}

impl<'a> HostReport<'a> {
    fn new(id: &TargetId, outcome: &'a Result<CommandResult, ExecError>) -> Self {
        let (result, error) = match outcome {
            Ok(result) => (Some(result), None),
            Err(e) => (e.result(), Some(e.to_string())),
        };
        Self {
            target: id.to_string(),
            ok: matches!(outcome, Ok(result) if result.ok()),
            exited: result.map(CommandResult::exited),
            stdout: result.map_or("", CommandResult::stdout),
            stderr: result.map_or("", CommandResult::stderr),
            pty: result.is_some_and(CommandResult::pty),
            duration_ms: result.map(|r| r.duration().as_millis()),
            error,
        }
    }
}

/// Results as a JSON array in group order
///
/// # Errors
/// Returns error if serialization fails
pub fn json(results: &GroupResult) -> serde_json::Result<String> {
    let reports: Vec<HostReport<'_>> = results
        .iter()
        .map(|(id, outcome)| HostReport::new(id, outcome))
        .collect();
    serde_json::to_string_pretty(&reports)
}

/// One status line per host plus a totals line
pub fn summary(results: &GroupResult) -> String {
    let mut out = String::new();
    let mut failed = 0;
    for (id, outcome) in results.iter() {
        let _ = match outcome {
            Ok(result) if result.ok() => {
                writeln!(out, "{id}: ok ({:?})", result.duration())
            }
            Ok(result) => {
                failed += 1;
                writeln!(out, "{id}: exited {}", result.exited())
            }
            Err(e) => {
                failed += 1;
                writeln!(out, "{id}: {e}")
            }
        };
    }
    let _ = writeln!(
        out,
        "{} succeeded, {failed} failed",
        results.len() - failed
    );
    out
}

#[cfg(test)]
mod tests {
    use hostrun_exec::{ConnectOptions, Group, RunOptions};

    use super::*;

    async fn results(command: &str) -> GroupResult {
        let options = ConnectOptions {
            user: Some("ops".to_string()),
            ..ConnectOptions::default()
        };
        let group = Group::from_hosts(["web1", "web1"], &options).unwrap();
        group
            .local(command, &RunOptions::new().hide(true).warn(true))
            .await
    }

    #[tokio::test]
    async fn test_json_lists_every_member() {
        let results = results("echo hi").await;
        let value: serde_json::Value = serde_json::from_str(&json(&results).unwrap()).unwrap();

        let hosts = value.as_array().unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0]["target"], "ops@web1:22");
        assert_eq!(hosts[1]["target"], "ops@web1:22#1");
        assert_eq!(hosts[0]["stdout"], "hi\n");
        assert_eq!(hosts[0]["ok"], true);
        assert!(hosts[0]["error"].is_null());
    }

    #[tokio::test]
    async fn test_summary_counts_failures() {
        let results = results("exit 5").await;
        let text = summary(&results);
        assert!(text.contains("ops@web1:22: exited 5"));
        assert!(text.ends_with("0 succeeded, 2 failed\n"));
    }
}
