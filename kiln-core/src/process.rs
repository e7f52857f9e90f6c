// kiln-core/src/process.rs
use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use kiln_common::error::{KilnError, Result};
use tracing::{debug, error};

/// Runs `program` to completion with captured stdout/stderr.
///
/// When `envs` is given the child sees exactly that environment and nothing
/// inherited from this process; `PATH` lookup of `program` then uses the
/// `PATH` entry of the map.
pub fn run_command_sync(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    envs: Option<&BTreeMap<String, String>>,
) -> Result<Output> {
    debug!(
        "Running command: {} {:?} (cwd: {:?}, envs: {:?})",
        program,
        args,
        cwd,
        envs.map(|e| e.keys().collect::<Vec<_>>())
    );
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    if let Some(env_map) = envs {
        cmd.env_clear();
        cmd.envs(env_map);
    }
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.stdin(Stdio::null());

    match cmd.output() {
        Ok(output) => {
            if !output.status.success() {
                debug!("Command failed with status: {}", output.status);
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.trim().is_empty() {
                    debug!("Stderr:\n{}", stderr.trim());
                }
            } else {
                debug!("Command finished successfully.");
            }
            Ok(output)
        }
        Err(e) => {
            error!("Failed to execute {}: {}", program, e);
            Err(KilnError::CommandExecError(format!("{program}: {e}")))
        }
    }
}

/// Last `max_lines` non-empty lines of captured output.
pub fn output_tail(bytes: &[u8], max_lines: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn child_sees_only_the_given_environment() {
        let mut envs = BTreeMap::new();
        envs.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        envs.insert("KILN_PROBE".to_string(), "42".to_string());
        let out = run_command_sync(
            "sh",
            &["-c".into(), "echo $KILN_PROBE:${HOME:-unset}".into()],
            None,
            Some(&envs),
        )
        .unwrap();
        assert!(out.status.success());
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "42:unset");
    }

    #[test]
    fn missing_programs_are_exec_errors() {
        let err = run_command_sync("kiln-no-such-program", &[], None, None).unwrap_err();
        assert!(matches!(err, KilnError::CommandExecError(_)));
    }

    #[test]
    fn tail_keeps_the_last_lines() {
        assert_eq!(output_tail(b"a\n\nb\nc\n", 2), "b\nc");
        assert_eq!(output_tail(b"", 3), "");
    }
}
