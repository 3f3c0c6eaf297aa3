use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::error::{Result, XposeError};

#[derive(Debug, Deserialize)]
struct DryRunDoc {
    tasks: Vec<DryRunTask>,
}

#[derive(Debug, Deserialize)]
struct DryRunTask {
    command: String,
}

fn explicit_port_regexes() -> &'static [Regex; 5] {
    static RES: OnceLock<[Regex; 5]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            Regex::new(r"\bPORT=(\d+)").unwrap(),
            Regex::new(r"--port[=\s]+(\d+)").unwrap(),
            Regex::new(r"(?:^|\s)-p\s*(\d+)").unwrap(),
            Regex::new(r"--listen\s+(?:[\w.-]+:)?(\d+)").unwrap(),
            Regex::new(r"https?://[^\s:/]+:(\d+)").unwrap(),
        ]
    })
}

/// Locate the JSON payload in a runner's mixed dry-run output: the
/// substring between the first `{` and the last `}`.
pub fn extract_json_payload(output: &str) -> Option<&str> {
    let start = output.find('{')?;
    let end = output.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&output[start..=end])
}

/// Ports explicitly named in a task's command string (`PORT=`, `--port`,
/// `-p`, `--listen`, or an embedded `http(s)://host:port` URL), in the
/// order they appear.
pub fn extract_explicit_ports(command: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    for re in explicit_port_regexes() {
        for caps in re.captures_iter(command) {
            if let Some(p) = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) {
                if (1..=65535).contains(&p) {
                    ports.push(p as u16);
                }
            }
        }
    }
    ports
}

/// Classify a command with no explicit port by its leading process name.
fn classify_by_process_name(command: &str) -> Option<u16> {
    let lower = command.to_ascii_lowercase();
    let tokens: Vec<&str> = lower.split_whitespace().collect();
    let mut idx = 0;
    while idx < tokens.len() && tokens[idx].contains('=') {
        idx += 1;
    }
    let rest = &tokens[idx..];

    match rest {
        [a, b, ..] if matches!(*a, "next" | "nuxt" | "remix") && *b == "dev" => Some(3000),
        [a, b, ..] if *a == "astro" && *b == "dev" => Some(4321),
        [a, b, ..] if *a == "wrangler" && *b == "dev" => Some(8787),
        [a, b, ..] if *a == "storybook" && *b == "dev" => Some(6006),
        [a, ..] if *a == "start-storybook" => Some(6006),
        [a, ..] if *a == "vite" => Some(5173),
        _ => None,
    }
}

/// Ports implied by one task command: explicit ports if any are present,
/// otherwise the process-name classification.
pub fn ports_for_command(command: &str) -> Vec<u16> {
    let explicit = extract_explicit_ports(command);
    if !explicit.is_empty() {
        return explicit;
    }
    classify_by_process_name(command).into_iter().collect()
}

/// Parse a runner's mixed dry-run output and return the deduplicated,
/// ascending-sorted set of ports implied by its `tasks[].command` entries.
pub fn discover_ports(output: &str) -> Result<Vec<u16>> {
    let payload = extract_json_payload(output)
        .ok_or_else(|| XposeError::Other("no JSON object found in dry-run output".into()))?;
    let doc: DryRunDoc = serde_json::from_str(payload)
        .map_err(|e| XposeError::Other(format!("failed to parse dry-run JSON: {e}")))?;

    let mut seen = std::collections::HashSet::new();
    let mut ports = Vec::new();
    for task in &doc.tasks {
        for port in ports_for_command(&task.command) {
            if seen.insert(port) {
                ports.push(port);
            }
        }
    }
    ports.sort_unstable();
    Ok(ports)
}

/// Run a monorepo task runner in dry-run mode and discover the ports its
/// tasks would listen on. `argv` is the full command line (runner binary
/// plus dry-run/JSON flags); it is invoked with `cwd` as the working
/// directory if given.
pub async fn discover_ports_via_runner(argv: &[String], cwd: Option<&Path>) -> Result<Vec<u16>> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| XposeError::Other("empty runner command".into()))?;

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = cmd.output().await?;
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    discover_ports(&combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_between_braces_in_mixed_output() {
        let output = "warning: cache miss\n{\"tasks\":[]}\ndone in 1.2s";
        assert_eq!(extract_json_payload(output), Some(r#"{"tasks":[]}"#));
    }

    #[test]
    fn classifies_known_commands() {
        let cases = [
            ("next dev", vec![3000]),
            ("next dev --port 3000", vec![3000]),
            ("PORT=8080 node server.js", vec![8080]),
            ("vite", vec![5173]),
            ("vitest run", vec![]),
            ("astro dev", vec![4321]),
            ("wrangler dev", vec![8787]),
            ("storybook dev", vec![6006]),
        ];
        for (command, expected) in cases {
            assert_eq!(ports_for_command(command), expected, "command: {command}");
        }
    }

    #[test]
    fn discovers_and_dedups_across_tasks() {
        let output = serde_json::json!({
            "tasks": [
                { "command": "next dev" },
                { "command": "next dev --port 3000" },
                { "command": "PORT=8080 node server.js" },
                { "command": "vite" },
                { "command": "vitest run" },
                { "command": "astro dev" },
                { "command": "wrangler dev" },
                { "command": "storybook dev" },
            ]
        })
        .to_string();
        let wrapped = format!("some build tool banner\n{output}\nextra trailing text");
        let ports = discover_ports(&wrapped).unwrap();
        assert_eq!(ports, vec![3000, 4321, 5173, 6006, 8080, 8787]);
    }

    #[test]
    fn rejects_out_of_range_ports() {
        assert_eq!(extract_explicit_ports("--port 0"), Vec::<u16>::new());
        assert_eq!(extract_explicit_ports("--port 70000"), Vec::<u16>::new());
    }

    #[test]
    fn recognizes_listen_and_url_forms() {
        assert_eq!(extract_explicit_ports("--listen 0.0.0.0:4000"), vec![4000]);
        assert_eq!(extract_explicit_ports("--listen 4000"), vec![4000]);
        assert_eq!(
            extract_explicit_ports("connecting to http://localhost:9090/health"),
            vec![9090]
        );
    }

    #[test]
    fn recognizes_short_flag_forms() {
        assert_eq!(extract_explicit_ports("serve -p 8081"), vec![8081]);
        assert_eq!(extract_explicit_ports("serve -p8081"), vec![8081]);
    }

    #[test]
    fn missing_tasks_array_is_an_error() {
        assert!(discover_ports("{\"nope\":true}").is_err());
    }
}
