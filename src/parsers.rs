//! Pure parsing functions: transcript lines, tool-action descriptions, role
//! inference, and offset-tracked file reading. No I/O beyond `readNewLines`
//! reading a single file; no access to StateManager.

use crate::model::{now_ms, Millis, Role};
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct SessionMetadata {
    pub session_id: String,
    pub slug: Option<String>,
    pub cwd: Option<String>,
    pub git_branch: Option<String>,
    pub team_name: Option<String>,
    pub agent_id: Option<String>,
    pub is_team: bool,
    pub project_name: Option<String>,
    pub last_activity: Millis,
}

/// Last hyphen-delimited segment, splitting preferentially on a `-Source-` marker.
fn clean_project_name(slug: &str) -> String {
    if let Some(idx) = slug.find("-Source-") {
        return slug[..idx].to_string();
    }
    slug.rsplit('-').next().unwrap_or(slug).to_string()
}

fn last_path_segment(path: &str) -> Option<String> {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Scans a JSON object for the session-metadata fields. Returns `None` if
/// the line isn't valid JSON or lacks a `sessionId`.
pub fn parse_session_metadata(line: &str) -> Option<SessionMetadata> {
    let value: Value = serde_json::from_str(line).ok()?;
    let session_id = value.get("sessionId")?.as_str()?.to_string();
    let slug = value.get("slug").and_then(Value::as_str).map(str::to_string);
    let cwd = value.get("cwd").and_then(Value::as_str).map(str::to_string);
    let git_branch = value
        .get("gitBranch")
        .and_then(Value::as_str)
        .map(str::to_string);
    let team_name = value
        .get("teamName")
        .and_then(Value::as_str)
        .map(str::to_string);
    let agent_id = value
        .get("agentId")
        .and_then(Value::as_str)
        .map(str::to_string);

    let project_name = cwd
        .as_deref()
        .and_then(last_path_segment)
        .or_else(|| slug.as_deref().map(clean_project_name));

    Some(SessionMetadata {
        session_id,
        is_team: team_name.is_some(),
        slug,
        cwd,
        git_branch,
        team_name,
        agent_id,
        project_name,
        last_activity: now_ms(),
    })
}

#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub enum TranscriptLine {
    Message(ParsedMessage),
    ToolCall {
        tool_name: String,
        is_user_prompt: bool,
        agent_name: Option<String>,
    },
    AgentActivity,
    Compact,
    Thinking { tool_name: &'static str },
    Progress,
    Unknown,
}

fn content_blocks(message: &Value) -> Vec<&Value> {
    match message.get("content") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(other) => vec![other],
        None => Vec::new(),
    }
}

const USER_PROMPT_TOOLS: &[&str] = &["AskUserQuestion", "EnterPlanMode", "ExitPlanMode"];

/// Parses a single JSONL transcript line into a tagged record.
pub fn parse_transcript_line(line: &str) -> TranscriptLine {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return TranscriptLine::Unknown,
    };

    if value.get("type").and_then(Value::as_str) == Some("system")
        && value.get("subtype").and_then(Value::as_str) == Some("compact_boundary")
    {
        return TranscriptLine::Compact;
    }

    if matches!(
        value.get("type").and_then(Value::as_str),
        Some("tool_result") | Some("tool_output")
    ) {
        return TranscriptLine::AgentActivity;
    }

    let message = value.get("message").unwrap_or(&value);
    let agent_name = value
        .get("agentName")
        .and_then(Value::as_str)
        .map(str::to_string);

    for block in content_blocks(message) {
        let Some(block_type) = block.get("type").and_then(Value::as_str) else {
            continue;
        };
        if block_type != "tool_use" {
            continue;
        }
        let Some(name) = block.get("name").and_then(Value::as_str) else {
            continue;
        };

        if matches!(name, "SendMessage" | "SendMessageTool") {
            let input = block.get("input").cloned().unwrap_or(Value::Null);
            let kind = input.get("type").and_then(Value::as_str).unwrap_or("message");
            let content = input
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if matches!(kind, "message" | "broadcast") && !content.is_empty() {
                let to = input
                    .get("to")
                    .and_then(Value::as_str)
                    .unwrap_or("all")
                    .to_string();
                let summary = input.get("summary").and_then(Value::as_str);
                let content = summary
                    .unwrap_or(content)
                    .chars()
                    .take(200)
                    .collect::<String>();
                let id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("msg-{}", now_ms()));
                return TranscriptLine::Message(ParsedMessage {
                    id,
                    from: agent_name.unwrap_or_else(|| "unknown".to_string()),
                    to,
                    content,
                });
            }
            // else: fall through to the generic tool_call rule below, so e.g.
            // a shutdown_request still surfaces via describe_tool_action.
        }

        let is_user_prompt = USER_PROMPT_TOOLS.contains(&name);
        let tool_name = describe_tool_action(name, block.get("input").unwrap_or(&Value::Null)).action;
        return TranscriptLine::ToolCall {
            tool_name,
            is_user_prompt,
            agent_name,
        };
    }

    if let Some(first) = content_blocks(message).first() {
        match first.get("type").and_then(Value::as_str) {
            Some("thinking") => return TranscriptLine::Thinking { tool_name: "Thinking..." },
            Some("text") => return TranscriptLine::Thinking { tool_name: "Responding..." },
            _ => {}
        }
    }

    if value.get("type").and_then(Value::as_str) == Some("progress") {
        return TranscriptLine::Progress;
    }

    TranscriptLine::Unknown
}

#[derive(Debug, Clone, Default)]
pub struct ToolAction {
    pub action: String,
    pub context: Option<String>,
}

fn last_two_segments(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if parts.len() >= 2 {
        parts[parts.len() - 2..].join("/")
    } else {
        parts.join("/")
    }
}

fn truncate(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

/// Closed lookup table describing a tool invocation for display.
pub fn describe_tool_action(tool_name: &str, tool_input: &Value) -> ToolAction {
    let input_str = |key: &str| tool_input.get(key).and_then(Value::as_str);

    match tool_name {
        "Edit" | "Write" | "Read" => {
            let verb = match tool_name {
                "Edit" => "Editing",
                "Write" => "Writing",
                _ => "Reading",
            };
            let path = input_str("file_path").unwrap_or("file");
            let basename = path.rsplit('/').next().unwrap_or(path);
            let dir = path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
            ToolAction {
                action: format!("{verb} {basename}"),
                context: if dir.is_empty() {
                    None
                } else {
                    Some(last_two_segments(dir))
                },
            }
        }
        "Bash" => {
            if let Some(desc) = input_str("description") {
                return ToolAction {
                    action: truncate(desc, 60),
                    context: None,
                };
            }
            if let Some(cmd) = input_str("command") {
                let first = cmd.split("&&").next().unwrap_or(cmd);
                let first = first.split('|').next().unwrap_or(first).trim();
                return ToolAction {
                    action: format!("Running: {}", truncate(first, 50)),
                    context: None,
                };
            }
            ToolAction {
                action: "Running command".to_string(),
                context: None,
            }
        }
        "Grep" | "Glob" => {
            let action = input_str("pattern")
                .map(|p| format!("Searching: {}", truncate(p, 40)))
                .unwrap_or_else(|| "Searching files".to_string());
            let context = input_str("glob")
                .map(|g| format!("in {g}"))
                .or_else(|| {
                    input_str("path").map(|p| {
                        let seg = last_two_segments(p);
                        format!("in {seg}")
                    })
                });
            ToolAction { action, context }
        }
        "Task" => {
            let action = input_str("description")
                .map(|d| format!("Spawning: {}", truncate(d, 40)))
                .unwrap_or_else(|| "Spawning agent".to_string());
            let context = input_str("subagent_type").map(|t| format!("({t})"));
            ToolAction { action, context }
        }
        "TaskCreate" => {
            let action = input_str("subject")
                .map(|s| format!("Creating task: {}", truncate(s, 40)))
                .unwrap_or_else(|| "Creating task".to_string());
            ToolAction {
                action,
                context: None,
            }
        }
        "TaskUpdate" => {
            let action = match (input_str("taskId"), input_str("status")) {
                (Some(id), Some(status)) => format!("Task #{id}: {status}"),
                (Some(id), None) => format!("Updating task #{id}"),
                _ => "Updating task".to_string(),
            };
            ToolAction {
                action,
                context: None,
            }
        }
        "TaskList" => ToolAction {
            action: "Checking task list".to_string(),
            context: None,
        },
        "SendMessage" | "SendMessageTool" => {
            let action = match input_str("type") {
                Some("broadcast") => "Broadcasting to team".to_string(),
                Some("shutdown_request") => {
                    format!("Requesting {} shutdown", input_str("to").unwrap_or("agent"))
                }
                _ => format!("Messaging {}", input_str("to").unwrap_or("team")),
            };
            ToolAction {
                action,
                context: None,
            }
        }
        "TeamCreate" => {
            let action = input_str("team_name")
                .map(|n| format!("Creating team: {n}"))
                .unwrap_or_else(|| "Creating team".to_string());
            ToolAction {
                action,
                context: None,
            }
        }
        "TeamDelete" => ToolAction {
            action: "Deleting team".to_string(),
            context: None,
        },
        "WebSearch" => {
            let action = input_str("query")
                .map(|q| format!("Searching: {}", truncate(q, 40)))
                .unwrap_or_else(|| "Web search".to_string());
            ToolAction {
                action,
                context: None,
            }
        }
        "WebFetch" => ToolAction {
            action: "Fetching web page".to_string(),
            context: None,
        },
        "EnterPlanMode" => ToolAction {
            action: "Entering plan mode".to_string(),
            context: None,
        },
        "ExitPlanMode" => ToolAction {
            action: "Exiting plan mode".to_string(),
            context: None,
        },
        "AskUserQuestion" => ToolAction {
            action: "Asking a question".to_string(),
            context: None,
        },
        other => ToolAction {
            action: other.to_string(),
            context: None,
        },
    }
}

const LEAD_MARKERS: &[&str] = &["lead"];
const RESEARCHER_MARKERS: &[&str] = &["research", "explore", "architect"];
const TESTER_MARKERS: &[&str] = &["test", "validat"];
const PLANNER_MARKERS: &[&str] = &["plan", "design", "artist", "scribe"];

/// `inferRole`: lowercases both inputs and tests substring membership against
/// a fixed ordered list of marker sets, falling back to implementer.
pub fn infer_role(agent_type: &str, name: &str) -> Role {
    let haystack = format!("{} {}", agent_type.to_lowercase(), name.to_lowercase());
    let matches = |markers: &[&str]| markers.iter().any(|m| haystack.contains(m));

    if matches(LEAD_MARKERS) {
        Role::Lead
    } else if matches(RESEARCHER_MARKERS) {
        Role::Researcher
    } else if matches(TESTER_MARKERS) {
        Role::Tester
    } else if matches(PLANNER_MARKERS) {
        Role::Planner
    } else {
        Role::Implementer
    }
}

pub struct NewLines {
    pub lines: Vec<String>,
    pub new_offset: u64,
}

/// Reads complete lines appended to `path` since `offset` bytes. Resets to 0
/// if the file has shrunk below `offset` (truncation). Missing files yield
/// an empty result at offset 0, never an error.
pub fn read_new_lines(path: &std::path::Path, offset: u64) -> NewLines {
    use std::io::{Read, Seek, SeekFrom};

    let Ok(metadata) = std::fs::metadata(path) else {
        return NewLines {
            lines: Vec::new(),
            new_offset: 0,
        };
    };
    let size = metadata.len();
    let start = if size < offset { 0 } else { offset };

    let Ok(mut file) = std::fs::File::open(path) else {
        return NewLines {
            lines: Vec::new(),
            new_offset: 0,
        };
    };
    if file.seek(SeekFrom::Start(start)).is_err() {
        return NewLines {
            lines: Vec::new(),
            new_offset: start,
        };
    }

    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return NewLines {
            lines: Vec::new(),
            new_offset: start,
        };
    }

    let mut lines = Vec::new();
    let mut consumed: u64 = 0;
    let mut rest = &buf[..];
    while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
        let (line, remainder) = rest.split_at(pos + 1);
        if let Ok(text) = std::str::from_utf8(&line[..line.len() - 1]) {
            lines.push(text.to_string());
        }
        consumed += line.len() as u64;
        rest = remainder;
    }

    NewLines {
        lines,
        new_offset: start + consumed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_project_name_splits_on_source_marker() {
        assert_eq!(clean_project_name("myapp-Source-abc123"), "myapp");
        assert_eq!(clean_project_name("foo-bar-baz"), "baz");
    }

    #[test]
    fn parse_session_metadata_requires_session_id() {
        assert!(parse_session_metadata("{}").is_none());
        assert!(parse_session_metadata("not json").is_none());
    }

    #[test]
    fn parse_session_metadata_derives_project_name_from_cwd() {
        let meta =
            parse_session_metadata(r#"{"sessionId":"s1","cwd":"/home/user/myproject"}"#).unwrap();
        assert_eq!(meta.project_name.as_deref(), Some("myproject"));
        assert!(!meta.is_team);
    }

    #[test]
    fn parse_session_metadata_detects_team() {
        let meta =
            parse_session_metadata(r#"{"sessionId":"s1","teamName":"alpha"}"#).unwrap();
        assert!(meta.is_team);
    }

    #[test]
    fn describe_tool_action_read() {
        let input = serde_json::json!({"file_path": "/src/app.ts"});
        let action = describe_tool_action("Read", &input);
        assert_eq!(action.action, "Reading app.ts");
        assert_eq!(action.context.as_deref(), Some("src"));
    }

    #[test]
    fn describe_tool_action_bash_prefers_description() {
        let input = serde_json::json!({"description": "Run the test suite and report"});
        let action = describe_tool_action("Bash", &input);
        assert_eq!(action.action, "Run the test suite and report");
    }

    #[test]
    fn describe_tool_action_bash_falls_back_to_command() {
        let input = serde_json::json!({"command": "npm test && echo done"});
        let action = describe_tool_action("Bash", &input);
        assert_eq!(action.action, "Running: npm test");
    }

    #[test]
    fn describe_tool_action_send_message_broadcast() {
        let input = serde_json::json!({"type": "broadcast"});
        let action = describe_tool_action("SendMessage", &input);
        assert_eq!(action.action, "Broadcasting to team");
    }

    #[test]
    fn describe_tool_action_default_passthrough() {
        let action = describe_tool_action("SomeUnknownTool", &Value::Null);
        assert_eq!(action.action, "SomeUnknownTool");
    }

    #[test]
    fn infer_role_matches_in_order() {
        assert_eq!(infer_role("team-lead", "x"), Role::Lead);
        assert_eq!(infer_role("explorer", "x"), Role::Researcher);
        assert_eq!(infer_role("x", "validator"), Role::Tester);
        assert_eq!(infer_role("x", "planner"), Role::Planner);
        assert_eq!(infer_role("generic", "x"), Role::Implementer);
    }

    #[test]
    fn read_new_lines_missing_file_is_empty() {
        let result = read_new_lines(std::path::Path::new("/nonexistent/path.jsonl"), 0);
        assert!(result.lines.is_empty());
        assert_eq!(result.new_offset, 0);
    }

    #[test]
    fn read_new_lines_tracks_offset_and_partial_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, b"{\"a\":1}\n{\"b\":2}\npartial").unwrap();

        let first = read_new_lines(&path, 0);
        assert_eq!(first.lines.len(), 2);
        assert_eq!(first.lines[0], r#"{"a":1}"#);

        std::fs::write(&path, b"{\"a\":1}\n{\"b\":2}\npartial{\"c\":3}\n").unwrap();
        let second = read_new_lines(&path, first.new_offset);
        assert_eq!(second.lines, vec!["partial{\"c\":3}".to_string()]);
    }

    #[test]
    fn read_new_lines_resets_on_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, b"{\"a\":1}\n{\"b\":2}\n").unwrap();
        let first = read_new_lines(&path, 0);
        assert_eq!(first.new_offset, 16);

        std::fs::write(&path, b"{\"c\":3}\n").unwrap();
        let second = read_new_lines(&path, first.new_offset);
        assert_eq!(second.lines, vec![r#"{"c":3}"#.to_string()]);
    }

    #[test]
    fn transcript_line_tool_call_sets_user_prompt_flag() {
        let line = serde_json::json!({
            "message": {"content": [{"type": "tool_use", "name": "AskUserQuestion", "input": {}}]}
        })
        .to_string();
        match parse_transcript_line(&line) {
            TranscriptLine::ToolCall { is_user_prompt, .. } => assert!(is_user_prompt),
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn transcript_line_send_message_becomes_message() {
        let line = serde_json::json!({
            "agentName": "lead",
            "message": {"content": [{"type": "tool_use", "name": "SendMessage", "input": {
                "type": "broadcast", "content": "Team standup in 5 minutes", "summary": "Standup reminder"
            }}]}
        }).to_string();
        match parse_transcript_line(&line) {
            TranscriptLine::Message(m) => {
                assert_eq!(m.from, "lead");
                assert_eq!(m.to, "all");
                assert_eq!(m.content, "Standup reminder");
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[test]
    fn transcript_line_send_message_shutdown_request_falls_through_to_tool_call() {
        let line = serde_json::json!({
            "message": {"content": [{"type": "tool_use", "name": "SendMessage", "input": {
                "type": "shutdown_request", "to": "researcher"
            }}]}
        })
        .to_string();
        match parse_transcript_line(&line) {
            TranscriptLine::ToolCall { tool_name, .. } => {
                assert_eq!(tool_name, "Requesting researcher shutdown");
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn transcript_line_compact_boundary() {
        let line = r#"{"type":"system","subtype":"compact_boundary"}"#;
        assert!(matches!(parse_transcript_line(line), TranscriptLine::Compact));
    }

    #[test]
    fn transcript_line_tool_result_is_agent_activity() {
        let line = r#"{"type":"tool_result"}"#;
        assert!(matches!(
            parse_transcript_line(line),
            TranscriptLine::AgentActivity
        ));
    }
}

impl std::fmt::Debug for TranscriptLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranscriptLine::Message(_) => write!(f, "Message"),
            TranscriptLine::ToolCall { tool_name, .. } => write!(f, "ToolCall({tool_name})"),
            TranscriptLine::AgentActivity => write!(f, "AgentActivity"),
            TranscriptLine::Compact => write!(f, "Compact"),
            TranscriptLine::Thinking { tool_name } => write!(f, "Thinking({tool_name})"),
            TranscriptLine::Progress => write!(f, "Progress"),
            TranscriptLine::Unknown => write!(f, "Unknown"),
        }
    }
}
