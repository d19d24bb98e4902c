//! HookHandler: stateless dispatch of lifecycle hook events onto a
//! `StateManager`. Owns three small maps not shared with anything else:
//! `pendingTaskSpawns`, `gitInfoDetected`, `sessionCwd`.

use crate::errors::HookError;
use crate::gitprobe::{self, GitExecutor};
use crate::model::{now_ms, Agent, AgentStatus, Message, Millis, Role, Session, Task, TaskStatus};
use crate::parsers::{describe_tool_action, infer_role};
use crate::state::StateManager;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

const SPAWN_EXPIRY: Millis = 60_000;

#[derive(Debug, Clone, Deserialize)]
pub struct HookEvent {
    pub session_id: String,
    #[serde(default)]
    pub cwd: Option<String>,
    pub hook_event_name: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default)]
    pub tool_response: Value,
    #[serde(default)]
    pub team_name: Option<String>,
    #[serde(default)]
    pub teammate_name: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone)]
struct PendingSpawn {
    description: Option<String>,
    prompt: Option<String>,
    subagent_type: String,
    session_id: String,
    timestamp: Millis,
    team_name: Option<String>,
}

static GIT_MUTATING_COMMAND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"git (push|commit|pull|merge|rebase|checkout|switch)|gh pr").unwrap()
});
static TASK_ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"Task #(\d+)").unwrap());

pub struct HookHandler {
    state: Arc<StateManager>,
    executor: Arc<dyn GitExecutor>,
    pending_task_spawns: Mutex<HashMap<String, PendingSpawn>>,
    git_info_detected: Mutex<HashSet<String>>,
    session_cwd: Mutex<HashMap<String, String>>,
}

impl HookHandler {
    pub fn new(state: Arc<StateManager>, executor: Arc<dyn GitExecutor>) -> Arc<Self> {
        Arc::new(Self {
            state,
            executor,
            pending_task_spawns: Mutex::new(HashMap::new()),
            git_info_detected: Mutex::new(HashSet::new()),
            session_cwd: Mutex::new(HashMap::new()),
        })
    }

    pub async fn handle_event(self: &Arc<Self>, event: HookEvent) -> Result<(), HookError> {
        if event.session_id.is_empty() {
            return Err(HookError::EmptySessionId);
        }

        self.state.update_session_activity(&event.session_id);
        self.state.mark_hook_active(&event.session_id);

        if let Some(cwd) = &event.cwd {
            self.session_cwd
                .lock()
                .unwrap()
                .entry(event.session_id.clone())
                .or_insert_with(|| cwd.clone());
        }

        self.auto_register(&event);

        if let Some(cwd) = self.session_cwd.lock().unwrap().get(&event.session_id).cloned() {
            self.maybe_probe_git(event.session_id.clone(), cwd);
        }

        self.dispatch(event)
    }

    fn is_subagent_lifecycle(event_name: &str) -> bool {
        matches!(event_name, "SubagentStart" | "SubagentStop")
    }

    fn auto_register(&self, event: &HookEvent) {
        if self.state.get_agent(&event.session_id).is_some() {
            return;
        }
        if Self::is_subagent_lifecycle(&event.hook_event_name) {
            return;
        }

        if let Some(session) = self.state.get_session(&event.session_id) {
            let name = session
                .slug
                .clone()
                .or_else(|| session.project_name.clone())
                .unwrap_or_else(|| "claude".to_string());
            let agent = Agent::new(event.session_id.clone(), name, Role::Implementer);
            self.state.register_agent(agent.clone());
            self.state.update_agent(agent);
            return;
        }

        if let Some(cwd) = &event.cwd {
            let project_name = cwd
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or("claude")
                .to_string();
            let mut session = Session::new(event.session_id.clone());
            session.project_path = Some(cwd.clone());
            session.project_name = Some(project_name.clone());
            self.state.add_session(session);

            let mut agent = Agent::new(event.session_id.clone(), project_name, Role::Implementer);
            agent.status = AgentStatus::Working;
            self.state.register_agent(agent.clone());
            self.state.update_agent(agent);
        }
    }

    fn maybe_probe_git(self: &Arc<Self>, session_id: String, cwd: String) {
        if !self.git_info_detected.lock().unwrap().insert(session_id.clone()) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let cwd_path = std::path::PathBuf::from(&cwd);
            let worktree = gitprobe::detect_git_worktree(this.executor.as_ref(), &cwd_path).await;
            let status = gitprobe::detect_git_status(this.executor.as_ref(), &cwd_path).await;
            let branch = gitprobe::detect_current_branch(this.executor.as_ref(), &cwd_path).await;
            this.state.update_agent_git_info(
                &session_id,
                branch,
                worktree.worktree,
                Some(status.ahead),
                Some(status.behind),
                Some(status.has_upstream),
                Some(status.is_dirty),
            );
        });
    }

    fn dispatch(self: &Arc<Self>, event: HookEvent) -> Result<(), HookError> {
        let action = event
            .tool_name
            .as_deref()
            .map(|name| describe_tool_action(name, &event.tool_input));

        match event.hook_event_name.as_str() {
            "PreToolUse" => self.on_pre_tool_use(&event, action),
            "PostToolUse" => self.on_post_tool_use(&event),
            "PostToolUseFailure" => self.on_post_tool_use_failure(&event),
            "PermissionRequest" => {
                self.state.set_agent_waiting_by_id(
                    &event.session_id,
                    true,
                    action.as_ref().map(|a| a.action.as_str()),
                    action.as_ref().map(|a| a.action.as_str()),
                    action.as_ref().and_then(|a| a.context.as_deref()),
                );
            }
            "SubagentStart" => self.on_subagent_start(&event),
            "SubagentStop" => self.on_subagent_stop(&event),
            "PreCompact" => {
                self.state.update_agent_activity_by_id(
                    &event.session_id,
                    AgentStatus::Working,
                    Some("Compacting conversation..."),
                    None,
                );
            }
            "Stop" => {
                self.state
                    .update_agent_activity_by_id(&event.session_id, AgentStatus::Idle, None, None);
                self.state.mark_session_stopped(&event.session_id);
            }
            "SessionStart" => {
                tracing::info!(session_id = %event.session_id, "session started");
            }
            "SessionEnd" => {
                self.state
                    .update_agent_activity_by_id(&event.session_id, AgentStatus::Idle, None, None);
            }
            "UserPromptSubmit" => {
                self.state.clear_session_stopped(&event.session_id);
                self.state
                    .set_agent_waiting_by_id(&event.session_id, false, None, None, None);
                self.state.update_agent_activity_by_id(
                    &event.session_id,
                    AgentStatus::Working,
                    Some("Processing prompt..."),
                    None,
                );
            }
            "TeammateIdle" => {
                if let Some(name) = &event.teammate_name {
                    self.state.update_agent_activity(name, AgentStatus::Idle, None, None);
                } else {
                    self.state
                        .update_agent_activity_by_id(&event.session_id, AgentStatus::Idle, None, None);
                }
            }
            "TaskCompleted" => self.on_task_completed(&event),
            "Notification" => {
                tracing::debug!(session_id = %event.session_id, "notification hook");
            }
            other => {
                return Err(HookError::UnknownEvent(other.to_string()));
            }
        }
        Ok(())
    }

    fn on_pre_tool_use(&self, event: &HookEvent, action: Option<crate::parsers::ToolAction>) {
        self.state.clear_session_stopped(&event.session_id);

        if event.tool_name.as_deref() == Some("Task") {
            if let Some(tool_use_id) = &event.tool_use_id {
                let mut pending = self.pending_task_spawns.lock().unwrap();
                let now = now_ms();
                pending.retain(|_, spawn| now - spawn.timestamp < SPAWN_EXPIRY);
                let input = &event.tool_input;
                let prompt_first_line = input
                    .get("prompt")
                    .and_then(Value::as_str)
                    .and_then(|p| p.lines().next())
                    .map(|l| l.chars().take(80).collect::<String>());
                pending.insert(
                    tool_use_id.clone(),
                    PendingSpawn {
                        description: input.get("description").and_then(Value::as_str).map(str::to_string),
                        prompt: prompt_first_line,
                        subagent_type: input
                            .get("subagent_type")
                            .and_then(Value::as_str)
                            .unwrap_or("general-purpose")
                            .to_string(),
                        session_id: event.session_id.clone(),
                        timestamp: now,
                        team_name: event.team_name.clone(),
                    },
                );
            }
        }

        self.state
            .set_agent_waiting_by_id(&event.session_id, false, None, None, None);
        self.state.update_agent_activity_by_id(
            &event.session_id,
            AgentStatus::Working,
            action.as_ref().map(|a| a.action.as_str()),
            action.as_ref().and_then(|a| a.context.as_deref()),
        );
    }

    fn on_post_tool_use(&self, event: &HookEvent) {
        self.state
            .set_agent_waiting_by_id(&event.session_id, false, None, None, None);

        if event.tool_name.as_deref() == Some("Bash") {
            if let Some(command) = event.tool_input.get("command").and_then(Value::as_str) {
                if GIT_MUTATING_COMMAND.is_match(command) {
                    if let Some(cwd) = self.session_cwd.lock().unwrap().get(&event.session_id).cloned() {
                        gitprobe::clear_git_status_cache(std::path::Path::new(&cwd));
                    }
                }
            }
        }

        match event.tool_name.as_deref() {
            Some("SendMessage") | Some("SendMessageTool") => self.handle_send_message(event),
            Some("TeamCreate") => self.handle_team_create(event),
            Some("TeamDelete") => {
                self.state.clear_team_agents();
                self.add_system_message("Team deleted");
            }
            Some("TaskCreate") => self.handle_task_create(event),
            Some("TaskUpdate") => self.handle_task_update(event),
            _ => {}
        }
    }

    fn on_post_tool_use_failure(&self, event: &HookEvent) {
        self.state
            .set_agent_waiting_by_id(&event.session_id, false, None, None, None);
        if let Some(tool) = &event.tool_name {
            tracing::warn!(session_id = %event.session_id, tool, "tool call failed");
        }
    }

    fn handle_send_message(&self, event: &HookEvent) {
        let input = &event.tool_input;
        let content = input.get("content").and_then(Value::as_str).unwrap_or("");
        let summary = input.get("summary").and_then(Value::as_str);
        if content.is_empty() && summary.unwrap_or("").is_empty() {
            return;
        }
        let kind = input.get("type").and_then(Value::as_str).unwrap_or("message");
        let to = match kind {
            "broadcast" => "team (broadcast)".to_string(),
            "shutdown_request" => format!(
                "Shutdown request: {}",
                input.get("to").and_then(Value::as_str).unwrap_or("agent")
            ),
            _ => input.get("to").and_then(Value::as_str).unwrap_or("agent").to_string(),
        };
        let from = self
            .state
            .get_agent(&event.session_id)
            .map(|a| a.name)
            .unwrap_or_else(|| event.session_id.chars().take(8).collect());

        self.state.add_message(Message {
            id: format!("msg-{}", now_ms()),
            from,
            to,
            content: summary.unwrap_or(content).chars().take(200).collect(),
            timestamp: now_ms(),
        });
    }

    fn handle_team_create(&self, event: &HookEvent) {
        let Some(team_name) = event.team_name.clone() else { return };
        self.state.set_team_name(&team_name);

        if let Some(members) = event.tool_response.get("members").and_then(Value::as_array) {
            for member in members {
                let Some(name) = member.get("name").and_then(Value::as_str) else { continue };
                let id = member
                    .get("agentId")
                    .and_then(Value::as_str)
                    .unwrap_or(name)
                    .to_string();
                let agent_type = member.get("agentType").and_then(Value::as_str).unwrap_or("");
                let role = infer_role(agent_type, name);
                self.state.clear_recently_removed(&id);
                let mut agent = Agent::new(id, name, role);
                agent.team_name = Some(team_name.clone());
                self.state.register_agent(agent.clone());
                self.state.update_agent(agent);
            }
        }

        self.add_system_message(&format!("Team \"{team_name}\" created"));
    }

    fn add_system_message(&self, content: &str) {
        self.state.add_message(Message {
            id: format!("msg-{}", now_ms()),
            from: "system".to_string(),
            to: "all".to_string(),
            content: content.to_string(),
            timestamp: now_ms(),
        });
    }

    fn handle_task_create(&self, event: &HookEvent) {
        let response_str = event
            .tool_response
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| event.tool_response.to_string());
        let id = TASK_ID_PATTERN
            .captures(&response_str)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| format!("hook-{}", now_ms()));

        let input = &event.tool_input;
        let subject = input
            .get("subject")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                input
                    .get("description")
                    .and_then(Value::as_str)
                    .map(|d| d.chars().take(60).collect())
            })
            .unwrap_or_else(|| "Untitled task".to_string());

        self.state.update_task(Task {
            id,
            subject,
            status: TaskStatus::Pending,
            owner: input.get("owner").and_then(Value::as_str).map(str::to_string),
            blocked_by: Vec::new(),
            blocks: Vec::new(),
        });
    }

    fn handle_task_update(&self, event: &HookEvent) {
        let input = &event.tool_input;
        let Some(task_id) = input.get("taskId").and_then(Value::as_str) else { return };
        if task_id.is_empty() {
            return;
        }
        let Some(mut task) = self.find_task(task_id) else { return };

        if input.get("status").and_then(Value::as_str) == Some("deleted") {
            self.state.remove_task(task_id);
            return;
        }

        if let Some(status) = input.get("status").and_then(Value::as_str) {
            task.status = match status {
                "pending" => TaskStatus::Pending,
                "in_progress" => TaskStatus::InProgress,
                "completed" => TaskStatus::Completed,
                _ => task.status,
            };
        }
        if let Some(owner) = input.get("owner").and_then(Value::as_str) {
            task.owner = Some(owner.to_string());
        }

        self.state.update_task(task);
        self.state.reconcile_agent_statuses();
    }

    fn find_task(&self, task_id: &str) -> Option<Task> {
        self.state
            .current_state()
            .tasks
            .into_iter()
            .find(|t| t.id == task_id)
    }

    fn on_subagent_start(&self, event: &HookEvent) {
        let spawn = {
            let mut pending = self.pending_task_spawns.lock().unwrap();
            let oldest_key = pending
                .iter()
                .filter(|(_, s)| s.session_id == event.session_id)
                .min_by_key(|(_, s)| s.timestamp)
                .map(|(k, _)| k.clone());
            oldest_key.and_then(|k| pending.remove(&k))
        };

        let name = spawn
            .as_ref()
            .and_then(|s| s.description.clone().or_else(|| s.prompt.clone()))
            .or_else(|| event.agent_type.clone())
            .unwrap_or_else(|| "subagent".to_string());
        let subagent_type = spawn
            .as_ref()
            .map(|s| s.subagent_type.clone())
            .or_else(|| event.agent_type.clone())
            .unwrap_or_else(|| "general-purpose".to_string());
        let role = infer_role(&subagent_type, &name);

        let agent_id = event.agent_id.clone().unwrap_or_else(|| event.session_id.clone());
        let mut agent = Agent::new(agent_id, name, role);
        agent.status = AgentStatus::Working;
        match spawn.and_then(|s| s.team_name) {
            Some(team) => {
                agent.is_subagent = false;
                agent.team_name = Some(team);
            }
            None => {
                agent.is_subagent = true;
                agent.parent_agent_id = Some(event.session_id.clone());
            }
        }
        self.state.register_agent(agent.clone());
        self.state.update_agent(agent);
    }

    fn on_subagent_stop(self: &Arc<Self>, event: &HookEvent) {
        let agent_id = event.agent_id.clone().unwrap_or_else(|| event.session_id.clone());
        let Some(agent) = self.state.get_agent(&agent_id) else { return };
        if agent.is_subagent {
            self.state
                .update_agent_activity_by_id(&agent_id, AgentStatus::Done, Some("Done"), None);
            self.state.schedule_subagent_removal(agent_id);
        } else {
            self.state
                .update_agent_activity_by_id(&agent_id, AgentStatus::Idle, None, None);
        }
    }

    fn on_task_completed(&self, event: &HookEvent) {
        let Some(task_id) = &event.task_id else { return };
        if let Some(mut task) = self.find_task(task_id) {
            task.status = TaskStatus::Completed;
            self.state.update_task(task);
        }
        if let Some(name) = &event.teammate_name {
            if let Some(mut agent) = self.state.get_agent_by_name(name) {
                agent.tasks_completed += 1;
                self.state.update_agent(agent);
            }
        }
        self.state.reconcile_agent_statuses();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoopExecutor;
    #[async_trait]
    impl GitExecutor for NoopExecutor {
        async fn run(&self, _cwd: &std::path::Path, _args: &[&str]) -> Result<String, crate::errors::ParseError> {
            Err(crate::errors::ParseError::GitFailed("no git in tests".into()))
        }
    }

    fn handler() -> Arc<HookHandler> {
        HookHandler::new(StateManager::new(), Arc::new(NoopExecutor))
    }

    fn event(session_id: &str, hook: &str) -> HookEvent {
        HookEvent {
            session_id: session_id.to_string(),
            cwd: Some("/tmp/project".to_string()),
            hook_event_name: hook.to_string(),
            tool_name: None,
            tool_use_id: None,
            tool_input: Value::Null,
            tool_response: Value::Null,
            team_name: None,
            teammate_name: None,
            task_id: None,
            agent_type: None,
            agent_id: None,
        }
    }

    #[tokio::test]
    async fn empty_session_id_is_rejected() {
        let h = handler();
        let mut e = event("s1", "UserPromptSubmit");
        e.session_id = String::new();
        assert!(matches!(h.handle_event(e).await, Err(HookError::EmptySessionId)));
    }

    #[tokio::test]
    async fn auto_registers_session_and_agent_from_cwd() {
        let h = handler();
        h.handle_event(event("s1", "UserPromptSubmit")).await.unwrap();
        assert!(h.state.has_session("s1"));
        assert!(h.state.get_agent("s1").is_some());
    }

    #[tokio::test]
    async fn stop_marks_session_stopped_and_idle() {
        let h = handler();
        h.handle_event(event("s1", "UserPromptSubmit")).await.unwrap();
        h.handle_event(event("s1", "Stop")).await.unwrap();
        assert!(h.state.is_session_stopped("s1"));
        assert_eq!(h.state.get_agent("s1").unwrap().status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn unknown_hook_event_name_is_rejected() {
        let h = handler();
        let result = h.handle_event(event("s1", "SomeFutureEvent")).await;
        assert!(matches!(result, Err(HookError::UnknownEvent(name)) if name == "SomeFutureEvent"));
    }

    #[tokio::test]
    async fn pre_tool_use_records_pending_task_spawn() {
        let h = handler();
        let mut e = event("s1", "PreToolUse");
        e.tool_name = Some("Task".to_string());
        e.tool_use_id = Some("tu1".to_string());
        e.tool_input = serde_json::json!({"description": "do the thing", "subagent_type": "researcher"});
        h.handle_event(e).await.unwrap();
        assert!(h.pending_task_spawns.lock().unwrap().contains_key("tu1"));
    }

    #[tokio::test]
    async fn subagent_start_consumes_oldest_pending_spawn_fifo() {
        let h = handler();
        let mut pre1 = event("s1", "PreToolUse");
        pre1.tool_name = Some("Task".to_string());
        pre1.tool_use_id = Some("tu1".to_string());
        pre1.tool_input = serde_json::json!({"description": "first"});
        h.handle_event(pre1).await.unwrap();

        let mut sub_start = event("sub1", "SubagentStart");
        sub_start.session_id = "sub1".to_string();
        h.pending_task_spawns.lock().unwrap().insert(
            "tu1".to_string(),
            PendingSpawn {
                description: Some("first".to_string()),
                prompt: None,
                subagent_type: "general-purpose".to_string(),
                session_id: "sub1".to_string(),
                timestamp: now_ms() - 1000,
                team_name: None,
            },
        );
        h.handle_event(sub_start).await.unwrap();
        let agent = h.state.get_agent("sub1").unwrap();
        assert_eq!(agent.name, "first");
        assert!(agent.is_subagent);
    }

    #[tokio::test]
    async fn concurrent_subagent_starts_at_same_session_id_stay_distinct_by_agent_id() {
        let h = handler();
        let mut a = event("parent", "SubagentStart");
        a.agent_id = Some("sub-a".to_string());
        let mut b = event("parent", "SubagentStart");
        b.agent_id = Some("sub-b".to_string());

        h.handle_event(a).await.unwrap();
        h.handle_event(b).await.unwrap();

        let agent_a = h.state.get_agent("sub-a").unwrap();
        let agent_b = h.state.get_agent("sub-b").unwrap();
        assert!(agent_a.is_subagent);
        assert!(agent_b.is_subagent);
        assert_eq!(agent_a.parent_agent_id.as_deref(), Some("parent"));
        assert_eq!(agent_b.parent_agent_id.as_deref(), Some("parent"));
    }

    #[tokio::test]
    async fn task_create_extracts_id_from_response_regex() {
        let h = handler();
        h.handle_event(event("s1", "UserPromptSubmit")).await.unwrap();
        let mut e = event("s1", "PostToolUse");
        e.tool_name = Some("TaskCreate".to_string());
        e.tool_input = serde_json::json!({"subject": "Write tests"});
        e.tool_response = serde_json::json!({"result": "Created Task #42"});
        h.handle_event(e).await.unwrap();
        let state = h.state.current_state();
        assert!(state.tasks.iter().any(|t| t.id == "42" && t.subject == "Write tests"));
    }

    #[tokio::test]
    async fn post_tool_use_failure_skips_side_channel_parsing() {
        let h = handler();
        h.handle_event(event("s1", "UserPromptSubmit")).await.unwrap();
        let mut e = event("s1", "PostToolUseFailure");
        e.tool_name = Some("TaskCreate".to_string());
        e.tool_response = serde_json::json!({"result": "Created Task #99"});
        h.handle_event(e).await.unwrap();
        let state = h.state.current_state();
        assert!(!state.tasks.iter().any(|t| t.id == "99"));
    }
}
