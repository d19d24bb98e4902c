//! Core data types shared by the StateManager, HookHandler and Watcher.
//!
//! These are plain data: no behavior lives here beyond small derived-field
//! helpers. Serialization matches the wire shape documented for the
//! WebSocket envelope.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub type Millis = i64;

pub fn now_ms() -> Millis {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Lead,
    Researcher,
    Implementer,
    Tester,
    Planner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentAction {
    pub action: String,
    pub timestamp: Millis,
}

/// A visual character for one participant: solo session agent, team member, or subagent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub status: AgentStatus,
    #[serde(default)]
    pub tasks_completed: u32,
    #[serde(default)]
    pub waiting_for_input: bool,
    #[serde(default)]
    pub waiting_type: Option<String>,
    #[serde(default)]
    pub current_action: Option<String>,
    #[serde(default)]
    pub action_context: Option<String>,
    #[serde(default)]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub recent_actions: Vec<RecentAction>,
    #[serde(default)]
    pub is_subagent: bool,
    #[serde(default)]
    pub parent_agent_id: Option<String>,
    #[serde(default)]
    pub team_name: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
    #[serde(default)]
    pub git_worktree: Option<String>,
    #[serde(default)]
    pub git_ahead: Option<u32>,
    #[serde(default)]
    pub git_behind: Option<u32>,
    #[serde(default)]
    pub git_has_upstream: Option<bool>,
    #[serde(default)]
    pub git_dirty: Option<bool>,
}

pub const MAX_RECENT_ACTIONS: usize = 5;

impl Agent {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
            status: AgentStatus::Idle,
            tasks_completed: 0,
            waiting_for_input: false,
            waiting_type: None,
            current_action: None,
            action_context: None,
            current_task_id: None,
            recent_actions: Vec::new(),
            is_subagent: false,
            parent_agent_id: None,
            team_name: None,
            git_branch: None,
            git_worktree: None,
            git_ahead: None,
            git_behind: None,
            git_has_upstream: None,
            git_dirty: None,
        }
    }

    pub fn push_recent_action(&mut self, action: String, timestamp: Millis) {
        self.recent_actions.push(RecentAction { action, timestamp });
        if self.recent_actions.len() > MAX_RECENT_ACTIONS {
            let overflow = self.recent_actions.len() - MAX_RECENT_ACTIONS;
            self.recent_actions.drain(0..overflow);
        }
    }

    /// Copy the fields `setAgents` preserves across a bulk display replace.
    pub fn carry_forward_from(&mut self, prior: &Agent) {
        self.tasks_completed = prior.tasks_completed;
        self.status = prior.status;
        self.current_action = prior.current_action.clone();
        self.action_context = prior.action_context.clone();
        self.current_task_id = prior.current_task_id.clone();
        self.recent_actions = prior.recent_actions.clone();
        self.git_branch = prior.git_branch.clone();
        self.git_worktree = prior.git_worktree.clone();
        self.git_ahead = prior.git_ahead;
        self.git_behind = prior.git_behind;
        self.git_has_upstream = prior.git_has_upstream;
        self.git_dirty = prior.git_dirty;
        self.team_name = prior.team_name.clone();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub project_path: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub main_repo_path: Option<String>,
    #[serde(default)]
    pub is_team: bool,
    #[serde(default)]
    pub team_name: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
    #[serde(default)]
    pub git_worktree: Option<String>,
    pub last_activity: Millis,
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            slug: None,
            project_path: None,
            project_name: None,
            main_repo_path: None,
            is_team: false,
            team_name: None,
            agent_id: None,
            git_branch: None,
            git_worktree: None,
            last_activity: now_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub subject: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub blocks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: String,
    pub content: String,
    pub timestamp: Millis,
}

pub const MAX_MESSAGES: usize = 200;

/// What a client sees for its currently-selected session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeamState {
    pub name: String,
    pub agents: Vec<Agent>,
    pub tasks: Vec<Task>,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListEntry {
    pub session_id: String,
    pub project_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    pub last_activity: Millis,
    pub active: bool,
    pub has_waiting_agent: bool,
    pub is_team: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchGroup {
    pub branch: String,
    pub is_default: bool,
    pub active: bool,
    pub has_waiting_agent: bool,
    pub last_activity: Millis,
    pub sessions: Vec<SessionListEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectGroup {
    pub project_key: String,
    pub project_name: String,
    pub active: bool,
    pub has_waiting_agent: bool,
    pub last_activity: Millis,
    pub branches: Vec<BranchGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupedSessionsList {
    pub projects: Vec<ProjectGroup>,
    pub flat_sessions: Vec<SessionListEntry>,
}

/// Per-tracked-file/session Watcher bookkeeping (§4.5).
#[derive(Debug, Clone, Default)]
pub struct TrackedSession {
    /// The session this file belongs to (top-level files: their own id;
    /// subagent files: the parent session's id).
    pub session_id: String,
    /// The agent id this file's activity should mutate: the session id
    /// itself for a top-level solo file, or the subagent's own id.
    pub target_agent_id: String,
    pub is_team: bool,
    pub last_activity: Millis,
    pub last_tool_use_at: Option<Millis>,
    pub pending_tool_name: Option<String>,
    pub is_internal_subagent: bool,
    pub is_subagent: bool,
}

/// Events broadcast by StateManager to all subscribers (§4.3).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BroadcastEvent {
    FullState(TeamState),
    AgentUpdate(Agent),
    AgentAdded(Agent),
    AgentRemoved { id: String },
    TaskUpdate(Task),
    NewMessage(Message),
    SessionStarted(Session),
    SessionEnded { session_id: String },
    SessionsList(Vec<SessionListEntry>),
    SessionsGrouped(GroupedSessionsList),
}

/// Ids of sessions referenced by any currently-tracked file; used by the
/// Watcher to decide whether a session can be torn down on unlink.
pub type ReferencedSessions = HashSet<String>;
