//! Watcher: three recursive `notify` watches over `<claude_dir>/{teams,tasks,projects}`,
//! tailing transcript JSONL, team configs and task files into `StateManager` mutations.

use crate::config::AppConfig;
use crate::errors::WatcherError;
use crate::gitprobe::{self, GitExecutor};
use crate::model::{
    now_ms, Agent, AgentStatus, Message, Millis, Role, Session, Task, TaskStatus, TrackedSession,
};
use crate::parsers::{self, read_new_lines, TranscriptLine};
use crate::state::StateManager;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcherTrait};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TRANSCRIPT_DEBOUNCE: Duration = Duration::from_millis(100);
const WAITING_CHECK_DELAY: Duration = Duration::from_secs(45);
const STALENESS_INTERVAL: Duration = Duration::from_secs(15);
const STALE_IDLE_MS: Millis = 45_000;
const IDLE_THRESHOLD_MS: Millis = 60_000;
const SUBAGENT_REAP_MS: Millis = 300_000;
const INITIAL_SCAN_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
const INITIAL_SCAN_SUBAGENT_MAX_AGE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Deserialize, Default)]
struct TeamConfig {
    #[serde(default)]
    members: Vec<TeamMember>,
}

#[derive(Debug, Deserialize)]
struct TeamMember {
    name: String,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    agent_type: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TaskFile {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    blocked_by: Vec<String>,
    #[serde(default)]
    blocks: Vec<String>,
}

pub struct Watcher {
    state: Arc<StateManager>,
    executor: Arc<dyn GitExecutor>,
    teams_dir: PathBuf,
    tasks_dir: PathBuf,
    projects_dir: PathBuf,
    file_offsets: Mutex<HashMap<PathBuf, u64>>,
    tracked: Mutex<HashMap<PathBuf, TrackedSession>>,
    registered_sessions: Mutex<HashSet<String>>,
    transcript_debounce: Mutex<HashMap<PathBuf, JoinHandle<()>>>,
    waiting_checks: Mutex<HashMap<PathBuf, JoinHandle<()>>>,
    watchers: Mutex<Vec<RecommendedWatcher>>,
    ready: AtomicBool,
}

impl Watcher {
    pub fn new(state: Arc<StateManager>, executor: Arc<dyn GitExecutor>, config: &AppConfig) -> Arc<Self> {
        Arc::new(Self {
            state,
            executor,
            teams_dir: config.teams_dir(),
            tasks_dir: config.tasks_dir(),
            projects_dir: config.projects_dir(),
            file_offsets: Mutex::new(HashMap::new()),
            tracked: Mutex::new(HashMap::new()),
            registered_sessions: Mutex::new(HashSet::new()),
            transcript_debounce: Mutex::new(HashMap::new()),
            waiting_checks: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
            ready: AtomicBool::new(false),
        })
    }

    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), WatcherError> {
        for dir in [&self.teams_dir, &self.tasks_dir, &self.projects_dir] {
            std::fs::create_dir_all(dir).map_err(|source| WatcherError::Io {
                path: dir.clone(),
                source,
            })?;
        }

        self.initial_scan().await;
        self.ready.store(true, Ordering::SeqCst);

        self.watch_dir(&self.teams_dir.clone())?;
        self.watch_dir(&self.tasks_dir.clone())?;
        self.watch_dir(&self.projects_dir.clone())?;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STALENESS_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => this.staleness_sweep(),
                    _ = cancel.cancelled() => break,
                }
            }
        });

        Ok(())
    }

    fn watch_dir(self: &Arc<Self>, dir: &Path) -> Result<(), WatcherError> {
        let this = Arc::clone(self);
        let handle = tokio::runtime::Handle::current();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let Ok(event) = res else { return };
            let this = Arc::clone(&this);
            handle.spawn(async move { this.on_fs_event(event).await });
        })
        .map_err(|source| WatcherError::Watch {
            path: dir.to_path_buf(),
            source,
        })?;
        watcher
            .watch(dir, RecursiveMode::Recursive)
            .map_err(|source| WatcherError::Watch {
                path: dir.to_path_buf(),
                source,
            })?;
        self.watchers.lock().unwrap().push(watcher);
        Ok(())
    }

    async fn on_fs_event(self: Arc<Self>, event: Event) {
        let removed = matches!(event.kind, EventKind::Remove(_));
        for path in event.paths {
            self.route_path(path, removed).await;
        }
    }

    async fn route_path(self: &Arc<Self>, path: PathBuf, removed: bool) {
        if path.starts_with(&self.teams_dir) {
            if path.file_name().and_then(|n| n.to_str()) == Some("config.json") {
                self.handle_team_config(path, removed).await;
            }
        } else if path.starts_with(&self.tasks_dir) {
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                self.handle_task_file(path, removed).await;
            }
        } else if path.starts_with(&self.projects_dir)
            && path.extension().and_then(|e| e.to_str()) == Some("jsonl")
        {
            if removed {
                self.handle_unlink(&path);
            } else {
                self.schedule_transcript_change(path);
            }
        }
    }

    async fn initial_scan(self: &Arc<Self>) {
        let now = std::time::SystemTime::now();
        for path in walk(&self.teams_dir) {
            if path.file_name().and_then(|n| n.to_str()) == Some("config.json") {
                self.handle_team_config(path, false).await;
            }
        }
        for path in walk(&self.tasks_dir) {
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                self.handle_task_file(path, false).await;
            }
        }
        for path in walk(&self.projects_dir) {
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let is_subagent = path.to_string_lossy().contains("/subagents/");
            let max_age = if is_subagent {
                INITIAL_SCAN_SUBAGENT_MAX_AGE
            } else {
                INITIAL_SCAN_MAX_AGE
            };
            let age = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|m| now.duration_since(m).ok());
            if age.map(|a| a > max_age).unwrap_or(true) {
                continue;
            }
            self.detect_session(&path).await;
        }
    }

    // ---- team configs ----

    async fn handle_team_config(&self, path: PathBuf, removed: bool) {
        let Some(team_name) = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .map(str::to_string)
        else {
            return;
        };

        if removed {
            self.state.clear_team_agents();
            return;
        }

        let Ok(contents) = std::fs::read_to_string(&path) else { return };
        let Ok(config) = serde_json::from_str::<TeamConfig>(&contents) else {
            tracing::warn!(path = %path.display(), "malformed team config");
            return;
        };

        self.state.set_team_name(&team_name);
        let agents: Vec<Agent> = config
            .members
            .into_iter()
            .map(|m| {
                let id = m.agent_id.unwrap_or_else(|| m.name.clone());
                let role = parsers::infer_role(m.agent_type.as_deref().unwrap_or(""), &m.name);
                let mut agent = Agent::new(id, m.name, role);
                agent.team_name = Some(team_name.clone());
                agent
            })
            .collect();
        self.state.set_agents(agents);

        let sibling_tasks = self
            .tasks_dir
            .join(&team_name)
            .read_dir()
            .ok()
            .map(|rd| rd.filter_map(|e| e.ok().map(|e| e.path())).collect::<Vec<_>>())
            .unwrap_or_default();
        for task_path in sibling_tasks {
            if task_path.extension().and_then(|e| e.to_str()) == Some("json") {
                self.handle_task_file(task_path, false).await;
            }
        }
    }

    // ---- task files ----

    async fn handle_task_file(&self, path: PathBuf, removed: bool) {
        let basename = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        if removed {
            self.state.remove_task(&basename);
            self.state.reconcile_agent_statuses();
            return;
        }

        let Ok(contents) = std::fs::read_to_string(&path) else { return };
        let Ok(parsed) = serde_json::from_str::<TaskFile>(&contents) else {
            tracing::warn!(path = %path.display(), "malformed task file");
            return;
        };

        let status = match parsed.status.as_deref() {
            Some("deleted") => {
                self.state.remove_task(&basename);
                self.state.reconcile_agent_statuses();
                return;
            }
            Some("in_progress") => TaskStatus::InProgress,
            Some("completed") => TaskStatus::Completed,
            _ => TaskStatus::Pending,
        };

        self.state.update_task(Task {
            id: parsed.id.unwrap_or(basename),
            subject: parsed.subject.unwrap_or_else(|| "Untitled task".to_string()),
            status,
            owner: parsed.owner,
            blocked_by: parsed.blocked_by,
            blocks: parsed.blocks,
        });
        self.state.reconcile_agent_statuses();
    }

    // ---- transcript detection ----

    fn path_depth_under_projects(&self, path: &Path) -> Vec<String> {
        path.strip_prefix(&self.projects_dir)
            .ok()
            .map(|rel| rel.iter().map(|c| c.to_string_lossy().to_string()).collect())
            .unwrap_or_default()
    }

    async fn detect_session(self: &Arc<Self>, path: &Path) {
        let parts = self.path_depth_under_projects(path);
        let file_contents = std::fs::read_to_string(path).unwrap_or_default();
        let first_lines: Vec<&str> = file_contents.lines().take(20).collect();
        let meta = first_lines.iter().find_map(|l| parsers::parse_session_metadata(l));

        let file_mtime = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as Millis)
            .unwrap_or_else(now_ms);

        // subagent file: <dir>/<sessionId>/subagents/<agentId>.jsonl
        if parts.len() >= 4 && parts[parts.len() - 2] == "subagents" {
            let parent_session_id = parts[parts.len() - 3].clone();
            let agent_file = &parts[parts.len() - 1];
            let agent_id = agent_file.trim_end_matches(".jsonl").to_string();

            if agent_id.starts_with("agent-acompact") {
                self.state.update_agent_activity_by_id(
                    &parent_session_id,
                    AgentStatus::Working,
                    Some("Compacting conversation..."),
                    None,
                );
                self.tracked.lock().unwrap().insert(
                    path.to_path_buf(),
                    TrackedSession {
                        session_id: parent_session_id,
                        target_agent_id: agent_id,
                        is_team: false,
                        last_activity: file_mtime,
                        last_tool_use_at: None,
                        pending_tool_name: None,
                        is_internal_subagent: true,
                        is_subagent: false,
                    },
                );
                self.mark_offset_at_end(path);
                return;
            }

            let name = first_lines
                .iter()
                .find_map(|l| serde_json::from_str::<Value>(l).ok())
                .and_then(|v| {
                    v.get("message")
                        .and_then(|m| m.get("content"))
                        .and_then(|c| c.as_str().map(str::to_string).or_else(|| {
                            c.as_array()
                                .and_then(|arr| arr.first())
                                .and_then(|b| b.get("text"))
                                .and_then(Value::as_str)
                                .map(str::to_string)
                        }))
                })
                .map(|s| s.chars().take(40).collect::<String>())
                .unwrap_or_else(|| "subagent".to_string());

            let fresh = now_ms() - file_mtime < 60_000;
            let mut agent = Agent::new(agent_id.clone(), name, Role::Implementer);
            agent.is_subagent = true;
            agent.parent_agent_id = Some(parent_session_id.clone());
            agent.status = if fresh { AgentStatus::Working } else { AgentStatus::Idle };
            self.state.register_agent(agent.clone());
            self.state.update_agent(agent);

            self.tracked.lock().unwrap().insert(
                path.to_path_buf(),
                TrackedSession {
                    session_id: parent_session_id,
                    target_agent_id: agent_id,
                    is_team: false,
                    last_activity: file_mtime,
                    last_tool_use_at: None,
                    pending_tool_name: None,
                    is_internal_subagent: false,
                    is_subagent: true,
                },
            );
            self.mark_offset_at_end(path);
            return;
        }

        // top-level <dir>/<sessionId>.jsonl
        let filename_session_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let mut meta = meta.unwrap_or_default();
        meta.session_id = filename_session_id.clone();

        if let Some(cwd) = &meta.cwd {
            let branch = gitprobe::detect_current_branch(self.executor.as_ref(), Path::new(cwd)).await;
            if branch.is_some() {
                meta.git_branch = branch;
            }
        }
        meta.last_activity = file_mtime;

        let first_time = self.registered_sessions.lock().unwrap().insert(filename_session_id.clone());
        if first_time {
            if !meta.is_team {
                let name = meta
                    .slug
                    .clone()
                    .or_else(|| meta.project_name.clone())
                    .unwrap_or_else(|| "claude".to_string());
                let status = if now_ms() - file_mtime < 60_000 {
                    AgentStatus::Working
                } else {
                    AgentStatus::Idle
                };
                let mut agent = Agent::new(filename_session_id.clone(), name, Role::Implementer);
                agent.status = status;
                self.state.register_agent(agent.clone());
                self.state.update_agent(agent);
            }

            let mut session = Session::new(filename_session_id.clone());
            session.slug = meta.slug.clone();
            session.project_path = meta.cwd.clone();
            session.project_name = meta.project_name.clone();
            session.is_team = meta.is_team;
            session.team_name = meta.team_name.clone();
            session.git_branch = meta.git_branch.clone();
            session.last_activity = file_mtime;
            self.state.add_session(session);
        } else {
            self.state.update_session_activity(&filename_session_id);
        }

        self.tracked.lock().unwrap().insert(
            path.to_path_buf(),
            TrackedSession {
                session_id: filename_session_id.clone(),
                target_agent_id: filename_session_id,
                is_team: meta.is_team,
                last_activity: file_mtime,
                last_tool_use_at: None,
                pending_tool_name: None,
                is_internal_subagent: false,
                is_subagent: false,
            },
        );
        self.mark_offset_at_end(path);
    }

    fn mark_offset_at_end(&self, path: &Path) {
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        self.file_offsets.lock().unwrap().insert(path.to_path_buf(), size);
    }

    fn schedule_transcript_change(self: &Arc<Self>, path: PathBuf) {
        let this = Arc::clone(self);
        let key = path.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(TRANSCRIPT_DEBOUNCE).await;
            this.handle_transcript_change(&key).await;
            this.transcript_debounce.lock().unwrap().remove(&key);
        });
        if let Some(prior) = self.transcript_debounce.lock().unwrap().insert(path, handle) {
            prior.abort();
        }
    }

    async fn handle_transcript_change(self: &Arc<Self>, path: &Path) {
        if !self.tracked.lock().unwrap().contains_key(path) {
            self.detect_session(path).await;
        }

        let offset = self.file_offsets.lock().unwrap().get(path).copied().unwrap_or(0);
        let result = read_new_lines(path, offset);
        self.file_offsets.lock().unwrap().insert(path.to_path_buf(), result.new_offset);

        let mut had_activity = false;
        for line in &result.lines {
            if self.apply_transcript_line(path, line) {
                had_activity = true;
            }
        }

        let file_mtime_recent = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| now_ms() - d.as_millis() as Millis < 5 * 60 * 1000)
            .unwrap_or(false);

        if had_activity && file_mtime_recent {
            let (session_id, is_subagent, is_internal) = {
                let mut tracked = self.tracked.lock().unwrap();
                let Some(t) = tracked.get_mut(path) else { return };
                t.last_activity = now_ms();
                (t.session_id.clone(), t.is_subagent, t.is_internal_subagent)
            };
            self.state.update_session_activity(&session_id);

            if !is_subagent && !is_internal {
                self.schedule_waiting_check(path.to_path_buf());
            }
        }
    }

    fn apply_transcript_line(&self, path: &Path, line: &str) -> bool {
        let target_agent_id = {
            let tracked = self.tracked.lock().unwrap();
            match tracked.get(path) {
                Some(t) => t.target_agent_id.clone(),
                None => return false,
            }
        };

        match parsers::parse_transcript_line(line) {
            TranscriptLine::Message(m) => {
                self.state.add_message(Message {
                    id: m.id,
                    from: m.from,
                    to: m.to,
                    content: m.content,
                    timestamp: now_ms(),
                });
                true
            }
            TranscriptLine::Compact => {
                self.state.update_agent_activity_by_id(
                    &target_agent_id,
                    AgentStatus::Working,
                    Some("Compacting conversation..."),
                    None,
                );
                self.clear_pending_tool(path);
                true
            }
            TranscriptLine::Thinking { tool_name } => {
                self.clear_pending_tool(path);
                self.state
                    .set_agent_waiting_by_id(&target_agent_id, false, None, None, None);
                self.state
                    .update_agent_activity_by_id(&target_agent_id, AgentStatus::Working, Some(tool_name), None);
                true
            }
            TranscriptLine::ToolCall {
                tool_name,
                is_user_prompt,
                ..
            } => {
                {
                    let mut tracked = self.tracked.lock().unwrap();
                    if let Some(t) = tracked.get_mut(path) {
                        t.last_tool_use_at = Some(now_ms());
                        t.pending_tool_name = Some(tool_name.clone());
                    }
                }
                if is_user_prompt {
                    self.state
                        .set_agent_waiting_by_id(&target_agent_id, true, Some(tool_name.as_str()), None, None);
                }
                self.state.update_agent_activity_by_id(
                    &target_agent_id,
                    AgentStatus::Working,
                    Some(tool_name.as_str()),
                    None,
                );
                true
            }
            TranscriptLine::Progress => {
                let mut tracked = self.tracked.lock().unwrap();
                if let Some(t) = tracked.get_mut(path) {
                    t.last_tool_use_at = Some(now_ms());
                    if !t.is_team {
                        drop(tracked);
                        self.state
                            .set_agent_waiting_by_id(&target_agent_id, false, None, None, None);
                    }
                }
                true
            }
            TranscriptLine::AgentActivity => {
                self.clear_pending_tool(path);
                self.state
                    .set_agent_waiting_by_id(&target_agent_id, false, None, None, None);
                true
            }
            TranscriptLine::Unknown => false,
        }
    }

    fn clear_pending_tool(&self, path: &Path) {
        let mut tracked = self.tracked.lock().unwrap();
        if let Some(t) = tracked.get_mut(path) {
            t.last_tool_use_at = None;
            t.pending_tool_name = None;
        }
    }

    fn schedule_waiting_check(self: &Arc<Self>, path: PathBuf) {
        let captured = self
            .tracked
            .lock()
            .unwrap()
            .get(&path)
            .and_then(|t| t.last_tool_use_at);
        let this = Arc::clone(self);
        let key = path.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(WAITING_CHECK_DELAY).await;
            let still_pending = {
                let tracked = this.tracked.lock().unwrap();
                tracked.get(&key).map(|t| t.last_tool_use_at) == Some(captured)
            };
            if still_pending {
                if let Some(t) = this.tracked.lock().unwrap().get(&key).cloned() {
                    this.state.set_agent_waiting_by_id(
                        &t.target_agent_id,
                        true,
                        t.pending_tool_name.as_deref(),
                        t.pending_tool_name.as_deref(),
                        None,
                    );
                }
            }
            this.waiting_checks.lock().unwrap().remove(&key);
        });
        if let Some(prior) = self.waiting_checks.lock().unwrap().insert(path, handle) {
            prior.abort();
        }
    }

    fn handle_unlink(&self, path: &Path) {
        let removed = self.tracked.lock().unwrap().remove(path);
        self.file_offsets.lock().unwrap().remove(path);
        let Some(removed) = removed else { return };

        let still_referenced = self
            .tracked
            .lock()
            .unwrap()
            .values()
            .any(|t| t.session_id == removed.session_id);
        if !still_referenced && !removed.is_team {
            self.registered_sessions.lock().unwrap().remove(&removed.session_id);
            self.state.remove_agent(&removed.session_id);
            self.state.remove_session(&removed.session_id);
        }
    }

    fn staleness_sweep(&self) {
        let now = now_ms();
        let snapshot: Vec<(PathBuf, TrackedSession)> = self
            .tracked
            .lock()
            .unwrap()
            .iter()
            .map(|(p, t)| (p.clone(), t.clone()))
            .collect();

        for (path, tracked) in snapshot {
            if tracked.is_internal_subagent {
                if now - tracked.last_activity >= IDLE_THRESHOLD_MS {
                    self.tracked.lock().unwrap().remove(&path);
                }
                continue;
            }

            if let Some(last_tool) = tracked.last_tool_use_at {
                if now - last_tool >= STALE_IDLE_MS {
                    self.state.set_agent_waiting_by_id(
                        &tracked.target_agent_id,
                        true,
                        tracked.pending_tool_name.as_deref(),
                        tracked.pending_tool_name.as_deref(),
                        None,
                    );
                }
            }

            if now - tracked.last_activity >= IDLE_THRESHOLD_MS {
                if let Some(t) = self.tracked.lock().unwrap().get_mut(&path) {
                    t.last_tool_use_at = None;
                }
                self.state
                    .set_agent_waiting_by_id(&tracked.target_agent_id, false, None, None, None);
                if tracked.is_subagent {
                    self.state.update_agent_activity_by_id(
                        &tracked.target_agent_id,
                        AgentStatus::Done,
                        Some("Done"),
                        None,
                    );
                    if now - tracked.last_activity >= SUBAGENT_REAP_MS {
                        self.state.remove_agent(&tracked.target_agent_id);
                        self.tracked.lock().unwrap().remove(&path);
                    }
                } else {
                    self.state
                        .update_agent_activity_by_id(&tracked.target_agent_id, AgentStatus::Idle, None, None);
                }
            }
        }
    }
}

fn walk(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoopExecutor;
    #[async_trait]
    impl GitExecutor for NoopExecutor {
        async fn run(&self, _cwd: &Path, _args: &[&str]) -> Result<String, crate::errors::ParseError> {
            Err(crate::errors::ParseError::GitFailed("no git in tests".into()))
        }
    }

    fn test_watcher(claude_dir: PathBuf) -> Arc<Watcher> {
        let config = AppConfig {
            port: 0,
            auth_token: None,
            claude_dir,
        };
        Watcher::new(StateManager::new(), Arc::new(NoopExecutor), &config)
    }

    #[tokio::test]
    async fn detect_session_registers_solo_agent_from_top_level_file() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = test_watcher(dir.path().to_path_buf());
        std::fs::create_dir_all(watcher.projects_dir.join("myproj")).unwrap();
        let path = watcher.projects_dir.join("myproj").join("s1.jsonl");
        std::fs::write(&path, "{\"sessionId\":\"s1\",\"cwd\":\"/tmp/myproj\"}\n").unwrap();

        watcher.detect_session(&path).await;
        assert!(watcher.state.has_session("s1"));
        assert!(watcher.state.get_agent("s1").is_some());
        assert!(watcher.tracked.lock().unwrap().contains_key(&path));
    }

    #[tokio::test]
    async fn subagent_acompact_file_does_not_register_agent() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = test_watcher(dir.path().to_path_buf());
        let sub_dir = watcher.projects_dir.join("myproj").join("parent1").join("subagents");
        std::fs::create_dir_all(&sub_dir).unwrap();
        let path = sub_dir.join("agent-acompact-1.jsonl");
        std::fs::write(&path, "{}\n").unwrap();

        watcher.detect_session(&path).await;
        assert!(watcher.state.get_agent("agent-acompact-1").is_none());
        assert!(watcher.tracked.lock().unwrap().get(&path).unwrap().is_internal_subagent);
    }

    #[tokio::test]
    async fn transcript_change_applies_tool_call_and_bumps_activity() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = test_watcher(dir.path().to_path_buf());
        std::fs::create_dir_all(watcher.projects_dir.join("myproj")).unwrap();
        let path = watcher.projects_dir.join("myproj").join("s1.jsonl");
        std::fs::write(&path, "{\"sessionId\":\"s1\",\"cwd\":\"/tmp/myproj\"}\n").unwrap();
        watcher.detect_session(&path).await;

        let tool_line = serde_json::json!({
            "message": {"content": [{"type": "tool_use", "name": "Read", "input": {"file_path": "/tmp/myproj/a.rs"}}]}
        })
        .to_string();
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        use std::io::Write;
        writeln!(f, "{tool_line}").unwrap();

        watcher.handle_transcript_change(&path).await;
        let agent = watcher.state.get_agent("s1").unwrap();
        assert_eq!(agent.status, AgentStatus::Working);
        assert!(agent.current_action.unwrap().contains("a.rs"));
    }

    #[tokio::test]
    async fn unlink_removes_session_only_when_no_file_still_references_it() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = test_watcher(dir.path().to_path_buf());
        std::fs::create_dir_all(watcher.projects_dir.join("myproj")).unwrap();
        let path = watcher.projects_dir.join("myproj").join("s1.jsonl");
        std::fs::write(&path, "{\"sessionId\":\"s1\",\"cwd\":\"/tmp/myproj\"}\n").unwrap();
        watcher.detect_session(&path).await;

        watcher.handle_unlink(&path);
        assert!(!watcher.state.has_session("s1"));
    }
}
