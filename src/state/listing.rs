//! Deterministic flat and grouped session-list derivation (§6).

use crate::model::{
    Agent, AgentStatus, BranchGroup, GroupedSessionsList, ProjectGroup, Session, SessionListEntry,
};
use std::collections::HashMap;

fn has_waiting_agent(agents: &[&Agent]) -> bool {
    agents.iter().any(|a| a.waiting_for_input)
}

fn session_agents<'a>(session: &Session, all_agents: &'a HashMap<String, Agent>) -> Vec<&'a Agent> {
    all_agents
        .values()
        .filter(|a| super::agent_belongs(a, session))
        .collect()
}

fn entry(session: &Session, agents: &[&Agent], active_id: Option<&str>) -> SessionListEntry {
    SessionListEntry {
        session_id: session.session_id.clone(),
        project_name: session
            .project_name
            .clone()
            .unwrap_or_else(|| session.session_id.clone()),
        git_branch: session.git_branch.clone(),
        last_activity: session.last_activity,
        active: active_id == Some(session.session_id.as_str()),
        has_waiting_agent: has_waiting_agent(agents),
        is_team: session.is_team,
    }
}

fn project_key(session: &Session) -> String {
    if session.is_team && session.project_path.is_none() {
        format!(
            "team:{}",
            session
                .team_name
                .clone()
                .or_else(|| session.project_name.clone())
                .unwrap_or_default()
        )
    } else {
        session
            .main_repo_path
            .clone()
            .or_else(|| session.project_path.clone())
            .unwrap_or_else(|| session.session_id.clone())
    }
}

pub fn build_grouped(
    sessions: &HashMap<String, Session>,
    all_agents: &HashMap<String, Agent>,
    active_id: Option<&str>,
) -> GroupedSessionsList {
    let mut flat: Vec<SessionListEntry> = sessions
        .values()
        .map(|s| entry(s, &session_agents(s, all_agents), active_id))
        .collect();
    flat.sort_by(|a, b| {
        b.active
            .cmp(&a.active)
            .then(b.has_waiting_agent.cmp(&a.has_waiting_agent))
            .then(b.last_activity.cmp(&a.last_activity))
    });

    let mut by_project: HashMap<String, Vec<&Session>> = HashMap::new();
    for session in sessions.values() {
        by_project.entry(project_key(session)).or_default().push(session);
    }

    let mut projects: Vec<ProjectGroup> = by_project
        .into_iter()
        .map(|(key, members)| build_project_group(key, members, all_agents, active_id))
        .collect();

    projects.sort_by(|a, b| {
        b.active
            .cmp(&a.active)
            .then(b.has_waiting_agent.cmp(&a.has_waiting_agent))
            .then(b.last_activity.cmp(&a.last_activity))
            .then(a.project_name.cmp(&b.project_name))
    });

    GroupedSessionsList {
        projects,
        flat_sessions: flat,
    }
}

fn build_project_group(
    key: String,
    members: Vec<&Session>,
    all_agents: &HashMap<String, Agent>,
    active_id: Option<&str>,
) -> ProjectGroup {
    let mut by_branch: HashMap<String, (bool, Vec<&Session>)> = HashMap::new();
    for session in &members {
        let (branch, is_default) = match &session.git_branch {
            Some(b) => (b.clone(), false),
            None => ("(default)".to_string(), true),
        };
        let entry = by_branch.entry(branch).or_insert((is_default, Vec::new()));
        entry.1.push(session);
    }

    let mut branches: Vec<BranchGroup> = by_branch
        .into_iter()
        .map(|(branch, (is_default, sessions))| {
            let mut entries: Vec<SessionListEntry> = sessions
                .iter()
                .map(|s| entry(s, &session_agents(s, all_agents), active_id))
                .collect();
            entries.sort_by(|a, b| {
                b.active
                    .cmp(&a.active)
                    .then(b.has_waiting_agent.cmp(&a.has_waiting_agent))
                    .then(b.last_activity.cmp(&a.last_activity))
            });
            let active = entries.iter().any(|e| e.active);
            let waiting = entries.iter().any(|e| e.has_waiting_agent);
            let last_activity = entries.iter().map(|e| e.last_activity).max().unwrap_or(0);
            BranchGroup {
                branch,
                is_default,
                active,
                has_waiting_agent: waiting,
                last_activity,
                sessions: entries,
            }
        })
        .collect();

    branches.sort_by(|a, b| {
        b.active
            .cmp(&a.active)
            .then(b.has_waiting_agent.cmp(&a.has_waiting_agent))
            .then(a.is_default.cmp(&b.is_default))
            .then(b.last_activity.cmp(&a.last_activity))
            .then(a.branch.cmp(&b.branch))
    });

    let active = branches.iter().any(|b| b.active);
    let waiting = branches.iter().any(|b| b.has_waiting_agent);
    let last_activity = branches.iter().map(|b| b.last_activity).max().unwrap_or(0);
    let project_name = members
        .first()
        .and_then(|s| s.project_name.clone())
        .unwrap_or_else(|| key.clone());

    ProjectGroup {
        project_key: key,
        project_name,
        active,
        has_waiting_agent: waiting,
        last_activity,
        branches,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    fn session(id: &str, activity: i64, branch: Option<&str>, project: &str) -> Session {
        let mut s = Session::new(id);
        s.last_activity = activity;
        s.git_branch = branch.map(str::to_string);
        s.project_path = Some(project.to_string());
        s.project_name = Some(project.to_string());
        s
    }

    #[test]
    fn flat_sessions_sort_active_then_waiting_then_recency() {
        let mut sessions = HashMap::new();
        sessions.insert("a".to_string(), session("a", 100, None, "p"));
        sessions.insert("b".to_string(), session("b", 200, None, "p"));
        let mut agents = HashMap::new();
        let mut waiting_agent = Agent::new("b", "b", Role::Implementer);
        waiting_agent.waiting_for_input = true;
        agents.insert("b".to_string(), waiting_agent);

        let grouped = build_grouped(&sessions, &agents, Some("a"));
        assert_eq!(grouped.flat_sessions[0].session_id, "a");
        assert!(grouped.flat_sessions[0].active);
    }

    #[test]
    fn missing_branch_groups_under_default() {
        let mut sessions = HashMap::new();
        sessions.insert("a".to_string(), session("a", 100, None, "p"));
        let agents = HashMap::new();
        let grouped = build_grouped(&sessions, &agents, None);
        assert_eq!(grouped.projects.len(), 1);
        assert_eq!(grouped.projects[0].branches[0].branch, "(default)");
        assert!(grouped.projects[0].branches[0].is_default);
    }

    #[test]
    fn worktree_sessions_merge_by_main_repo_path() {
        let mut sessions = HashMap::new();
        let mut s1 = session("a", 100, Some("main"), "repo");
        s1.main_repo_path = Some("/repo".into());
        let mut s2 = session("b", 200, Some("feature"), "repo");
        s2.main_repo_path = Some("/repo".into());
        sessions.insert("a".to_string(), s1);
        sessions.insert("b".to_string(), s2);
        let agents = HashMap::new();
        let grouped = build_grouped(&sessions, &agents, None);
        assert_eq!(grouped.projects.len(), 1);
        assert_eq!(grouped.projects[0].branches.len(), 2);
    }
}
