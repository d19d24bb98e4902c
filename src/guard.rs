//! GuardManager: short-lived bookkeeping that prevents duplicate or
//! out-of-order agent lifecycle transitions across hook events and watcher
//! ticks. Each map is a guard against one specific race, documented inline.

use std::collections::HashMap;
use std::time::{Duration, Instant};

const REMOVED_AGENT_TTL: Duration = Duration::from_secs(5 * 60);
const HOOK_ACTIVE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct GuardManager {
    /// Sessions whose Stop hook has fired; suppresses late watcher activity
    /// updates from resurrecting an agent that already finished.
    stopped_sessions: HashMap<String, Instant>,
    /// Agent ids removed from display in the last 5 minutes, so a stale
    /// transcript line replayed by the watcher can't re-add them.
    removed_agents: HashMap<String, Instant>,
    /// Session ids with a hook event in the last 5 seconds, so the watcher's
    /// own polling doesn't race the hook-driven update for the same line.
    hook_active_sessions: HashMap<String, Instant>,
    /// Maps a session id to the team + agent id it was last attributed to,
    /// so a PreToolUse Task spawn and the SubagentStart it correlates with
    /// agree on identity even if the team name changes mid-session.
    session_to_team_agent: HashMap<String, (String, String)>,
}

impl GuardManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_session_stopped(&mut self, session_id: &str) {
        self.stopped_sessions
            .insert(session_id.to_string(), Instant::now());
    }

    pub fn is_session_stopped(&self, session_id: &str) -> bool {
        self.stopped_sessions.contains_key(session_id)
    }

    pub fn clear_session_stopped(&mut self, session_id: &str) {
        self.stopped_sessions.remove(session_id);
    }

    pub fn mark_agent_removed(&mut self, agent_id: &str) {
        self.removed_agents
            .insert(agent_id.to_string(), Instant::now());
    }

    pub fn is_agent_removed(&mut self, agent_id: &str) -> bool {
        self.sweep_removed_agents();
        self.removed_agents.contains_key(agent_id)
    }

    fn sweep_removed_agents(&mut self) {
        self.removed_agents
            .retain(|_, at| at.elapsed() < REMOVED_AGENT_TTL);
    }

    /// Explicit escape hatch: lets a deliberate re-registration (e.g. a team
    /// recreated with the same member ids) bypass the 5-min removal window.
    pub fn clear_recently_removed(&mut self, agent_id: &str) {
        self.removed_agents.remove(agent_id);
    }

    pub fn mark_hook_active(&mut self, session_id: &str) {
        self.hook_active_sessions
            .insert(session_id.to_string(), Instant::now());
    }

    pub fn is_hook_active(&mut self, session_id: &str) -> bool {
        self.sweep_hook_active();
        self.hook_active_sessions.contains_key(session_id)
    }

    fn sweep_hook_active(&mut self) {
        self.hook_active_sessions
            .retain(|_, at| at.elapsed() < HOOK_ACTIVE_TTL);
    }

    pub fn set_session_team_agent(&mut self, session_id: &str, team: &str, agent_id: &str) {
        self.session_to_team_agent.insert(
            session_id.to_string(),
            (team.to_string(), agent_id.to_string()),
        );
    }

    pub fn session_team_agent(&self, session_id: &str) -> Option<(&str, &str)> {
        self.session_to_team_agent
            .get(session_id)
            .map(|(t, a)| (t.as_str(), a.as_str()))
    }

    pub fn clear_session(&mut self, session_id: &str) {
        self.stopped_sessions.remove(session_id);
        self.hook_active_sessions.remove(session_id);
        self.session_to_team_agent.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_sessions_roundtrip() {
        let mut guard = GuardManager::new();
        assert!(!guard.is_session_stopped("s1"));
        guard.mark_session_stopped("s1");
        assert!(guard.is_session_stopped("s1"));
        guard.clear_session_stopped("s1");
        assert!(!guard.is_session_stopped("s1"));
    }

    #[test]
    fn removed_agents_tracked_until_swept() {
        let mut guard = GuardManager::new();
        guard.mark_agent_removed("a1");
        assert!(guard.is_agent_removed("a1"));
    }

    #[test]
    fn clear_recently_removed_lifts_the_block_early() {
        let mut guard = GuardManager::new();
        guard.mark_agent_removed("a1");
        assert!(guard.is_agent_removed("a1"));
        guard.clear_recently_removed("a1");
        assert!(!guard.is_agent_removed("a1"));
    }

    #[test]
    fn hook_active_tracked_immediately_after_mark() {
        let mut guard = GuardManager::new();
        assert!(!guard.is_hook_active("s1"));
        guard.mark_hook_active("s1");
        assert!(guard.is_hook_active("s1"));
    }

    #[test]
    fn session_team_agent_roundtrip() {
        let mut guard = GuardManager::new();
        assert!(guard.session_team_agent("s1").is_none());
        guard.set_session_team_agent("s1", "team-a", "agent-1");
        assert_eq!(guard.session_team_agent("s1"), Some(("team-a", "agent-1")));
    }

    #[test]
    fn clear_session_removes_all_guards_for_it() {
        let mut guard = GuardManager::new();
        guard.mark_session_stopped("s1");
        guard.mark_hook_active("s1");
        guard.set_session_team_agent("s1", "team-a", "agent-1");
        guard.clear_session("s1");
        assert!(!guard.is_session_stopped("s1"));
        assert!(!guard.is_hook_active("s1"));
        assert!(guard.session_team_agent("s1").is_none());
    }
}
