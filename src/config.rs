//! Runtime configuration assembled from parsed CLI args.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub auth_token: Option<String>,
    pub claude_dir: PathBuf,
}

impl AppConfig {
    pub fn from_cli(cli: &crate::cli::Cli) -> Self {
        Self {
            port: cli.port,
            auth_token: cli.auth_token.clone(),
            claude_dir: cli.claude_dir.clone(),
        }
    }

    pub fn teams_dir(&self) -> PathBuf {
        self.claude_dir.join("teams")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.claude_dir.join("tasks")
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.claude_dir.join("projects")
    }
}
