use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::SyncError;

const DEFAULT_LIST_NAME: &str = "Tasks";
const DEFAULT_CALENDAR_NAME: &str = "Calendar";
const DEFAULT_LOOK_BACK_PAGES: i64 = 50;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "tasktoevent", "tasktoevent")
}

/// Per-user application directory holding config.txt, prevUser.txt and the
/// token cache.
pub fn data_dir() -> PathBuf {
    if let Some(path) = std::env::var_os("TASKTOEVENT_DATA_DIR") {
        return PathBuf::from(path);
    }
    if let Some(dirs) = project_dirs() {
        return dirs.data_dir().to_path_buf();
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".tasktoevent")
}

pub fn config_path(dir: &Path) -> PathBuf {
    dir.join("config.txt")
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub list_name: String,
    pub calendar_name: String,
    pub look_back_pages: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            list_name: DEFAULT_LIST_NAME.to_string(),
            calendar_name: DEFAULT_CALENDAR_NAME.to_string(),
            look_back_pages: DEFAULT_LOOK_BACK_PAGES,
        }
    }
}

impl Config {
    /// Loads config.txt if it exists, otherwise falls back to the built-in
    /// defaults. A file that is present but missing any of the three keys is
    /// rejected as a whole; defaults never fill in partial files.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> Result<Self, SyncError> {
        let mut list_name: Option<String> = None;
        let mut calendar_name: Option<String> = None;
        let mut look_back_pages: Option<i64> = None;

        for line in content.lines() {
            let line = line.trim();
            if let Some(value) = line.strip_prefix("List=") {
                list_name = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("Calendar=") {
                calendar_name = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("LookBackPages=") {
                match value.trim().parse::<i64>() {
                    Ok(pages) => look_back_pages = Some(pages),
                    Err(_) => {
                        eprintln!("Invalid LookBackPages value: {}", value.trim());
                    }
                }
            }
            // Anything else is ignored.
        }

        let complete = matches!(&list_name, Some(name) if !name.is_empty())
            && matches!(&calendar_name, Some(name) if !name.is_empty())
            && look_back_pages.is_some();
        if !complete {
            return Err(SyncError::InvalidConfig(
                "Invalid config: List=, Calendar= and LookBackPages= are all required".to_string(),
            ));
        }

        Ok(Config {
            list_name: list_name.unwrap_or_default(),
            calendar_name: calendar_name.unwrap_or_default(),
            look_back_pages: look_back_pages.unwrap_or(DEFAULT_LOOK_BACK_PAGES),
        })
    }
}
