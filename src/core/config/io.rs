use crate::core::config::data::{path_display, Config, McpServerConfig};
use directories::ProjectDirs;
use serde::Deserialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Errors that can occur when loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("Failed to read config at {}: {source}", path_display(.path))]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse the configuration file.
    #[error("Failed to parse config at {}: {message}", path_display(.path))]
    Parse { path: PathBuf, message: String },

    #[error("Failed to write config at {}: {source}", path_display(.path))]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No configuration directory is available on this platform")]
    NoConfigDir,
}

/// Shape accepted for a standalone MCP servers file: either a bare list or a
/// table with an `mcp_servers` list.
#[derive(Deserialize)]
#[serde(untagged)]
enum ServersFile {
    List(Vec<McpServerConfig>),
    Table {
        #[serde(default, alias = "servers")]
        mcp_servers: Vec<McpServerConfig>,
    },
}

impl ServersFile {
    fn into_servers(self) -> Vec<McpServerConfig> {
        match self {
            ServersFile::List(servers) => servers,
            ServersFile::Table { mcp_servers } => mcp_servers,
        }
    }
}

impl Config {
    pub fn load_from_path(config_path: &Path) -> Result<Config, ConfigError> {
        if !config_path.exists() {
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|err| ConfigError::Parse {
            path: config_path.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// Loads the config and folds in the servers listed in `mcp_servers_file`.
    pub fn load_with_servers_file(config_path: &Path) -> Result<Config, ConfigError> {
        let mut config = Self::load_from_path(config_path)?;
        if let Some(file) = config.mcp_servers_file.clone() {
            let file = match config_path.parent() {
                Some(dir) if file.is_relative() => dir.join(file),
                _ => file,
            };
            let servers = load_mcp_servers_file(&file)?;
            tracing::debug!(count = servers.len(), path = %path_display(&file), "Loaded MCP servers file");
            config.merge_mcp_servers(servers);
        }
        Ok(config)
    }

    pub fn save_to_path(&self, config_path: &Path) -> Result<(), ConfigError> {
        let write_error = |source: std::io::Error| ConfigError::Write {
            path: config_path.to_path_buf(),
            source,
        };
        let parent = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty());

        if let Some(dir) = parent {
            fs::create_dir_all(dir).map_err(write_error)?;
        }

        let contents = toml::to_string_pretty(self).map_err(|err| ConfigError::Parse {
            path: config_path.to_path_buf(),
            message: err.to_string(),
        })?;
        let mut temp_file = match parent {
            Some(dir) => NamedTempFile::new_in(dir),
            None => NamedTempFile::new(),
        }
        .map_err(write_error)?;

        temp_file
            .write_all(contents.as_bytes())
            .map_err(write_error)?;
        temp_file.as_file_mut().sync_all().map_err(write_error)?;
        temp_file
            .persist(config_path)
            .map_err(|err| write_error(err.error))?;
        Ok(())
    }

    pub fn default_config_path() -> Result<PathBuf, ConfigError> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Where the JSON conversation store lives unless `conversations_dir` is set.
    pub fn conversations_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.conversations_dir {
            Some(dir) => Ok(dir.clone()),
            None => Self::project_dirs().map(|dirs| dirs.data_dir().join("conversations")),
        }
    }

    fn project_dirs() -> Result<ProjectDirs, ConfigError> {
        ProjectDirs::from("org", "conduit", "conduit").ok_or(ConfigError::NoConfigDir)
    }
}

/// Reads MCP server descriptors from a `.json` or `.toml` file.
pub fn load_mcp_servers_file(path: &Path) -> Result<Vec<McpServerConfig>, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_error = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };

    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let parsed: ServersFile = if is_toml {
        toml::from_str(&contents).map_err(|err| parse_error(err.to_string()))?
    } else {
        serde_json::from_str(&contents).map_err(|err| parse_error(err.to_string()))?
    };
    Ok(parsed.into_servers())
}
