//! Named catalogue of compiled commands.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};

use super::{Command, CommandSpec};
use crate::error::CommandError;

/// Commands keyed by [`Command::name`], iterated in name order.
#[derive(Debug, Clone, Default)]
pub struct CommandSet {
    commands: BTreeMap<String, Command>,
}

impl CommandSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON array of [`CommandSpec`] and compile every entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed, a pattern fails to compile,
    /// or two entries share a name.
    pub fn from_json(json: &str) -> Result<Self, CommandError> {
        let specs: Vec<CommandSpec> = serde_json::from_str(json)?;
        let mut set = Self::new();
        for spec in specs {
            let command = spec.compile()?;
            if set.commands.contains_key(command.name()) {
                return Err(CommandError::DuplicateName(command.name().to_string()));
            }
            set.insert(command);
        }
        Ok(set)
    }

    /// Read and compile a JSON command catalogue from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read command catalogue {}", path.display()))?;
        let set = Self::from_json(&json)
            .with_context(|| format!("Failed to load command catalogue {}", path.display()))?;
        tracing::debug!(path = %path.display(), commands = set.len(), "Loaded command catalogue");
        Ok(set)
    }

    /// Insert a command, returning the one it replaced.
    pub fn insert(&mut self, command: Command) -> Option<Command> {
        self.commands.insert(command.name().to_string(), command)
    }

    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    /// The command names as a JSON array of strings.
    pub fn labels_json(&self) -> String {
        let names: Vec<&str> = self.names().collect();
        serde_json::Value::from(names).to_string()
    }
}

impl fmt::Display for CommandSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for command in self.iter() {
            writeln!(f, "{command}")?;
        }
        Ok(())
    }
}
