//! Command-table shell.
//!
//! A dispatch trampoline, not a Unix shell: the input line is split on
//! spaces, the first token selects a handler, the rest become argv. No
//! quoting, no escapes, no environment, no chaining.

use std::collections::HashMap;

use tracing::debug;

use crate::error::Error;

/// Per-session data handed to every command handler.
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Authenticated user name (`"guest"` for anonymous sessions).
    pub user: String,
}

/// A command implementation: pure over (context, argv) -> bytes.
pub type CommandHandler =
    Box<dyn Fn(&CommandContext, &[&str]) -> Result<Vec<u8>, Error> + Send + Sync>;

/// Fixed-at-construction mapping from command name to handler.
pub struct Shell {
    commands: HashMap<String, CommandHandler>,
}

impl Shell {
    /// Shell with the baseline command table.
    pub fn new() -> Self {
        Self::with_commands([])
    }

    /// Shell with the baseline table plus extension commands.
    pub fn with_commands(extensions: impl IntoIterator<Item = (String, CommandHandler)>) -> Self {
        let mut commands: HashMap<String, CommandHandler> = HashMap::new();
        commands.insert("echo".to_string(), Box::new(echo));
        for (name, handler) in extensions {
            commands.insert(name, handler);
        }
        Self { commands }
    }

    /// Dispatch one line. `Error::CommandNotFound` when the first token
    /// names no handler; otherwise the handler's result verbatim.
    pub fn execute(&self, ctx: &CommandContext, line: &str) -> Result<Vec<u8>, Error> {
        debug!(command = line, "executing command");
        let parts: Vec<&str> = line.split(' ').collect();
        match self.commands.get(parts[0]) {
            Some(handler) => handler(ctx, &parts[1..]),
            None => Err(Error::CommandNotFound),
        }
    }
}

impl Default for Shell {
    fn default() -> Self {
        Self::new()
    }
}

fn echo(_ctx: &CommandContext, args: &[&str]) -> Result<Vec<u8>, Error> {
    Ok(format!("echo: {}", args.join(" ")).into_bytes())
}
