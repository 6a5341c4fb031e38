//! Command, variable and handler tables.
//!
//! A `Registry` is assembled once through a `RegistryBuilder` and then
//! shared read-only between the interactive loop and the script worker.
//! Plugins only ever see the builder.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::download::Payload;
use crate::engine::{CommandContext, Services};
use crate::error::ErrorKind;
use crate::flash::{FlashContext, FlashError, FlashOutcome};

/// Handler for a top-level command; receives the text after the prefix.
pub type CommandHandler =
    Box<dyn Fn(&mut CommandContext<'_>, &str) -> anyhow::Result<()> + Send + Sync>;

/// Computes a variable value; receives the text after `name:`.
pub type VariableResolver = Box<dyn Fn(&Services, &str) -> Option<String> + Send + Sync>;

/// Writes a payload to one named destination.
pub type FlashHandler = Box<
    dyn Fn(&FlashContext<'_>, Payload<'_>) -> Result<FlashOutcome, FlashError> + Send + Sync,
>;

/// Handler for `oem <name> ...`; receives the whole argument vector.
pub type OemHandler =
    Box<dyn Fn(&mut CommandContext<'_>, &[&str]) -> anyhow::Result<()> + Send + Sync>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("command '{0}' already registered")]
    DuplicateCommand(String),

    #[error("no command '{0}' to replace")]
    MissingCommand(String),

    #[error("flash handler '{0}': key collision")]
    FlashCollision(String),

    #[error("OEM command '{0}': key collision")]
    OemCollision(String),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Protocol
    }
}

pub struct Command {
    prefix: String,
    handler: CommandHandler,
}

impl Command {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn handler(&self) -> &CommandHandler {
        &self.handler
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command").field("prefix", &self.prefix).finish()
    }
}

/// A published variable.
pub enum Variable {
    Static(String),
    Resolver(VariableResolver),
}

/// Something that contributes commands, variables or handlers.
pub trait Plugin {
    fn name(&self) -> &str;

    fn register(&self, builder: &mut RegistryBuilder) -> Result<(), RegistryError>;
}

#[derive(Default)]
pub struct RegistryBuilder {
    commands: Vec<Command>,
    variables: Vec<(String, Variable)>,
    flash: HashMap<String, FlashHandler>,
    oem: HashMap<String, OemHandler>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command. Later registrations take precedence when several
    /// prefixes match the same input.
    pub fn register_command<F>(&mut self, prefix: &str, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(&mut CommandContext<'_>, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if self.commands.iter().any(|c| c.prefix == prefix) {
            return Err(RegistryError::DuplicateCommand(prefix.to_string()));
        }
        debug!(prefix, "Command registered");
        self.commands.push(Command {
            prefix: prefix.to_string(),
            handler: Box::new(handler),
        });
        Ok(())
    }

    /// Swap the handler of an existing command, keeping its precedence.
    pub fn replace_command<F>(&mut self, prefix: &str, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(&mut CommandContext<'_>, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let command = self
            .commands
            .iter_mut()
            .find(|c| c.prefix == prefix)
            .ok_or_else(|| RegistryError::MissingCommand(prefix.to_string()))?;
        debug!(prefix, "Command replaced");
        command.handler = Box::new(handler);
        Ok(())
    }

    /// Publish a fixed value. Publishing an existing name replaces it.
    pub fn publish(&mut self, name: &str, value: impl Into<String>) {
        self.set_variable(name, Variable::Static(value.into()));
    }

    /// Publish a computed value.
    pub fn publish_resolver<F>(&mut self, name: &str, resolver: F)
    where
        F: Fn(&Services, &str) -> Option<String> + Send + Sync + 'static,
    {
        self.set_variable(name, Variable::Resolver(Box::new(resolver)));
    }

    fn set_variable(&mut self, name: &str, variable: Variable) {
        match self.variables.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = variable,
            None => self.variables.push((name.to_string(), variable)),
        }
    }

    pub fn register_flash<F>(&mut self, name: &str, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(&FlashContext<'_>, Payload<'_>) -> Result<FlashOutcome, FlashError>
            + Send
            + Sync
            + 'static,
    {
        if self.flash.contains_key(name) {
            return Err(RegistryError::FlashCollision(name.to_string()));
        }
        self.flash.insert(name.to_string(), Box::new(handler));
        Ok(())
    }

    pub fn register_oem<F>(&mut self, name: &str, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(&mut CommandContext<'_>, &[&str]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if self.oem.contains_key(name) {
            return Err(RegistryError::OemCollision(name.to_string()));
        }
        self.oem.insert(name.to_string(), Box::new(handler));
        Ok(())
    }

    pub fn with_plugin(&mut self, plugin: &dyn Plugin) -> Result<(), RegistryError> {
        debug!(plugin = plugin.name(), "Registering plugin");
        plugin.register(self)
    }

    pub fn build(self) -> Registry {
        Registry {
            commands: self.commands,
            variables: self.variables,
            flash: self.flash,
            oem: self.oem,
        }
    }
}

/// Frozen lookup tables.
pub struct Registry {
    commands: Vec<Command>,
    variables: Vec<(String, Variable)>,
    flash: HashMap<String, FlashHandler>,
    oem: HashMap<String, OemHandler>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Most recently registered command whose prefix is a byte prefix of
    /// `line`.
    pub fn find_command(&self, line: &str) -> Option<&Command> {
        self.commands
            .iter()
            .rev()
            .find(|c| line.as_bytes().starts_with(c.prefix.as_bytes()))
    }

    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Resolve `name` or `name:arg`.
    pub fn resolve(&self, services: &Services, query: &str) -> Option<String> {
        let (variable, arg) = match self.variable(query) {
            Some(v) => (v, ""),
            None => {
                let (name, arg) = query.split_once(':')?;
                (self.variable(name)?, arg)
            }
        };
        match variable {
            Variable::Static(value) => Some(value.clone()),
            Variable::Resolver(resolve) => resolve(services, arg),
        }
    }

    /// Fixed-value variables in publication order.
    pub fn static_variables(&self) -> impl Iterator<Item = (&str, &str)> {
        self.variables.iter().filter_map(|(name, v)| match v {
            Variable::Static(value) => Some((name.as_str(), value.as_str())),
            Variable::Resolver(_) => None,
        })
    }

    pub fn flash_handler(&self, name: &str) -> Option<&FlashHandler> {
        self.flash.get(name)
    }

    pub fn oem_handler(&self, name: &str) -> Option<&OemHandler> {
        self.oem.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::test_services;

    fn noop(_: &mut CommandContext<'_>, _: &str) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn test_latest_matching_prefix_wins() {
        let mut b = Registry::builder();
        b.register_command("reboot", noop).unwrap();
        b.register_command("reboot-bootloader", noop).unwrap();
        b.register_command("flash:", noop).unwrap();
        let r = b.build();

        assert_eq!(r.find_command("reboot-bootloader").unwrap().prefix(), "reboot-bootloader");
        assert_eq!(r.find_command("reboot").unwrap().prefix(), "reboot");
        assert_eq!(r.find_command("flash:boot").unwrap().prefix(), "flash:");
        assert!(r.find_command("fla").is_none());
    }

    #[test]
    fn test_shorter_prefix_registered_later_shadows() {
        let mut b = Registry::builder();
        b.register_command("oem unlock", noop).unwrap();
        b.register_command("oem", noop).unwrap();
        let r = b.build();
        assert_eq!(r.find_command("oem unlock").unwrap().prefix(), "oem");
    }

    #[test]
    fn test_duplicate_prefix_rejected() {
        let mut b = Registry::builder();
        b.register_command("boot", noop).unwrap();
        assert!(matches!(
            b.register_command("boot", noop),
            Err(RegistryError::DuplicateCommand(_))
        ));
        b.replace_command("boot", noop).unwrap();
        assert!(matches!(
            b.replace_command("missing", noop),
            Err(RegistryError::MissingCommand(_))
        ));
    }

    #[test]
    fn test_replace_keeps_precedence() {
        let mut b = Registry::builder();
        b.register_command("reboot", noop).unwrap();
        b.register_command("reboot-bootloader", noop).unwrap();
        b.replace_command("reboot", noop).unwrap();
        let r = b.build();
        assert_eq!(r.find_command("reboot-bootloader").unwrap().prefix(), "reboot-bootloader");
    }

    #[test]
    fn test_variables() {
        let services = test_services();
        let mut b = Registry::builder();
        b.publish("version-bootloader", "1.0");
        b.publish("version-bootloader", "2.0");
        b.publish("product", "droidboot");
        b.publish_resolver("echo", |_, arg| Some(arg.to_uppercase()));
        let r = b.build();

        assert_eq!(r.resolve(&services, "version-bootloader").as_deref(), Some("2.0"));
        assert_eq!(r.resolve(&services, "echo:abc").as_deref(), Some("ABC"));
        assert_eq!(r.resolve(&services, "nope"), None);
        assert_eq!(r.resolve(&services, "nope:x"), None);
        let statics: Vec<_> = r.static_variables().collect();
        assert_eq!(statics, vec![("version-bootloader", "2.0"), ("product", "droidboot")]);
    }

    #[test]
    fn test_keyed_collisions() {
        let mut b = Registry::builder();
        b.register_flash("boot", |_, _| Ok(FlashOutcome::Done)).unwrap();
        assert!(matches!(
            b.register_flash("boot", |_, _| Ok(FlashOutcome::Done)),
            Err(RegistryError::FlashCollision(_))
        ));
        b.register_oem("showtext", |_, _| Ok(())).unwrap();
        assert!(matches!(
            b.register_oem("showtext", |_, _| Ok(())),
            Err(RegistryError::OemCollision(_))
        ));
        let r = b.build();
        assert!(r.flash_handler("boot").is_some());
        assert!(r.oem_handler("showtext").is_some());
        assert!(r.oem_handler("system").is_none());
    }
}
