//! Command table
//!
//! Ordered set of registered [`CommandSpec`]s. Registration order is
//! classification order: inbound lines are tested against specs first to
//! last and the first match wins. Overlapping specs are rejected at
//! registration so that order never silently changes meaning.

use std::sync::Arc;
use std::time::Duration;

use crate::command::{Accessor, CommandSpec, ValueDict};
use crate::error::{AvrError, Result};

/// Name of the default power property
pub const POWER: &str = "powerState";
/// Name of the default master volume property
pub const VOLUME: &str = "volume";
/// Name of the default mute property
pub const MUTED: &str = "muted";
/// Name of the default input source property
pub const INPUT: &str = "input";
/// Name of the default dynamic volume (Audyssey) property
pub const DYNAMIC_VOLUME: &str = "dynamicVolume";

/// Ordered, name-unique collection of command specs.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    specs: Vec<Arc<CommandSpec>>,
}

impl CommandTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table with the standard receiver properties:
    /// power, volume, mute, input and dynamic volume.
    pub fn with_defaults() -> Result<Self> {
        let mut table = Self::new();
        table.register(
            CommandSpec::new(POWER, "ZM", "^ZM(ON|OFF)")?
                .with_aliases(["on", "off"])
                .with_values(ValueDict::boolean("ON", "OFF"))
                .with_settle(Duration::from_secs(1)),
        )?;
        table.register(CommandSpec::new(VOLUME, "MV", "^MV([0-9]+)")?)?;
        table.register(
            CommandSpec::new(MUTED, "MU", "^MU(ON|OFF)")?
                .with_aliases(["mute"])
                .with_values(ValueDict::boolean("ON", "OFF")),
        )?;
        table.register(CommandSpec::new(INPUT, "SI", r"^SI([A-Z0-9./]+)")?)?;
        table.register(CommandSpec::new(
            DYNAMIC_VOLUME,
            "PSDYNVOL ",
            "^PSDYNVOL ([A-Z]+)",
        )?)?;
        Ok(table)
    }

    /// Register a spec.
    ///
    /// Fails on a duplicate name or when the spec overlaps a registered one.
    pub fn register(&mut self, spec: CommandSpec) -> Result<()> {
        if self.get(spec.name()).is_some() {
            return Err(AvrError::DuplicateCommand(spec.name().to_string()));
        }
        if let Some(existing) = self.specs.iter().find(|existing| existing.overlaps(&spec)) {
            return Err(AvrError::OverlappingCommand {
                name: spec.name().to_string(),
                existing: existing.name().to_string(),
            });
        }

        tracing::debug!("Registered command {} ({:?})", spec.name(), spec.prefix());
        self.specs.push(Arc::new(spec));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<CommandSpec>> {
        self.specs.iter().find(|spec| spec.name() == name)
    }

    /// Look up a spec, failing with [`AvrError::UnknownProperty`].
    pub fn require(&self, name: &str) -> Result<&Arc<CommandSpec>> {
        self.get(name)
            .ok_or_else(|| AvrError::UnknownProperty(name.to_string()))
    }

    /// Spec whose send prefix starts `wire`, used to match raw commands.
    pub fn for_wire(&self, wire: &str) -> Option<&Arc<CommandSpec>> {
        self.specs
            .iter()
            .find(|spec| !spec.prefix().is_empty() && wire.starts_with(spec.prefix()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CommandSpec>> {
        self.specs.iter()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// All accessor names derived from the table, in registration order.
    pub fn accessor_names(&self) -> Vec<String> {
        self.specs
            .iter()
            .flat_map(|spec| spec.accessors())
            .map(|(name, _)| name)
            .collect()
    }

    /// Resolve a derived accessor name to the operation it stands for.
    pub fn resolve_accessor(&self, accessor: &str) -> Result<Accessor> {
        self.specs
            .iter()
            .flat_map(|spec| spec.accessors())
            .find(|(name, _)| name == accessor)
            .map(|(_, accessor)| accessor)
            .ok_or_else(|| AvrError::UnknownAccessor(accessor.to_string()))
    }
}
