//! Typed accessors for the standard receiver properties
//!
//! Thin wrappers over [`AvrSession::set_property`] and
//! [`AvrSession::get_property`] for the default command table, plus
//! [`AvrSession::invoke`] which runs an accessor by its derived name
//! (`setVolume`, `getMute`, `on`, ...).

use crate::command::Accessor;
use crate::error::{AvrError, Result};
use crate::session::AvrSession;
use crate::state::PropertyValue;
use crate::table::{DYNAMIC_VOLUME, INPUT, MUTED, POWER, VOLUME};

fn expect_bool(property: &str, value: PropertyValue) -> Result<bool> {
    value.as_bool().ok_or_else(|| AvrError::InvalidValue {
        property: property.to_string(),
        value: value.to_string(),
    })
}

impl AvrSession {
    pub async fn power_on(&self) -> Result<()> {
        self.set_property(POWER, true).await?;
        Ok(())
    }

    pub async fn power_off(&self) -> Result<()> {
        self.set_property(POWER, false).await?;
        Ok(())
    }

    /// Whether the main zone is on.
    pub async fn power_state(&self) -> Result<bool> {
        expect_bool(POWER, self.get_property(POWER).await?)
    }

    /// Set the master volume in whole steps (`35` is sent as `MV35`,
    /// `5` as `MV05`).
    pub async fn set_volume(&self, volume: u8) -> Result<String> {
        let value = self.set_property(VOLUME, format!("{:02}", volume)).await?;
        Ok(value.to_string())
    }

    /// Master volume as reported by the receiver. A third digit denotes a
    /// half step (`355` is 35.5).
    pub async fn volume(&self) -> Result<String> {
        Ok(self.get_property(VOLUME).await?.to_string())
    }

    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        self.set_property(MUTED, muted).await?;
        Ok(())
    }

    pub async fn muted(&self) -> Result<bool> {
        expect_bool(MUTED, self.get_property(MUTED).await?)
    }

    /// Select an input source by its wire name (e.g. `DVD`, `SAT/CBL`).
    pub async fn set_input(&self, input: &str) -> Result<String> {
        let value = self.set_property(INPUT, input).await?;
        Ok(value.to_string())
    }

    pub async fn input(&self) -> Result<String> {
        Ok(self.get_property(INPUT).await?.to_string())
    }

    /// Set Audyssey Dynamic Volume (`OFF`, `LIT`, `MED`, `HEV`).
    pub async fn set_dynamic_volume(&self, level: &str) -> Result<String> {
        let value = self.set_property(DYNAMIC_VOLUME, level).await?;
        Ok(value.to_string())
    }

    pub async fn dynamic_volume(&self) -> Result<String> {
        Ok(self.get_property(DYNAMIC_VOLUME).await?.to_string())
    }

    /// Run an accessor by its derived name.
    ///
    /// Setters take their value from `args`, joined with spaces; `true` and
    /// `false` are passed as booleans.
    pub async fn invoke(&self, accessor: &str, args: &[&str]) -> Result<PropertyValue> {
        let table = self.table().await?;

        match table.resolve_accessor(accessor)? {
            Accessor::Set(property) => {
                if args.is_empty() {
                    return Err(AvrError::MissingArgument(accessor.to_string()));
                }
                let value = PropertyValue::parse_loose(&args.join(" "));
                self.set_property(&property, value).await
            }
            Accessor::Get(property) => self.get_property(&property).await,
            Accessor::Fixed { property, value } => self.set_property(&property, value).await,
        }
    }
}
