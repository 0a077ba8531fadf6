use anyhow::bail;
use serde::Deserialize;
use tracing::debug;

use crate::error::XgressError;

/// Binding-specific configuration data. Options live in its `options` section.
pub type OptionsData = serde_json::Value;

const OPTIONS_KEY: &str = "options";

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Track payloads sent into the fabric until they are acknowledged, and acknowledge payloads
    ///  received from the fabric.
    pub retransmission: bool,

    /// Fault injection for testing the retransmission path: payloads received from the fabric
    ///  are randomly discarded instead of being delivered.
    ///
    /// This is meaningless (and in fact harmful) without retransmission, and that combination is
    ///  rejected.
    #[serde(rename = "randomDrops")]
    pub random_drops: bool,

    /// On average, one in this many payloads is dropped if `random_drops` is enabled. `1` drops
    ///  every payload.
    #[serde(rename = "drop1InN")]
    pub drop_1_in_n: i32,
}
impl Default for Options {
    fn default() -> Self {
        Options {
            retransmission: true,
            random_drops: false,
            drop_1_in_n: 100,
        }
    }
}
impl Options {
    /// Loads options from the `options` section of binding configuration data, falling back to
    ///  defaults for everything that is not configured.
    pub fn load(data: &OptionsData) -> anyhow::Result<Options> {
        let options = match data.get(OPTIONS_KEY) {
            None | Some(serde_json::Value::Null) => {
                debug!("no options configured, using defaults");
                Options::default()
            }
            Some(section) => match Options::deserialize(section) {
                Ok(options) => options,
                Err(e) => bail!(XgressError::InvalidOptions(e.to_string())),
            }
        };

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.random_drops && !self.retransmission {
            bail!(XgressError::InvalidOptions("random drops require retransmission to be enabled".to_string()));
        }
        if self.drop_1_in_n < 1 {
            bail!(XgressError::InvalidOptions(format!("drop1InN must be positive, was {}", self.drop_1_in_n)));
        }
        Ok(())
    }
}
