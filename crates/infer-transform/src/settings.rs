//! Transformation settings.

#[cfg(feature = "config")]
use clap::Args;
use serde::{Deserialize, Serialize};

/// Environment variable enabling debug logging.
pub const ENV_DEBUG: &str = "INFER_COMPILER_DEBUG";

/// Environment variable enabling the fused matmul+bias linear path.
pub const ENV_FUSED_LINEAR: &str = "ONEFLOW_KERNEL_ENABLE_FUSED_LINEAR";

/// Environment variable enabling strict conversion.
pub const ENV_STRICT: &str = "INFER_COMPILER_STRICT";

/// Settings shared by every conversion driven through one manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "config", derive(Args))]
pub struct Settings {
    /// Log every resolution and conversion step at debug level.
    #[cfg_attr(feature = "config", arg(long = "infer-debug", env = ENV_DEBUG))]
    #[serde(default)]
    pub debug: bool,

    /// Report `use_fused_matmul_bias` on linear layers that have a bias.
    #[cfg_attr(feature = "config", arg(long = "fused-linear", env = ENV_FUSED_LINEAR))]
    #[serde(default)]
    pub fused_linear: bool,

    /// Fail on values of unregistered types instead of passing them through,
    /// and resolve module classes eagerly during conversion.
    #[cfg_attr(feature = "config", arg(long = "strict", env = ENV_STRICT))]
    #[serde(default)]
    pub strict: bool,
}

impl Settings {
    /// Reads the settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the settings through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| lookup(key).is_some_and(|value| parse_flag(&value));
        Self {
            debug: flag(ENV_DEBUG),
            fused_linear: flag(ENV_FUSED_LINEAR),
            strict: flag(ENV_STRICT),
        }
    }

    /// Sets the debug flag.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Sets the fused linear toggle.
    #[must_use]
    pub fn with_fused_linear(mut self, fused_linear: bool) -> Self {
        self.fused_linear = fused_linear;
        self
    }

    /// Sets strict conversion.
    #[must_use]
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
