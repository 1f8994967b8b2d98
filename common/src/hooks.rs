use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// When a hook fires relative to a pod's lifecycle.
///
/// The set is closed: a hook directory or store key naming anything else is
/// rejected with [`HookTypeError::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    BeforeInstall,
    AfterInstall,
    BeforeUninstall,
    AfterLaunch,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HookTypeError {
    #[error("unknown hook type {0:?}, expected one of: before_install, after_install, before_uninstall, after_launch")]
    Unknown(String),
}

impl HookType {
    pub const ALL: [HookType; 4] = [
        HookType::BeforeInstall,
        HookType::AfterInstall,
        HookType::BeforeUninstall,
        HookType::AfterLaunch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookType::BeforeInstall => "before_install",
            HookType::AfterInstall => "after_install",
            HookType::BeforeUninstall => "before_uninstall",
            HookType::AfterLaunch => "after_launch",
        }
    }
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookType {
    type Err = HookTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| HookTypeError::Unknown(s.to_string()))
    }
}
