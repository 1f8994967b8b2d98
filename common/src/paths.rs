//! Key layout of the preparer's data in the store.
//!
//! ```text
//! <prefix>/intent/<node>/<pod-id>                 desired pods of a node
//! <prefix>/reality/<node>/<pod-id>                pods the node's preparer applied
//! <prefix>/hooks/<hook-type>/global/<pod-id>      hook binding for every node
//! <prefix>/hooks/<hook-type>/nodes/<node>/<pod-id> hook binding for one node
//! ```
//!
//! Subtree paths returned by [`StorePaths`] end with `/`, so a prefix read of
//! `intent/node-1/` never picks up keys of `node-10`.

use std::fmt;

use crate::hooks::{HookType, HookTypeError};

pub const DEFAULT_PREFIX: &str = "/rk8s/preparer";

const GLOBAL_SEGMENT: &str = "global";
const NODES_SEGMENT: &str = "nodes";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookScope {
    Global,
    Node(String),
}

impl HookScope {
    pub fn applies_to(&self, node: &str) -> bool {
        match self {
            HookScope::Global => true,
            HookScope::Node(n) => n == node,
        }
    }
}

impl fmt::Display for HookScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookScope::Global => f.write_str(GLOBAL_SEGMENT),
            HookScope::Node(node) => write!(f, "{NODES_SEGMENT}/{node}"),
        }
    }
}

/// A hook binding decoded from its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookBinding {
    pub hook_type: HookType,
    pub scope: HookScope,
    pub pod_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("key {0:?} is not under the hooks path")]
    NotAHookKey(String),
    #[error("malformed hook key {0:?}")]
    MalformedHookKey(String),
    #[error(transparent)]
    UnknownHookType(#[from] HookTypeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    prefix: String,
}

impl Default for StorePaths {
    fn default() -> Self {
        StorePaths::new(DEFAULT_PREFIX)
    }
}

impl StorePaths {
    pub fn new(prefix: &str) -> Self {
        StorePaths {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn intent_path(&self, node: &str) -> String {
        format!("{}/intent/{node}/", self.prefix)
    }

    pub fn intent_key(&self, node: &str, pod_id: &str) -> String {
        format!("{}{pod_id}", self.intent_path(node))
    }

    pub fn reality_path(&self, node: &str) -> String {
        format!("{}/reality/{node}/", self.prefix)
    }

    pub fn reality_key(&self, node: &str, pod_id: &str) -> String {
        format!("{}{pod_id}", self.reality_path(node))
    }

    /// Root of every hook binding, global and node-scoped.
    pub fn hooks_root(&self) -> String {
        format!("{}/hooks/", self.prefix)
    }

    pub fn hook_path(&self, hook_type: HookType, scope: &HookScope) -> String {
        format!("{}{hook_type}/{scope}/", self.hooks_root())
    }

    pub fn hook_key(&self, hook_type: HookType, scope: &HookScope, pod_id: &str) -> String {
        format!("{}{pod_id}", self.hook_path(hook_type, scope))
    }

    pub fn parse_hook_key(&self, key: &str) -> Result<HookBinding, PathError> {
        let root = self.hooks_root();
        let rest = key
            .strip_prefix(root.as_str())
            .ok_or_else(|| PathError::NotAHookKey(key.to_string()))?;
        let segments: Vec<&str> = rest.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(PathError::MalformedHookKey(key.to_string()));
        }
        match segments.as_slice() {
            [hook_type, GLOBAL_SEGMENT, pod_id] => Ok(HookBinding {
                hook_type: hook_type.parse()?,
                scope: HookScope::Global,
                pod_id: pod_id.to_string(),
            }),
            [hook_type, NODES_SEGMENT, node, pod_id] => Ok(HookBinding {
                hook_type: hook_type.parse()?,
                scope: HookScope::Node(node.to_string()),
                pod_id: pod_id.to_string(),
            }),
            _ => Err(PathError::MalformedHookKey(key.to_string())),
        }
    }
}

/// The last segment of a key: the pod id of an intent or reality entry.
pub fn slot_of(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
