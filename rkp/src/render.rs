use std::fmt::Write;

use common::{HookType, StorePaths, decode_manifest, slot_of};
use libkv::Snapshot;
use tracing::warn;

/// Which subtree `rkp-watch` follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTarget {
    Intent,
    Reality,
    Hooks(HookType),
}

impl WatchTarget {
    pub fn path(&self, paths: &StorePaths, node: &str) -> String {
        match self {
            WatchTarget::Intent => paths.intent_path(node),
            WatchTarget::Reality => paths.reality_path(node),
            WatchTarget::Hooks(hook_type) => format!("{}{hook_type}/", paths.hooks_root()),
        }
    }
}

/// Print every manifest of a snapshot as `# <key> (revision N)` followed by
/// its YAML. Hook bindings for other nodes are left out; values that do not
/// decode are printed as stored.
pub fn render_snapshot(
    snapshot: &Snapshot,
    target: WatchTarget,
    paths: &StorePaths,
    node: &str,
) -> String {
    let mut out = String::new();
    for entry in &snapshot.entries {
        let slot = match target {
            WatchTarget::Hooks(_) => match paths.parse_hook_key(&entry.key) {
                Ok(binding) if binding.scope.applies_to(node) => binding.pod_id,
                Ok(_) => continue,
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "not a hook binding");
                    continue;
                }
            },
            _ => slot_of(&entry.key).to_string(),
        };

        let _ = writeln!(out, "# {} (revision {})", entry.key, entry.mod_revision);
        let yaml = decode_manifest(&slot, &entry.value)
            .map_err(|e| e.to_string())
            .and_then(|m| m.to_yaml().map_err(|e| e.to_string()));
        match yaml {
            Ok(yaml) => out.push_str(&yaml),
            Err(e) => {
                warn!(key = %entry.key, error = %e, "cannot decode manifest, printing raw value");
                out.push_str(&String::from_utf8_lossy(&entry.value));
            }
        }
        if !out.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}
