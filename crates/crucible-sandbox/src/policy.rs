//! Capability denylist policy.

use serde::{Deserialize, Serialize};

/// Ordered denylist of name prefixes with an ordered allowlist that vetoes
/// denylist matches.
///
/// Matching is a plain prefix test against fully qualified names. The
/// policy is read-only at patch time; the host constructs it once and
/// shares it across jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    denylist: Vec<String>,
    allowlist: Vec<String>,
}

impl SecurityPolicy {
    /// Creates a policy from explicit lists.
    pub fn new(denylist: Vec<String>, allowlist: Vec<String>) -> Self {
        Self {
            denylist,
            allowlist,
        }
    }

    /// The host's default surface: filesystem, network, process, threading
    /// and reflection access is denied, with narrow carve-outs for types
    /// that scripts legitimately need.
    pub fn host_default() -> Self {
        Self {
            denylist: vec![
                "Crucible.Host.Console".to_string(),
                "System.IO".to_string(),
                "System.Net".to_string(),
                "System.Xml".to_string(),
                "System.Reflection.Assembly".to_string(),
                "System.Reflection.Emit".to_string(),
                "System.Threading".to_string(),
                "System.Runtime.InteropServices".to_string(),
                "System.Diagnostics".to_string(),
                "System.Security".to_string(),
                "System.Timers".to_string(),
            ],
            allowlist: vec![
                "System.Diagnostics.Stopwatch".to_string(),
                "System.IO.MemoryStream".to_string(),
                "System.IO.Stream".to_string(),
                "System.IO.BinaryReader".to_string(),
                "System.IO.BinaryWriter".to_string(),
                "System.Net.Dns".to_string(),
                "System.Net.IPAddress".to_string(),
                "System.Net.IPEndPoint".to_string(),
                "System.Security.Cryptography".to_string(),
                "System.Threading.Interlocked".to_string(),
            ],
        }
    }

    /// True when `full_name` matches the denylist and no allowlist entry
    /// vetoes the match.
    pub fn is_denied(&self, full_name: &str) -> bool {
        self.denylist
            .iter()
            .any(|prefix| full_name.starts_with(prefix.as_str()))
            && !self
                .allowlist
                .iter()
                .any(|prefix| full_name.starts_with(prefix.as_str()))
    }
}
