use std::time::Duration;

use crate::config::global::GlobalConfig;

/// Per-build settings threaded through the planner, drivers and chroot code.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    /// Upper bound for every external tool invocation. `None` waits forever.
    pub tool_timeout: Option<Duration>,

    /// Reuse an existing image: skip partition tables and filesystem creation.
    pub skip_format: bool,
}

impl BuildContext {
    pub fn from_global(global: Option<&GlobalConfig>) -> Self {
        match global {
            Some(global) => Self {
                tool_timeout: global.tool_timeout_secs.map(Duration::from_secs),
                skip_format: global.skip_format,
            },
            None => Self::default(),
        }
    }
}
