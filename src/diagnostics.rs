use log::{Level, LevelFilter};

/// Per-connection logging settings.
///
/// Every log record emitted on behalf of a connection (and the data channels it owns) is
/// filtered by `level` and tagged with `label`, so several connections living in one process
/// can be told apart and tuned independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    pub label: String,
    pub level: LevelFilter,
}

impl Diagnostics {
    pub fn new(label: impl Into<String>, level: LevelFilter) -> Self {
        Diagnostics {
            label: label.into(),
            level,
        }
    }

    /// Diagnostics which never emit anything.
    pub fn silent() -> Self {
        Diagnostics::new("peer", LevelFilter::Off)
    }

    #[inline]
    pub fn enabled(&self, level: Level) -> bool {
        level <= self.level
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Diagnostics::new("peer", LevelFilter::Info)
    }
}

/// Logs through the `log` facade, gated by a [Diagnostics] instance.
macro_rules! diag {
    ($diag:expr, $level:expr, $($arg:tt)+) => {{
        let diag: &$crate::diagnostics::Diagnostics = &$diag;
        let level: log::Level = $level;
        if diag.enabled(level) {
            log::log!(target: "rtcpeer", level, "[{}] {}", diag.label, format_args!($($arg)+));
        }
    }};
}

pub(crate) use diag;
