//! Facade over the native SDK's own log file.
//!
//! This is the fabric's diagnostic log, separate from the `log` records the
//! binding itself emits.

use std::fmt;
use std::ops::BitOr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use super::FabricApi;
use crate::error::{BridgeError, BridgeResult};

/// Native log level flags; levels combine with `|`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LogLevel(u32);

impl LogLevel {
    pub const NONE: LogLevel = LogLevel(0);
    pub const ERROR: LogLevel = LogLevel(0x0001);
    pub const WARN: LogLevel = LogLevel(0x0002);
    pub const INFO: LogLevel = LogLevel(0x0004);
    pub const DATA: LogLevel = LogLevel(0x0008);
    pub const STATE: LogLevel = LogLevel(0x0010);
    pub const VERBOSE_STATE: LogLevel = LogLevel(0x0020);
    pub const STATS: LogLevel = LogLevel(0x0040);
    pub const QSTATS: LogLevel = LogLevel(0x0080);
    pub const RSTATS: LogLevel = LogLevel(0x0100);
    pub const LSTATS: LogLevel = LogLevel(0x0200);
    pub const VERBOSE_STATS: LogLevel = LogLevel(0x0400);
    pub const DIAGNOSTIC: LogLevel = LogLevel(0x0800);
    pub const VERBOSE_DIAGNOSTIC: LogLevel = LogLevel(0x1000);

    const NAMES: [(&'static str, LogLevel); 13] = [
        ("error", LogLevel::ERROR),
        ("warn", LogLevel::WARN),
        ("info", LogLevel::INFO),
        ("data", LogLevel::DATA),
        ("state", LogLevel::STATE),
        ("verbose-state", LogLevel::VERBOSE_STATE),
        ("stats", LogLevel::STATS),
        ("qstats", LogLevel::QSTATS),
        ("rstats", LogLevel::RSTATS),
        ("lstats", LogLevel::LSTATS),
        ("verbose-stats", LogLevel::VERBOSE_STATS),
        ("diagnostic", LogLevel::DIAGNOSTIC),
        ("verbose-diagnostic", LogLevel::VERBOSE_DIAGNOSTIC),
    ];

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: LogLevel) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn without(self, other: LogLevel) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for LogLevel {
    type Output = LogLevel;

    fn bitor(self, rhs: LogLevel) -> LogLevel {
        LogLevel(self.0 | rhs.0)
    }
}

/// Parses a `|`- or `,`-separated list of level names.
impl FromStr for LogLevel {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(['|', ','])
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .try_fold(LogLevel::NONE, |acc, name| {
                LogLevel::NAMES
                    .iter()
                    .find(|(known, _)| known.eq_ignore_ascii_case(name))
                    .map(|(_, level)| acc | *level)
                    .ok_or_else(|| {
                        BridgeError::invalid_argument(format!("Unknown log level '{name}'"))
                    })
            })
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = LogLevel::NAMES
            .iter()
            .filter(|(_, level)| self.contains(*level))
            .map(|(name, _)| *name)
            .collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// Native log file control.
pub struct FabricLogger {
    api: Arc<dyn FabricApi>,
}

impl FabricLogger {
    pub fn new(api: Arc<dyn FabricApi>) -> Self {
        Self { api }
    }

    pub fn open(&self, file: &Path, tag: &str) -> BridgeResult<()> {
        if tag.is_empty() {
            return Err(BridgeError::invalid_argument("Log tag must not be empty"));
        }
        self.api.log_open(file, tag).check("log_open")
    }

    pub fn close(&self) -> BridgeResult<()> {
        self.api.log_close().check("log_close")
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::from_bits(self.api.log_level())
    }

    pub fn set_level(&self, level: LogLevel) -> BridgeResult<()> {
        self.api.log_set_level(level.bits()).check("log_set_level")
    }

    /// Add `level` to the current mask.
    pub fn enable(&self, level: LogLevel) -> BridgeResult<()> {
        self.set_level(self.level() | level)
    }

    /// Remove `level` from the current mask.
    pub fn clear_level(&self, level: LogLevel) -> BridgeResult<()> {
        self.set_level(self.level().without(level))
    }

    pub fn write(&self, level: LogLevel, text: &str) -> BridgeResult<()> {
        self.api.log_write(level.bits(), text).check("log_write")
    }
}
