//! Consistency modes and the secondary-read state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::wire::QueryFlags;

/// Session consistency mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Every operation may use any available secondary. Nothing is pinned.
    Eventual,
    /// Reads may use a secondary until the first write, after which the
    /// session stays on the primary.
    Monotonic,
    /// Every operation uses the primary.
    Strong,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Eventual => write!(f, "eventual"),
            Mode::Monotonic => write!(f, "monotonic"),
            Mode::Strong => write!(f, "strong"),
        }
    }
}

/// Reserved sockets that must be released after a mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// Keep everything.
    Nothing,
    /// Drop a reserved secondary.
    Secondary,
    /// Drop every reserved socket.
    All,
}

/// Mode plus the "may read from a secondary" flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Consistency {
    mode: Mode,
    slave_ok: bool,
}

impl Consistency {
    pub(crate) fn new(mode: Mode) -> Self {
        Self {
            mode,
            slave_ok: mode != Mode::Strong,
        }
    }

    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn slave_ok(&self) -> bool {
        self.slave_ok
    }

    /// Restores the mode's default for secondary reads. Callers release
    /// every reserved socket alongside.
    pub(crate) fn refresh(&mut self) {
        self.slave_ok = self.mode != Mode::Strong;
    }

    /// Switches mode and reports which reservations no longer fit.
    ///
    /// Without `refresh`, a reserved primary keeps a session off secondaries
    /// until the next refresh.
    pub(crate) fn set_mode(&mut self, mode: Mode, refresh: bool, has_primary: bool) -> Release {
        self.mode = mode;
        if refresh {
            self.refresh();
            Release::All
        } else if mode == Mode::Strong {
            self.slave_ok = false;
            Release::Secondary
        } else {
            if !has_primary {
                self.slave_ok = true;
            }
            Release::Nothing
        }
    }

    /// Returns true if a caller accepting secondaries may be served by one.
    pub(crate) fn allows_secondary(&self, accepts_secondary: bool) -> bool {
        self.slave_ok && accepts_secondary
    }

    /// Returns true if a freshly acquired socket should stay reserved.
    pub(crate) fn should_reserve(&self, has_secondary: bool) -> bool {
        self.mode != Mode::Eventual || has_secondary
    }

    /// Records that an operation needed the primary. Pins monotonic sessions.
    pub(crate) fn note_primary_required(&mut self, accepts_secondary: bool) {
        if !accepts_secondary && self.mode == Mode::Monotonic {
            self.slave_ok = false;
        }
    }

    /// Returns the query flag matching the secondary-read permission.
    pub(crate) fn query_flags(&self) -> QueryFlags {
        if self.slave_ok {
            QueryFlags::SLAVE_OK
        } else {
            QueryFlags::NONE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_defaults() {
        assert!(Consistency::new(Mode::Eventual).slave_ok());
        assert!(Consistency::new(Mode::Monotonic).slave_ok());
        assert!(!Consistency::new(Mode::Strong).slave_ok());
    }

    #[test]
    fn test_refresh_resets_flag() {
        let mut c = Consistency::new(Mode::Monotonic);
        c.note_primary_required(false);
        assert!(!c.slave_ok());
        c.refresh();
        assert!(c.slave_ok());
    }

    #[test]
    fn test_set_mode_with_refresh() {
        let mut c = Consistency::new(Mode::Eventual);
        assert_eq!(c.set_mode(Mode::Strong, true, false), Release::All);
        assert_eq!(c.mode(), Mode::Strong);
        assert!(!c.slave_ok());
    }

    #[test]
    fn test_set_mode_without_refresh() {
        let mut c = Consistency::new(Mode::Eventual);
        assert_eq!(c.set_mode(Mode::Strong, false, false), Release::Secondary);
        assert!(!c.slave_ok());

        assert_eq!(c.set_mode(Mode::Monotonic, false, true), Release::Nothing);
        assert!(!c.slave_ok());

        assert_eq!(c.set_mode(Mode::Monotonic, false, false), Release::Nothing);
        assert!(c.slave_ok());
    }

    #[test]
    fn test_monotonic_pins_after_primary_use() {
        let mut c = Consistency::new(Mode::Monotonic);
        c.note_primary_required(true);
        assert!(c.slave_ok());
        c.note_primary_required(false);
        assert!(!c.slave_ok());

        let mut e = Consistency::new(Mode::Eventual);
        e.note_primary_required(false);
        assert!(e.slave_ok());
    }

    #[test]
    fn test_reservation_policy() {
        assert!(!Consistency::new(Mode::Eventual).should_reserve(false));
        assert!(Consistency::new(Mode::Eventual).should_reserve(true));
        assert!(Consistency::new(Mode::Monotonic).should_reserve(false));
        assert!(Consistency::new(Mode::Strong).should_reserve(false));
    }

    #[test]
    fn test_query_flags() {
        assert_eq!(Consistency::new(Mode::Eventual).query_flags(), QueryFlags::SLAVE_OK);
        assert_eq!(Consistency::new(Mode::Strong).query_flags(), QueryFlags::NONE);
    }
}
