//! Write acknowledgement requirements.
//!
//! A session either sends writes without waiting for the server or follows
//! each write with a `getLastError` command on the same socket. [`Safe`] is
//! the public description of the requirements; [`GetLastError`] is the merged
//! command the session actually sends.

use bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};

/// Acknowledgement requirements for writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Safe {
    /// Minimum number of servers that must confirm the write.
    #[serde(default)]
    pub w: i32,
    /// Named replication mode, such as `majority`. Wins over `w`.
    #[serde(default)]
    pub w_mode: Option<String>,
    /// Milliseconds to wait for `w` before giving up. Zero waits forever.
    #[serde(default)]
    pub w_timeout: u32,
    /// Wait for the data to be flushed to disk.
    #[serde(default)]
    pub fsync: bool,
    /// Wait for the next group commit of the journal.
    #[serde(default)]
    pub j: bool,
}

impl Safe {
    /// Requires `w` servers to confirm.
    pub fn w(w: i32) -> Self {
        Self {
            w,
            ..Default::default()
        }
    }

    /// Requires the named replication mode.
    pub fn w_mode(mode: impl Into<String>) -> Self {
        Self {
            w_mode: Some(mode.into()),
            ..Default::default()
        }
    }

    /// Sets the replication timeout in milliseconds.
    pub fn with_timeout(mut self, w_timeout: u32) -> Self {
        self.w_timeout = w_timeout;
        self
    }

    /// Sets the fsync requirement.
    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    /// Sets the journal requirement.
    pub fn with_j(mut self, j: bool) -> Self {
        self.j = j;
        self
    }
}

/// Replication requirement of a merged acknowledgement command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteConcern {
    /// Number of servers.
    Count(i32),
    /// Named mode.
    Mode(String),
}

impl WriteConcern {
    fn from_safe(safe: &Safe) -> Option<Self> {
        match &safe.w_mode {
            Some(mode) if !mode.is_empty() => Some(WriteConcern::Mode(mode.clone())),
            _ if safe.w > 0 => Some(WriteConcern::Count(safe.w)),
            _ => None,
        }
    }
}

/// The acknowledgement command a session sends after each write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetLastError {
    /// Replication requirement.
    pub w: Option<WriteConcern>,
    /// Replication timeout in milliseconds; zero means none.
    pub w_timeout: u32,
    /// Disk flush requirement.
    pub fsync: bool,
    /// Journal commit requirement.
    pub j: bool,
}

impl GetLastError {
    /// Builds the command for `safe` alone.
    pub fn from_safe(safe: &Safe) -> Self {
        Self {
            w: WriteConcern::from_safe(safe),
            w_timeout: safe.w_timeout,
            fsync: safe.fsync,
            j: safe.j,
        }
    }

    /// Merges `safe` into the command, keeping whichever requirement is
    /// stricter.
    ///
    /// A named mode replaces anything; a larger count replaces a smaller one
    /// but never a named mode. A shorter timeout replaces a longer one or the
    /// absence of one. `fsync` replaces `j`, and `j` only applies while
    /// `fsync` is unset.
    pub fn merge(&mut self, safe: &Safe) {
        let incoming = WriteConcern::from_safe(safe);
        self.w = match (self.w.take(), incoming) {
            (None, w) => w,
            (_, Some(WriteConcern::Mode(mode))) => Some(WriteConcern::Mode(mode)),
            (Some(WriteConcern::Count(current)), Some(WriteConcern::Count(n))) => {
                Some(WriteConcern::Count(current.max(n)))
            }
            (current, _) => current,
        };

        if safe.w_timeout > 0 && (self.w_timeout == 0 || safe.w_timeout < self.w_timeout) {
            self.w_timeout = safe.w_timeout;
        }

        if safe.fsync {
            self.fsync = true;
            self.j = false;
        } else if safe.j && !self.fsync {
            self.j = true;
        }
    }

    /// Renders the command document. Unset fields are omitted.
    pub fn to_command(&self) -> Document {
        let mut cmd = doc! { "getLastError": 1 };
        match &self.w {
            Some(WriteConcern::Count(n)) => {
                cmd.insert("w", *n);
            }
            Some(WriteConcern::Mode(mode)) => {
                cmd.insert("w", Bson::String(mode.clone()));
            }
            None => {}
        }
        if self.w_timeout > 0 {
            cmd.insert("wtimeout", self.w_timeout as i64);
        }
        if self.fsync {
            cmd.insert("fsync", true);
        }
        if self.j {
            cmd.insert("j", true);
        }
        cmd
    }

    /// Describes the command as a [`Safe`].
    pub fn to_safe(&self) -> Safe {
        let (w, w_mode) = match &self.w {
            Some(WriteConcern::Count(n)) => (*n, None),
            Some(WriteConcern::Mode(mode)) => (0, Some(mode.clone())),
            None => (0, None),
        };
        Safe {
            w,
            w_mode,
            w_timeout: self.w_timeout,
            fsync: self.fsync,
            j: self.j,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merged(steps: &[Safe]) -> GetLastError {
        let mut iter = steps.iter();
        let mut cmd = GetLastError::from_safe(iter.next().unwrap());
        for safe in iter {
            cmd.merge(safe);
        }
        cmd
    }

    #[test]
    fn test_default_command() {
        let cmd = GetLastError::from_safe(&Safe::default());
        assert_eq!(cmd.to_command(), doc! { "getLastError": 1 });
    }

    #[test]
    fn test_larger_count_wins() {
        let cmd = merged(&[Safe::w(2), Safe::w(1), Safe::w(3), Safe::w(2)]);
        assert_eq!(cmd.w, Some(WriteConcern::Count(3)));
    }

    #[test]
    fn test_mode_never_replaced_by_count() {
        let cmd = merged(&[Safe::w(2), Safe::w_mode("majority"), Safe::w(10)]);
        assert_eq!(cmd.w, Some(WriteConcern::Mode("majority".into())));
        let cmd = merged(&[Safe::w_mode("majority"), Safe::w_mode("dc")]);
        assert_eq!(cmd.w, Some(WriteConcern::Mode("dc".into())));
    }

    #[test]
    fn test_timeout_only_shrinks() {
        let cmd = merged(&[
            Safe::w(1).with_timeout(500),
            Safe::default().with_timeout(800),
            Safe::default().with_timeout(200),
            Safe::default(),
        ]);
        assert_eq!(cmd.w_timeout, 200);

        let cmd = merged(&[Safe::w(2), Safe::default().with_timeout(300)]);
        assert_eq!(cmd.w_timeout, 300);
    }

    #[test]
    fn test_fsync_clears_j() {
        let cmd = merged(&[Safe::default().with_j(true), Safe::default().with_fsync(true)]);
        assert!(cmd.fsync);
        assert!(!cmd.j);

        let cmd = merged(&[Safe::default().with_fsync(true), Safe::default().with_j(true)]);
        assert!(cmd.fsync);
        assert!(!cmd.j);

        let cmd = merged(&[Safe::default(), Safe::default().with_j(true)]);
        assert!(cmd.j);
    }

    #[test]
    fn test_command_rendering() {
        let cmd = GetLastError::from_safe(&Safe::w_mode("majority").with_timeout(100).with_j(true));
        assert_eq!(
            cmd.to_command(),
            doc! { "getLastError": 1, "w": "majority", "wtimeout": 100_i64, "j": true }
        );
        assert_eq!(
            cmd.to_safe(),
            Safe {
                w: 0,
                w_mode: Some("majority".into()),
                w_timeout: 100,
                fsync: false,
                j: true,
            }
        );
    }

    #[test]
    fn test_empty_mode_ignored() {
        let safe = Safe {
            w: 2,
            w_mode: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(GetLastError::from_safe(&safe).w, Some(WriteConcern::Count(2)));
    }
}
