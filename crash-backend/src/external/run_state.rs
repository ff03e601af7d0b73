//! The files the external handler picks up as attachments after a crash.
//!
//! The scope is snapshotted into a single event file every time it changes,
//! while breadcrumbs are appended to one of two files. Each file holds at most
//! `max_breadcrumbs` entries, once it is full the other file is truncated and
//! written to instead, so the two together always contain at least the last
//! `max_breadcrumbs` breadcrumbs.

use crate::{Error, Host, ScopeMode, Value};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

pub const EVENT_FILE_NAME: &str = "__sentry-event";
pub const BREADCRUMB1_FILE_NAME: &str = "__sentry-breadcrumb1";
pub const BREADCRUMB2_FILE_NAME: &str = "__sentry-breadcrumb2";

pub struct RunState {
    pub event_path: PathBuf,
    pub breadcrumb1_path: PathBuf,
    pub breadcrumb2_path: PathBuf,
    num_breadcrumbs: usize,
    max_breadcrumbs: usize,
}

/// Creates the file if it doesn't exist, leaving its contents alone otherwise
fn touch(path: &Path) -> Result<(), Error> {
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(())
}

impl RunState {
    /// Creates the run files inside `run_path`
    pub fn create(run_path: &Path, max_breadcrumbs: usize) -> Result<Self, Error> {
        fs::create_dir_all(run_path)?;

        let state = Self {
            event_path: run_path.join(EVENT_FILE_NAME),
            breadcrumb1_path: run_path.join(BREADCRUMB1_FILE_NAME),
            breadcrumb2_path: run_path.join(BREADCRUMB2_FILE_NAME),
            num_breadcrumbs: 0,
            max_breadcrumbs: max_breadcrumbs.max(1),
        };

        for path in state.paths() {
            touch(path)?;
        }

        Ok(state)
    }

    /// The event file followed by both breadcrumb files
    #[inline]
    pub fn paths(&self) -> [&Path; 3] {
        [
            self.event_path.as_path(),
            self.breadcrumb1_path.as_path(),
            self.breadcrumb2_path.as_path(),
        ]
    }

    /// The number of breadcrumbs recorded so far, including ones that failed
    /// to be written
    #[inline]
    pub fn num_breadcrumbs(&self) -> usize {
        self.num_breadcrumbs
    }

    /// Overwrites the event file with the current scope, without breadcrumbs
    /// or the module list
    pub fn flush_scope(&self, host: &dyn Host) -> Result<(), Error> {
        let mut event = Value::Object(Default::default());
        host.apply_scope(&mut event, ScopeMode::NONE);

        // The breadcrumbs have their own files
        if let Value::Object(obj) = &mut event {
            obj.remove("breadcrumbs");
            obj.remove("modules");
        }

        let buf = host.encode(&event);
        if buf.is_empty() {
            log::debug!("failed to encode the scope, skipping flush");
            return Ok(());
        }

        fs::write(&self.event_path, buf)?;
        Ok(())
    }

    /// Returns whether the next breadcrumb goes into the second file, and
    /// whether it is the first in its block, ie whether the file needs to be
    /// truncated
    fn next_breadcrumb_target(&mut self) -> (bool, bool) {
        let n = self.num_breadcrumbs;
        self.num_breadcrumbs += 1;

        let first = n % self.max_breadcrumbs == 0;
        let second_file = n % (self.max_breadcrumbs * 2) >= self.max_breadcrumbs;

        (second_file, first)
    }

    pub fn add_breadcrumb(&mut self, host: &dyn Host, breadcrumb: &Value) -> Result<(), Error> {
        let (second_file, first) = self.next_breadcrumb_target();
        let path = if second_file {
            &self.breadcrumb2_path
        } else {
            &self.breadcrumb1_path
        };

        let buf = host.encode(breadcrumb);
        if buf.is_empty() {
            log::debug!("failed to encode breadcrumb, skipping");
            return Ok(());
        }

        if first {
            fs::write(path, buf)?;
        } else {
            let mut file = fs::OpenOptions::new().append(true).open(path)?;
            file.write_all(&buf)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rotates_between_files() {
        let dir = std::env::temp_dir().join(format!("run-state-{}", uuid::Uuid::new_v4()));
        let max = 3;
        let mut state = RunState::create(&dir, max).unwrap();

        for path in state.paths() {
            assert!(path.is_file());
        }

        let targets: Vec<_> = (0..max * 2 + 3)
            .map(|_| state.next_breadcrumb_target())
            .collect();

        assert_eq!(
            targets,
            [
                (false, true),
                (false, false),
                (false, false),
                (true, true),
                (true, false),
                (true, false),
                (false, true),
                (false, false),
                (false, false),
            ]
        );
        assert_eq!(state.num_breadcrumbs(), max * 2 + 3);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn zero_max_is_clamped() {
        let dir = std::env::temp_dir().join(format!("run-state-{}", uuid::Uuid::new_v4()));
        let mut state = RunState::create(&dir, 0).unwrap();

        assert_eq!(state.next_breadcrumb_target(), (false, true));
        assert_eq!(state.next_breadcrumb_target(), (true, true));

        let _ = fs::remove_dir_all(dir);
    }
}
