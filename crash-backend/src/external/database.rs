//! The crash report database shared with the handler process.
//!
//! The database is a directory containing a `settings.json` file, which is
//! read by the handler once at launch, and a `reports` directory that the
//! handler writes captured reports into.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const REPORTS_DIR_NAME: &str = "reports";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Identifies this installation across runs
    pub client_id: uuid::Uuid,
    /// Whether the handler may upload reports
    pub uploads_enabled: bool,
    /// Unix timestamp of the last upload attempt
    #[serde(default)]
    pub last_upload_attempt: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_id: uuid::Uuid::new_v4(),
            uploads_enabled: false,
            last_upload_attempt: None,
        }
    }
}

/// Reads the settings of the database at `path`
pub fn read_settings(path: &Path) -> Result<Settings, Error> {
    let buf = fs::read(path.join(SETTINGS_FILE_NAME)).map_err(|source| Error::Database {
        path: path.to_owned(),
        source,
    })?;
    Ok(serde_json::from_slice(&buf)?)
}

/// An open handle to the crash report database
pub struct ReportDatabase {
    path: PathBuf,
    settings: Settings,
}

impl ReportDatabase {
    /// Opens the database at `path`, creating it if it doesn't exist yet
    pub fn initialize(path: &Path) -> Result<Self, Error> {
        let db_err = |source: io::Error| Error::Database {
            path: path.to_owned(),
            source,
        };

        fs::create_dir_all(path.join(REPORTS_DIR_NAME)).map_err(db_err)?;

        let mut db = Self {
            path: path.to_owned(),
            settings: Settings::default(),
        };

        match read_settings(path) {
            Ok(settings) => {
                db.settings = settings;
            }
            Err(Error::Database { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                db.write_settings()?;
            }
            Err(err) => {
                log::debug!("discarding unreadable database settings: {err}");
                db.write_settings()?;
            }
        }

        Ok(db)
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The directory the handler writes reports to
    #[inline]
    pub fn reports_path(&self) -> PathBuf {
        self.path.join(REPORTS_DIR_NAME)
    }

    #[inline]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Persists the upload consent
    pub fn set_uploads_enabled(&mut self, enabled: bool) -> Result<(), Error> {
        if self.settings.uploads_enabled == enabled {
            return Ok(());
        }

        self.settings.uploads_enabled = enabled;
        self.write_settings()
    }

    /// Closes the database, the files are left on disk for the handler
    #[inline]
    pub fn close(self) {}

    fn write_settings(&self) -> Result<(), Error> {
        let buf = serde_json::to_vec_pretty(&self.settings)?;

        // Write to a temporary file first so the handler never reads a
        // partially written file
        let settings_path = self.path.join(SETTINGS_FILE_NAME);
        let tmp_path = settings_path.with_extension("json.tmp");

        fs::write(&tmp_path, buf)
            .and_then(|()| fs::rename(&tmp_path, &settings_path))
            .map_err(|source| Error::Database {
                path: self.path.clone(),
                source,
            })
    }
}
