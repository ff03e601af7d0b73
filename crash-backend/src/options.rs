use crate::Error;
use std::{fmt, path::PathBuf, str::FromStr};

/// The default maximum number of breadcrumbs kept per rotation block
pub const DEFAULT_MAX_BREADCRUMBS: usize = 100;

/// Pre-parsed configuration consumed by the backends.
#[derive(Clone, Debug)]
pub struct Options {
    /// Directory for the files belonging to the current run
    pub run_path: PathBuf,
    /// Directory of the crash report database owned by the handler process
    pub database_path: PathBuf,
    /// Explicit path to the handler executable, if not set the handler is
    /// looked up next to the current executable
    pub handler_path: Option<PathBuf>,
    /// Additional files the handler process attaches to a crash report
    pub attachments: Vec<PathBuf>,
    pub dsn: Option<Dsn>,
    /// If false, forwarding of crashes to the OS crash reporter is disabled
    pub system_crash_reporter_enabled: bool,
    /// The size of a breadcrumb rotation block
    pub max_breadcrumbs: usize,
}

impl Default for Options {
    fn default() -> Self {
        let root = std::env::temp_dir().join("crash-backend");
        Self {
            run_path: root.join("run"),
            database_path: root.join("db"),
            handler_path: None,
            attachments: Vec::new(),
            dsn: None,
            system_crash_reporter_enabled: false,
            max_breadcrumbs: DEFAULT_MAX_BREADCRUMBS,
        }
    }
}

impl Options {
    /// Creates options with the run directory and database directory both
    /// placed under `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            run_path: root.join("run"),
            database_path: root.join("db"),
            ..Default::default()
        }
    }

    #[inline]
    pub fn with_run_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.run_path = path.into();
        self
    }

    #[inline]
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    #[inline]
    pub fn with_handler_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.handler_path = Some(path.into());
        self
    }

    #[inline]
    pub fn with_attachment(mut self, path: impl Into<PathBuf>) -> Self {
        self.attachments.push(path.into());
        self
    }

    #[inline]
    pub fn with_dsn(mut self, dsn: Dsn) -> Self {
        self.dsn = Some(dsn);
        self
    }

    #[inline]
    pub fn with_system_crash_reporter(mut self, enabled: bool) -> Self {
        self.system_crash_reporter_enabled = enabled;
        self
    }

    #[inline]
    pub fn with_max_breadcrumbs(mut self, max: usize) -> Self {
        self.max_breadcrumbs = max;
        self
    }
}

/// The project credentials, `scheme://public_key@host[:port]/[path/]project_id`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dsn {
    scheme: String,
    public_key: String,
    host: String,
    port: Option<u16>,
    path: String,
    project_id: String,
}

impl Dsn {
    #[inline]
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    #[inline]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// The port, falling back to the scheme's default if one was not specified
    pub fn port(&self) -> u16 {
        self.port
            .unwrap_or(if self.scheme == "https" { 443 } else { 80 })
    }

    /// The url minidumps and their attachments are submitted to
    pub fn minidump_url(&self) -> String {
        format!(
            "{}://{}:{}{}/api/{}/minidump/?sentry_key={}",
            self.scheme,
            self.host,
            self.port(),
            self.path,
            self.project_id,
            self.public_key
        )
    }
}

impl FromStr for Dsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidDsn(s.to_owned());

        let (scheme, rest) = s.split_once("://").ok_or_else(invalid)?;
        if scheme != "http" && scheme != "https" {
            return Err(invalid());
        }

        let (auth, rest) = rest.split_once('@').ok_or_else(invalid)?;
        // The secret key is deprecated and ignored
        let public_key = auth.split(':').next().unwrap_or_default();
        if public_key.is_empty() {
            return Err(invalid());
        }

        let (host_port, path) = rest.split_once('/').ok_or_else(invalid)?;
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => (host, Some(port.parse().map_err(|_err| invalid())?)),
            None => (host_port, None),
        };
        if host.is_empty() {
            return Err(invalid());
        }

        let path = path.trim_end_matches('/');
        let (prefix, project_id) = match path.rsplit_once('/') {
            Some((prefix, project_id)) => (format!("/{prefix}"), project_id),
            None => (String::new(), path),
        };
        if project_id.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            scheme: scheme.to_owned(),
            public_key: public_key.to_owned(),
            host: host.to_owned(),
            port,
            path: prefix,
            project_id: project_id.to_owned(),
        })
    }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}@{}", self.scheme, self.public_key, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        write!(f, "{}/{}", self.path, self.project_id)
    }
}
