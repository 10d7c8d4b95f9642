use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use rusqlite::OpenFlags;

static MEMORY_ENDPOINT: &str = "sqlite::memory:";
static FILE_SCHEME: &str = "sqlite://";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// How a database file is opened.
pub enum OpenMode {
    /// `mode=ro`
    ReadOnly,
    /// `mode=rw`, the file must already exist.
    ReadWrite,
    #[default]
    /// `mode=rwc`, the file is created if missing.
    ReadWriteCreate,
}

impl OpenMode {
    fn parse(mode: &str) -> Result<Self, String> {
        match mode {
            "ro" => Ok(Self::ReadOnly),
            "rw" => Ok(Self::ReadWrite),
            "rwc" => Ok(Self::ReadWriteCreate),
            other => Err(format!("unknown mode {other:?}, expected one of ro, rw or rwc")),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
            Self::ReadWriteCreate => "rwc",
        }
    }

    pub(crate) fn flags(&self) -> OpenFlags {
        let base = OpenFlags::SQLITE_OPEN_NO_MUTEX;
        match self {
            Self::ReadOnly => base | OpenFlags::SQLITE_OPEN_READ_ONLY,
            Self::ReadWrite => base | OpenFlags::SQLITE_OPEN_READ_WRITE,
            Self::ReadWriteCreate => {
                base | OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
            },
        }
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A parsed SQLite endpoint.
pub enum SqliteEndpoint {
    /// `sqlite::memory:`, a private in-memory database.
    Memory,
    /// `sqlite://<path>[?mode=ro|rw|rwc]`
    File { path: PathBuf, mode: OpenMode },
}

impl SqliteEndpoint {
    /// Parses a raw endpoint without touching the filesystem.
    pub fn parse(endpoint: &str) -> Result<Self, String> {
        let endpoint = endpoint.trim();
        if endpoint == MEMORY_ENDPOINT {
            return Ok(Self::Memory);
        }

        let rest = endpoint
            .strip_prefix(FILE_SCHEME)
            .ok_or_else(|| format!("expected {MEMORY_ENDPOINT:?} or the {FILE_SCHEME:?} scheme"))?;

        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };

        if path.is_empty() {
            return Err("missing database path".to_string());
        }

        let mut mode = OpenMode::default();
        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some(("mode", value)) => mode = OpenMode::parse(value)?,
                _ => return Err(format!("unknown parameter {pair:?}")),
            }
        }

        Ok(Self::File {
            path: PathBuf::from(path),
            mode,
        })
    }

    #[inline]
    pub fn is_memory(&self) -> bool {
        matches!(self, Self::Memory)
    }
}

impl Display for SqliteEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "{MEMORY_ENDPOINT}"),
            Self::File { path, mode } => {
                write!(f, "{FILE_SCHEME}{}?mode={}", path.display(), mode.as_str())
            },
        }
    }
}
