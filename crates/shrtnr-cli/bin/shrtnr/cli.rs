use clap::{Parser, Subcommand, ValueEnum};
use shrtnr_storage::{FileConfig, FileDeleteMode, PostgresConfig, StoreConfig};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

pub const STORAGE_BACKEND_ENV: &str = "SHRTNR_STORAGE";
pub const FILE_PATH_ENV: &str = "SHRTNR_FILE_PATH";
pub const FILE_DELETE_MODE_ENV: &str = "SHRTNR_FILE_DELETE_MODE";
pub const DATABASE_DSN_ENV: &str = "SHRTNR_DATABASE_DSN";
pub const BASE_URL_ENV: &str = "SHRTNR_BASE_URL";
pub const JSON_LOGS_ENV: &str = "SHRTNR_JSON_LOGS";

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageBackendArg {
    #[value(name = "in-memory")]
    InMemory,
    #[value(name = "file")]
    File,
    #[value(name = "postgres")]
    Postgres,
}

impl Display for StorageBackendArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackendArg::InMemory => write!(f, "in-memory"),
            StorageBackendArg::File => write!(f, "file"),
            StorageBackendArg::Postgres => write!(f, "postgres"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FileDeleteModeArg {
    Persist,
    Disabled,
}

impl From<FileDeleteModeArg> for FileDeleteMode {
    fn from(arg: FileDeleteModeArg) -> Self {
        match arg {
            FileDeleteModeArg::Persist => FileDeleteMode::Persist,
            FileDeleteModeArg::Disabled => FileDeleteMode::Disabled,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "shrtnr", about = "Store and look up shortened links")]
pub struct CLI {
    #[arg(
        long,
        global = true,
        env = STORAGE_BACKEND_ENV,
        value_enum,
        default_value_t = StorageBackendArg::InMemory
    )]
    pub storage: StorageBackendArg,

    #[arg(long, global = true, env = FILE_PATH_ENV)]
    pub file_path: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = FILE_DELETE_MODE_ENV,
        value_enum,
        default_value_t = FileDeleteModeArg::Persist
    )]
    pub file_delete_mode: FileDeleteModeArg,

    #[arg(long, global = true, env = DATABASE_DSN_ENV)]
    pub database_dsn: Option<String>,

    /// Prefix for printed short URLs.
    #[arg(long, global = true, env = BASE_URL_ENV, default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true, env = JSON_LOGS_ENV)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Store a long URL and print its short URL.
    Shorten {
        #[arg(long)]
        owner: String,
        url: String,
    },
    /// Print the long URL behind a short code.
    Resolve { code: String },
    /// Print every live link of an owner.
    List {
        #[arg(long)]
        owner: String,
    },
    /// Soft-delete short codes owned by `owner`.
    Delete {
        #[arg(long)]
        owner: String,
        #[arg(required = true)]
        codes: Vec<String>,
    },
    /// Print owner and link counts as JSON.
    Stats,
    /// Check that the backend is reachable.
    Ping,
}

impl CLI {
    /// Builds the store configuration for the selected backend.
    pub fn store_config(&self) -> anyhow::Result<StoreConfig> {
        let config = match self.storage {
            StorageBackendArg::InMemory => StoreConfig::Memory,
            StorageBackendArg::File => {
                let path = self.file_path.clone().ok_or_else(|| {
                    anyhow::anyhow!("--file-path is required when storage backend is file")
                })?;
                StoreConfig::File(
                    FileConfig::builder()
                        .path(path)
                        .delete_mode(self.file_delete_mode.into())
                        .build(),
                )
            }
            StorageBackendArg::Postgres => {
                let dsn = self.database_dsn.clone().ok_or_else(|| {
                    anyhow::anyhow!("--database-dsn is required when storage backend is postgres")
                })?;
                StoreConfig::Postgres(PostgresConfig::builder().dsn(dsn).build())
            }
        };
        Ok(config)
    }
}
