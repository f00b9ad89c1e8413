use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;

/// Manages a catalog of storages and accesses data items living in them.
///
/// Storages are kept in a JSON catalog file. Data items are addressed by a
/// chain of locators, outermost first: names of cataloged storages, urls or
/// paths recognized by one of the handlers, or explicit `type:value` pairs.
/// The last locator is the item inside the innermost storage.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// A global log level to use when printing logs.
    /// It's also possible to set `RUST_LOG` according to
    /// `tracing_subscriber::filter::EnvFilter`, which will always have
    /// priority.
    #[arg(long, env = "VSISTORE_LOG_LEVEL", default_value_t = Level::INFO)]
    pub log_level: Level,

    /// Whether to log in JSON
    #[arg(long)]
    pub json: bool,

    /// Path to a TOML config file. Defaults apply without one.
    #[arg(long, env = "VSISTORE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to the storage catalog. Created on first write.
    #[arg(long, env = "VSISTORE_CATALOG", default_value = "vsistore-catalog.json")]
    pub catalog: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Manages storages.
    #[command(subcommand)]
    Storage(StorageCommand),

    /// Manages storage authorizations.
    #[command(subcommand)]
    Auth(AuthCommand),

    /// Accesses a data item. By default only prints a virtual path to read it
    /// from, along with the environment needed to do so.
    Retrieve {
        /// The locator chain, outermost first, ending with the item itself.
        #[arg(required = true, value_name = "LOCATOR")]
        locators: Vec<String>,

        /// The format of the item.
        #[arg(long, short = 'f')]
        format: Option<String>,

        /// Materialize the item into the cache and print its local path.
        #[arg(long)]
        materialize: bool,
    },
}

#[derive(Subcommand, Clone, Debug)]
pub enum StorageCommand {
    /// Adds a storage to the catalog.
    Create {
        name: String,

        /// The storage location, in a URL format.
        url: String,

        /// The storage type. Detected from the url if omitted.
        #[arg(long = "type", short = 't')]
        storage_type: Option<String>,

        /// The name of the storage this one is nested in.
        #[arg(long, short = 'p')]
        parent: Option<String>,

        /// The name of the storage auth to use.
        #[arg(long, short = 'a', visible_alias = "storage-auth")]
        auth: Option<String>,
    },

    /// Removes a storage, and every storage nested in it, from the catalog.
    Delete { name: String },

    /// Lists the files of a storage.
    List {
        name: String,

        /// Sub-paths on that storage, possibly naming nested storages.
        paths: Vec<String>,

        /// A glob pattern to filter the listing with.
        #[arg(long, short = 'g', visible_alias = "glob")]
        pattern: Option<String>,
    },

    /// Prints the environment needed to read virtual paths of a storage.
    Env {
        name: String,

        /// Nested storages below the named one.
        paths: Vec<String>,
    },
}

#[derive(Subcommand, Clone, Debug)]
pub enum AuthCommand {
    /// Adds a storage auth to the catalog.
    Create {
        name: String,

        /// The auth endpoint, in a URL format.
        url: String,

        /// The auth type, e.g. `S3` or `swift`.
        #[arg(long = "type", short = 't')]
        auth_type: String,

        /// Parameters for that auth, as `KEY=VALUE`.
        #[arg(long = "param", short = 'p', value_parser = parse_parameter)]
        parameters: Vec<(String, String)>,
    },
}

/// Parses a `KEY=VALUE` parameter. Dashes in keys are taken as underscores,
/// so `--param auth-token=x` sets `auth_token`.
pub fn parse_parameter(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.replace('-', "_"), value.to_string())),
        _ => Err(format!("invalid parameter {:?}, expected KEY=VALUE", s)),
    }
}
