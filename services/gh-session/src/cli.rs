//! Command-line definitions

use clap::builder::NonEmptyStringValueParser;
use clap::{Parser, Subcommand};

/// GitHub session manager
#[derive(Parser, Debug)]
#[command(name = "gh-session", version, about = "Device-flow login and GitHub API access")]
pub struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true, env = "CONFIG_PATH", value_name = "PATH")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Authorize this machine with the device flow
    Login {
        /// Scopes to request, comma separated
        #[arg(long, value_delimiter = ',')]
        scopes: Option<Vec<String>>,
    },
    /// Delete the active token
    Logout,
    /// Show the active token
    Status,
    /// List stored tokens
    Tokens {
        #[arg(long)]
        json: bool,
    },
    /// Make another stored token active
    Switch {
        /// Token prefix (see `gh-session tokens`)
        #[arg(value_parser = NonEmptyStringValueParser::new())]
        handle: String,
    },
    /// Delete stored tokens starting with a prefix
    Delete {
        #[arg(value_parser = NonEmptyStringValueParser::new())]
        handle: String,
    },
    /// Store a token read from stdin and make it active
    Import {
        #[arg(long)]
        host: Option<String>,
        #[arg(long, value_delimiter = ',')]
        scopes: Vec<String>,
    },
    /// Call the REST API and print the JSON response
    Api {
        /// Path such as /user, or an absolute URL on the API host
        path: String,
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,
        /// JSON request body
        #[arg(short = 'd', long)]
        data: Option<String>,
        /// Follow `Link: rel="next"` and print all pages as one array
        #[arg(long)]
        paginate: bool,
    },
}
