/*!
 * Configuration structures and defaults for starport
 *
 * The server core receives an already-populated `ServerConfig`; the binary
 * builds one from a TOML file plus command-line overrides. Every limit has a
 * default so a minimal config of just an address and port is runnable.
 */

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};

/// Ceiling on keep-alive slots: `FD_SETSIZE - 256` in the classic select()
/// sizing, retained so a misconfigured maxkeep cannot starve the process of
/// descriptors.
pub const MAX_KEEP_CEILING: usize = 1024 - 256;

/// How header names are stored in a header set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderCase {
    /// Keep names exactly as received
    Preserve,
    /// Fold names to lower case
    Lower,
    /// Fold names to upper case
    Upper,
}

impl Default for HeaderCase {
    fn default() -> Self {
        Self::Preserve
    }
}

/// Log verbosity for the binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

/// Identity and listen surface of the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Server name; also names the pid file (`<name>.pid`)
    pub name: String,
    /// Listen address
    pub address: String,
    /// Listen port
    pub port: u16,
    /// Comma-separated `[addr:]port` list to bind before privilege drop
    pub prebind: Option<String>,
    /// File with one prebind entry per line
    pub prebind_file: Option<String>,
    /// Seconds allowed for each subsystem to drain at shutdown
    pub shutdown_timeout: u64,
    /// Directory for the pid file
    pub home: String,
    /// Log file; stdout when unset
    pub log_file: Option<String>,
    pub log_level: LogLevel,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            name: "starport".to_string(),
            address: "0.0.0.0".to_string(),
            port: 8080,
            prebind: None,
            prebind_file: None,
            shutdown_timeout: 20,
            home: ".".to_string(),
            log_file: None,
            log_level: LogLevel::Info,
        }
    }
}

/// Request-parsing and response limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    /// Total byte budget for the request line plus all headers
    pub maxheaders: usize,
    /// Byte budget for a single line
    pub maxline: usize,
    /// Largest accepted request body
    pub maxpost: u64,
    /// Responses at least this large are sent with the fd fast path
    pub sendfdmin: u64,
    /// Error bodies are padded to at least this size
    pub errorminsize: usize,
    /// Queued connections beyond this are flagged overflow and served by the
    /// error pool; 0 disables the check
    pub maxqueued: usize,
    /// Drain unread request content before closing
    pub flushcontent: bool,
    pub header_case: HeaderCase,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            maxheaders: 16384,
            maxline: 8192,
            maxpost: 65536,
            sendfdmin: 2048,
            errorminsize: 514,
            maxqueued: 128,
            flushcontent: false,
            header_case: HeaderCase::Preserve,
        }
    }
}

/// Keep-alive waiter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveSection {
    pub enabled: bool,
    /// Seconds an idle socket may wait for its next request
    pub timeout: u64,
    /// Slots in the waiter slab; clamped to [`MAX_KEEP_CEILING`]
    pub maxkeep: usize,
}

impl Default for KeepaliveSection {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: 30,
            maxkeep: MAX_KEEP_CEILING,
        }
    }
}

/// One worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    pub name: String,
    #[serde(default)]
    pub minthreads: usize,
    #[serde(default = "default_maxthreads")]
    pub maxthreads: usize,
    /// Connections a worker serves before retiring; 0 = unlimited
    #[serde(default)]
    pub maxconns: usize,
    /// Seconds an idle worker above minthreads lingers before exiting
    #[serde(default = "default_pool_timeout")]
    pub timeout: u64,
}

fn default_maxthreads() -> usize {
    10
}

fn default_pool_timeout() -> u64 {
    120
}

impl PoolSection {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            minthreads: 0,
            maxthreads: default_maxthreads(),
            maxconns: 0,
            timeout: default_pool_timeout(),
        }
    }
}

/// A (method, url) → pool route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSection {
    pub method: String,
    pub url: String,
    pub pool: String,
}

/// One database handle pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbPoolSection {
    pub name: String,
    pub driver: String,
    pub datasource: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_connections")]
    pub connections: usize,
    /// Seconds a handle may sit unused before reconnecting; 0 disables
    #[serde(default = "default_maxidle")]
    pub maxidle: u64,
    /// Seconds a handle may stay open before reconnecting; 0 disables
    #[serde(default = "default_maxopen")]
    pub maxopen: u64,
    /// Log every statement
    #[serde(default)]
    pub verbose: bool,
    /// Log failed statements only
    #[serde(default)]
    pub logsqlerrors: bool,
}

fn default_connections() -> usize {
    2
}

fn default_maxidle() -> u64 {
    600
}

fn default_maxopen() -> u64 {
    3600
}

/// Database directory settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DbSection {
    /// Allowed pool names, comma separated; `*` allows all configured pools
    pub pools: Option<String>,
    pub defaultpool: Option<String>,
}

/// Full server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub limits: LimitsSection,
    pub keepalive: KeepaliveSection,
    #[serde(rename = "pool")]
    pub pools: Vec<PoolSection>,
    #[serde(rename = "route")]
    pub routes: Vec<RouteSection>,
    #[serde(rename = "dbpool")]
    pub dbpools: Vec<DbPoolSection>,
    pub db: DbSection,
    /// status code (as a string key) → redirect URL
    pub redirects: HashMap<String, String>,
}

impl ServerConfig {
    /// Load and validate a TOML config file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| {
            ServerError::Config(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        let config: ServerConfig = toml::from_str(&text)
            .map_err(|e| ServerError::Config(format!("parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency beyond what serde enforces
    pub fn validate(&self) -> Result<()> {
        if self.server.name.is_empty() {
            return Err(ServerError::Config("server.name must not be empty".into()));
        }
        for pool in &self.pools {
            if pool.maxthreads == 0 {
                return Err(ServerError::Config(format!(
                    "pool '{}': maxthreads must be at least 1",
                    pool.name
                )));
            }
            if pool.minthreads > pool.maxthreads {
                return Err(ServerError::Config(format!(
                    "pool '{}': minthreads {} exceeds maxthreads {}",
                    pool.name, pool.minthreads, pool.maxthreads
                )));
            }
        }
        for db in &self.dbpools {
            if db.connections == 0 {
                return Err(ServerError::Config(format!(
                    "dbpool '{}': connections must be at least 1",
                    db.name
                )));
            }
            if db.datasource.is_empty() {
                return Err(ServerError::Config(format!(
                    "dbpool '{}': datasource is required",
                    db.name
                )));
            }
        }
        for route in &self.routes {
            if !self.pools.iter().any(|p| p.name == route.pool)
                && route.pool != "default"
                && route.pool != "error"
            {
                return Err(ServerError::Config(format!(
                    "route {} {} references unknown pool '{}'",
                    route.method, route.url, route.pool
                )));
            }
        }
        self.parsed_redirects()?;
        Ok(())
    }

    /// Redirect table with numeric status keys
    pub fn parsed_redirects(&self) -> Result<HashMap<u16, String>> {
        let mut out = HashMap::with_capacity(self.redirects.len());
        for (status, url) in &self.redirects {
            let code: u16 = status.parse().map_err(|_| {
                ServerError::Config(format!("redirects: invalid status code '{}'", status))
            })?;
            out.insert(code, url.clone());
        }
        Ok(out)
    }

    /// Pool section by name, if configured
    pub fn pool(&self, name: &str) -> Option<&PoolSection> {
        self.pools.iter().find(|p| p.name == name)
    }

    /// Names of db pools this server may use, honoring `db.pools`
    pub fn allowed_dbpools(&self) -> Vec<String> {
        match self.db.pools.as_deref() {
            None | Some("*") => self.dbpools.iter().map(|p| p.name.clone()).collect(),
            Some(list) => {
                let allowed: Vec<&str> = list.split(',').map(str::trim).collect();
                self.dbpools
                    .iter()
                    .filter(|p| allowed.contains(&p.name.as_str()))
                    .map(|p| p.name.clone())
                    .collect()
            }
        }
    }
}
