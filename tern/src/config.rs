use crate::error::{TernError, TernResult};
use serde::Deserialize;
use serde::de::IntoDeserializer;
use serde::de::value::{Error as ValueError, StrDeserializer};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Verbosity names accepted in the `log_level` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    #[serde(alias = "WARN")]
    Warning,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Server configuration loaded from a `key=value` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address to listen on (default: 0.0.0.0)
    pub host: Ipv4Addr,

    /// TCP port (default: 8080)
    pub port: u16,

    /// Worker threads; `0` means one per CPU (default: 4)
    pub thread_count: usize,

    /// Set SO_LINGER on accepted sockets (default: true)
    pub linger: bool,

    pub log_level: LogLevel,

    /// Directory served to clients (default: ./static)
    pub root: PathBuf,

    /// Where daily log files are written (default: current directory)
    pub log_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED,
            port: 8080,
            thread_count: 4,
            linger: true,
            log_level: LogLevel::Info,
            root: PathBuf::from("./static"),
            log_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    pub const DEFAULT_PATH: &'static str = "config.ini";

    /// Load configuration from `path`.
    ///
    /// A missing file is not an error: defaults are returned. The second
    /// element holds warnings to report once logging is running.
    pub fn load(path: impl AsRef<Path>) -> TernResult<(Self, Vec<String>)> {
        let path = path.as_ref();
        let iter = match dotenvy::from_path_iter(path) {
            Ok(iter) => iter,
            Err(e) if e.not_found() => {
                let warning = format!(
                    "config file {} not found, using defaults",
                    path.display()
                );
                return Ok((Self::default(), vec![warning]));
            }
            Err(e) => {
                return Err(TernError::Config(format!("{}: {}", path.display(), e)));
            }
        };

        let mut pairs = Vec::new();
        for item in iter {
            let pair =
                item.map_err(|e| TernError::Config(format!("{}: {}", path.display(), e)))?;
            pairs.push(pair);
        }
        Self::from_pairs(pairs)
    }

    /// Build a config from already-split pairs, starting from the defaults.
    pub fn from_pairs<I, K, V>(pairs: I) -> TernResult<(Self, Vec<String>)>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        let mut warnings = Vec::new();
        for (key, value) in pairs {
            let key = key.as_ref().trim();
            let value = value.as_ref().trim();
            if !config.apply(key, value)? {
                warnings.push(format!("unknown config key '{}' ignored", key));
            }
        }
        Ok((config, warnings))
    }

    /// Returns `false` for keys this server does not know.
    fn apply(&mut self, key: &str, value: &str) -> TernResult<bool> {
        match key {
            "port" => self.port = parse_value(key, value)?,
            "thread_count" => self.thread_count = parse_value(key, value)?,
            "linger" => self.linger = parse_bool(value),
            "log_level" => self.log_level = parse_log_level(value)?,
            "host" => self.host = parse_value(key, value)?,
            "root" => self.root = PathBuf::from(value),
            "log_dir" => self.log_dir = PathBuf::from(value),
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Worker pool size after resolving `thread_count = 0`.
    pub fn worker_threads(&self) -> usize {
        if self.thread_count == 0 {
            num_cpus::get()
        } else {
            self.thread_count
        }
    }
}

fn parse_value<T>(key: &str, value: &str) -> TernResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| TernError::Config(format!("{} = '{}': {}", key, value, e)))
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn parse_log_level(value: &str) -> TernResult<LogLevel> {
    let upper = value.to_ascii_uppercase();
    let de: StrDeserializer<'_, ValueError> = upper.as_str().into_deserializer();
    LogLevel::deserialize(de).map_err(|e| TernError::Config(format!("log_level: {}", e)))
}
