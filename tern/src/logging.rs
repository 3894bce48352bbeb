//! Logging initialization for tern.
//!
//! Events go to stdout and to a per-day file `log_YYYY-MM-DD.log` inside the
//! configured log directory. `RUST_LOG` overrides the configured level:
//!
//! ```bash
//! RUST_LOG=tern=debug tern --config config.ini
//! ```

use crate::config::Config;
use crate::error::{TernError, TernResult};
use chrono::{Local, NaiveDate};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &Config) -> TernResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));

    let file = DailyFile::new(&config.log_dir).map_err(|e| {
        TernError::Logging(format!("cannot open log directory {}: {}", config.log_dir.display(), e))
    })?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .with(fmt::layer().with_ansi(false).with_thread_names(true).with_writer(file))
        .try_init()
        .map_err(|e| TernError::Logging(e.to_string()))
}

/// Append-only log file that rolls over when the local date changes.
pub struct DailyFile {
    dir: PathBuf,
    current: Mutex<Option<(NaiveDate, File)>>,
}

impl DailyFile {
    pub fn new(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let daily = Self {
            dir,
            current: Mutex::new(None),
        };
        // Surface permission problems at startup rather than on first event.
        let today = Local::now().date_naive();
        let file = daily.open(today)?;
        *daily.current.lock().unwrap_or_else(PoisonError::into_inner) = Some((today, file));
        Ok(daily)
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("log_{}.log", date.format("%Y-%m-%d")))
    }

    fn open(&self, date: NaiveDate) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(date))
    }

    /// Write one formatted record into the file for `date`.
    pub fn write_for(&self, date: NaiveDate, buf: &[u8]) -> io::Result<usize> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let stale = !matches!(&*current, Some((open_date, _)) if *open_date == date);
        if stale {
            *current = Some((date, self.open(date)?));
        }
        if let Some((_, file)) = current.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }
}

pub struct DailyFileWriter<'a> {
    target: &'a DailyFile,
}

impl Write for DailyFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.target.write_for(Local::now().date_naive(), buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for DailyFile {
    type Writer = DailyFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        DailyFileWriter { target: self }
    }
}
