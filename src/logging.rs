//! Tracing subscriber setup and the daily log file sink.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Append-only log file that rolls over to `<prefix>_<YYYY-MM-DD>.log`
/// when the local date changes.
///
/// The sink owns its open file; nothing global is swapped at midnight.
#[derive(Debug)]
pub struct DailyFile {
    dir: PathBuf,
    prefix: String,
    current: Mutex<Option<(NaiveDate, File)>>,
}

impl DailyFile {
    pub fn new(dir: &Path, prefix: &str) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            current: Mutex::new(None),
        })
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}_{}.log", self.prefix, date.format("%Y-%m-%d")))
    }

    fn write_dated(&self, date: NaiveDate, buf: &[u8]) -> io::Result<usize> {
        let mut current = self.current.lock();
        let stale = current.as_ref().map_or(true, |(open, _)| *open != date);
        if stale {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path_for(date))?;
            *current = Some((date, file));
        }
        match current.as_mut() {
            Some((_, file)) => file.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "log file not open")),
        }
    }

    fn flush_current(&self) -> io::Result<()> {
        match self.current.lock().as_mut() {
            Some((_, file)) => file.flush(),
            None => Ok(()),
        }
    }
}

pub struct DailyWriter<'a> {
    sink: &'a DailyFile,
}

impl Write for DailyWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink.write_dated(Local::now().date_naive(), buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush_current()
    }
}

impl<'a> MakeWriter<'a> for DailyFile {
    type Writer = DailyWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        DailyWriter { sink: self }
    }
}

fn fmt_layer<W>(json: bool, ansi: bool, writer: W) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    if json {
        fmt::layer().json().with_writer(writer).boxed()
    } else {
        fmt::layer().with_ansi(ansi).with_writer(writer).boxed()
    }
}

fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// stderr honours `RUST_LOG`, falling back to the configured level. With a
/// `files` target, `<prefix>_<date>.log` receives the configured level and
/// `<prefix>_error_<date>.log` receives warnings and errors only.
pub fn init(cfg: &LoggingConfig, files: Option<(&Path, &str)>) -> Result<()> {
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter(&cfg.level));

    let mut layers: Vec<BoxedLayer> = vec![fmt_layer(cfg.json, true, io::stderr)
        .with_filter(stderr_filter)
        .boxed()];

    if let Some((dir, prefix)) = files.filter(|_| cfg.files) {
        let info_sink = DailyFile::new(dir, prefix)?;
        let error_sink = DailyFile::new(dir, &format!("{}_error", prefix))?;
        layers.push(
            fmt_layer(cfg.json, false, info_sink)
                .with_filter(level_filter(&cfg.level))
                .boxed(),
        );
        layers.push(
            fmt_layer(cfg.json, false, error_sink)
                .with_filter(LevelFilter::WARN)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .context("failed to install tracing subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_daily_file_rolls_over_on_date_change() {
        let dir = TempDir::new().unwrap();
        let sink = DailyFile::new(dir.path(), "detector").unwrap();
        let day1 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();

        sink.write_dated(day1, b"first\n").unwrap();
        sink.write_dated(day1, b"second\n").unwrap();
        sink.write_dated(day2, b"third\n").unwrap();
        sink.flush_current().unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("detector_2024-01-01.log")).unwrap(),
            "first\nsecond\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("detector_2024-01-02.log")).unwrap(),
            "third\n"
        );
    }

    #[test]
    fn test_reopening_same_day_appends() {
        let dir = TempDir::new().unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        DailyFile::new(dir.path(), "agg")
            .unwrap()
            .write_dated(day, b"a\n")
            .unwrap();
        DailyFile::new(dir.path(), "agg")
            .unwrap()
            .write_dated(day, b"b\n")
            .unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("agg_2024-03-05.log")).unwrap(),
            "a\nb\n"
        );
    }

    #[test]
    fn test_writer_uses_todays_file() {
        let dir = TempDir::new().unwrap();
        let sink = DailyFile::new(dir.path(), "ingest").unwrap();
        sink.make_writer().write_all(b"hello\n").unwrap();
        let today = sink.path_for(Local::now().date_naive());
        assert!(today.exists());
    }
}
