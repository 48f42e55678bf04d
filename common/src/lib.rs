/*
 * Copyright 2024 Oxide Computer Company
 */

use std::io::{IsTerminal, Read};
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use serde::Deserialize;
use slog::{o, Drain, Logger};

pub fn read_toml<P: AsRef<Path>, T>(n: P) -> Result<T>
where
    for<'de> T: Deserialize<'de>,
{
    let mut f = std::fs::File::open(n.as_ref())?;
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;
    Ok(toml::from_str(&buf)?)
}

pub fn make_log(name: &'static str) -> Logger {
    let filter_level = match std::env::var("RUNOMAT_DEBUG")
        .map(|v| v.to_ascii_lowercase())
        .as_deref()
    {
        Ok("yes") | Ok("1") | Ok("true") => slog::Level::Debug,
        _ => slog::Level::Info,
    };

    if std::io::stdout().is_terminal() {
        /*
         * Use a terminal-formatted logger for interactive processes.
         */
        let dec = slog_term::TermDecorator::new().stdout().build();
        let dr = Mutex::new(
            slog_term::FullFormat::new(dec).use_original_order().build(),
        )
        .filter_level(filter_level)
        .fuse();
        Logger::root(dr, o!("name" => name))
    } else {
        /*
         * Otherwise, emit bunyan-formatted records:
         */
        let dr = Mutex::new(
            slog_bunyan::with_name(name, std::io::stdout())
                .set_flush(true)
                .build(),
        )
        .filter_level(filter_level)
        .fuse();
        Logger::root(dr, o!())
    }
}

/**
 * A logger that discards everything.  Handy for tests and for library
 * consumers that have not set up logging of their own.
 */
pub fn discard_log() -> Logger {
    Logger::root(slog::Discard, o!())
}

pub async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/**
 * Guess at whether this is a log file based on the filename.  Try to handle
 * both regular ".log" files and log files that have been rotated using an
 * integer suffix, e.g., ".log.0".
 */
pub fn guess_is_log_path(filename: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\.log(\.[0-9]+)?$").unwrap())
        .is_match(filename)
}

pub fn guess_mime_type(filename: &str) -> String {
    if guess_is_log_path(filename) {
        /*
         * Treat any file that looks like it might be a log file as plain text.
         */
        "text/plain".to_string()
    } else if filename.ends_with(".sdf") || filename.ends_with(".sdf.gz") {
        /*
         * Structure-data files are common job outputs, but are not in the
         * usual MIME databases.
         */
        "chemical/x-mdl-sdfile".to_string()
    } else {
        new_mime_guess::from_path(std::path::PathBuf::from(filename))
            .first_or_octet_stream()
            .to_string()
    }
}

pub trait DurationExt {
    fn render(&self) -> String;
    fn as_secs_f32_rounded(&self) -> String;
}

impl DurationExt for std::time::Duration {
    fn render(&self) -> String {
        let mut out = String::new();
        let mut secs = self.as_secs();
        let hours = secs / 3600;
        if hours > 0 {
            secs -= hours * 3600;
            out += &format!(" {} h", hours);
        }
        let minutes = secs / 60;
        if minutes > 0 || hours > 0 {
            secs -= minutes * 60;
            out += &format!(" {} m", minutes);
        }
        out += &format!(" {} s", secs);

        out.trim().to_string()
    }

    fn as_secs_f32_rounded(&self) -> String {
        format!("{:.3}", self.as_secs_f32())
    }
}
