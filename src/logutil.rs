//! Logging helpers: single-line escaping of message content and the shared
//! `env_logger` setup used by the `meshmsg` binary.

use std::fmt::Write as _;
use std::io::Write as _;

use crate::config::LoggingConfig;

/// Byte budget for message content quoted in routine log lines.
pub const CONTENT_PREVIEW_BYTES: usize = 48;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Other control characters become `\xNN`. Very long strings are cut with an ellipsis.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 300;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Escaped, UTF-8 safe prefix of message content for debug logs.
pub fn content_preview(content: &str) -> String {
    truncate_for_log(content, CONTENT_PREVIEW_BYTES)
}

fn truncate_for_log(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return escape_log(input);
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = escape_log(&input[..cut]);
    out.push_str("...");
    out
}

fn level_from_config(level: &str) -> log::LevelFilter {
    match level.to_ascii_lowercase().as_str() {
        "off" => log::LevelFilter::Off,
        "error" => log::LevelFilter::Error,
        "warn" | "warning" => log::LevelFilter::Warn,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    }
}

/// Install the global logger. `-v` flags override the configured level; a configured
/// log file receives every line, and the console still does when attached to a TTY.
pub fn init_logging(config: &LoggingConfig, verbosity: u8) {
    let mut builder = env_logger::Builder::new();
    let level = match verbosity {
        0 => level_from_config(&config.level),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(level);

    let file = config.file.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| eprintln!("Cannot open log file {}: {}", path, e))
            .ok()
    });

    match file {
        Some(f) => {
            let file = std::sync::Mutex::new(f);
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = file.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_newlines_and_truncates() {
        let s = "Line1\nLine2\r\tEnd";
        let esc = escape_log(s);
        assert_eq!(esc, "Line1\\nLine2\\r\\tEnd");
    }

    #[test]
    fn preview_does_not_split_multibyte_chars() {
        // 45 ASCII bytes then a 3-byte em dash straddling the cut point
        let s = format!("{}\u{2014}tail", "a".repeat(45));
        let preview = content_preview(&s);
        assert!(preview.ends_with("..."));
        assert_eq!(preview, format!("{}...", "a".repeat(45)));
    }

    #[test]
    fn short_content_is_only_escaped() {
        assert_eq!(content_preview("hi\nthere"), "hi\\nthere");
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        assert_eq!(level_from_config("chatty"), log::LevelFilter::Info);
        assert_eq!(level_from_config("DEBUG"), log::LevelFilter::Debug);
    }
}
