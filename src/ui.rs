//! User-facing progress output.

use std::time::Instant;

/// A pipeline step announced on stderr, timed until [`Step::finish`].
pub struct Step {
    done: String,
    start: Instant,
}

impl Step {
    /// Print `‣ <text>...` and start timing.
    pub fn start(text: &str) -> Self {
        Self::with_done(text, &format!("{} complete", text))
    }

    /// Like [`Step::start`] but with a custom completion line.
    pub fn with_done(text: &str, done: &str) -> Self {
        eprintln!("‣ {}...", text);
        Self {
            done: done.to_string(),
            start: Instant::now(),
        }
    }

    /// Print the completion line and the elapsed time.
    pub fn finish(self) {
        let secs = self.start.elapsed().as_secs_f64();
        if secs >= 60.0 {
            eprintln!("‣ {}. [{:.1}m]", self.done, secs / 60.0);
        } else {
            eprintln!("‣ {}. [{:.1}s]", self.done, secs);
        }
    }
}

/// Print a one-off informational line.
pub fn info(text: &str) {
    eprintln!("‣ {}", text);
}

/// Render a byte count as `1.0G`, `12.5M`, `3.0K` or `17B`.
pub fn format_bytes(bytes: u64) -> String {
    const K: u64 = 1024;
    const M: u64 = K * 1024;
    const G: u64 = M * 1024;

    if bytes >= G {
        format!("{:.1}G", bytes as f64 / G as f64)
    } else if bytes >= M {
        format!("{:.1}M", bytes as f64 / M as f64)
    } else if bytes >= K {
        format!("{:.1}K", bytes as f64 / K as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(17), "17B");
        assert_eq!(format_bytes(3 * 1024), "3.0K");
        assert_eq!(format_bytes(12 * 1024 * 1024 + 512 * 1024), "12.5M");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.0G");
    }
}
