/*
 * Progress output for operations fanned out over child images.
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use once_cell::sync::Lazy;
use std::sync::Mutex;

/// A bar counting finished children.
struct ChildProgress {
    bar: ProgressBar,
    // Progress goes to stderr, which may not be a tty; in that case we
    // print nothing at all.
    is_hidden: bool,
    // Repeated in the completion line, e.g. "Syncing children... done".
    message: String,
}

// Children are processed on a thread pool, but there is only one
// terminal; at most one bar is active.
static PROGRESS: Lazy<Mutex<Option<ChildProgress>>> = Lazy::new(|| Mutex::new(None));

impl ChildProgress {
    fn new(message: &str, n: u64) -> Self {
        let target = ProgressDrawTarget::stderr();
        let is_hidden = target.is_hidden();
        let bar = ProgressBar::with_draw_target(Some(n), target);
        let width = n_digits(n);
        let fmt = format!("{{prefix}} {{pos:>{width}}}/{{len:{width}}} [{{bar:20}}] {{msg}}");
        if let Ok(style) = ProgressStyle::with_template(&fmt) {
            bar.set_style(style);
        }
        bar.set_prefix(message.to_string());
        Self {
            bar,
            is_hidden,
            message: message.to_string(),
        }
    }

    fn finish(&self, suffix: Option<&str>) {
        self.bar.finish_and_clear();
        if !self.is_hidden {
            eprintln!("{}... {}", self.message, suffix.unwrap_or("done"));
        }
    }
}

/// Number of decimal digits in `n`.
fn n_digits(n: u64) -> usize {
    n.checked_ilog10().unwrap_or(0) as usize + 1
}

fn with_state(f: impl FnOnce(&mut Option<ChildProgress>)) {
    match PROGRESS.lock() {
        Ok(mut g) => f(&mut g),
        Err(e) => tracing::debug!("progress state poisoned: {e}"),
    }
}

/// Start a bar for `n` children, replacing any active one.
pub fn begin_n_items(msg: &str, n: u64) {
    with_state(|s| *s = Some(ChildProgress::new(msg, n)));
}

/// Show which child finished last.
pub fn set_sub_message(msg: &str) {
    with_state(|s| {
        if let Some(s) = s.as_ref() {
            s.bar.set_message(msg.to_string())
        }
    });
}

/// Count one more child as done.
pub fn inc() {
    with_state(|s| {
        if let Some(s) = s.as_ref() {
            s.bar.inc(1)
        }
    });
}

pub fn end(suffix: Option<&str>) {
    with_state(|s| {
        if let Some(s) = s.take() {
            s.finish(suffix)
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_n_digits() {
        assert_eq!(n_digits(0), 1);
        assert_eq!(n_digits(9), 1);
        assert_eq!(n_digits(10), 2);
        assert_eq!(n_digits(100), 3);
        assert_eq!(n_digits(123798), 6);
    }

    #[test]
    fn lifecycle() {
        begin_n_items("Syncing children", 2);
        set_sub_message("system:a");
        inc();
        inc();
        end(None);
        // Without an active bar these do nothing.
        inc();
        end(Some("failed"));
    }
}
