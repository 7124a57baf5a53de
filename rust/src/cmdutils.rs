//! Helpers for the processes which carry out child operations.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::io::{Read, Seek, SeekFrom};
use std::os::unix::process::CommandExt;
use std::process::Command;

/// At most this much of a failed child's stderr is shown.
const STDERR_TAIL_BYTES: u64 = 1024;

pub(crate) trait ChildCommandExt {
    /// Have the process receive SIGTERM if we die first.
    fn bind_to_parent(&mut self) -> &mut Self;

    /// Log the full command line.
    fn log_debug(&mut self) -> &mut Self;
}

impl ChildCommandExt for Command {
    #[allow(unsafe_code)]
    fn bind_to_parent(&mut self) -> &mut Self {
        // SAFETY: prctl() is async-signal-safe.
        unsafe {
            self.pre_exec(|| {
                nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGTERM)
                    .map_err(Into::into)
            })
        }
    }

    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {self:?}");
        self
    }
}

/// The end of what a child process wrote to stderr, for error messages.
/// Never fails; problems reading the file are logged and replaced by a
/// placeholder.
pub(crate) fn stderr_tail(mut f: std::fs::File) -> String {
    let len = match f.metadata() {
        Ok(m) => m.len(),
        Err(e) => {
            tracing::warn!("Reading child stderr: {e}");
            return "<no stderr>".into();
        }
    };
    let start = len.saturating_sub(STDERR_TAIL_BYTES);
    let mut buf = Vec::new();
    match f
        .seek(SeekFrom::Start(start))
        .and_then(|_| f.read_to_end(&mut buf))
    {
        Ok(_) => String::from_utf8_lossy(&buf).into_owned(),
        Err(e) => {
            tracing::warn!("Reading child stderr: {e}");
            "<no stderr>".into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn bound_child_runs() {
        let st = Command::new("true")
            .bind_to_parent()
            .log_debug()
            .status()
            .unwrap();
        assert!(st.success());
    }

    #[test]
    fn tail() {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(b"child failed\n").unwrap();
        similar_asserts::assert_eq!(stderr_tail(f), "child failed\n");

        let mut f = tempfile::tempfile().unwrap();
        f.write_all(b"bad\xc0utf8\n").unwrap();
        assert_eq!(stderr_tail(f), "bad\u{fffd}utf8\n");

        let mut f = tempfile::tempfile().unwrap();
        f.write_all(&[b'x'; 4096]).unwrap();
        f.write_all(b"end").unwrap();
        let t = stderr_tail(f);
        assert_eq!(t.len(), 1024);
        assert!(t.ends_with("xend"));
    }
}
