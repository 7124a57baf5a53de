//! The per-invocation operation context.
//!
//! Everything an operation needs beyond the image itself (configuration,
//! how to reach children, cancellation state) is carried here and passed
//! explicitly; there is no process-global state.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::bootenv::{BootEnv, StaticBootEnv};
use crate::config::{ClientConfig, RunnerKind};
use crate::errors::LinkedError;
use crate::linked::child::{ChildRunner, ExecRunner, InlineRunner};
use anyhow::Result;
use nix::sys::signal::{SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A handle that can cancel an operation from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst)
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct OpContext {
    cancel: CancelToken,
    pub config: ClientConfig,
    pub bootenv: Arc<dyn BootEnv>,
    pub runner: Arc<dyn ChildRunner>,
    /// Show progress for child operations.
    pub progress: bool,
}

impl OpContext {
    pub fn new(config: ClientConfig) -> Self {
        let runner: Arc<dyn ChildRunner> = match config.runner {
            RunnerKind::Exec => Arc::new(ExecRunner::default()),
            RunnerKind::Inline => Arc::new(InlineRunner),
        };
        let bootenv = Arc::new(StaticBootEnv::new(config.be_roots.iter()));
        Self {
            cancel: CancelToken::default(),
            config,
            bootenv,
            runner,
            progress: false,
        }
    }

    /// A context for operating on a child image from within this one.
    /// Cancellation is shared.
    pub fn for_child(&self) -> Self {
        Self {
            progress: false,
            ..self.clone()
        }
    }

    pub fn canceler(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        tracing::debug!("Operation canceled");
        self.cancel.cancel()
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// Return an error if the operation has been canceled.
    pub fn check_canceled(&self) -> Result<()> {
        if self.is_canceled() {
            return Err(LinkedError::Canceled.into());
        }
        Ok(())
    }

    pub fn live_root(&self) -> &str {
        &self.config.live_root
    }
}

/// Route SIGINT, SIGTERM and SIGHUP to a dedicated thread which cancels
/// the operation; a second signal terminates the process.  This must be
/// called before any other threads are started so that they inherit the
/// blocked signal mask.
pub fn install_signal_handler(ctx: &OpContext) -> Result<()> {
    let mut set = SigSet::empty();
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
        set.add(sig);
    }
    set.thread_block()?;
    let cancel = ctx.canceler();
    std::thread::Builder::new()
        .name("signals".into())
        .spawn(move || loop {
            match set.wait() {
                Ok(sig) => {
                    if cancel.is_canceled() {
                        tracing::warn!("Received {sig} again; exiting");
                        std::process::exit(128 + sig as i32);
                    }
                    tracing::warn!("Received {sig}; canceling");
                    cancel.cancel();
                }
                Err(e) => {
                    tracing::warn!("Waiting for signals: {e}");
                    return;
                }
            }
        })?;
    Ok(())
}
