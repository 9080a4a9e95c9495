//! Startup and shutdown hooks.
//!
//! Startup hooks run once, in registration order, before the first request
//! is accepted; the first failure aborts startup. Shutdown hooks run once,
//! in registration order, after the last request has drained; a failure is
//! logged and the remaining hooks still run.

use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info, warn};

use crate::error::{BoxError, Error};
use crate::handler::BoxFuture;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Startup,
    Shutdown,
}

/// Parses `"startup"` / `"shutdown"`.
impl FromStr for Phase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "startup"  => Ok(Self::Startup),
            "shutdown" => Ok(Self::Shutdown),
            _          => Err(()),
        }
    }
}

type Hook = Box<dyn Fn() -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

#[derive(Default)]
pub struct Lifecycle {
    startup: Vec<Hook>,
    shutdown: Vec<Hook>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F, Fut, E>(&mut self, phase: Phase, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let erased: Hook = Box::new(move || {
            let fut = hook();
            Box::pin(async move { fut.await.map_err(Into::<BoxError>::into) }) as BoxFuture<'static, Result<(), BoxError>>
        });
        match phase {
            Phase::Startup => self.startup.push(erased),
            Phase::Shutdown => self.shutdown.push(erased),
        }
    }

    /// Runs the startup hooks. Later calls are no-ops.
    pub async fn startup(&self) -> Result<(), Error> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for (index, hook) in self.startup.iter().enumerate() {
            if let Err(e) = hook().await {
                error!(hook = index, error = %e, "startup hook failed, aborting startup");
                return Err(Error::Startup(e));
            }
        }
        info!(hooks = self.startup.len(), "startup complete");
        Ok(())
    }

    /// Runs every shutdown hook, whatever the others do. Later calls are
    /// no-ops.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for (index, hook) in self.shutdown.iter().enumerate() {
            if let Err(e) = hook().await {
                warn!(hook = index, error = %e, "shutdown hook failed, continuing");
            }
        }
        info!(hooks = self.shutdown.len(), "shutdown complete");
    }
}
