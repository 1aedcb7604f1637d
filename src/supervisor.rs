//! Long-running units and the loop that keeps them alive.
//!
//! Every data-path unit (scanner, tailers, sender, heartbeat) restarts itself
//! after a fixed delay when it fails. Only errors a unit declares fatal end
//! the process. Cancellation flows down a [`CancellationToken`] tree and the
//! [`Supervisor`] joins every unit it started before returning.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub type UnitError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait Service: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    fn name(&self) -> String;

    /// Run until `cancel` fires. `Ok` means the unit is done for good.
    async fn run(&mut self, cancel: &CancellationToken) -> Result<(), Self::Error>;

    /// Errors that must stop the process instead of restarting the unit
    fn is_fatal(_error: &Self::Error) -> bool {
        false
    }
}

/// Run `service`, restarting it `restart_delay` after every non-fatal failure
pub async fn keep_running<S: Service>(
    service: &mut S,
    restart_delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), S::Error> {
    loop {
        match service.run(cancel).await {
            Ok(()) => return Ok(()),
            Err(e) if S::is_fatal(&e) => {
                error!(unit = %service.name(), error = %e, "Unit failed fatally");
                return Err(e);
            }
            Err(e) => {
                error!(
                    unit = %service.name(),
                    error = %e,
                    restart_in = ?restart_delay,
                    "Unit failed, restarting"
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(restart_delay) => {}
        }
    }
}

/// Owns the top-level units of a run
pub struct Supervisor {
    cancel: CancellationToken,
    tasks: JoinSet<(String, Result<(), UnitError>)>,
}

impl Supervisor {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            tasks: JoinSet::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Start `service` under [`keep_running`]
    pub fn spawn<S>(&mut self, mut service: S, restart_delay: Duration)
    where
        S: Service + 'static,
    {
        let cancel = self.cancel.child_token();
        let name = service.name();
        info!(unit = %name, "Starting unit");

        self.tasks.spawn(async move {
            let result = keep_running(&mut service, restart_delay, &cancel)
                .await
                .map_err(|e| Box::new(e) as UnitError);
            (name, result)
        });
    }

    /// Wait for `shutdown` or for a unit to fail fatally, then cancel every
    /// unit and join them all. Returns the first fatal error, if any.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<(), UnitError>
    where
        F: Future<Output = ()>,
    {
        let mut failure = None;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = self.cancel.cancelled() => break,
                joined = self.tasks.join_next() => match joined {
                    Some(Ok((name, Ok(())))) => {
                        info!(unit = %name, "Unit finished");
                    }
                    Some(Ok((name, Err(e)))) => {
                        error!(unit = %name, error = %e, "Stopping all units");
                        failure = Some(e);
                        break;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Unit task panicked, stopping all units");
                        failure = Some(Box::new(e) as UnitError);
                        break;
                    }
                    None => break,
                },
            }
        }

        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => info!(unit = %name, "Unit stopped"),
                Ok((name, Err(e))) => {
                    error!(unit = %name, error = %e, "Unit failed during shutdown");
                    failure.get_or_insert(e);
                }
                Err(e) => error!(error = %e, "Unit task panicked during shutdown"),
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
