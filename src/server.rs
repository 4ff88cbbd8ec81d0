use anyhow::Result;
use std::{sync::Arc, time::Duration};
use tokio::{
    net::TcpListener,
    sync::watch,
    task::{JoinError, JoinSet},
    time::sleep,
};
use tracing::{error, info};

use crate::config::GatewayConfig;
use crate::proxy::{Gateway, handle_connection};

/// Pause after a failed accept before trying again.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// WHOIS listener front-end.
///
/// [`serve`](Self::serve) runs the accept loop until [`stop`](Self::stop) is
/// called; `stop` then waits for every connection accepted so far to finish.
/// In-flight handlers are never cancelled, so a hung upstream delays shutdown.
pub struct WhoisServer {
    gateway: Arc<Gateway>,
    stop_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
}

impl WhoisServer {
    #[must_use]
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway: Arc::new(gateway),
            stop_tx: watch::Sender::new(false),
            done_tx: watch::Sender::new(false),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        Ok(Self::new(Gateway::from_config(config)?))
    }

    /// Accepts connections until stopped, handling each on its own task.
    ///
    /// Accept errors are logged and never end the loop. Once stopped, the
    /// listener is closed and all spawned handlers are awaited before the
    /// completion signal fires.
    pub async fn serve(&self, listener: TcpListener) {
        let mut stop = self.stop_tx.subscribe();
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                () = stopped(&mut stop) => break,

                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    log_handler_exit(joined);
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let gateway = Arc::clone(&self.gateway);
                        handlers.spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, &gateway).await {
                                error!(
                                    client_addr = %peer,
                                    error = %format!("{e:#}"),
                                    "Connection error"
                                );
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                        sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        info!(in_flight = handlers.len(), "Waiting for clients to finish");

        while let Some(joined) = handlers.join_next().await {
            log_handler_exit(joined);
        }

        self.done_tx.send_replace(true);
        info!("All clients finished");
    }

    /// Signals the accept loop to stop and waits until every accepted
    /// connection has been fully handled.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let mut done = self.done_tx.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }
}

/// Resolves once the stop flag is set. The `watch::Ref` is dropped here so the
/// accept loop future stays `Send`.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

fn log_handler_exit(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Connection handler panicked");
    }
}
