use std::future::Future;

use futures::future::{self, Either};
use tokio::signal::unix::{signal, SignalKind};

/// Signal which triggered the shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

/// Returns a future that completes when a shutdown event has been received.
/// Shutdown events: INT|TERM.
/// If the handlers can't be registered the future never completes.
pub async fn wait() -> Signal {
    let handlers = signal(SignalKind::interrupt())
        .and_then(|int| Ok((int, signal(SignalKind::terminate())?)));
    let (mut sig_int, mut sig_term) = match handlers {
        Ok(handlers) => handlers,
        Err(error) => {
            error!(%error, "Failed to register shutdown signal handlers");
            return future::pending().await;
        }
    };

    let signal = first_of(
        Box::pin(async move { sig_int.recv().await }),
        Box::pin(async move { sig_term.recv().await }),
    )
    .await;
    warn!(?signal, "Signalled");
    signal
}

/// Whichever of the two signal streams fires first.
async fn first_of<I, T>(interrupt: I, terminate: T) -> Signal
where
    I: Future<Output = Option<()>> + Unpin,
    T: Future<Output = Option<()>> + Unpin,
{
    match future::select(interrupt, terminate).await {
        Either::Left(_) => Signal::Interrupt,
        Either::Right(_) => Signal::Terminate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_signal_wins() {
        let signal = first_of(
            Box::pin(future::pending::<Option<()>>()),
            Box::pin(future::ready(Some(()))),
        )
        .await;
        assert_eq!(signal, Signal::Terminate);

        let signal = first_of(
            Box::pin(future::ready(Some(()))),
            Box::pin(future::pending::<Option<()>>()),
        )
        .await;
        assert_eq!(signal, Signal::Interrupt);
    }
}
