use miette::Result;
use smtp::{SmtpBackend, SmtpServer};
use tokio::net::TcpListener;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, info_span, Instrument};

/// Accepts connections until `shutdown` fires, running each session on its
/// own task. Returns once every in-flight session has finished, which also
/// drops the last handle on `server`.
pub async fn serve<B: SmtpBackend>(
    listener: TcpListener,
    server: SmtpServer<B>,
    shutdown: CancellationToken,
) -> Result<()> {
    let tracker = TaskTracker::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (socket, remote) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "error accepting tcp connection");
                        continue;
                    }
                };

                let server = server.clone();
                tracker.spawn(
                    async move {
                        debug!("connection accepted");
                        match server.handle_client(socket, remote).await {
                            Ok(()) => debug!("connection closed"),
                            Err(e) => error!(error = %e, "error handling client"),
                        }
                    }
                    .instrument(info_span!("session", %remote)),
                );
            }
        }
    }

    tracker.close();
    info!(
        sessions = tracker.len(),
        "stopped accepting connections, waiting for sessions"
    );
    tracker.wait().await;
    Ok(())
}
