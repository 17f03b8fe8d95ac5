//! HTTP and Unix-socket serving of the API router.

use std::path::Path;

use axum::Router;
use tokio::sync::broadcast;

/// Serve `router` on a bound TCP listener until `shutdown` fires.
pub async fn serve_http(
    listener: tokio::net::TcpListener,
    router: Router,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
}

/// Serve `router` on a Unix socket (behind a reverse proxy) until `shutdown` fires.
pub async fn serve_unix(
    sock_path: &Path,
    router: Router,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    use hyper_util::rt::TokioIo;
    use tower::Service;

    let _ = std::fs::remove_file(sock_path);
    if let Some(parent) = sock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = tokio::net::UnixListener::bind(sock_path)?;
    tracing::info!(path = %sock_path.display(), "listening (Unix socket)");

    loop {
        tokio::select! {
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let router = router.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = hyper::service::service_fn(move |req| {
                                let mut router = router.clone();
                                async move { router.call(req).await }
                            });
                            if let Err(e) = hyper_util::server::conn::auto::Builder::new(
                                hyper_util::rt::TokioExecutor::new(),
                            )
                            .serve_connection(io, service)
                            .await
                            {
                                tracing::error!("connection error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                    }
                }
            }
            _ = shutdown.recv() => {
                break;
            }
        }
    }

    let _ = std::fs::remove_file(sock_path);
    Ok(())
}
