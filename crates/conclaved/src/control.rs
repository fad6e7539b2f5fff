//! Local control socket.
//!
//! The CLI opens a websocket to
//! `ws://<control_addr>/1.0/session/{initiating|joining}?timeout=<secs>`
//! and drives one session over it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};

use conclave_common::SessionRole;
use conclave_common::constants::timeouts;

use crate::context::Context;
use crate::gateway::Gateway;
use crate::handler::Handler;
use crate::protocol;

/// Accept control connections until shutdown
pub async fn serve(
    listener: TcpListener,
    handler: Arc<Handler>,
    default_timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        let (stream, addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.recv() => {
                tracing::info!("Control socket stopped");
                return Ok(());
            }
        };

        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, handler, default_timeout).await {
                tracing::warn!(peer = %addr, error = %e, "Control connection failed");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handler: Arc<Handler>,
    default_timeout: Duration,
) -> Result<()> {
    let mut requested = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        match parse_request(req.uri(), default_timeout) {
            Ok(parsed) => {
                requested = Some(parsed);
                Ok(resp)
            }
            Err(message) => {
                let mut err = ErrorResponse::new(Some(message));
                *err.status_mut() = StatusCode::BAD_REQUEST;
                Err(err)
            }
        }
    })
    .await?;

    let Some((role, timeout)) = requested else {
        anyhow::bail!("Handshake finished without a session request");
    };

    tracing::info!(peer = %addr, role = %role, timeout_secs = timeout.as_secs(), "🔌 Control session opened");

    let ctx = Context::new().with_timeout(timeout, "Session timeout exceeded");
    let gw = Gateway::new(&ctx, ws);
    protocol::handle_session(handler, role, timeout, gw).await;

    tracing::debug!(peer = %addr, "Control session closed");
    Ok(())
}

/// Role and lifetime requested by a control URI
fn parse_request(uri: &Uri, default_timeout: Duration) -> Result<(SessionRole, Duration), String> {
    let role = match uri.path() {
        "/1.0/session/initiating" => SessionRole::Initiating,
        "/1.0/session/joining" => SessionRole::Joining,
        other => return Err(format!("Unknown control endpoint {other:?}")),
    };

    let requested = uri
        .query()
        .and_then(|q| q.split('&').find_map(|pair| pair.strip_prefix("timeout=")));

    let timeout = match requested {
        None => default_timeout,
        Some(value) => match value.parse::<u64>() {
            Ok(0) => default_timeout,
            Ok(secs) if secs > timeouts::SESSION_MAX_SECS => {
                return Err(format!(
                    "Session timeout of {secs}s exceeds the maximum of {}s",
                    timeouts::SESSION_MAX_SECS
                ));
            }
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => return Err(format!("Invalid session timeout {value:?}")),
        },
    };

    Ok((role, timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::test_handler;
    use crate::services::ServiceRegistry;
    use conclave_common::Session;

    const DEFAULT: Duration = Duration::from_secs(600);

    #[test]
    fn test_parse_request() {
        let uri: Uri = "/1.0/session/joining?timeout=120".parse().unwrap();
        assert_eq!(
            parse_request(&uri, DEFAULT),
            Ok((SessionRole::Joining, Duration::from_secs(120)))
        );

        let uri: Uri = "/1.0/session/initiating".parse().unwrap();
        assert_eq!(parse_request(&uri, DEFAULT), Ok((SessionRole::Initiating, DEFAULT)));

        let uri: Uri = "/1.0/session/initiating?timeout=7200".parse().unwrap();
        assert_eq!(
            parse_request(&uri, DEFAULT),
            Err("Session timeout of 7200s exceeds the maximum of 3600s".to_string())
        );

        let uri: Uri = "/1.0/status".parse().unwrap();
        assert!(parse_request(&uri, DEFAULT).is_err());
    }

    #[tokio::test]
    async fn test_control_socket_starts_session() {
        let handler = Arc::new(test_handler("control", ServiceRegistry::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(serve(listener, handler.clone(), DEFAULT, shutdown_rx));

        let bad = tokio_tungstenite::connect_async(format!("ws://{addr}/1.0/session/nope")).await;
        assert!(bad.is_err());

        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/1.0/session/initiating?timeout=60"))
            .await
            .unwrap();
        let ctx = Context::new();
        let gw = Gateway::new(&ctx, ws);

        gw.write(&Session::default()).await.unwrap();
        let reply: Session = gw.receive_as().await.unwrap();
        assert_eq!(reply.passphrase.split(' ').count(), 4);
        assert!(handler.active_session().await);

        let _ = shutdown_tx.send(());
    }
}
