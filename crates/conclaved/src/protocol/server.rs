//! Daemon side of a session.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow, bail};
use tokio::task::JoinSet;

use conclave_common::constants::{PROTOCOL_VERSION, timeouts};
use conclave_common::{ServerInfo, Session as SessionFrame, SessionRole};

use crate::certs::Certificate;
use crate::discovery::Discovery;
use crate::gateway::Gateway;
use crate::handler::Handler;
use crate::services::{RemoteSystem, ServiceError};
use crate::session::format_passphrase;

/// Serve one session over `gw` until it ends. Any failure is sent to the
/// CLI as the close reason; the session is stopped either way.
pub async fn handle_session(handler: Arc<Handler>, role: SessionRole, timeout: Duration, gw: Arc<Gateway>) {
    let result = match role {
        SessionRole::Initiating => handle_initiating_session(&handler, timeout, &gw).await,
        SessionRole::Joining => handle_joining_session(&handler, timeout, &gw).await,
    };

    if let Err(e) = result {
        let cause = format!("{e:#}");
        tracing::error!(role = %role, error = %cause, "❌ Session failed");
        let _ = gw.write_close(cause).await;
    }

    // The session may already be gone, or belong to someone else if it never started
    if let Ok(session) = handler.session().await {
        if Arc::ptr_eq(session.gateway(), &gw) {
            let _ = handler.stop_session(None).await;
        }
    }
}

async fn handle_initiating_session(
    handler: &Arc<Handler>,
    timeout: Duration,
    gw: &Arc<Gateway>,
) -> anyhow::Result<()> {
    let start: SessionFrame = gw.receive_as().await?;
    let passphrase = if start.passphrase.is_empty() {
        None
    } else {
        Some(format_passphrase(&start.passphrase)?)
    };

    let session = handler
        .start_session(SessionRole::Initiating, passphrase, gw.clone(), timeout)
        .await?;
    session.set_address(&start.address).await;

    if start.interface.is_empty() {
        tracing::info!("No lookup interface given, multicast responder disabled");
    } else {
        let discovery = Arc::new(Discovery::new(&start.interface, handler.multicast_port));
        let intent = handler.join_intent(&start.address);
        let info = ServerInfo {
            version: PROTOCOL_VERSION.to_string(),
            name: intent.name,
            address: intent.address,
            services: intent.services,
            certificate: None,
        };
        discovery.respond(gw.context(), info).await?;
        session.set_responder(discovery).await;
    }

    let passphrase = session.passphrase().await;
    gw.write(&SessionFrame {
        passphrase: passphrase.clone(),
        ..Default::default()
    })
    .await?;

    let confirmed = loop {
        tokio::select! {
            intent = session.next_intent() => {
                let Some(intent) = intent else {
                    return Err(stopped(gw));
                };
                tracing::info!(peer = %intent.name, address = %intent.address, "📨 Forwarding join intent");
                gw.write(&SessionFrame {
                    intent: Some(intent),
                    ..Default::default()
                })
                .await?;
            }
            frame = gw.receive_as::<SessionFrame>() => break frame?.confirmed_intents,
        }
    };

    let ours = handler.join_intent(&session.address().await);
    let mut confirmations = JoinSet::new();
    for intent in confirmed {
        let cert = Certificate::from_pem(&intent.certificate)
            .with_context(|| format!("Invalid certificate of system {:?}", intent.name))?;
        let peer = RemoteSystem::new(&intent.name, &intent.address, &handler.tls, Some(&cert), &passphrase)?;
        session.allow(&intent.name, cert).await?;

        let ours = ours.clone();
        confirmations.spawn(async move {
            peer.session_join(&ours)
                .await
                .with_context(|| format!("Failed to confirm system {:?}", intent.name))
        });
    }

    while let Some(joined) = confirmations.join_next().await {
        joined??;
    }

    gw.write(&SessionFrame {
        accepted: true,
        ..Default::default()
    })
    .await?;

    // Serve trusted peers until the CLI hangs up or the session times out
    let cause = gw.context().done().await;
    tracing::debug!(cause = %cause, "Initiating session finished");
    Ok(())
}

async fn handle_joining_session(handler: &Arc<Handler>, timeout: Duration, gw: &Arc<Gateway>) -> anyhow::Result<()> {
    let start: SessionFrame = gw.receive_as().await?;
    let passphrase = format_passphrase(&start.passphrase)?;

    let session = handler
        .start_session(SessionRole::Joining, Some(passphrase.clone()), gw.clone(), timeout)
        .await?;
    session.set_address(&start.address).await;

    let initiator_address = if !start.initiator_address.is_empty() {
        start.initiator_address.clone()
    } else if !start.interface.is_empty() {
        let secs = match start.lookup_timeout_secs {
            0 => timeouts::LOOKUP_DEFAULT_SECS,
            secs => secs,
        };
        let ctx = gw
            .context()
            .with_timeout(Duration::from_secs(secs), "Lookup timeout exceeded");
        let discovery = Discovery::new(&start.interface, handler.multicast_port);
        discovery.lookup(&ctx, PROTOCOL_VERSION).await?.address
    } else {
        bail!("Either an initiator address or a lookup interface is required");
    };

    // Nothing to pin yet; the initiator's certificate is learned from this exchange
    let initiator = RemoteSystem::new(&initiator_address, &initiator_address, &handler.tls, None, &passphrase)?;
    let (reply, presented) = match initiator.session_join(&handler.join_intent(&start.address)).await {
        Ok(reply) => reply,
        Err(ServiceError::Status { status: 401, .. }) => bail!("Wrong passphrase"),
        Err(e) => return Err(e).context("Failed to send join intent"),
    };

    let initiator_cert =
        Certificate::from_pem(&reply.certificate).context("Invalid certificate of the initiator")?;
    if initiator_cert.fingerprint() != presented.fingerprint() {
        bail!("Certificate of initiator {:?} does not match its TLS connection", reply.name);
    }
    tracing::info!(
        initiator = %reply.name,
        address = %initiator_address,
        fingerprint = %initiator_cert.short_fingerprint(),
        "🔎 Reached initiator"
    );

    gw.write(&SessionFrame {
        initiator_name: reply.name.clone(),
        initiator_address: initiator_address.clone(),
        initiator_fingerprint: initiator_cert.fingerprint().to_string(),
        ..Default::default()
    })
    .await?;

    let intent = tokio::select! {
        intent = session.next_intent() => intent.ok_or_else(|| anyhow!("Exit waiting for join confirmation"))?,
        cause = gw.context().done() => return Err(cause.into()),
    };

    let cert = Certificate::from_pem(&intent.certificate)
        .with_context(|| format!("Invalid certificate of system {:?}", intent.name))?;
    if cert.fingerprint() != initiator_cert.fingerprint() {
        bail!("Join confirmation from {:?} does not match the initiator", intent.name);
    }
    session.allow(&intent.name, cert).await?;

    gw.write(&SessionFrame {
        intent: Some(intent),
        ..Default::default()
    })
    .await?;

    let exit = tokio::select! {
        cause = session.exited() => cause,
        cause = gw.context().done() => return Err(cause.into()),
    };

    gw.write(&SessionFrame {
        error: exit.map(|c| c.to_string()).unwrap_or_default(),
        ..Default::default()
    })
    .await?;

    Ok(())
}

/// Why the intent handoff closed under us
fn stopped(gw: &Gateway) -> anyhow::Error {
    match gw.context().cause() {
        Some(cause) => cause.into(),
        None => anyhow!("Session stopped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::tests::test_certificate;
    use crate::context::Context;
    use crate::gateway::GatewayError;
    use crate::gateway::tests::gateway_pair;
    use crate::handler::tests::test_handler;
    use crate::services::ServiceRegistry;
    use crate::tls::tests::{serve_tls, test_identity};
    use axum::{Json, Router, http::StatusCode, routing::post};
    use conclave_common::{ErrorResponse, JoinIntent};

    const TIMEOUT: Duration = Duration::from_secs(600);

    async fn expect_close(gw: &Gateway) -> String {
        match gw.receive_as::<SessionFrame>().await {
            Err(GatewayError::Closed(cause)) => cause.to_string(),
            other => panic!("expected a close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_initiator_forwards_intents() {
        let handler = Arc::new(test_handler("proto-initiator", ServiceRegistry::default()));
        let ctx = Context::new();
        let (server, client) = gateway_pair(&ctx).await;
        let task = tokio::spawn(handle_session(handler.clone(), SessionRole::Initiating, TIMEOUT, server));

        client
            .write(&SessionFrame {
                passphrase: "acorn  adobe agent alarm".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let reply: SessionFrame = client.receive_as().await.unwrap();
        assert_eq!(reply.passphrase, "acorn adobe agent alarm");

        let session = handler.session().await.unwrap();
        let intent = JoinIntent {
            name: "node2".to_string(),
            version: PROTOCOL_VERSION.to_string(),
            address: "10.0.0.2:9443".to_string(),
            certificate: test_certificate("node2").pem().to_string(),
            services: vec![],
        };
        let publisher = {
            let session = session.clone();
            let intent = intent.clone();
            tokio::spawn(async move { session.publish_intent(intent, Duration::from_secs(5)).await })
        };

        let forwarded: SessionFrame = client.receive_as().await.unwrap();
        assert_eq!(forwarded.intent, Some(intent));
        publisher.await.unwrap().unwrap();

        // Confirm nobody
        client.write(&SessionFrame::default()).await.unwrap();
        let accepted: SessionFrame = client.receive_as().await.unwrap();
        assert!(accepted.accepted);

        client.context().cancel("CLI done");
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(!handler.active_session().await);
        assert!(session.is_stopped().await);
    }

    #[tokio::test]
    async fn test_joiner_reports_wrong_passphrase() {
        let app = Router::new().route(
            "/1.0/session/join",
            post(|| async {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(ErrorResponse {
                        error: "Trust error: Invalid HMAC".to_string(),
                    }),
                )
            }),
        );
        let (_, identity) = test_identity("proto-wrong-passphrase");
        let addr = serve_tls(app, &identity).await;

        let handler = Arc::new(test_handler("proto-joiner", ServiceRegistry::default()));
        let ctx = Context::new();
        let (server, client) = gateway_pair(&ctx).await;
        let task = tokio::spawn(handle_session(handler.clone(), SessionRole::Joining, TIMEOUT, server));

        client
            .write(&SessionFrame {
                passphrase: "acorn adobe agent alarm".to_string(),
                initiator_address: addr,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(expect_close(&client).await, "Wrong passphrase");
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(!handler.active_session().await);
    }

    #[tokio::test]
    async fn test_joiner_rejects_initiator_claiming_other_certificate() {
        // Answers with another system's certificate than the one it serves
        let claimed = test_certificate("node1").pem().to_string();
        let app = Router::new().route(
            "/1.0/session/join",
            post(move || {
                let certificate = claimed.clone();
                async move {
                    Json(JoinIntent {
                        name: "node1".to_string(),
                        version: PROTOCOL_VERSION.to_string(),
                        address: "10.0.0.1:9443".to_string(),
                        certificate,
                        services: vec![],
                    })
                }
            }),
        );
        let (_, identity) = test_identity("proto-impostor");
        let addr = serve_tls(app, &identity).await;

        let handler = Arc::new(test_handler("proto-misled", ServiceRegistry::default()));
        let ctx = Context::new();
        let (server, client) = gateway_pair(&ctx).await;
        let task = tokio::spawn(handle_session(handler.clone(), SessionRole::Joining, TIMEOUT, server));

        client
            .write(&SessionFrame {
                passphrase: "acorn adobe agent alarm".to_string(),
                initiator_address: addr,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(
            expect_close(&client).await,
            "Certificate of initiator \"node1\" does not match its TLS connection"
        );
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(!handler.active_session().await);
    }

    #[tokio::test]
    async fn test_joiner_needs_a_way_to_the_initiator() {
        let handler = Arc::new(test_handler("proto-nowhere", ServiceRegistry::default()));
        let ctx = Context::new();
        let (server, client) = gateway_pair(&ctx).await;
        tokio::spawn(handle_session(handler, SessionRole::Joining, TIMEOUT, server));

        client
            .write(&SessionFrame {
                passphrase: "acorn adobe agent alarm".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(
            expect_close(&client).await,
            "Either an initiator address or a lookup interface is required"
        );
    }

    #[tokio::test]
    async fn test_second_session_is_refused() {
        let handler = Arc::new(test_handler("proto-busy", ServiceRegistry::default()));
        let ctx = Context::new();
        let (first, first_client) = gateway_pair(&ctx).await;
        let (second, second_client) = gateway_pair(&ctx).await;

        tokio::spawn(handle_session(handler.clone(), SessionRole::Initiating, TIMEOUT, first));
        first_client.write(&SessionFrame::default()).await.unwrap();
        let _: SessionFrame = first_client.receive_as().await.unwrap();

        tokio::spawn(handle_session(handler.clone(), SessionRole::Initiating, TIMEOUT, second));
        second_client.write(&SessionFrame::default()).await.unwrap();
        assert_eq!(expect_close(&second_client).await, "There already is an active session");

        // The refused attempt leaves the running session alone
        assert!(handler.active_session().await);
    }
}
