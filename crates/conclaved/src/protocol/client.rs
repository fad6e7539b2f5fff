//! CLI side of a session.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context as _, bail};

use conclave_common::constants::PROTOCOL_VERSION;
use conclave_common::{JoinIntent, ServerInfo, ServiceType, Session as SessionFrame};

use crate::certs::{Certificate, short_fingerprint};
use crate::gateway::Gateway;

/// Progress callbacks for an interactive front end. Every method
/// defaults to doing nothing.
pub trait SessionObserver: Send + Sync {
    /// The session passphrase is known
    fn passphrase(&self, _passphrase: &str) {}

    /// A system asked to join; `fingerprint` is its short fingerprint
    fn intent(&self, _intent: &JoinIntent, _fingerprint: &str) {}

    /// The joiner reached its initiator
    fn initiator(&self, _name: &str, _address: &str, _fingerprint: &str) {}

    /// The initiator confirmed this system
    fn confirmed(&self, _name: &str) {}
}

/// Observer that ignores everything
pub struct Quiet;

impl SessionObserver for Quiet {}

#[derive(Debug, Clone, Default)]
pub struct InitiatingOptions {
    pub address: String,
    pub interface: String,
    pub services: Vec<ServiceType>,
    /// Generated by the daemon when empty
    pub passphrase: String,
    /// Systems to wait for; when empty, everyone seen before the lookup
    /// timeout is taken
    pub expected: Vec<String>,
    pub lookup_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct JoiningOptions {
    pub address: String,
    pub interface: String,
    pub services: Vec<ServiceType>,
    pub passphrase: String,
    /// Skip multicast lookup and contact this initiator directly
    pub initiator_address: Option<String>,
    pub lookup_timeout: Duration,
}

/// Run the initiating side of a session and return every confirmed
/// system, with its certificate.
pub async fn initiating_session(
    gw: &Gateway,
    opts: &InitiatingOptions,
    observer: &dyn SessionObserver,
) -> anyhow::Result<BTreeMap<String, ServerInfo>> {
    gw.write(&SessionFrame {
        address: opts.address.clone(),
        interface: opts.interface.clone(),
        services: opts.services.clone(),
        passphrase: opts.passphrase.clone(),
        ..Default::default()
    })
    .await?;

    let reply: SessionFrame = gw.receive_as().await?;
    observer.passphrase(&reply.passphrase);

    let mut intents: BTreeMap<String, JoinIntent> = BTreeMap::new();
    let deadline = tokio::time::sleep(opts.lookup_timeout);
    tokio::pin!(deadline);

    loop {
        if !opts.expected.is_empty() && opts.expected.iter().all(|n| intents.contains_key(n)) {
            break;
        }

        let frame = tokio::select! {
            _ = &mut deadline => break,
            frame = gw.receive_as::<SessionFrame>() => frame?,
        };

        let Some(intent) = frame.intent else { continue };
        let cert = Certificate::from_pem(&intent.certificate)
            .with_context(|| format!("Invalid certificate of system {:?}", intent.name))?;
        observer.intent(&intent, cert.short_fingerprint());

        if !opts.expected.is_empty() && !opts.expected.contains(&intent.name) {
            tracing::warn!(peer = %intent.name, "Ignoring unexpected system");
            continue;
        }
        intents.insert(intent.name.clone(), intent);
    }

    for name in &opts.expected {
        if !intents.contains_key(name) {
            bail!("System {name:?} hasn't reached out");
        }
    }
    if intents.is_empty() {
        bail!("No system reached out before the lookup timeout");
    }

    gw.write(&SessionFrame {
        confirmed_intents: intents.values().cloned().collect(),
        ..Default::default()
    })
    .await?;

    let reply: SessionFrame = gw.receive_as().await?;
    if !reply.accepted {
        bail!("Join confirmations didn't get accepted on all systems");
    }

    let mut systems = BTreeMap::new();
    for (name, intent) in intents {
        let cert = Certificate::from_pem(&intent.certificate)
            .with_context(|| format!("Invalid certificate of system {name:?}"))?;
        systems.insert(
            name.clone(),
            ServerInfo {
                version: intent.version,
                name,
                address: intent.address,
                services: intent.services,
                certificate: Some(cert.pem().to_string()),
            },
        );
    }

    Ok(systems)
}

/// Run the joining side of a session. Returns the initiator once it has
/// confirmed this system and the session ended without error.
pub async fn joining_session(
    gw: &Gateway,
    opts: &JoiningOptions,
    observer: &dyn SessionObserver,
) -> anyhow::Result<ServerInfo> {
    gw.write(&SessionFrame {
        address: opts.address.clone(),
        interface: opts.interface.clone(),
        services: opts.services.clone(),
        passphrase: opts.passphrase.clone(),
        initiator_address: opts.initiator_address.clone().unwrap_or_default(),
        lookup_timeout_secs: opts.lookup_timeout.as_secs(),
        ..Default::default()
    })
    .await?;

    let reply: SessionFrame = gw.receive_as().await?;
    observer.initiator(
        &reply.initiator_name,
        &reply.initiator_address,
        short_fingerprint(&reply.initiator_fingerprint),
    );

    let confirmation: SessionFrame = gw.receive_as().await?;
    if let Some(intent) = &confirmation.intent {
        observer.confirmed(&intent.name);
    }

    let last: SessionFrame = gw.receive_as().await?;
    if !last.error.is_empty() {
        bail!("{}", last.error);
    }

    Ok(ServerInfo {
        version: PROTOCOL_VERSION.to_string(),
        name: reply.initiator_name,
        address: reply.initiator_address,
        services: Vec::new(),
        certificate: confirmation.intent.map(|i| i.certificate),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::tests::test_certificate;
    use crate::context::Context;
    use crate::gateway::tests::gateway_pair;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl SessionObserver for Recorder {
        fn passphrase(&self, passphrase: &str) {
            self.0.lock().unwrap().push(format!("passphrase {passphrase}"));
        }

        fn intent(&self, intent: &JoinIntent, _fingerprint: &str) {
            self.0.lock().unwrap().push(format!("intent {}", intent.name));
        }

        fn confirmed(&self, name: &str) {
            self.0.lock().unwrap().push(format!("confirmed {name}"));
        }
    }

    fn intent(name: &str) -> JoinIntent {
        JoinIntent {
            name: name.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            address: format!("10.0.0.{}:9443", name.len()),
            certificate: test_certificate(name).pem().to_string(),
            services: vec![ServiceType::Storage],
        }
    }

    #[tokio::test]
    async fn test_initiating_collects_expected_systems() {
        let ctx = Context::new();
        let (cli, daemon) = gateway_pair(&ctx).await;

        let fake_daemon = tokio::spawn(async move {
            let start: SessionFrame = daemon.receive_as().await.unwrap();
            assert_eq!(start.interface, "eth0");
            daemon
                .write(&SessionFrame {
                    passphrase: "acorn adobe agent alarm".to_string(),
                    ..Default::default()
                })
                .await
                .unwrap();
            for name in ["node2", "stranger", "node3"] {
                daemon
                    .write(&SessionFrame {
                        intent: Some(intent(name)),
                        ..Default::default()
                    })
                    .await
                    .unwrap();
            }

            let confirmed: SessionFrame = daemon.receive_as().await.unwrap();
            daemon
                .write(&SessionFrame {
                    accepted: true,
                    ..Default::default()
                })
                .await
                .unwrap();
            confirmed.confirmed_intents
        });

        let recorder = Recorder::default();
        let opts = InitiatingOptions {
            interface: "eth0".to_string(),
            expected: vec!["node2".to_string(), "node3".to_string()],
            lookup_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let systems = initiating_session(&cli, &opts, &recorder).await.unwrap();

        assert_eq!(systems.keys().collect::<Vec<_>>(), vec!["node2", "node3"]);
        assert!(systems["node2"].certificate.is_some());

        let confirmed = fake_daemon.await.unwrap();
        let names: Vec<_> = confirmed.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["node2", "node3"]);
        assert_eq!(
            recorder.0.lock().unwrap()[0],
            "passphrase acorn adobe agent alarm"
        );
    }

    #[tokio::test]
    async fn test_initiating_names_missing_system() {
        let ctx = Context::new();
        let (cli, daemon) = gateway_pair(&ctx).await;

        tokio::spawn(async move {
            let _: SessionFrame = daemon.receive_as().await.unwrap();
            daemon
                .write(&SessionFrame {
                    passphrase: "a b c d".to_string(),
                    ..Default::default()
                })
                .await
                .unwrap();
            daemon
                .write(&SessionFrame {
                    intent: Some(intent("node2")),
                    ..Default::default()
                })
                .await
                .unwrap();
            daemon.context().cancelled().await;
        });

        let opts = InitiatingOptions {
            expected: vec!["node2".to_string(), "node3".to_string()],
            lookup_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let err = initiating_session(&cli, &opts, &Quiet).await.unwrap_err();
        assert_eq!(err.to_string(), "System \"node3\" hasn't reached out");
    }

    #[tokio::test]
    async fn test_initiating_rejected_confirmation() {
        let ctx = Context::new();
        let (cli, daemon) = gateway_pair(&ctx).await;

        tokio::spawn(async move {
            let _: SessionFrame = daemon.receive_as().await.unwrap();
            daemon
                .write(&SessionFrame {
                    passphrase: "a b c d".to_string(),
                    ..Default::default()
                })
                .await
                .unwrap();
            daemon
                .write(&SessionFrame {
                    intent: Some(intent("node2")),
                    ..Default::default()
                })
                .await
                .unwrap();
            let _: SessionFrame = daemon.receive_as().await.unwrap();
            daemon.write(&SessionFrame::default()).await.unwrap();
            daemon.context().cancelled().await;
        });

        let opts = InitiatingOptions {
            lookup_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let err = initiating_session(&cli, &opts, &Quiet).await.unwrap_err();
        assert_eq!(err.to_string(), "Join confirmations didn't get accepted on all systems");
    }

    #[tokio::test]
    async fn test_joining_surfaces_final_error() {
        let ctx = Context::new();
        let (cli, daemon) = gateway_pair(&ctx).await;

        tokio::spawn(async move {
            let start: SessionFrame = daemon.receive_as().await.unwrap();
            assert_eq!(start.initiator_address, "10.0.0.1:9443");
            assert_eq!(start.lookup_timeout_secs, 30);

            let initiator = intent("node1");
            let fingerprint = Certificate::from_pem(&initiator.certificate)
                .unwrap()
                .fingerprint()
                .to_string();
            daemon
                .write(&SessionFrame {
                    initiator_name: "node1".to_string(),
                    initiator_address: "10.0.0.1:9443".to_string(),
                    initiator_fingerprint: fingerprint,
                    ..Default::default()
                })
                .await
                .unwrap();
            daemon
                .write(&SessionFrame {
                    intent: Some(initiator),
                    ..Default::default()
                })
                .await
                .unwrap();
            daemon
                .write(&SessionFrame {
                    error: "Timed out waiting for cluster member \"node2\" to appear".to_string(),
                    ..Default::default()
                })
                .await
                .unwrap();
            daemon.context().cancelled().await;
        });

        let recorder = Recorder::default();
        let opts = JoiningOptions {
            passphrase: "a b c d".to_string(),
            initiator_address: Some("10.0.0.1:9443".to_string()),
            lookup_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        let err = joining_session(&cli, &opts, &recorder).await.unwrap_err();

        assert_eq!(err.to_string(), "Timed out waiting for cluster member \"node2\" to appear");
        assert_eq!(*recorder.0.lock().unwrap(), vec!["confirmed node1"]);
    }

    #[tokio::test]
    async fn test_joining_reports_daemon_close() {
        let ctx = Context::new();
        let (cli, daemon) = gateway_pair(&ctx).await;

        tokio::spawn(async move {
            let _: SessionFrame = daemon.receive_as().await.unwrap();
            let _ = daemon.write_close("Wrong passphrase").await;
        });

        let opts = JoiningOptions {
            passphrase: "a b c d".to_string(),
            ..Default::default()
        };
        let err = joining_session(&cli, &opts, &Quiet).await.unwrap_err();
        assert_eq!(err.to_string(), "Wrong passphrase");
    }
}
