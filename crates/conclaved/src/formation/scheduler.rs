use std::future::Future;

use tokio::task::{JoinError, JoinSet};

use conclave_common::ServiceType;

/// Run `f` once per service.
///
/// `first` runs alone before everything else and `last` runs alone after
/// everything else; the remaining services run concurrently. Either ordered
/// slot is skipped when its service is not in `services`. The concurrent
/// batch is always awaited in full and its first error is returned.
pub async fn run_concurrent<F, Fut, E>(
    services: &[ServiceType],
    first: Option<ServiceType>,
    last: Option<ServiceType>,
    f: F,
) -> Result<(), E>
where
    F: Fn(ServiceType) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: From<JoinError> + Send + 'static,
{
    let first = first.filter(|s| services.contains(s));
    let last = last.filter(|s| services.contains(s) && Some(*s) != first);

    if let Some(service) = first {
        f(service).await?;
    }

    let mut set = JoinSet::new();
    for service in services {
        if Some(*service) == first || Some(*service) == last {
            continue;
        }
        set.spawn(f(*service));
    }

    let mut failure = None;
    while let Some(joined) = set.join_next().await {
        let result = joined.map_err(E::from).and_then(|r| r);
        if let Err(e) = result {
            failure.get_or_insert(e);
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }

    if let Some(service) = last {
        f(service).await?;
    }

    Ok(())
}
