//! Seed test 3 (spec §8): with `maxConcurrentLookupRequests = 1` and a
//! discovery provider that never replies, a second `Lookup` arriving while
//! the first is still in flight gets `Error(TooManyRequests, request_id=2)`
//! rather than queueing.

use std::sync::Arc;
use std::time::Duration;

use broker_proxy::auth::Principal;
use broker_proxy::authz::AllowAllAuthorizer;
use broker_proxy::discovery::NeverRespondingDiscovery;
use broker_proxy::error::ErrorKind;
use broker_proxy::lookup::{handle_lookup_family, LookupServices};
use broker_proxy::protocol::command::Command;
use tokio::sync::Semaphore;

fn clone_services(s: &LookupServices) -> LookupServices {
    LookupServices {
        semaphore: s.semaphore.clone(),
        discovery: s.discovery.clone(),
        authorizer: s.authorizer.clone(),
        require_authorization: s.require_authorization,
        advertised_service_url: s.advertised_service_url.clone(),
        lookup_request_timeout: s.lookup_request_timeout,
    }
}

#[tokio::test]
async fn second_lookup_is_rejected_while_the_only_permit_is_held() {
    let services = LookupServices {
        semaphore: Arc::new(Semaphore::new(1)),
        discovery: Arc::new(NeverRespondingDiscovery),
        authorizer: Arc::new(AllowAllAuthorizer),
        require_authorization: false,
        advertised_service_url: "pulsar://proxy.example:6650".to_string(),
        lookup_request_timeout: Duration::from_secs(30),
    };
    let principal = Principal("test-client".to_string());

    // The first lookup's discovery call never resolves, so it holds the
    // only permit for as long as the spawned task lives.
    let first_services = clone_services(&services);
    let first_principal = principal.clone();
    let first = tokio::spawn(async move {
        handle_lookup_family(
            &first_services,
            &first_principal,
            Command::Lookup {
                request_id: 1,
                topic: "persistent://t/n/topic-0".to_string(),
                authoritative: false,
            },
        )
        .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(services.semaphore.available_permits(), 0);

    let (reply, target) = handle_lookup_family(
        &services,
        &principal,
        Command::Lookup {
            request_id: 2,
            topic: "persistent://t/n/topic-1".to_string(),
            authoritative: false,
        },
    )
    .await;

    assert!(target.is_none());
    match reply {
        Command::Error {
            request_id, kind, ..
        } => {
            assert_eq!(request_id, Some(2));
            assert_eq!(kind, ErrorKind::TooManyRequests);
        }
        other => panic!("expected Error(TooManyRequests), got {other:?}"),
    }

    first.abort();
}
