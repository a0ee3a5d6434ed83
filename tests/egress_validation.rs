//! Seed test 4 (spec §8): a splice target outside the configured egress
//! allow-lists is rejected with `ServiceNotReady`, checked at whichever
//! allow-list fails first.

use broker_proxy::dns::DnsResolver;
use broker_proxy::egress::{BrokerProxyValidator, EgressAllowLists};
use broker_proxy::error::ErrorKind;

#[tokio::test]
async fn disallowed_hostname_is_rejected_with_service_not_ready() {
    let lists = EgressAllowLists {
        allowed_host_names: vec!["broker-a.*".to_string()],
        allowed_ip_addresses: vec!["10.0.0.0/8".to_string()],
        allowed_target_ports: vec!["6650".to_string()],
    };
    let validator = BrokerProxyValidator::new(&lists).unwrap();
    let resolver = DnsResolver::from_system_config().unwrap();

    let err = validator
        .validate(&resolver, "broker-b.example", 6650)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ServiceNotReady);
}

#[tokio::test]
async fn disallowed_port_is_rejected_before_any_dns_lookup() {
    let lists = EgressAllowLists {
        allowed_host_names: vec!["*".to_string()],
        allowed_ip_addresses: vec!["0.0.0.0/0".to_string()],
        allowed_target_ports: vec!["6650".to_string()],
    };
    let validator = BrokerProxyValidator::new(&lists).unwrap();
    let resolver = DnsResolver::from_system_config().unwrap();

    let err = validator
        .validate(&resolver, "broker-a.example", 9999)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ServiceNotReady);
}
