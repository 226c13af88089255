//! Property-based tests for URL validation and backoff.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::Duration,
};

use offload_delivery::{
    retry::apply_jitter, url_guard::is_blocked, GuardConfig, RetryPolicy, UnsafeReason, UrlGuard,
};
use proptest::prelude::*;

fn private_v4() -> impl Strategy<Value = Ipv4Addr> {
    prop_oneof![
        any::<[u8; 3]>().prop_map(|[b, c, d]| Ipv4Addr::new(10, b, c, d)),
        any::<[u8; 3]>().prop_map(|[b, c, d]| Ipv4Addr::new(127, b, c, d)),
        (16u8..32, any::<[u8; 2]>()).prop_map(|(b, [c, d])| Ipv4Addr::new(172, b, c, d)),
        any::<[u8; 2]>().prop_map(|[c, d]| Ipv4Addr::new(192, 168, c, d)),
        any::<[u8; 2]>().prop_map(|[c, d]| Ipv4Addr::new(169, 254, c, d)),
        (64u8..128, any::<[u8; 2]>()).prop_map(|(b, [c, d])| Ipv4Addr::new(100, b, c, d)),
        any::<[u8; 3]>().prop_map(|[b, c, d]| Ipv4Addr::new(0, b, c, d)),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

proptest! {
    #[test]
    fn private_literals_are_refused(ip in private_v4()) {
        let rt = runtime();
        let url = format!("http://{ip}:8080/hook");

        let strict = rt.block_on(UrlGuard::new(GuardConfig::default()).check(&url));
        prop_assert_eq!(strict.unwrap_err(), UnsafeReason::PrivateAddress(IpAddr::V4(ip)));

        let relaxed = rt.block_on(
            UrlGuard::new(GuardConfig { allow_private: true, ..GuardConfig::default() }).check(&url),
        );
        prop_assert!(relaxed.is_ok());
    }

    #[test]
    fn mapped_ipv6_matches_ipv4_verdict(octets in any::<[u8; 4]>()) {
        let v4 = Ipv4Addr::from(octets);
        let mapped = IpAddr::V6(v4.to_ipv6_mapped());
        prop_assert_eq!(is_blocked(mapped), is_blocked(IpAddr::V4(v4)));
    }

    #[test]
    fn unique_local_ipv6_is_blocked(segments in any::<[u16; 7]>(), low in 0u16..0x200) {
        let ip = Ipv6Addr::new(
            0xfc00 | low,
            segments[0], segments[1], segments[2], segments[3], segments[4], segments[5], segments[6],
        );
        prop_assert!(is_blocked(IpAddr::V6(ip)));
    }

    #[test]
    fn other_schemes_are_refused(scheme in "(ftp|file|gopher|ws|javascript|data)") {
        let rt = runtime();
        let url = format!("{scheme}://example.com/x");
        let result = rt.block_on(UrlGuard::new(GuardConfig::default()).check(&url));
        prop_assert!(matches!(result, Err(UnsafeReason::BadScheme(_))), "{:?}", result);
    }

    #[test]
    fn overlong_urls_are_refused(extra in 1usize..500) {
        let rt = runtime();
        let url = format!("https://example.com/{}", "a".repeat(2048 + extra));
        let result = rt.block_on(UrlGuard::new(GuardConfig::default()).check(&url));
        prop_assert!(matches!(result, Err(UnsafeReason::TooLong { max: 2048, .. })), "{:?}", result);
    }

    #[test]
    fn jitter_stays_in_band(base_ms in 1u64..120_000, factor in 0.0f64..=1.0) {
        let base = Duration::from_millis(base_ms);
        let jittered = apply_jitter(base, factor).as_secs_f64();
        let spread = base.as_secs_f64() * factor;
        prop_assert!(jittered >= base.as_secs_f64() - spread - 1e-9);
        prop_assert!(jittered <= base.as_secs_f64() + spread + 1e-9);
    }

    #[test]
    fn default_schedule_strictly_increases(_seed in any::<u8>()) {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (1..policy.max_attempts).map(|n| policy.delay_for(n)).collect();
        prop_assert!(delays.windows(2).all(|w| w[0] < w[1]), "{:?}", delays);
        prop_assert!(delays.iter().all(|d| *d <= policy.max_delay));
    }
}
