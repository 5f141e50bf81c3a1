//! Built-in SPKI Pins for Known DoH Providers
//!
//! Maps a DoH endpoint hostname to the base64-encoded SHA-256 hash of its
//! subject-public-key-info. An endpoint not listed here is validated against
//! the bundled root store instead of a pin.

/// `(provider hostname, base64(SHA-256(SPKI)))`
pub const DOH_PROVIDER_PINS: &[(&str, &str)] = &[
    ("dns.google", "f7eIFfWjlrYrl9JNAl5DI9TrcawOLDzQo0NxH0pVvUY="),
    ("dns.google.com", "f7eIFfWjlrYrl9JNAl5DI9TrcawOLDzQo0NxH0pVvUY="),
    ("cloudflare-dns.com", "GP8Knf7qBae+aIfythytMbYnL+yowaWVeD6MoLHkVRg="),
    ("one.one.one.one", "GP8Knf7qBae+aIfythytMbYnL+yowaWVeD6MoLHkVRg="),
    ("dns.quad9.net", "/SlsviBkb05Y/8XiKF9+CZsgCtrqPQk5bh47o0R3/Cg="),
    ("dns.adguard-dns.com", "ZfSSP1eUv4O8Dtm0mDWDIVwJDyBPDQXBxGjAhhAn45w="),
    ("doh.mullvad.net", "A5zNyMGpqQV1cMsiFy7KsAdruAu3qEaGRDt8M3MqDfc="),
];

/// Look up the pin for a DoH endpoint hostname, if one is built in
pub fn pin_for_host(host: &str) -> Option<&'static str> {
    DOH_PROVIDER_PINS
        .iter()
        .find(|(provider, _)| provider.eq_ignore_ascii_case(host))
        .map(|(_, pin)| *pin)
}
