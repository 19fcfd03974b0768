///! Configuration loading and WebSocket endpoint derivation.
///!
///! Run with: `cargo test --test config_test`
use std::collections::HashMap;
use std::time::Duration;

use fanchat_client::ChatConfig;
use fanchat_client::config::ConfigError;
use reqwest::Url;

fn config_from(pairs: &[(&str, &str)]) -> Result<ChatConfig, ConfigError> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    ChatConfig::from_lookup(|key| vars.get(key).cloned())
}

#[test]
fn origin_is_required() {
    let err = config_from(&[]).unwrap_err();

    assert!(matches!(err, ConfigError::Missing("CHAT_ORIGIN")));
}

#[test]
fn invalid_url_names_the_variable() {
    let err = config_from(&[("CHAT_ORIGIN", "not a url")]).unwrap_err();

    assert!(matches!(err, ConfigError::InvalidUrl { var: "CHAT_ORIGIN", .. }));
}

#[test]
fn defaults_apply_when_only_origin_is_set() {
    let config = config_from(&[("CHAT_ORIGIN", "https://fans.test")]).unwrap();

    assert_eq!(config.heartbeat_outgoing, Duration::from_millis(4000));
    assert_eq!(config.heartbeat_incoming, Duration::from_millis(4000));
    assert_eq!(config.reconnect_delay, Duration::from_millis(5000));
    assert_eq!(config.connect_timeout, Duration::from_secs(10));
    assert_eq!(config.history_page_size, 30);
    assert_eq!(config.api_base_url, config.origin);
    assert_eq!(config.access_token, None);
}

#[test]
fn overrides_are_read_and_bad_numbers_fall_back() {
    let config = config_from(&[
        ("CHAT_ORIGIN", "https://fans.test"),
        ("CHAT_API_URL", "https://api.fans.test/v1/"),
        ("CHAT_HEARTBEAT_MS", "10000"),
        ("CHAT_RECONNECT_DELAY_MS", "250"),
        ("CHAT_CONNECT_TIMEOUT_MS", "soon"),
        ("CHAT_PAGE_SIZE", "50"),
        ("CHAT_ACCESS_TOKEN", "tok"),
    ])
    .unwrap();

    assert_eq!(config.api_base_url.as_str(), "https://api.fans.test/v1/");
    assert_eq!(config.heartbeat_outgoing, Duration::from_secs(10));
    assert_eq!(config.reconnect_delay, Duration::from_millis(250));
    assert_eq!(config.connect_timeout, Duration::from_secs(10));
    assert_eq!(config.history_page_size, 50);
    assert_eq!(config.access_token.as_deref(), Some("tok"));
}

#[test]
fn empty_token_counts_as_unset() {
    let config = config_from(&[("CHAT_ORIGIN", "https://fans.test"), ("CHAT_ACCESS_TOKEN", "")])
        .unwrap();

    assert_eq!(config.access_token, None);
}

#[test]
fn ws_endpoint_is_derived_from_origin() {
    let secure = ChatConfig::new(Url::parse("https://fans.test/app?x=1#top").unwrap());
    assert_eq!(secure.ws_endpoint().unwrap().as_str(), "wss://fans.test/ws-chat");

    let plain = ChatConfig::new(Url::parse("http://localhost:8080").unwrap());
    assert_eq!(
        plain.ws_endpoint().unwrap().as_str(),
        "ws://localhost:8080/ws-chat"
    );
}

#[test]
fn explicit_ws_url_wins() {
    let config = config_from(&[
        ("CHAT_ORIGIN", "https://fans.test"),
        ("CHAT_WS_URL", "wss://socket.fans.test/stomp"),
    ])
    .unwrap();

    assert_eq!(
        config.ws_endpoint().unwrap().as_str(),
        "wss://socket.fans.test/stomp"
    );
}

#[test]
fn non_http_origin_has_no_ws_endpoint() {
    let config = ChatConfig::new(Url::parse("ftp://fans.test").unwrap());

    assert!(matches!(
        config.ws_endpoint(),
        Err(ConfigError::UnsupportedScheme(scheme)) if scheme == "ftp"
    ));
}
