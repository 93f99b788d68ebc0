use serde::{Deserialize, Serialize};

use crate::AccountType;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DuetConfig {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub media: MediaConfig,
    /// Identity handed over by the sign-in provider. Absent means guest.
    #[serde(default)]
    pub account: Option<AccountConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Matchmaking relay WebSocket URL
    #[serde(default = "default_relay_url")]
    pub url: String,
    /// PEM certificate to pin for `wss://` relays (system roots otherwise)
    pub tls_cert: Option<String>,
    /// Largest relay message accepted, in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// ICE/TURN server configuration for WebRTC NAT traversal.
///
/// One discovery (STUN) server and one relay (TURN) server with static
/// shared credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds a match may stay in negotiation before it is abandoned (0 = never)
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_secs: u64,
    /// First delay after a failed relay reconnect
    #[serde(default = "default_initial_backoff")]
    pub reconnect_initial_backoff_ms: u64,
    /// Upper bound for the doubling reconnect delay
    #[serde(default = "default_max_backoff")]
    pub reconnect_max_backoff_ms: u64,
    /// Join the queue as soon as the relay acknowledges our identity
    #[serde(default)]
    pub auto_join: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// When false, every capture request is denied
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub audio: bool,
    #[serde(default = "default_true")]
    pub video: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub display_identity: String,
    #[serde(default)]
    pub account_type: AccountType,
    pub email: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            tls_cert: None,
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_secs: default_negotiation_timeout(),
            reconnect_initial_backoff_ms: default_initial_backoff(),
            reconnect_max_backoff_ms: default_max_backoff(),
            auto_join: false,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            audio: true,
            video: true,
        }
    }
}

impl DuetConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the client should not start)
    /// or "WARNING:" (advisory).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- Relay URL ---
        if !self.relay.url.starts_with("ws://") && !self.relay.url.starts_with("wss://") {
            issues.push(format!(
                "ERROR: relay.url '{}' must start with 'ws://' or 'wss://'.",
                self.relay.url
            ));
        }
        if self.relay.tls_cert.is_some() && self.relay.url.starts_with("ws://") {
            issues.push(
                "WARNING: relay.tls_cert is set but relay.url is plain ws://, the certificate is unused."
                    .to_string(),
            );
        }
        if self.relay.max_message_size < 1024 {
            issues.push(format!(
                "ERROR: relay.max_message_size must be at least 1024 bytes, got {}. \
                 SDP payloads alone are several kilobytes.",
                self.relay.max_message_size
            ));
        }

        // --- STUN URLs ---
        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }

        // --- TURN URLs ---
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'. \
                     Example: turn:turn.example.com:3478",
                    url
                ));
            }
        }
        if !self.ice.turn_urls.is_empty()
            && (self.ice.turn_username.is_none() || self.ice.turn_credential.is_none())
        {
            issues.push(
                "ERROR: ice.turn_urls is set but turn_username/turn_credential are missing. \
                 TURN relays require the static shared credentials."
                    .to_string(),
            );
        }
        if self.ice.stun_urls.is_empty() && self.ice.turn_urls.is_empty() {
            issues.push(
                "WARNING: no STUN or TURN servers configured, only host candidates will be gathered."
                    .to_string(),
            );
        }

        // --- Reconnect backoff ---
        if self.session.reconnect_max_backoff_ms == 0 {
            issues.push("ERROR: session.reconnect_max_backoff_ms must be >= 1.".to_string());
        }
        if self.session.reconnect_initial_backoff_ms > self.session.reconnect_max_backoff_ms {
            issues.push(format!(
                "WARNING: session.reconnect_initial_backoff_ms ({}) exceeds reconnect_max_backoff_ms ({}), \
                 every retry will wait the maximum.",
                self.session.reconnect_initial_backoff_ms, self.session.reconnect_max_backoff_ms
            ));
        }

        // --- Media ---
        if self.media.enabled && !self.media.audio && !self.media.video {
            issues.push(
                "ERROR: media.audio and media.video are both false. Disable media.enabled instead."
                    .to_string(),
            );
        }

        // --- Account ---
        if let Some(account) = &self.account {
            if account.display_identity.trim().is_empty() {
                issues.push("ERROR: account.display_identity must not be empty.".to_string());
            }
            if account.account_type == AccountType::Member && account.email.is_none() {
                issues.push(
                    "WARNING: account.account_type is 'member' but no account.email is set."
                        .to_string(),
                );
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_relay_url() -> String {
    "ws://localhost:4000/ws".to_string()
}
fn default_max_message_size() -> usize {
    65_536
}
fn default_negotiation_timeout() -> u64 {
    30
}
fn default_initial_backoff() -> u64 {
    2_000
}
fn default_max_backoff() -> u64 {
    60_000
}
fn default_true() -> bool {
    true
}
fn default_stun_urls() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_error(issues: &[String], needle: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("ERROR:") && i.contains(needle))
    }

    fn has_warning(issues: &[String], needle: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("WARNING:") && i.contains(needle))
    }

    #[test]
    fn default_config_from_empty_string() {
        let config: DuetConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert_eq!(config.relay.url, "ws://localhost:4000/ws");
        assert!(config.relay.tls_cert.is_none());
        assert_eq!(config.relay.max_message_size, 65_536);

        assert_eq!(config.ice.stun_urls, vec!["stun:stun.l.google.com:19302"]);
        assert!(config.ice.turn_urls.is_empty());
        assert!(config.ice.turn_username.is_none());

        assert_eq!(config.session.negotiation_timeout_secs, 30);
        assert_eq!(config.session.reconnect_initial_backoff_ms, 2_000);
        assert_eq!(config.session.reconnect_max_backoff_ms, 60_000);
        assert!(!config.session.auto_join);

        assert!(config.media.enabled);
        assert!(config.media.audio);
        assert!(config.media.video);

        assert!(config.account.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config: DuetConfig = toml::from_str(
            r#"
            [relay]
            url = "wss://relay.example.com/ws"

            [session]
            auto_join = true
            "#,
        )
        .unwrap();
        assert_eq!(config.relay.url, "wss://relay.example.com/ws");
        assert_eq!(config.relay.max_message_size, 65_536);
        assert!(config.session.auto_join);
        assert_eq!(config.session.negotiation_timeout_secs, 30);
    }

    #[test]
    fn member_account_section() {
        let config: DuetConfig = toml::from_str(
            r#"
            [account]
            display_identity = "ada@example.com"
            account_type = "member"
            email = "ada@example.com"
            "#,
        )
        .unwrap();
        let account = config.account.as_ref().unwrap();
        assert_eq!(account.account_type, AccountType::Member);
        assert_eq!(account.email.as_deref(), Some("ada@example.com"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn account_type_defaults_to_guest() {
        let config: DuetConfig = toml::from_str(
            r#"
            [account]
            display_identity = "Eevee"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.account.unwrap().account_type,
            AccountType::Guest
        );
    }

    #[test]
    fn validate_rejects_http_relay_url() {
        let mut config = DuetConfig::default();
        config.relay.url = "http://localhost:4000".to_string();
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues, "relay.url"));
    }

    #[test]
    fn validate_turn_requires_credentials() {
        let mut config = DuetConfig::default();
        config.ice.turn_urls = vec!["turn:turn.example.com:3478".to_string()];
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues, "turn_username"));

        config.ice.turn_username = Some("turnuser".to_string());
        config.ice.turn_credential = Some("turnpass".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_bad_ice_schemes() {
        let mut config = DuetConfig::default();
        config.ice.stun_urls = vec!["turn:wrong.example.com".to_string()];
        config.ice.turn_urls = vec!["stun:wrong.example.com".to_string()];
        config.ice.turn_username = Some("u".to_string());
        config.ice.turn_credential = Some("p".to_string());
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues, "STUN URL"));
        assert!(has_error(&issues, "TURN URL"));
    }

    #[test]
    fn validate_no_ice_servers_is_warning_only() {
        let mut config = DuetConfig::default();
        config.ice.stun_urls.clear();
        let issues = config.validate().unwrap_err();
        assert!(has_warning(&issues, "host candidates"));
        assert!(!issues.iter().any(|i| i.starts_with("ERROR:")));
    }

    #[test]
    fn validate_backoff_bounds() {
        let mut config = DuetConfig::default();
        config.session.reconnect_max_backoff_ms = 0;
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues, "reconnect_max_backoff_ms"));

        let mut config = DuetConfig::default();
        config.session.reconnect_initial_backoff_ms = 120_000;
        let issues = config.validate().unwrap_err();
        assert!(has_warning(&issues, "exceeds"));
    }

    #[test]
    fn validate_media_needs_a_kind() {
        let mut config = DuetConfig::default();
        config.media.audio = false;
        config.media.video = false;
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues, "media.audio"));

        // Disabled capture is a valid way to model a denied prompt
        config.media.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_member_without_email_warns() {
        let mut config = DuetConfig::default();
        config.account = Some(AccountConfig {
            display_identity: "ada".to_string(),
            account_type: AccountType::Member,
            email: None,
        });
        let issues = config.validate().unwrap_err();
        assert!(has_warning(&issues, "account.email"));
    }

    #[test]
    fn validate_empty_display_identity() {
        let mut config = DuetConfig::default();
        config.account = Some(AccountConfig {
            display_identity: "   ".to_string(),
            account_type: AccountType::Guest,
            email: None,
        });
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues, "display_identity"));
    }
}
