//! Value types carried by profile configuration messages.

use serde::{Deserialize, Serialize};

/// Kind of proxy server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    /// No proxy; a direct connection is attempted.
    Direct,
    Http,
    Socks4,
    Socks5,
    Https,
}

/// One entry of a proxy list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyServer {
    pub kind: ProxyType,
    pub host: String,
    pub port: u16,
}

/// Proxy configuration of a profile.
///
/// A PAC url, when set and loadable, overrides the manual lists. Manual lists
/// are tried in order per url scheme, with `fallback` covering every other
/// scheme. The default value means "always connect directly".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pac_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http: Vec<ProxyServer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub https: Vec<ProxyServer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ftp: Vec<ProxyServer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback: Vec<ProxyServer>,
    /// Host patterns that bypass the proxy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bypass_rules: Vec<String>,
}

impl ProxyConfig {
    pub fn with_pac_url(mut self, url: impl Into<String>) -> Self {
        self.pac_url = Some(url.into());
        self
    }

    pub fn with_http_proxy(mut self, kind: ProxyType, host: impl Into<String>, port: u16) -> Self {
        self.http.push(ProxyServer {
            kind,
            host: host.into(),
            port,
        });
        self
    }

    pub fn with_https_proxy(mut self, kind: ProxyType, host: impl Into<String>, port: u16) -> Self {
        self.https.push(ProxyServer {
            kind,
            host: host.into(),
            port,
        });
        self
    }

    pub fn with_ftp_proxy(mut self, kind: ProxyType, host: impl Into<String>, port: u16) -> Self {
        self.ftp.push(ProxyServer {
            kind,
            host: host.into(),
            port,
        });
        self
    }

    pub fn with_fallback_proxy(
        mut self,
        kind: ProxyType,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        self.fallback.push(ProxyServer {
            kind,
            host: host.into(),
            port,
        });
        self
    }

    pub fn with_bypass_rule(mut self, rule: impl Into<String>) -> Self {
        self.bypass_rules.push(rule.into());
        self
    }

    /// Whether every connection goes out directly.
    pub fn is_direct(&self) -> bool {
        self.pac_url.is_none()
            && [&self.http, &self.https, &self.ftp, &self.fallback]
                .iter()
                .all(|list| list.iter().all(|p| p.kind == ProxyType::Direct))
    }
}

/// Spellcheck settings of a profile.
///
/// Languages have no effect while spellchecking is disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpellCheckConfig {
    pub enabled: bool,
    #[serde(default)]
    pub languages: Vec<String>,
}

impl SpellCheckConfig {
    pub fn enabled(languages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            enabled: true,
            languages: languages.into_iter().map(Into::into).collect(),
        }
    }
}
