// ローカルネットワーク上の Beeclear を探す
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use regex::Regex;
use reqwest::StatusCode;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::net;
use tokio::time;

/// mDNSで引くホスト名
pub const LOCAL_HOSTNAME: &str = "beeclear.local";

/// Beeclear社のリダイレクトページ
pub const DISCOVERY_URL: &str = "http://beeclear.nl/mijnmeter/";

/// window.location.href = "http://10.0.0.22"
static REDIRECT_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""http://([^"/]+)"#).expect("valid regex"));

/// アドレス探索
#[derive(Clone, Debug)]
pub struct Discovery {
    local_hostname: Option<String>,
    discovery_url: Option<String>,
    timeout: Duration,
}

impl Default for Discovery {
    fn default() -> Self {
        Self {
            local_hostname: Some(LOCAL_HOSTNAME.to_owned()),
            discovery_url: Some(DISCOVERY_URL.to_owned()),
            timeout: Duration::from_secs(4),
        }
    }
}

impl Discovery {
    /// 探索先を指定する(Noneならその方法は使わない)
    pub fn new(local_hostname: Option<&str>, discovery_url: Option<&str>) -> Self {
        Self {
            local_hostname: local_hostname.map(str::to_owned),
            discovery_url: discovery_url.map(str::to_owned),
            ..Default::default()
        }
    }

    /// ローカルの名前解決、オンラインのリダイレクトページの順に試す
    /// どちらも失敗したらNone
    pub async fn resolve(&self, http: &reqwest::Client) -> Option<String> {
        if let Some(address) = self.lookup_local().await {
            tracing::debug!("found {} by local lookup", address);
            return Some(address);
        }
        if let Some(address) = self.lookup_online(http).await {
            tracing::debug!("found {} by online discovery", address);
            return Some(address);
        }
        None
    }

    async fn lookup_local(&self) -> Option<String> {
        let hostname = self.local_hostname.as_deref()?;
        match time::timeout(self.timeout, net::lookup_host((hostname, 80))).await {
            Ok(Ok(mut addrs)) => addrs.next().map(|addr| addr.ip().to_string()),
            Ok(Err(e)) => {
                tracing::trace!(r#"lookup "{}" failed: {}"#, hostname, e);
                None
            }
            Err(_) => {
                tracing::trace!(r#"lookup "{}" timed out"#, hostname);
                None
            }
        }
    }

    async fn lookup_online(&self, http: &reqwest::Client) -> Option<String> {
        let url = self.discovery_url.as_deref()?;
        let response = match http.get(url).timeout(self.timeout).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::trace!(r#"online discovery "{}" failed: {}"#, url, e);
                return None;
            }
        };
        if response.status() != StatusCode::OK {
            tracing::trace!("online discovery status {}", response.status());
            return None;
        }
        let body = response.text().await.ok()?;
        if body.contains("window.location.href") {
            extract_redirect_address(&body)
        } else {
            None
        }
    }
}

/// リダイレクト先のアドレスを取り出す
pub fn extract_redirect_address(body: &str) -> Option<String> {
    REDIRECT_ADDRESS
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_owned())
}

#[test]
fn test_extract_redirect_address() {
    let body = "<script language=\"javascript\"> window.location.href = \"http://10.0.0.22\" </script>\n";
    assert_eq!(extract_redirect_address(body).as_deref(), Some("10.0.0.22"));
    assert_eq!(extract_redirect_address("<html></html>"), None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    #[tokio::test]
    async fn test_online_discovery() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/mijnmeter/")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body(
                "<script language=\"javascript\"> window.location.href = \"http://10.0.0.22\" </script>\n",
            )
            .create_async()
            .await;

        let url = format!("{}/mijnmeter/", server.url());
        let discovery = Discovery::new(None, Some(&url));
        let address = discovery.resolve(&reqwest::Client::new()).await;

        assert_eq!(address.as_deref(), Some("10.0.0.22"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_online_discovery_not_found() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/mijnmeter/")
            .with_status(404)
            .create_async()
            .await;

        let url = format!("{}/mijnmeter/", server.url());
        let discovery = Discovery::new(None, Some(&url));
        assert_eq!(discovery.resolve(&reqwest::Client::new()).await, None);
    }

    #[tokio::test]
    async fn test_no_strategy() {
        let discovery = Discovery::new(None, None);
        assert_eq!(discovery.resolve(&reqwest::Client::new()).await, None);
    }
}
