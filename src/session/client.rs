// Beeclear P1 とのセッション
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::connection_settings::{SessionConfig, SessionOptions};
use crate::meter::{RawSample, ShortReading};
use crate::session::{
    Discovery, DeviceStatus, FirmwareList, NetworkInfo, SessionError, SoftwareVersion,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use reqwest::header::{
    CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HeaderMap, SET_COOKIE,
    USER_AGENT,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;

const LOGIN_PATH: &str = "/bc_login";
const LOGOUT_PATH: &str = "/bc_logout";
const REBOOT_PATH: &str = "/bc_reboot";
const READINGS_PATH: &str = "/bc_current";
const NETWORK_PATH: &str = "/bc_getNetwork";
const STATUS_PATH: &str = "/bc_status";
const SOFTWARE_VERSION_PATH: &str = "/bc_softwareVersion";
const FIRMWARE_LIST_PATH: &str = "/bc_firmware?type=list";

const USER_AGENT_VALUE: &str = "beeclearp1-rs";

/// 最後の応答
#[derive(Clone, PartialEq, Debug)]
pub enum LastResponse {
    Body(String),
    Status(u16),
    Error(String),
}

/// 認証状態
#[derive(Clone, PartialEq, Debug, Default)]
pub struct SessionState {
    pub cookie: Option<String>,
    pub logged_in: bool,
    pub last_response: Option<LastResponse>,
}

#[derive(Debug)]
struct Inner {
    config: SessionConfig,
    state: SessionState,
}

/// Beeclear P1 とのセッション
///
/// クッキーを共有するので、要求は1つずつ直列に処理する。
#[derive(Debug)]
pub struct Session {
    http: reqwest::Client,
    discovery: Discovery,
    inner: Mutex<Inner>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        // 機器は自己署名証明書を使うので検証しない
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(SessionError::Client)?;
        Ok(Self {
            http,
            discovery: Discovery::default(),
            inner: Mutex::new(Inner {
                config,
                state: SessionState::default(),
            }),
        })
    }

    /// アドレス探索方法を差し替える
    pub fn with_discovery(mut self, discovery: Discovery) -> Self {
        self.discovery = discovery;
        self
    }

    pub async fn config(&self) -> SessionConfig {
        self.inner.lock().await.config.clone()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state.clone()
    }

    pub async fn logged_in(&self) -> bool {
        self.inner.lock().await.state.logged_in
    }

    /// 設定を入れ替えて認証状態を捨てる
    pub async fn reconfigure(&self, config: SessionConfig) {
        let mut inner = self.inner.lock().await;
        inner.config = config;
        inner.state = SessionState::default();
    }

    /// ログインする
    /// optionsの空ではない項目で現在の設定を上書きする。
    pub async fn login(&self, options: Option<&SessionOptions>) -> Result<bool, SessionError> {
        let mut inner = self.inner.lock().await;
        if let Some(options) = options {
            inner.config.merge(options);
        }
        if inner.config.is_placeholder_host() {
            if let Some(address) = self.discovery.resolve(&self.http).await {
                inner.config.host = address;
            }
        }

        // 前回のセッションを持ち越さない
        inner.state.cookie = None;
        inner.state.logged_in = false;

        let path = login_path(&inner.config.username, &inner.config.password);
        let result = self
            .execute(&mut inner, &path, true, None)
            .await
            .and_then(|body| check_login(&body));
        match result {
            Ok(()) => {
                inner.state.logged_in = true;
                tracing::info!("logged in to {}", inner.config.host);
                Ok(true)
            }
            Err(e) => {
                inner.state.logged_in = false;
                inner.state.cookie = None;
                Err(e)
            }
        }
    }

    /// ログアウトする
    pub async fn logout(&self) -> Result<bool, SessionError> {
        self.end_session(LOGOUT_PATH).await
    }

    /// 再起動する
    pub async fn reboot(&self) -> Result<bool, SessionError> {
        self.end_session(REBOOT_PATH).await
    }

    async fn end_session(&self, path: &str) -> Result<bool, SessionError> {
        let mut inner = self.inner.lock().await;
        self.execute(&mut inner, path, false, None).await?;
        inner.state.logged_in = false;
        inner.state.cookie = None;
        Ok(true)
    }

    /// アドレスを探索してホスト名を更新する
    /// 見つからなければ今のホスト名のまま
    pub async fn discover(&self) -> String {
        let mut inner = self.inner.lock().await;
        if let Some(address) = self.discovery.resolve(&self.http).await {
            inner.config.host = address;
        }
        inner.config.host.clone()
    }

    /// GET要求を送ってJSONを得る
    pub async fn request(
        &self,
        path: &str,
        forced: bool,
        timeout: Option<Duration>,
    ) -> Result<Value, SessionError> {
        let mut inner = self.inner.lock().await;
        self.execute(&mut inner, path, forced, timeout).await
    }

    async fn request_as<T: DeserializeOwned>(&self, path: &str) -> Result<T, SessionError> {
        let value = self.request(path, false, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// ネットワーク情報(有線LANと無線LAN)
    pub async fn network(&self) -> Result<NetworkInfo, SessionError> {
        let eth = self
            .request_as(&format!("{}?type=eth", NETWORK_PATH))
            .await?;
        let wifi = self
            .request_as(&format!("{}?type=wifi", NETWORK_PATH))
            .await?;
        Ok(NetworkInfo { eth, wifi })
    }

    /// ソフトウェアバージョンと機器の設定
    pub async fn software_version(&self) -> Result<SoftwareVersion, SessionError> {
        self.request_as(SOFTWARE_VERSION_PATH).await
    }

    /// SDカードとP1ポートの状態
    pub async fn status(&self) -> Result<DeviceStatus, SessionError> {
        self.request_as(STATUS_PATH).await
    }

    /// ファームウェア一覧
    pub async fn firmware_list(&self) -> Result<FirmwareList, SessionError> {
        self.request_as(FIRMWARE_LIST_PATH).await
    }

    /// 計測値をそのまま得る
    pub async fn raw_meter_readings(&self) -> Result<RawSample, SessionError> {
        let value = match self.request(READINGS_PATH, false, None).await {
            // JSONのかわりにHTMLが返ってくるのはP1ポートが未接続のとき
            Err(SessionError::MalformedResponse(_)) => return Err(SessionError::SensorDisconnected),
            Err(e) => return Err(e),
            Ok(value) => value,
        };
        serde_json::from_value(value).map_err(|e| {
            tracing::debug!("meter readings parse error: {}", e);
            SessionError::ReadingParseError
        })
    }

    /// 短縮形の計測値を得る
    pub async fn meter_readings(&self) -> Result<ShortReading, SessionError> {
        let raw = self.raw_meter_readings().await?;
        ShortReading::try_from(&raw)
    }

    async fn execute(
        &self,
        inner: &mut Inner,
        path: &str,
        forced: bool,
        timeout: Option<Duration>,
    ) -> Result<Value, SessionError> {
        if !inner.state.logged_in && !forced {
            return Err(SessionError::NotLoggedIn);
        }
        let url = format!("{}{}", inner.config.base_url(), path);
        // ログイン情報は出さない
        let shown = if path.starts_with(LOGIN_PATH) {
            LOGIN_PATH
        } else {
            path
        };
        tracing::trace!(target:"Tx->", "GET {}{}", inner.config.base_url(), shown);

        let mut builder = self
            .http
            .get(&url)
            .header(CACHE_CONTROL, "no-cache")
            .header(USER_AGENT, USER_AGENT_VALUE)
            .header(CONTENT_LENGTH, "0")
            .header(CONNECTION, "keep-alive")
            .timeout(timeout.unwrap_or(inner.config.timeout));
        if let Some(cookie) = inner.state.cookie.as_deref() {
            builder = builder.header(COOKIE, cookie);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                // 例: 接続拒否(ポート番号違い), 接続リセット(IPアドレス違い)
                let e = SessionError::from(e);
                inner.state.last_response = Some(LastResponse::Error(e.to_string()));
                return Err(e);
            }
        };
        if let Some(cookie) = take_cookie(response.headers()) {
            inner.state.cookie = Some(cookie);
        }
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                let e = SessionError::from(e);
                inner.state.last_response = Some(LastResponse::Error(e.to_string()));
                return Err(e);
            }
        };
        tracing::trace!(target:"<-Rx", "{} {}", status, body.escape_debug());

        if status != StatusCode::OK {
            inner.state.last_response = Some(LastResponse::Status(status.as_u16()));
            return Err(SessionError::HttpError {
                status: status.as_u16(),
            });
        }
        inner.state.last_response = Some(LastResponse::Body(body.clone()));
        if !is_json_content_type(&content_type) {
            return Err(SessionError::UnexpectedContentType(content_type));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

/// ログインパス ユーザー名とパスワードはbase64
fn login_path(username: &str, password: &str) -> String {
    format!(
        "{}?username={}&password={}",
        LOGIN_PATH,
        escape_base64(&STANDARD.encode(username)),
        escape_base64(&STANDARD.encode(password))
    )
}

/// base64の記号をURLエンコードする
fn escape_base64(s: &str) -> String {
    s.replace('+', "%2B").replace('/', "%2F").replace('=', "%3D")
}

/// 応答のstatusが200以外ならログイン失敗
fn check_login(body: &Value) -> Result<(), SessionError> {
    match body.get("status").and_then(Value::as_u64) {
        Some(200) | None => Ok(()),
        Some(status) => {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| format!("status {}", status));
            Err(SessionError::AuthenticationFailed(message))
        }
    }
}

/// set-cookieから name=value の組を取り出す
fn take_cookie(headers: &HeaderMap) -> Option<String> {
    let cookies = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|s| s.split(';').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<&str>>();
    if cookies.is_empty() {
        None
    } else {
        Some(cookies.join("; "))
    }
}

fn is_json_content_type(content_type: &str) -> bool {
    let content_type = content_type.trim_start().to_ascii_lowercase();
    content_type.starts_with("text/json") || content_type.starts_with("application/json")
}

#[test]
fn test_login_path() {
    assert_eq!(
        login_path("beeclear", "energie"),
        "/bc_login?username=YmVlY2xlYXI%3D&password=ZW5lcmdpZQ%3D%3D"
    );
}

#[test]
fn test_content_type() {
    assert!(is_json_content_type("text/json"));
    assert!(is_json_content_type("text/json; charset=utf-8"));
    assert!(is_json_content_type("application/json"));
    assert!(!is_json_content_type("text/html"));
    assert!(!is_json_content_type(""));
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server, ServerGuard};
    use serde_json::json;

    fn session_for(server: &ServerGuard) -> Session {
        let addr = server.socket_address();
        let config = SessionConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..Default::default()
        };
        Session::new(config)
            .unwrap()
            .with_discovery(Discovery::new(None, None))
    }

    async fn mock_login(server: &mut ServerGuard) -> mockito::Mock {
        server
            .mock("GET", "/bc_login")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("username".into(), "YmVlY2xlYXI=".into()),
                Matcher::UrlEncoded("password".into(), "ZW5lcmdpZQ==".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "text/json")
            .with_header("set-cookie", "session=abc123; Path=/")
            .with_body(
                json!({"status": 200, "message": "Welkom", "access_token": "toegang gegeven"})
                    .to_string(),
            )
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_not_logged_in() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/bc_current")
            .expect(0)
            .create_async()
            .await;

        let session = session_for(&server);
        let result = session.meter_readings().await;

        assert!(matches!(result, Err(SessionError::NotLoggedIn)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_and_readings() {
        let mut server = Server::new_async().await;
        let login = mock_login(&mut server).await;
        let readings = server
            .mock("GET", "/bc_current")
            .match_header("cookie", "session=abc123")
            .match_header("cache-control", "no-cache")
            .with_status(200)
            .with_header("content-type", "text/json")
            .with_body(
                json!({
                    "d": 1600798993, "tariefStatus": 2,
                    "ul": 12637314, "uh": 8553028, "gl": 4288455, "gh": 10048153,
                    "u": 812, "g": 0,
                    "gas": [ { "slot": 0, "val": 6399475, "time": 1600797600 } ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let session = session_for(&server);
        assert!(session.login(None).await.unwrap());
        assert!(session.logged_in().await);
        assert_eq!(
            session.state().await.cookie.as_deref(),
            Some("session=abc123")
        );

        let reading = session.meter_readings().await.unwrap();
        assert_eq!(reading.pwr, Some(812.0));
        assert_eq!(reading.net, Some(6853.734));
        assert_eq!(reading.gtm, Some(1600797600));

        login.assert_async().await;
        readings.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_wrong_credentials() {
        let mut server = Server::new_async().await;
        let _login = server
            .mock("GET", "/bc_login")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "text/json")
            .with_header("set-cookie", "session=stale; Path=/")
            .with_body(json!({"status": 401, "message": "Onbekende gebruiker"}).to_string())
            .create_async()
            .await;

        let session = session_for(&server);
        let options = SessionOptions {
            password: Some("verkeerd".to_owned()),
            ..Default::default()
        };
        let result = session.login(Some(&options)).await;

        assert!(matches!(result, Err(SessionError::AuthenticationFailed(_))));
        let state = session.state().await;
        assert!(!state.logged_in);
        assert_eq!(state.cookie, None);
        assert_eq!(session.config().await.password, "verkeerd");
    }

    #[tokio::test]
    async fn test_login_http_error() {
        let mut server = Server::new_async().await;
        let _login = server
            .mock("GET", "/bc_login")
            .match_query(Matcher::Any)
            .with_status(403)
            .create_async()
            .await;

        let session = session_for(&server);
        let result = session.login(None).await;

        assert!(matches!(
            result,
            Err(SessionError::HttpError { status: 403 })
        ));
        assert!(!session.logged_in().await);
        assert_eq!(
            session.state().await.last_response,
            Some(LastResponse::Status(403))
        );
    }

    #[tokio::test]
    async fn test_unexpected_content_type() {
        let mut server = Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let _status = server
            .mock("GET", "/bc_status")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<html><body>busy</body></html>")
            .create_async()
            .await;

        let session = session_for(&server);
        session.login(None).await.unwrap();
        let result = session.status().await;

        assert!(matches!(
            result,
            Err(SessionError::UnexpectedContentType(ref s)) if s == "text/html"
        ));
    }

    #[tokio::test]
    async fn test_sensor_disconnected() {
        let mut server = Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let _readings = server
            .mock("GET", "/bc_current")
            .with_status(200)
            .with_header("content-type", "text/json")
            .with_body("<html><head><title>Error</title></head></html>")
            .create_async()
            .await;

        let session = session_for(&server);
        session.login(None).await.unwrap();
        let result = session.meter_readings().await;

        assert!(matches!(result, Err(SessionError::SensorDisconnected)));
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let mut server = Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let _status = server
            .mock("GET", "/bc_status")
            .with_status(200)
            .with_header("content-type", "text/json")
            .with_body("{ \"p1\": ")
            .create_async()
            .await;

        let session = session_for(&server);
        session.login(None).await.unwrap();

        assert!(matches!(
            session.status().await,
            Err(SessionError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_logout() {
        let mut server = Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let logout = server
            .mock("GET", "/bc_logout")
            .match_header("cookie", "session=abc123")
            .with_status(200)
            .with_header("content-type", "text/json")
            .with_body("{}")
            .create_async()
            .await;

        let session = session_for(&server);
        session.login(None).await.unwrap();
        assert!(session.logout().await.unwrap());

        let state = session.state().await;
        assert!(!state.logged_in);
        assert_eq!(state.cookie, None);
        logout.assert_async().await;
    }

    #[tokio::test]
    async fn test_network_info() {
        let mut server = Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let eth = server
            .mock("GET", "/bc_getNetwork")
            .match_query(Matcher::UrlEncoded("type".into(), "eth".into()))
            .with_status(200)
            .with_header("content-type", "text/json")
            .with_body(
                json!({"status": "ok", "hostname": "beeclear",
                       "status_ethernet": {"ip": "10.0.0.22", "mac": "64:51:7e:68:2e:9d"}})
                .to_string(),
            )
            .create_async()
            .await;
        let wifi = server
            .mock("GET", "/bc_getNetwork")
            .match_query(Matcher::UrlEncoded("type".into(), "wifi".into()))
            .with_status(200)
            .with_header("content-type", "text/json")
            .with_body(json!({"status": "ok", "mode": "ap", "ssid": "BeeClear"}).to_string())
            .create_async()
            .await;

        let session = session_for(&server);
        session.login(None).await.unwrap();
        let network = session.network().await.unwrap();

        assert_eq!(network.mac(), Some("64:51:7e:68:2e:9d"));
        assert_eq!(network.wifi.ssid.as_deref(), Some("BeeClear"));
        eth.assert_async().await;
        wifi.assert_async().await;
    }

    #[tokio::test]
    async fn test_reconfigure_resets_login() {
        let mut server = Server::new_async().await;
        let _login = mock_login(&mut server).await;

        let session = session_for(&server);
        session.login(None).await.unwrap();
        let config = session.config().await;
        session.reconfigure(config).await;

        assert_eq!(session.state().await, SessionState::default());
    }

    #[tokio::test]
    async fn test_discover_updates_host() {
        let mut server = Server::new_async().await;
        let _page = server
            .mock("GET", "/mijnmeter/")
            .with_status(200)
            .with_body("<script> window.location.href = \"http://10.0.0.22\" </script>")
            .create_async()
            .await;

        let url = format!("{}/mijnmeter/", server.url());
        let session = Session::new(SessionConfig::default())
            .unwrap()
            .with_discovery(Discovery::new(None, Some(&url)));

        assert_eq!(session.discover().await, "10.0.0.22");
        assert_eq!(session.config().await.host, "10.0.0.22");
    }

    #[tokio::test]
    async fn test_timeout() {
        // 接続は受け付けるが応答しない
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let session = Session::new(SessionConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            timeout: Duration::from_millis(300),
            ..Default::default()
        })
        .unwrap()
        .with_discovery(Discovery::new(None, None));

        let result = session.login(None).await;
        assert!(matches!(result, Err(SessionError::Timeout)));
        assert!(!session.logged_in().await);
        assert_eq!(
            session.state().await.last_response,
            Some(LastResponse::Error("request timed out".to_owned()))
        );
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // 空いているポートを確保してすぐ閉じる
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let session = Session::new(SessionConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..Default::default()
        })
        .unwrap()
        .with_discovery(Discovery::new(None, None));

        let e = match session.login(None).await {
            Err(e @ SessionError::Network(_)) => e,
            other => panic!("expected network error, got {:?}", other),
        };
        // ログイン情報をエラーに残さない
        let message = e.to_string();
        assert!(!message.contains("password"), "{}", message);
        assert!(!message.contains("ZW5lcmdpZQ"), "{}", message);
        let Some(LastResponse::Error(last)) = session.state().await.last_response else {
            panic!("expected transport error");
        };
        assert!(!last.contains("password"), "{}", last);
    }
}
