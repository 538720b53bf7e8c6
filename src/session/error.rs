// セッションのエラー
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not logged in")]
    NotLoggedIn,

    #[error(r#"network "{0}""#)]
    Network(#[source] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP request failed. status code: {status}")]
    HttpError { status: u16 },

    #[error(r#"invalid content-type. expected text/json but received "{0}""#)]
    UnexpectedContentType(String),

    #[error(r#"malformed response "{0}""#)]
    MalformedResponse(#[from] serde_json::Error),

    #[error("P1 is not connected")]
    SensorDisconnected,

    #[error("error parsing meter info")]
    ReadingParseError,

    #[error(r#"login rejected "{0}""#)]
    AuthenticationFailed(String),

    #[error(r#"http client "{0}""#)]
    Client(#[source] reqwest::Error),
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> SessionError {
        // URLにはログイン情報が含まれるので落とす
        if err.is_timeout() {
            SessionError::Timeout
        } else {
            SessionError::Network(err.without_url())
        }
    }
}
