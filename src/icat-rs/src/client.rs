use std::collections::HashMap;

use icat_core::error::{ErrorKind, IcatError, Result};
use icat_core::jsonstream::{self, Event, JsonTokens};
use reqwest::{Client as HttpClient, Response, StatusCode, Url};

use crate::session::Session;

/// All routes live under this path on the server.
const BASE_PATH: &str = "icat/";

/// The server rejects longer request lines; fail before any I/O instead.
const MAX_URI_LENGTH: usize = 2048;

/// A RESTful ICAT server from which sessions may be obtained.
///
/// Holds no session state; any number of [`Session`]s may share one
/// `Icat`. Cloning is cheap, the underlying connection pool is shared.
#[derive(Debug, Clone)]
pub struct Icat {
    pub(crate) base: Url,
    pub(crate) client: HttpClient,
}

impl Icat {
    /// Create a handle for the server at `uri`, e.g.
    /// `https://example.com:443`.
    pub fn new(uri: &str) -> Result<Self> {
        let base = Url::parse(uri)
            .map_err(|e| IcatError::internal(format!("url::ParseError {e}")))?;
        Ok(Self {
            base,
            client: HttpClient::new(),
        })
    }

    /// Build the URI for a route, attaching query parameters and
    /// enforcing the maximum URI length before any network call.
    pub(crate) fn url_for(&self, route: &str, params: &[(&str, &str)]) -> Result<Url> {
        let mut url = self
            .base
            .join(&format!("{BASE_PATH}{route}"))
            .map_err(|e| IcatError::internal(format!("url::ParseError {e}")))?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        let length = url.as_str().len();
        if length > MAX_URI_LENGTH {
            return Err(IcatError::bad_parameter(format!(
                "Generated URI is of length {length} which exceeds {MAX_URI_LENGTH}"
            )));
        }
        Ok(url)
    }

    /// Check the status and return the response body, which must be
    /// non-empty.
    pub(crate) async fn get_string(&self, response: Response) -> Result<String> {
        let status = response.status();
        let body = response.text().await.map_err(transport)?;
        check_status(status, &body)?;
        if body.is_empty() {
            return Err(IcatError::internal("No http entity returned in response"));
        }
        Ok(body)
    }

    /// Check the status and require an empty response body.
    pub(crate) async fn expect_nothing(&self, response: Response) -> Result<()> {
        let status = response.status();
        let body = response.text().await.map_err(transport)?;
        check_status(status, &body)?;
        if !body.is_empty() {
            return Err(IcatError::internal(format!(
                "No http entity expected in response {body}"
            )));
        }
        Ok(())
    }

    /// Login and return a session.
    ///
    /// The credential keys and values expected depend on the
    /// authentication plugin identified by `plugin`; they are passed
    /// through as an opaque map.
    pub async fn login(&self, plugin: &str, credentials: &HashMap<String, String>) -> Result<Session> {
        let mut creds = Vec::with_capacity(credentials.len());
        for (key, value) in credentials {
            let mut entry = serde_json::Map::new();
            entry.insert(key.clone(), serde_json::Value::String(value.clone()));
            creds.push(serde_json::Value::Object(entry));
        }
        let arg = serde_json::json!({ "plugin": plugin, "credentials": creds });

        tracing::debug!(plugin, "Logging in to {}", self.base);
        let url = self.url_for("session", &[])?;
        let response = self
            .client
            .post(url)
            .form(&[("json", arg.to_string())])
            .send()
            .await
            .map_err(transport)?;
        let body = self.get_string(response).await?;
        let session_id = jsonstream::string_value(&body, "sessionId")?;
        Ok(Session::new(self.clone(), session_id))
    }

    /// Obtain a session for a known sessionId. No check is made on its
    /// validity.
    pub fn get_session(&self, session_id: impl Into<String>) -> Session {
        Session::new(self.clone(), session_id.into())
    }

    /// See whether at least one session exists for `user_name`, which
    /// must include the plugin mnemonic if the authenticator is
    /// configured to return them.
    pub async fn is_logged_in(&self, user_name: &str) -> Result<bool> {
        let url = self.url_for(&format!("user/{user_name}"), &[])?;
        let response = self.client.get(url).send().await.map_err(transport)?;
        let body = self.get_string(response).await?;
        jsonstream::boolean_value(&body, "loggedIn")
    }

    /// Return the version of the ICAT server.
    pub async fn get_version(&self) -> Result<String> {
        let url = self.url_for("version", &[])?;
        let response = self.client.get(url).send().await.map_err(transport)?;
        let body = self.get_string(response).await?;
        jsonstream::string_value(&body, "version")
    }

    /// Return the server's properties document (maxEntities,
    /// lifetimeMinutes and the available authenticators) as raw JSON.
    pub async fn get_properties(&self) -> Result<String> {
        let url = self.url_for("properties", &[])?;
        let response = self.client.get(url).send().await.map_err(transport)?;
        self.get_string(response).await
    }
}

/// Wrap a transport-level failure, preserving its diagnostic text.
pub(crate) fn transport(e: reqwest::Error) -> IcatError {
    IcatError::internal(format!("reqwest::Error {e}"))
}

pub(crate) fn io_error(e: std::io::Error) -> IcatError {
    IcatError::internal(format!("std::io::Error {e}"))
}

/// Interpret a completed response. Returns normally only for a 2xx
/// status; otherwise decodes the server's error envelope
/// `{code, message, offset?}` into the typed error, falling back to
/// `Internal` carrying the raw body when the envelope cannot be decoded.
pub(crate) fn check_status(status: StatusCode, body: &str) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    if body.is_empty() {
        return Err(IcatError::internal("No explanation provided"));
    }
    let mut code = None;
    let mut message = None;
    let mut offset = -1;
    let mut key = String::new();
    for event in JsonTokens::new(body) {
        match event {
            Ok(Event::Key(k)) => key = k,
            Ok(Event::Str(s)) => {
                if key == "code" {
                    code = Some(s);
                } else if key == "message" {
                    message = Some(s);
                }
            }
            Ok(Event::Num(n)) => {
                if key == "offset" {
                    offset = n.parse().unwrap_or(-1);
                }
            }
            Ok(_) => {}
            Err(_) => return Err(IcatError::internal(body)),
        }
    }
    match (code, message) {
        (Some(code), Some(message)) => match ErrorKind::from_code(&code) {
            Some(kind) => Err(IcatError::with_offset(kind, message, offset)),
            None => Err(IcatError::internal(body)),
        },
        _ => Err(IcatError::internal(body)),
    }
}
