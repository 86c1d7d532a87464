//! The record codec: decoding one NDJSON input line into a [`RequestRecord`],
//! and encoding a [`ResultRecord`] back out.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// HTTP methods the replay engine is willing to issue: parsed into a closed
/// set, rejecting anything else with a descriptive error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    const ALL: &'static [(&'static str, Method)] = &[
        ("GET", Method::Get),
        ("HEAD", Method::Head),
        ("POST", Method::Post),
        ("PUT", Method::Put),
        ("DELETE", Method::Delete),
        ("CONNECT", Method::Connect),
        ("OPTIONS", Method::Options),
        ("TRACE", Method::Trace),
        ("PATCH", Method::Patch),
    ];

    pub fn as_str(&self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(_, m)| m == self)
            .map(|(s, _)| *s)
            .expect("Method::ALL is exhaustive")
    }

    pub fn to_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
            Method::Connect => reqwest::Method::CONNECT,
            Method::Options => reqwest::Method::OPTIONS,
            Method::Trace => reqwest::Method::TRACE,
            Method::Patch => reqwest::Method::PATCH,
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, m)| *m)
            .ok_or_else(|| Error::BadInput(format!("Invalid method: {s}")))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Method {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Method {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// The input unit: one recorded HTTP request, plus the fields derived from
/// it at decode time (`authority`, `is_tls`) used to key the client pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub method: Method,
    pub url: String,
    #[serde(serialize_with = "serialize_timestamp")]
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// `host[:port]`, derived from `url` (or the `Host` header override),
    /// port defaulted to 80. Not part of the wire schema.
    #[serde(skip)]
    pub authority: String,
    /// `true` when the URL scheme is `https`. Not part of the wire schema.
    #[serde(skip)]
    pub is_tls: bool,
}

impl RequestRecord {
    /// The effective host to send as the `Host` header: the `Host` header
    /// value if the input carried one, otherwise the URL's own host.
    pub fn host_override(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("host"))
            .map(|(_, v)| v.as_str())
    }
}

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Nanos, true))
}

fn deserialize_timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(d)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(serde::de::Error::custom)
}

/// Response metadata captured alongside a successful result, when the
/// caller asked for it (the dispatcher always fills this in; silent mode
/// just skips printing it).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResponseInfo {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_addr: Option<String>,
}

/// The output unit: the outcome of replaying (or failing to decode) one
/// request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    #[serde(rename = "StatusCode")]
    pub status_code: i32,
    /// Nanoseconds, matching the wire schema in §6.
    #[serde(rename = "Latency")]
    pub latency_nanos: i64,
    #[serde(rename = "Request")]
    pub request: RequestRecord,
    #[serde(rename = "Error")]
    pub error: String,
    #[serde(rename = "Response", default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseInfo>,
}

impl ResultRecord {
    pub fn is_success(&self) -> bool {
        self.status_code >= 200 && self.status_code < 600
    }

    pub fn is_transport_error(&self) -> bool {
        self.status_code == -1
    }

    pub fn is_decode_error(&self) -> bool {
        self.status_code == -2
    }

    pub fn is_server_error(&self) -> bool {
        self.status_code >= 500 || self.status_code < 0
    }
}

/// Decode one NDJSON line into a [`RequestRecord`], deriving `authority`
/// and `is_tls`. Unknown JSON keys are ignored (no `deny_unknown_fields`).
pub fn decode(line: &str) -> Result<RequestRecord, Error> {
    #[derive(Deserialize)]
    struct Wire {
        method: String,
        #[serde(default)]
        url: String,
        #[serde(default)]
        timestamp: Option<String>,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
    }

    let wire: Wire =
        serde_json::from_str(line).map_err(|e| Error::BadInput(format!("invalid JSON: {e}")))?;

    let method: Method = wire.method.parse()?;

    if wire.url.is_empty() {
        return Err(Error::BadInput("empty url".to_string()));
    }

    let timestamp_raw = wire
        .timestamp
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::BadInput("missing timestamp".to_string()))?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp_raw)
        .map_err(|e| Error::BadInput(format!("invalid timestamp {timestamp_raw:?}: {e}")))?
        .with_timezone(&Utc);

    let parsed_url = url::Url::parse(&wire.url)
        .map_err(|e| Error::BadInput(format!("invalid url {:?}: {e}", wire.url)))?;
    let is_tls = parsed_url.scheme() == "https";

    let host_header = headers_host(&wire.headers);
    let authority = host_header
        .map(|h| normalize_authority(h, is_tls))
        .unwrap_or_else(|| {
            let host = parsed_url.host_str().unwrap_or_default();
            let port = parsed_url
                .port()
                .unwrap_or(if is_tls { 443 } else { 80 });
            format!("{host}:{port}")
        });

    Ok(RequestRecord {
        method,
        url: wire.url,
        timestamp,
        body: wire.body,
        headers: wire.headers,
        authority,
        is_tls,
    })
}

fn headers_host(headers: &HashMap<String, String>) -> Option<&str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("host"))
        .map(|(_, v)| v.as_str())
}

fn normalize_authority(host_header: &str, is_tls: bool) -> String {
    if host_header.contains(':') {
        host_header.to_string()
    } else {
        let port = if is_tls { 443 } else { 80 };
        format!("{host_header}:{port}")
    }
}

/// Build a synthetic result for a line that failed to decode, per §6:
/// `StatusCode = -2`, `Latency = 0`, best-effort partial request.
pub fn decode_error_result(line: &str, err: &Error) -> ResultRecord {
    let partial = partial_request(line);
    ResultRecord {
        status_code: -2,
        latency_nanos: 0,
        request: partial,
        error: err.to_string(),
        response: None,
    }
}

fn partial_request(line: &str) -> RequestRecord {
    // Best-effort: recover whatever fields happen to parse, so operators can
    // still see which line failed in the output stream.
    #[derive(Deserialize, Default)]
    struct Loose {
        #[serde(default)]
        method: Option<String>,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        timestamp: Option<String>,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
    }

    let loose: Loose = serde_json::from_str(line).unwrap_or_default();
    let timestamp = loose
        .timestamp
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap());

    RequestRecord {
        method: loose
            .method
            .as_deref()
            .and_then(|m| m.parse().ok())
            .unwrap_or(Method::Get),
        url: loose.url.unwrap_or_default(),
        timestamp,
        body: loose.body,
        headers: loose.headers,
        authority: String::new(),
        is_tls: false,
    }
}

/// Encode a [`ResultRecord`] to one NDJSON line (no trailing newline).
pub fn encode(result: &ResultRecord) -> Result<String, Error> {
    serde_json::to_string(result).map_err(Error::from)
}
