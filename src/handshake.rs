//! # Handshake
//!
//! The HTTP opening handshake (RFC 6455 Section 4).
//!
//! Both sides work on `http` types only and never touch the network:
//!
//! - A server feeds the request headers to [`ServerHandshake::parse`], decides which subprotocol
//!   and extensions to accept (directly or through a [`Negotiate`] policy) and sends the `101`
//!   response built by [`ServerHandshake::response`].
//! - A client builds its upgrade request with [`ClientHandshake::request`] and checks the server's
//!   answer with [`ClientHandshake::verify`].
//!
//! ```rust
//! use wsengine::handshake::{ClientHandshake, ServerHandshake};
//!
//! let mut client = ClientHandshake::new("ws://example.com/chat").unwrap();
//! let request = client.request(&["chat"], &[]).unwrap();
//!
//! let server = ServerHandshake::parse(request.headers()).unwrap();
//! assert_eq!(server.protocols(), ["chat"]);
//!
//! let response = server.response(Some("chat"), &[]).unwrap();
//! let negotiated = client.verify(&response).unwrap();
//! assert_eq!(negotiated.protocol.as_deref(), Some("chat"));
//! ```
use base64::prelude::*;
use http::{
    header::{self, InvalidHeaderValue},
    HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri,
};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{anychar, char, none_of, space0},
    combinator::{eof, map, opt},
    multi::{fold_many0, many0},
    sequence::{delimited, pair, preceded, terminated},
    IResult, Parser,
};
use sha1::{Digest, Sha1};
use thiserror::Error;
use url::Url;

/// GUID appended to the client key before hashing.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this crate speaks.
const WEBSOCKET_VERSION: &str = "13";

/// Reasons an opening handshake is rejected.
///
/// On the server side any of these should be answered with a non-101 status (usually 400, or
/// 426 with `Sec-WebSocket-Version: 13` for [`HandshakeError::UnsupportedVersion`]).
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Missing Upgrade header")]
    MissingUpgrade,

    /// The Upgrade header does not contain the `websocket` token.
    #[error("Invalid Upgrade header")]
    InvalidUpgrade,

    #[error("Missing Connection header")]
    MissingConnection,

    /// The Connection header does not contain the `upgrade` token.
    #[error("Invalid Connection header")]
    InvalidConnection,

    #[error("Missing Sec-WebSocket-Key header")]
    MissingKey,

    /// `Sec-WebSocket-Version` is absent or not 13.
    #[error("Unsupported Sec-WebSocket-Version")]
    UnsupportedVersion,

    /// The server answered with something other than `101 Switching Protocols`.
    #[error("Invalid status code: {0}")]
    InvalidStatus(u16),

    /// `Sec-WebSocket-Accept` is absent or does not match the key the client sent.
    #[error("Invalid Sec-WebSocket-Accept header")]
    InvalidAccept,

    /// The server selected a subprotocol the client never offered.
    #[error("Unexpected subprotocol {0:?}")]
    UnexpectedProtocol(String),

    /// Not a `ws://` or `wss://` URL with a host.
    #[error("Invalid WebSocket URL")]
    InvalidUrl,

    /// A subprotocol, extension or origin cannot be sent as an HTTP header value.
    #[error(transparent)]
    InvalidHeaderValue(#[from] InvalidHeaderValue),
}

/// Computes `Sec-WebSocket-Accept` for a `Sec-WebSocket-Key`.
///
/// ```rust
/// assert_eq!(
///     wsengine::handshake::accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Generates a random `Sec-WebSocket-Key`: 16 random bytes, base64 encoded.
fn generate_key() -> String {
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

/// Iterates over the comma separated tokens of every `name` header.
fn header_tokens<'a>(
    headers: &'a HeaderMap,
    name: header::HeaderName,
) -> impl Iterator<Item = &'a str> + 'a {
    headers
        .get_all(name)
        .into_iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Checks that `name` is present and lists `token`, ignoring case.
fn has_token(
    headers: &HeaderMap,
    name: header::HeaderName,
    token: &str,
    missing: HandshakeError,
    invalid: HandshakeError,
) -> Result<(), HandshakeError> {
    if !headers.contains_key(&name) {
        return Err(missing);
    }

    if header_tokens(headers, name).any(|value| value.eq_ignore_ascii_case(token)) {
        Ok(())
    } else {
        Err(invalid)
    }
}

fn verify_upgrade_headers(headers: &HeaderMap) -> Result<(), HandshakeError> {
    has_token(
        headers,
        header::UPGRADE,
        "websocket",
        HandshakeError::MissingUpgrade,
        HandshakeError::InvalidUpgrade,
    )?;
    has_token(
        headers,
        header::CONNECTION,
        "upgrade",
        HandshakeError::MissingConnection,
        HandshakeError::InvalidConnection,
    )
}

/// Parses every `Sec-WebSocket-Protocol` header into one list, keeping the order.
fn parse_protocols(headers: &HeaderMap) -> Vec<String> {
    header_tokens(headers, header::SEC_WEBSOCKET_PROTOCOL)
        .map(str::to_owned)
        .collect()
}

/// Parses every `Sec-WebSocket-Extensions` header into one list, keeping the order.
fn parse_extensions(headers: &HeaderMap) -> Vec<Extension> {
    headers
        .get_all(header::SEC_WEBSOCKET_EXTENSIONS)
        .into_iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(Extension::parse_list)
        .collect()
}

fn join<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// One entry of a `Sec-WebSocket-Extensions` list, e.g.
/// `permessage-deflate; client_max_window_bits; server_max_window_bits=10`.
///
/// Parameters keep their order. Values given as quoted strings are stored unquoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub name: String,
    pub params: Vec<(String, Option<String>)>,
}

impl Extension {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Adds a parameter, with or without value.
    pub fn with_param(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.params.push((name.into(), value.map(str::to_owned)));
        self
    }

    /// Looks up a parameter. Returns `Some(None)` for a parameter present without value.
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_deref())
    }

    /// Parses a comma separated extension list.
    ///
    /// Malformed entries are skipped; the well-formed ones are returned in the order they were
    /// offered.
    pub fn parse_list(input: &str) -> Vec<Extension> {
        let mut extensions = Vec::new();
        let mut input = input;

        while !input.trim_start().is_empty() {
            match terminated(parse_extension, (space0, alt((tag(","), eof)))).parse(input) {
                Ok((remaining, extension)) => {
                    extensions.push(extension);
                    input = remaining;
                }
                Err(_) => {
                    let skip = input.find(',').map_or(input.len(), |comma| comma + 1);

                    #[cfg(feature = "logging")]
                    log::debug!("skipping malformed extension {:?}", input[..skip].trim());

                    input = &input[skip..];
                }
            }
        }

        extensions
    }
}

impl std::str::FromStr for Extension {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match terminated(parse_extension, (space0, eof)).parse(input) {
            Ok((_, extension)) => Ok(extension),
            Err(err) => Err(err.to_string()),
        }
    }
}

impl std::fmt::Display for Extension {
    /// Formats the extension the way it is sent in a handshake header.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)?;
        for (key, value) in &self.params {
            write!(f, "; {key}")?;
            match value {
                Some(value) if !value.is_empty() && value.chars().all(is_token_char) => {
                    write!(f, "={value}")?
                }
                Some(value) => {
                    f.write_str("=\"")?;
                    for c in value.chars() {
                        if c == '"' || c == '\\' {
                            f.write_str("\\")?;
                        }
                        write!(f, "{c}")?;
                    }
                    f.write_str("\"")?;
                }
                None => {}
            }
        }
        Ok(())
    }
}

/// `tchar` of RFC 7230.
fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(is_token_char).parse(input)
}

/// `"..."` with `\` escaping the next character.
fn quoted_string(input: &str) -> IResult<&str, String> {
    delimited(
        char('"'),
        fold_many0(
            alt((preceded(char('\\'), anychar), none_of("\\\""))),
            String::new,
            |mut value, c| {
                value.push(c);
                value
            },
        ),
        char('"'),
    )
    .parse(input)
}

/// `; name` or `; name=value`
fn parse_param(input: &str) -> IResult<&str, (String, Option<String>)> {
    map(
        preceded(
            (space0, char(';'), space0),
            pair(
                token,
                opt(preceded(
                    (space0, char('='), space0),
                    alt((map(token, str::to_owned), quoted_string)),
                )),
            ),
        ),
        |(name, value)| (name.to_owned(), value),
    )
    .parse(input)
}

fn parse_extension(input: &str) -> IResult<&str, Extension> {
    map(
        pair(preceded(space0, token), many0(parse_param)),
        |(name, params)| Extension {
            name: name.to_owned(),
            params,
        },
    )
    .parse(input)
}

/// What both sides agreed on during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Negotiated {
    pub protocol: Option<String>,
    pub extensions: Vec<Extension>,
}

/// Chooses the subprotocol and extensions a server accepts.
///
/// Offers are passed in the client's order of preference.
pub trait Negotiate {
    /// Picks one of the offered subprotocols, or none.
    fn select_protocol<'a>(&self, offered: &'a [String]) -> Option<&'a str>;

    /// Picks the extensions to accept, possibly with adjusted parameters.
    ///
    /// Defaults to accepting none.
    fn select_extensions(&self, offered: &[Extension]) -> Vec<Extension> {
        let _ = offered;
        Vec::new()
    }
}

/// The server side of the opening handshake.
#[derive(Debug, Clone)]
pub struct ServerHandshake {
    key: String,
    protocols: Vec<String>,
    extensions: Vec<Extension>,
}

impl ServerHandshake {
    /// Validates the headers of an upgrade request.
    ///
    /// # Errors
    /// - Missing or invalid `Upgrade` / `Connection` headers.
    /// - [`HandshakeError::MissingKey`] without a `Sec-WebSocket-Key`.
    /// - [`HandshakeError::UnsupportedVersion`] unless `Sec-WebSocket-Version` is 13.
    pub fn parse(headers: &HeaderMap) -> Result<Self, HandshakeError> {
        verify_upgrade_headers(headers)?;

        let key = headers
            .get(header::SEC_WEBSOCKET_KEY)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(HandshakeError::MissingKey)?;

        if headers
            .get(header::SEC_WEBSOCKET_VERSION)
            .map(|value| value.as_bytes())
            != Some(WEBSOCKET_VERSION.as_bytes())
        {
            return Err(HandshakeError::UnsupportedVersion);
        }

        let this = Self {
            key: key.to_owned(),
            protocols: parse_protocols(headers),
            extensions: parse_extensions(headers),
        };

        #[cfg(feature = "logging")]
        log::debug!(
            "upgrade request offers protocols {:?} and extensions [{}]",
            this.protocols,
            join(&this.extensions)
        );

        Ok(this)
    }

    /// Same as [`ServerHandshake::parse`], for a whole request.
    pub fn from_request<B>(request: &Request<B>) -> Result<Self, HandshakeError> {
        Self::parse(request.headers())
    }

    /// The client's `Sec-WebSocket-Key`.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The `Sec-WebSocket-Accept` value answering the client's key.
    pub fn accept(&self) -> String {
        accept_key(&self.key)
    }

    /// Offered subprotocols, most preferred first.
    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    /// Offered extensions, most preferred first.
    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    /// Builds the `101 Switching Protocols` response.
    ///
    /// `protocol` and `extensions` are what the caller decided to accept; they should come out of
    /// the offers.
    pub fn response(
        &self,
        protocol: Option<&str>,
        extensions: &[Extension],
    ) -> Result<Response<()>, HandshakeError> {
        let mut response = Response::new(());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;

        let headers = response.headers_mut();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(
            header::SEC_WEBSOCKET_ACCEPT,
            HeaderValue::from_str(&self.accept())?,
        );

        if let Some(protocol) = protocol {
            headers.insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_str(protocol)?,
            );
        }
        if !extensions.is_empty() {
            headers.insert(
                header::SEC_WEBSOCKET_EXTENSIONS,
                HeaderValue::from_str(&join(extensions))?,
            );
        }

        Ok(response)
    }

    /// Lets `policy` choose among the offers, then builds the response.
    pub fn negotiate(
        &self,
        policy: &impl Negotiate,
    ) -> Result<(Response<()>, Negotiated), HandshakeError> {
        let protocol = policy.select_protocol(&self.protocols).map(str::to_owned);
        let extensions = policy.select_extensions(&self.extensions);

        #[cfg(feature = "logging")]
        log::debug!(
            "accepting protocol {:?} and extensions [{}]",
            protocol,
            join(&extensions)
        );

        let response = self.response(protocol.as_deref(), &extensions)?;
        Ok((
            response,
            Negotiated {
                protocol,
                extensions,
            },
        ))
    }
}

/// The client side of the opening handshake.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    url: Url,
    key: String,
    origin: Option<String>,
    protocols: Vec<String>,
}

impl ClientHandshake {
    /// Prepares a handshake for a `ws://` or `wss://` URL, with a fresh random key.
    pub fn new(url: &str) -> Result<Self, HandshakeError> {
        let url = Url::parse(url).map_err(|_| HandshakeError::InvalidUrl)?;
        if !matches!(url.scheme(), "ws" | "wss") || url.host_str().is_none() {
            return Err(HandshakeError::InvalidUrl);
        }

        Ok(Self {
            url,
            key: generate_key(),
            origin: None,
            protocols: Vec::new(),
        })
    }

    /// Sends an `Origin` header with the request.
    pub fn with_origin(self, origin: impl Into<String>) -> Self {
        Self {
            origin: Some(origin.into()),
            ..self
        }
    }

    /// The `Sec-WebSocket-Key` sent with the request.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Builds the upgrade request offering `protocols` and `extensions`, most preferred first.
    pub fn request(
        &mut self,
        protocols: &[&str],
        extensions: &[Extension],
    ) -> Result<Request<()>, HandshakeError> {
        let host = self.url.host_str().ok_or(HandshakeError::InvalidUrl)?;
        // the port is implied for ws (80) and wss (443)
        let host = match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };

        let mut request = Request::new(());
        *request.method_mut() = Method::GET;
        *request.uri_mut() = self
            .url
            .as_str()
            .parse::<Uri>()
            .map_err(|_| HandshakeError::InvalidUrl)?;

        let headers = request.headers_mut();
        headers.insert(header::HOST, HeaderValue::from_str(&host)?);
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::SEC_WEBSOCKET_KEY, HeaderValue::from_str(&self.key)?);
        headers.insert(
            header::SEC_WEBSOCKET_VERSION,
            HeaderValue::from_static(WEBSOCKET_VERSION),
        );

        if let Some(origin) = &self.origin {
            headers.insert(header::ORIGIN, HeaderValue::from_str(origin)?);
        }
        if !protocols.is_empty() {
            headers.insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_str(&protocols.join(", "))?,
            );
        }
        if !extensions.is_empty() {
            headers.insert(
                header::SEC_WEBSOCKET_EXTENSIONS,
                HeaderValue::from_str(&join(extensions))?,
            );
        }

        self.protocols = protocols.iter().map(|protocol| protocol.to_string()).collect();

        Ok(request)
    }

    /// Checks the server's answer to the request.
    ///
    /// # Errors
    /// - [`HandshakeError::InvalidStatus`] for anything but `101`.
    /// - Missing or invalid `Upgrade` / `Connection` headers.
    /// - [`HandshakeError::InvalidAccept`] if the server did not prove it read our key.
    /// - [`HandshakeError::UnexpectedProtocol`] if the server chose a subprotocol we did not
    ///   offer.
    pub fn verify<B>(&self, response: &Response<B>) -> Result<Negotiated, HandshakeError> {
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(HandshakeError::InvalidStatus(response.status().as_u16()));
        }

        let headers = response.headers();
        verify_upgrade_headers(headers)?;

        let accept = headers
            .get(header::SEC_WEBSOCKET_ACCEPT)
            .and_then(|value| value.to_str().ok())
            .ok_or(HandshakeError::InvalidAccept)?;
        if accept.trim() != accept_key(&self.key) {
            return Err(HandshakeError::InvalidAccept);
        }

        let protocol = match parse_protocols(headers).as_slice() {
            [] => None,
            [protocol] if self.protocols.contains(protocol) => Some(protocol.clone()),
            protocols => return Err(HandshakeError::UnexpectedProtocol(protocols.join(", "))),
        };

        let negotiated = Negotiated {
            protocol,
            extensions: parse_extensions(headers),
        };

        #[cfg(feature = "logging")]
        log::debug!(
            "handshake with {} complete, protocol {:?}",
            self.url,
            negotiated.protocol
        );

        Ok(negotiated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    fn valid_request() -> HeaderMap {
        upgrade_headers(&[
            (header::UPGRADE, "websocket"),
            (header::CONNECTION, "Upgrade"),
            (header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ=="),
            (header::SEC_WEBSOCKET_VERSION, "13"),
        ])
    }

    mod server_tests {
        use super::*;

        #[test]
        fn test_accept_key_rfc_vector() {
            assert_eq!(
                accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
                "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
            );
        }

        #[test]
        fn test_response() {
            let handshake = ServerHandshake::parse(&valid_request()).unwrap();
            let response = handshake.response(None, &[]).unwrap();

            assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
            let headers = response.headers();
            assert_eq!(headers[header::UPGRADE], "websocket");
            assert_eq!(headers[header::CONNECTION], "Upgrade");
            assert_eq!(
                headers[header::SEC_WEBSOCKET_ACCEPT],
                "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
            );
            assert!(!headers.contains_key(header::SEC_WEBSOCKET_PROTOCOL));
            assert!(!headers.contains_key(header::SEC_WEBSOCKET_EXTENSIONS));
        }

        #[test]
        fn test_connection_token_list() {
            let mut headers = valid_request();
            headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
            headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
            assert!(ServerHandshake::parse(&headers).is_ok());
        }

        #[test]
        fn test_missing_and_invalid_headers() {
            let mut headers = valid_request();
            headers.remove(header::UPGRADE);
            assert!(matches!(
                ServerHandshake::parse(&headers),
                Err(HandshakeError::MissingUpgrade)
            ));

            let mut headers = valid_request();
            headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
            assert!(matches!(
                ServerHandshake::parse(&headers),
                Err(HandshakeError::InvalidUpgrade)
            ));

            let mut headers = valid_request();
            headers.remove(header::CONNECTION);
            assert!(matches!(
                ServerHandshake::parse(&headers),
                Err(HandshakeError::MissingConnection)
            ));

            let mut headers = valid_request();
            headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
            assert!(matches!(
                ServerHandshake::parse(&headers),
                Err(HandshakeError::InvalidConnection)
            ));

            let mut headers = valid_request();
            headers.remove(header::SEC_WEBSOCKET_KEY);
            assert!(matches!(
                ServerHandshake::parse(&headers),
                Err(HandshakeError::MissingKey)
            ));

            let mut headers = valid_request();
            headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("8"));
            assert!(matches!(
                ServerHandshake::parse(&headers),
                Err(HandshakeError::UnsupportedVersion)
            ));
        }

        #[test]
        fn test_offers_keep_their_order() {
            let mut headers = valid_request();
            headers.append(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("v2.chat, v1.chat"));
            headers.append(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("superchat"));
            headers.append(
                header::SEC_WEBSOCKET_EXTENSIONS,
                HeaderValue::from_static("permessage-deflate; client_max_window_bits, x-webkit"),
            );

            let handshake = ServerHandshake::parse(&headers).unwrap();
            assert_eq!(handshake.protocols(), ["v2.chat", "v1.chat", "superchat"]);

            let names: Vec<_> = handshake
                .extensions()
                .iter()
                .map(|extension| extension.name.as_str())
                .collect();
            assert_eq!(names, ["permessage-deflate", "x-webkit"]);
        }

        struct PreferSecond;

        impl Negotiate for PreferSecond {
            fn select_protocol<'a>(&self, offered: &'a [String]) -> Option<&'a str> {
                offered.get(1).map(String::as_str)
            }

            fn select_extensions(&self, offered: &[Extension]) -> Vec<Extension> {
                offered
                    .iter()
                    .filter(|extension| extension.name == "x-test")
                    .cloned()
                    .collect()
            }
        }

        #[test]
        fn test_negotiate_with_policy() {
            let mut headers = valid_request();
            headers.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("a, b"));
            headers.insert(
                header::SEC_WEBSOCKET_EXTENSIONS,
                HeaderValue::from_static("x-other, x-test; level=2"),
            );

            let handshake = ServerHandshake::parse(&headers).unwrap();
            let (response, negotiated) = handshake.negotiate(&PreferSecond).unwrap();

            assert_eq!(negotiated.protocol.as_deref(), Some("b"));
            assert_eq!(response.headers()[header::SEC_WEBSOCKET_PROTOCOL], "b");
            assert_eq!(
                response.headers()[header::SEC_WEBSOCKET_EXTENSIONS],
                "x-test; level=2"
            );
        }
    }

    mod client_tests {
        use super::*;

        #[test]
        fn test_request_headers() {
            let mut client = ClientHandshake::new("wss://example.com:8443/chat?room=1")
                .unwrap()
                .with_origin("https://example.com");
            let request = client
                .request(&["chat", "superchat"], &[Extension::new("x-test")])
                .unwrap();

            assert_eq!(request.method(), Method::GET);
            let headers = request.headers();
            assert_eq!(headers[header::HOST], "example.com:8443");
            assert_eq!(headers[header::ORIGIN], "https://example.com");
            assert_eq!(headers[header::SEC_WEBSOCKET_VERSION], "13");
            assert_eq!(headers[header::SEC_WEBSOCKET_PROTOCOL], "chat, superchat");
            assert_eq!(headers[header::SEC_WEBSOCKET_EXTENSIONS], "x-test");

            let key = BASE64_STANDARD
                .decode(headers[header::SEC_WEBSOCKET_KEY].as_bytes())
                .unwrap();
            assert_eq!(key.len(), 16);

            // and the server accepts it as is
            assert!(ServerHandshake::parse(headers).is_ok());
        }

        #[test]
        fn test_default_port_is_omitted() {
            let mut client = ClientHandshake::new("ws://example.com:80/").unwrap();
            let request = client.request(&[], &[]).unwrap();
            assert_eq!(request.headers()[header::HOST], "example.com");
            assert!(!request.headers().contains_key(header::SEC_WEBSOCKET_PROTOCOL));
        }

        #[test]
        fn test_invalid_urls() {
            for url in ["http://example.com", "not a url", "ws://"] {
                assert!(
                    matches!(ClientHandshake::new(url), Err(HandshakeError::InvalidUrl)),
                    "{url}"
                );
            }
        }

        #[test]
        fn test_verify_rejects_wrong_accept() {
            let mut client = ClientHandshake::new("ws://example.com").unwrap();
            let request = client.request(&[], &[]).unwrap();
            let server = ServerHandshake::parse(request.headers()).unwrap();

            let mut response = server.response(None, &[]).unwrap();
            response.headers_mut().insert(
                header::SEC_WEBSOCKET_ACCEPT,
                HeaderValue::from_static("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="),
            );
            assert!(matches!(
                client.verify(&response),
                Err(HandshakeError::InvalidAccept)
            ));
        }

        #[test]
        fn test_verify_status_and_protocol() {
            let mut client = ClientHandshake::new("ws://example.com").unwrap();
            let request = client.request(&["chat"], &[]).unwrap();
            let server = ServerHandshake::parse(request.headers()).unwrap();

            let mut response = server.response(None, &[]).unwrap();
            *response.status_mut() = StatusCode::FORBIDDEN;
            assert!(matches!(
                client.verify(&response),
                Err(HandshakeError::InvalidStatus(403))
            ));

            let response = server.response(Some("other"), &[]).unwrap();
            assert!(matches!(
                client.verify(&response),
                Err(HandshakeError::UnexpectedProtocol(protocol)) if protocol == "other"
            ));

            let response = server.response(None, &[]).unwrap();
            assert_eq!(client.verify(&response).unwrap(), Negotiated::default());
        }
    }

    mod extension_tests {
        use super::*;

        #[test]
        fn test_parse_params() {
            let extension: Extension =
                "permessage-deflate; client_max_window_bits; server_max_window_bits=10"
                    .parse()
                    .unwrap();

            assert_eq!(extension.name, "permessage-deflate");
            assert_eq!(extension.param("client_max_window_bits"), Some(None));
            assert_eq!(extension.param("server_max_window_bits"), Some(Some("10")));
            assert_eq!(extension.param("missing"), None);
        }

        #[test]
        fn test_quoted_values() {
            let extension: Extension = r#"x-ext; a="hello world"; b="q\"uote""#.parse().unwrap();
            assert_eq!(extension.param("a"), Some(Some("hello world")));
            assert_eq!(extension.param("b"), Some(Some("q\"uote")));

            // quoting is restored when needed
            assert_eq!(extension.to_string(), r#"x-ext; a="hello world"; b="q\"uote""#);
        }

        #[test]
        fn test_display() {
            let extension = Extension::new("permessage-deflate")
                .with_param("client_no_context_takeover", None)
                .with_param("server_max_window_bits", Some("12"));
            assert_eq!(
                extension.to_string(),
                "permessage-deflate; client_no_context_takeover; server_max_window_bits=12"
            );
        }

        #[test]
        fn test_malformed_entries_are_skipped() {
            let extensions = Extension::parse_list("foo; a=1, ;broken, bar; b=\"unterminated, baz");
            let names: Vec<_> = extensions.iter().map(|e| e.name.as_str()).collect();
            assert_eq!(names, ["foo", "baz"]);
        }

        #[test]
        fn test_single_extension_rejects_trailing_input() {
            assert!("foo bar".parse::<Extension>().is_err());
            assert!("".parse::<Extension>().is_err());
        }
    }
}
