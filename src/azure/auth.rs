//! SharedKey request signing and shared-access-signature minting.
//!
//! Both Azure services authenticate the same way: a canonical rendering of
//! the request is HMAC-SHA256 signed with the base64-decoded account key and
//! sent as `Authorization: SharedKey account:signature`. Container SAS
//! tokens reuse the same key over a fixed field layout.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use sha2::Sha256;

use super::error::AzureError;

type HmacSha256 = Hmac<Sha256>;

/// SAS version the signatures are produced for.
pub(super) const SAS_VERSION: &str = "2018-11-09";

/// Characters escaped in query-string values.
const QUERY_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'=')
    .add(b'?')
    .add(b'/')
    .add(b':');

/// Characters escaped in URL path segments; `/` separators are preserved.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'#')
    .add(b'%')
    .add(b'?');

/// Percent-encodes one query-string value.
pub(super) fn encode_query_value(value: &str) -> String {
    utf8_percent_encode(value, QUERY_VALUE).to_string()
}

/// Percent-encodes a blob path, preserving `/` separators.
pub(super) fn encode_path(path: &str) -> String {
    utf8_percent_encode(path, PATH_SEGMENT).to_string()
}

/// Current time in the RFC 1123 form the request-date headers require.
pub(super) fn rfc1123(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Timestamp in the compact ISO-8601 form SAS fields require.
pub(super) fn iso8601(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// A decoded account credential able to sign canonical strings.
#[derive(Clone)]
pub(super) struct SharedKey {
    account: String,
    key: Vec<u8>,
}

impl SharedKey {
    /// Decodes the base64 account key.
    pub(super) fn new(
        service: &'static str,
        account: &str,
        base64_key: &str,
    ) -> Result<Self, AzureError> {
        let key = BASE64
            .decode(base64_key.trim())
            .map_err(|err| AzureError::InvalidKey {
                service,
                message: err.to_string(),
            })?;
        Ok(Self {
            account: account.trim().to_owned(),
            key,
        })
    }

    pub(super) fn account(&self) -> &str {
        &self.account
    }

    /// Signs a canonical string, returning the base64 signature.
    pub(super) fn sign(&self, string_to_sign: &str) -> String {
        // An HMAC key of any length is accepted, so this cannot fail for a
        // successfully decoded credential.
        let mac = HmacSha256::new_from_slice(&self.key).map(|mut mac| {
            mac.update(string_to_sign.as_bytes());
            mac.finalize().into_bytes()
        });
        mac.map_or_else(|_| String::new(), |digest| BASE64.encode(digest))
    }

    /// Renders the `Authorization` header value for a canonical request.
    pub(super) fn authorization(&self, request: &CanonicalRequest) -> String {
        format!(
            "SharedKey {}:{}",
            self.account,
            self.sign(&request.string_to_sign(&self.account))
        )
    }

    /// Mints a container-scoped service SAS query string.
    pub(super) fn container_sas(
        &self,
        container: &str,
        permission_token: &str,
        expiry: DateTime<Utc>,
    ) -> String {
        let expiry_text = iso8601(expiry);
        let resource = format!("/blob/{}/{container}", self.account);
        // Field layout for service SAS version 2018-11-09: permissions,
        // start, expiry, resource, identifier, IP, protocol, version,
        // resource type, snapshot, and the five response-header overrides.
        let string_to_sign = format!(
            "{permission_token}\n\n{expiry_text}\n{resource}\n\n\nhttps\n{SAS_VERSION}\nc\n\n\n\n\n\n"
        );
        let signature = self.sign(&string_to_sign);
        format!(
            "sv={SAS_VERSION}&sr=c&sp={permission_token}&se={}&spr=https&sig={}",
            encode_query_value(&expiry_text),
            encode_query_value(&signature)
        )
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKey")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

/// The parts of a request that participate in SharedKey canonicalization.
#[derive(Debug)]
pub(super) struct CanonicalRequest {
    method: &'static str,
    content_length: usize,
    content_type: String,
    service_headers: Vec<(String, String)>,
    resource_path: String,
    query: Vec<(String, String)>,
}

impl CanonicalRequest {
    pub(super) fn new(method: &'static str, resource_path: impl Into<String>) -> Self {
        Self {
            method,
            content_length: 0,
            content_type: String::new(),
            service_headers: Vec::new(),
            resource_path: resource_path.into(),
            query: Vec::new(),
        }
    }

    pub(super) fn content(mut self, length: usize, content_type: impl Into<String>) -> Self {
        self.content_length = length;
        self.content_type = content_type.into();
        self
    }

    /// Adds an `x-ms-*`/`ocp-*` header; names must already be lowercase.
    pub(super) fn service_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.service_headers.push((name.into(), value.into()));
        self
    }

    pub(super) fn query_param(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub(super) fn headers(&self) -> &[(String, String)] {
        &self.service_headers
    }

    pub(super) fn content_type_value(&self) -> &str {
        &self.content_type
    }

    /// Renders the canonical string the SharedKey scheme signs: the verb,
    /// the standard header slots (most left empty here), the sorted
    /// service headers, and the canonicalized resource with sorted query
    /// parameters.
    pub(super) fn string_to_sign(&self, account: &str) -> String {
        let content_length = if self.content_length == 0 {
            String::new()
        } else {
            self.content_length.to_string()
        };

        let mut headers = self.service_headers.clone();
        headers.sort();
        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect();

        let mut query = self.query.clone();
        query.sort();
        let canonical_resource: String = query.iter().fold(
            format!("/{account}{}", self.resource_path),
            |acc, (name, value)| format!("{acc}\n{name}:{value}"),
        );

        format!(
            "{}\n\n\n{content_length}\n\n{}\n\n\n\n\n\n\n{canonical_headers}{canonical_resource}",
            self.method, self.content_type
        )
    }
}
