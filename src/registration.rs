//! Registration Codec (C1): the canonical record type, its binary wire
//! format, and the derived identifiers used throughout the rest of the
//! control plane.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::b62;
use crate::error::{FrontendError, Result};

/// Authorization header pass-through tags a proxied request can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AuthOperation {
    /// Mandatory default: every registration must include this tag.
    UserInfo,
    UserJson,
}

/// What kind of content this registration's prefix serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentServiceType {
    Proxy,
    StaticOnly,
    Hybrid,
}

/// The canonical user-provided registration record (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub user_facing_url_prefix: String,
    pub upstream_host_and_port: String,
    pub upstream_path: String,
    pub timeout: u32,
    pub timeout_tries: u32,
    pub upload_file_size: u32,
    pub sticky: bool,
    pub disable_chunked_transfer_encoding: bool,
    pub auth_operations: BTreeSet<AuthOperation>,
    pub content_service_type: ContentServiceType,
    pub validate_upstream_connection: bool,
    pub app_name: String,
    /// Fields this build doesn't recognize, preserved byte-for-byte so a
    /// round trip through an older or newer encoder doesn't lose data.
    #[serde(default)]
    pub unknown_fields: Vec<(u16, Vec<u8>)>,
}

impl Registration {
    /// The `serverName` portion of `userFacingUrlPrefix`: everything before
    /// the first `/`.
    #[must_use]
    pub fn server_name(&self) -> &str {
        self.user_facing_url_prefix
            .split_once('/')
            .map_or(self.user_facing_url_prefix.as_str(), |(server, _)| server)
    }

    /// The `location` portion of `userFacingUrlPrefix`: `/` when no `/`
    /// occurs, otherwise the suffix including the leading `/`.
    #[must_use]
    pub fn location(&self) -> String {
        self.user_facing_url_prefix
            .split_once('/')
            .map_or_else(|| "/".to_string(), |(_, rest)| format!("/{rest}"))
    }

    /// The coordination-service node name for this registration (§3).
    #[must_use]
    pub fn node_name(&self) -> String {
        b62::node_name(
            &self.user_facing_url_prefix,
            &self.upstream_path,
            &self.upstream_host_and_port,
        )
    }

    /// Validates this registration against the rules in §4.11.
    pub fn validate(&self) -> Result<()> {
        if !self.auth_operations.contains(&AuthOperation::UserInfo) {
            return Err(FrontendError::RegistrationInvalid(
                "missing mandatory default auth operation tag".into(),
            ));
        }
        if self.timeout < 1 || self.timeout > 120 {
            return Err(FrontendError::RegistrationInvalid(format!(
                "timeout {} out of range [1,120]",
                self.timeout
            )));
        }
        if self.timeout_tries < 1 || self.timeout_tries > 10 {
            return Err(FrontendError::RegistrationInvalid(format!(
                "timeoutTries {} out of range [1,10]",
                self.timeout_tries
            )));
        }
        if self.content_service_type != ContentServiceType::StaticOnly {
            let (host, port) = self
                .upstream_host_and_port
                .split_once(':')
                .ok_or_else(|| {
                    FrontendError::RegistrationInvalid(format!(
                        "upstreamHostAndPort {:?} is not host:port",
                        self.upstream_host_and_port
                    ))
                })?;
            if host.is_empty() {
                return Err(FrontendError::RegistrationInvalid(
                    "upstreamHostAndPort has empty host".into(),
                ));
            }
            let port: u32 = port.parse().map_err(|_| {
                FrontendError::RegistrationInvalid(format!("upstream port {port:?} is not an integer"))
            })?;
            if port < 1 || port > 65535 {
                return Err(FrontendError::RegistrationInvalid(format!(
                    "upstream port {port} out of range [1,65535]"
                )));
            }
        }
        Ok(())
    }
}

// Wire tags for the known fields, stable across encoder versions.
mod tag {
    pub const PREFIX: u16 = 1;
    pub const HOST_PORT: u16 = 2;
    pub const UPSTREAM_PATH: u16 = 3;
    pub const TIMEOUT: u16 = 4;
    pub const TIMEOUT_TRIES: u16 = 5;
    pub const UPLOAD_FILE_SIZE: u16 = 6;
    pub const STICKY: u16 = 7;
    pub const DISABLE_CHUNKED: u16 = 8;
    pub const AUTH_OPS: u16 = 9;
    pub const CONTENT_TYPE: u16 = 10;
    pub const VALIDATE_UPSTREAM: u16 = 11;
    pub const APP_NAME: u16 = 12;
}

fn put_field(out: &mut Vec<u8>, tag: u16, bytes: &[u8]) {
    out.extend_from_slice(&tag.to_be_bytes());
    out.extend_from_slice(&u32::try_from(bytes.len()).expect("field too large").to_be_bytes());
    out.extend_from_slice(bytes);
}

fn content_type_byte(t: ContentServiceType) -> u8 {
    match t {
        ContentServiceType::Proxy => 0,
        ContentServiceType::StaticOnly => 1,
        ContentServiceType::Hybrid => 2,
    }
}

fn content_type_from_byte(b: u8) -> Result<ContentServiceType> {
    match b {
        0 => Ok(ContentServiceType::Proxy),
        1 => Ok(ContentServiceType::StaticOnly),
        2 => Ok(ContentServiceType::Hybrid),
        other => Err(FrontendError::RegistrationInvalid(format!(
            "unknown contentServiceType byte {other}"
        ))),
    }
}

fn auth_op_byte(op: AuthOperation) -> u8 {
    match op {
        AuthOperation::UserInfo => 0,
        AuthOperation::UserJson => 1,
    }
}

fn auth_op_from_byte(b: u8) -> Result<AuthOperation> {
    match b {
        0 => Ok(AuthOperation::UserInfo),
        1 => Ok(AuthOperation::UserJson),
        other => Err(FrontendError::RegistrationInvalid(format!(
            "unknown authOperation byte {other}"
        ))),
    }
}

/// Encodes a registration into its framed, length-prefixed, field-tagged
/// wire format (§4.1). `encode` and `decode` are inverses.
#[must_use]
pub fn encode(r: &Registration) -> Vec<u8> {
    let mut out = Vec::new();
    put_field(&mut out, tag::PREFIX, r.user_facing_url_prefix.as_bytes());
    put_field(&mut out, tag::HOST_PORT, r.upstream_host_and_port.as_bytes());
    put_field(&mut out, tag::UPSTREAM_PATH, r.upstream_path.as_bytes());
    put_field(&mut out, tag::TIMEOUT, &r.timeout.to_be_bytes());
    put_field(&mut out, tag::TIMEOUT_TRIES, &r.timeout_tries.to_be_bytes());
    put_field(&mut out, tag::UPLOAD_FILE_SIZE, &r.upload_file_size.to_be_bytes());
    put_field(&mut out, tag::STICKY, &[u8::from(r.sticky)]);
    put_field(
        &mut out,
        tag::DISABLE_CHUNKED,
        &[u8::from(r.disable_chunked_transfer_encoding)],
    );
    let auth_bytes: Vec<u8> = r.auth_operations.iter().copied().map(auth_op_byte).collect();
    put_field(&mut out, tag::AUTH_OPS, &auth_bytes);
    put_field(&mut out, tag::CONTENT_TYPE, &[content_type_byte(r.content_service_type)]);
    put_field(
        &mut out,
        tag::VALIDATE_UPSTREAM,
        &[u8::from(r.validate_upstream_connection)],
    );
    put_field(&mut out, tag::APP_NAME, r.app_name.as_bytes());
    for (tag, bytes) in &r.unknown_fields {
        put_field(&mut out, *tag, bytes);
    }
    out
}

/// Decodes a registration from its wire format. Unknown tags are preserved
/// in `unknown_fields` for forward compatibility rather than rejected.
pub fn decode(bytes: &[u8]) -> Result<Registration> {
    let mut prefix = None;
    let mut host_port = None;
    let mut upstream_path = None;
    let mut timeout = None;
    let mut timeout_tries = None;
    let mut upload_file_size = None;
    let mut sticky = None;
    let mut disable_chunked = None;
    let mut auth_operations = BTreeSet::new();
    let mut content_type = None;
    let mut validate_upstream = None;
    let mut app_name = None;
    let mut unknown_fields = Vec::new();

    let mut cursor = 0usize;
    let err = || FrontendError::RegistrationInvalid("truncated registration frame".into());
    while cursor < bytes.len() {
        let tag_bytes = bytes.get(cursor..cursor + 2).ok_or_else(err)?;
        let field_tag = u16::from_be_bytes([tag_bytes[0], tag_bytes[1]]);
        cursor += 2;
        let len_bytes = bytes.get(cursor..cursor + 4).ok_or_else(err)?;
        let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        cursor += 4;
        let field = bytes.get(cursor..cursor + len).ok_or_else(err)?;
        cursor += len;

        match field_tag {
            tag::PREFIX => prefix = Some(String::from_utf8_lossy(field).into_owned()),
            tag::HOST_PORT => host_port = Some(String::from_utf8_lossy(field).into_owned()),
            tag::UPSTREAM_PATH => upstream_path = Some(String::from_utf8_lossy(field).into_owned()),
            tag::TIMEOUT => timeout = Some(u32::from_be_bytes(field.try_into().map_err(|_| err())?)),
            tag::TIMEOUT_TRIES => {
                timeout_tries = Some(u32::from_be_bytes(field.try_into().map_err(|_| err())?));
            }
            tag::UPLOAD_FILE_SIZE => {
                upload_file_size = Some(u32::from_be_bytes(field.try_into().map_err(|_| err())?));
            }
            tag::STICKY => sticky = Some(field.first().copied().ok_or_else(err)? != 0),
            tag::DISABLE_CHUNKED => disable_chunked = Some(field.first().copied().ok_or_else(err)? != 0),
            tag::AUTH_OPS => {
                for &b in field {
                    auth_operations.insert(auth_op_from_byte(b)?);
                }
            }
            tag::CONTENT_TYPE => {
                content_type = Some(content_type_from_byte(field.first().copied().ok_or_else(err)?)?);
            }
            tag::VALIDATE_UPSTREAM => {
                validate_upstream = Some(field.first().copied().ok_or_else(err)? != 0);
            }
            tag::APP_NAME => app_name = Some(String::from_utf8_lossy(field).into_owned()),
            other => unknown_fields.push((other, field.to_vec())),
        }
    }

    Ok(Registration {
        user_facing_url_prefix: prefix.ok_or_else(|| FrontendError::RegistrationInvalid("missing prefix".into()))?,
        upstream_host_and_port: host_port
            .ok_or_else(|| FrontendError::RegistrationInvalid("missing upstreamHostAndPort".into()))?,
        upstream_path: upstream_path
            .ok_or_else(|| FrontendError::RegistrationInvalid("missing upstreamPath".into()))?,
        timeout: timeout.ok_or_else(|| FrontendError::RegistrationInvalid("missing timeout".into()))?,
        timeout_tries: timeout_tries
            .ok_or_else(|| FrontendError::RegistrationInvalid("missing timeoutTries".into()))?,
        upload_file_size: upload_file_size.unwrap_or(0),
        sticky: sticky.unwrap_or(false),
        disable_chunked_transfer_encoding: disable_chunked.unwrap_or(false),
        auth_operations,
        content_service_type: content_type
            .ok_or_else(|| FrontendError::RegistrationInvalid("missing contentServiceType".into()))?,
        validate_upstream_connection: validate_upstream.unwrap_or(false),
        app_name: app_name.unwrap_or_default(),
        unknown_fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Registration {
        Registration {
            user_facing_url_prefix: "app.example.com/foo".into(),
            upstream_host_and_port: "10.0.0.1:8443".into(),
            upstream_path: "/bar".into(),
            timeout: 30,
            timeout_tries: 2,
            upload_file_size: 0,
            sticky: false,
            disable_chunked_transfer_encoding: false,
            auth_operations: [AuthOperation::UserInfo].into_iter().collect(),
            content_service_type: ContentServiceType::Proxy,
            validate_upstream_connection: true,
            app_name: "app".into(),
            unknown_fields: Vec::new(),
        }
    }

    #[test]
    fn encode_decode_round_trips() {
        let r = sample();
        let decoded = decode(&encode(&r)).unwrap();
        assert_eq!(r, decoded);
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let mut r = sample();
        r.unknown_fields.push((999, vec![1, 2, 3]));
        let decoded = decode(&encode(&r)).unwrap();
        assert_eq!(decoded.unknown_fields, vec![(999, vec![1, 2, 3])]);
    }

    #[test]
    fn server_name_and_location_split_on_first_slash() {
        let r = sample();
        assert_eq!(r.server_name(), "app.example.com");
        assert_eq!(r.location(), "/foo");
    }

    #[test]
    fn location_defaults_to_root_without_slash() {
        let mut r = sample();
        r.user_facing_url_prefix = "app.example.com".into();
        assert_eq!(r.location(), "/");
    }

    #[test]
    fn rejects_missing_mandatory_auth_tag() {
        let mut r = sample();
        r.auth_operations.clear();
        assert!(r.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_timeout() {
        let mut r = sample();
        r.timeout = 200;
        assert!(r.validate().is_err());
    }

    #[test]
    fn static_only_skips_host_port_check() {
        let mut r = sample();
        r.content_service_type = ContentServiceType::StaticOnly;
        r.upstream_host_and_port = "not-a-host-port".into();
        assert!(r.validate().is_ok());
    }

    #[test]
    fn node_name_matches_b62_scheme() {
        let r = sample();
        let expected = b62::node_name("app.example.com/foo", "/bar", "10.0.0.1:8443");
        assert_eq!(r.node_name(), expected);
    }
}
