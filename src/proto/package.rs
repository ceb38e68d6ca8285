//! The package: one framed wire message and its body codec.

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use super::command;

const FLAG_CREDENTIALS: u8 = 0x01;

/// Body prefix: command byte, flags byte, 16-byte correlation.
const BODY_PREFIX_LEN: usize = 18;

/// Per-request authentication credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl Credentials {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One framed wire message: command, correlation, opaque payload and
/// optional per-request credentials.
#[derive(Clone, Debug, PartialEq)]
pub struct Package {
    pub cmd: u8,
    pub correlation: Uuid,
    pub payload: Bytes,
    pub credentials: Option<Credentials>,
}

impl Package {
    pub fn new(cmd: u8, correlation: Uuid, payload: Bytes) -> Self {
        Self {
            cmd,
            correlation,
            payload,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn heartbeat_response(correlation: Uuid) -> Self {
        Self::new(command::HEARTBEAT_RESPONSE, correlation, Bytes::new())
    }

    pub fn heartbeat_request(correlation: Uuid) -> Self {
        Self::new(command::HEARTBEAT_REQUEST, correlation, Bytes::new())
    }

    pub fn authenticate(correlation: Uuid, credentials: Credentials) -> Self {
        Self::new(command::AUTHENTICATE, correlation, Bytes::new()).with_credentials(credentials)
    }

    /// Encodes the package body. Framing (the length prefix) is applied by
    /// the frame writer.
    pub fn encode(&self) -> Result<Vec<u8>, PackageEncodeError> {
        let creds_len = match &self.credentials {
            None => 0,
            Some(creds) => {
                if creds.login.len() > u8::MAX as usize {
                    return Err(PackageEncodeError::CredentialTooLong { field: "login" });
                }
                if creds.password.len() > u8::MAX as usize {
                    return Err(PackageEncodeError::CredentialTooLong { field: "password" });
                }
                2 + creds.login.len() + creds.password.len()
            }
        };

        let mut buf = Vec::with_capacity(BODY_PREFIX_LEN + creds_len + self.payload.len());
        buf.push(self.cmd);
        buf.push(if self.credentials.is_some() {
            FLAG_CREDENTIALS
        } else {
            0
        });
        buf.extend_from_slice(self.correlation.as_bytes());
        if let Some(creds) = &self.credentials {
            buf.push(creds.login.len() as u8);
            buf.extend_from_slice(creds.login.as_bytes());
            buf.push(creds.password.len() as u8);
            buf.extend_from_slice(creds.password.as_bytes());
        }
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes a package body as produced by [`Package::encode`].
    pub fn decode(body: &[u8]) -> Result<Self, PackageDecodeError> {
        if body.len() < BODY_PREFIX_LEN {
            return Err(PackageDecodeError::Truncated {
                need: BODY_PREFIX_LEN,
                got: body.len(),
            });
        }

        let cmd = body[0];
        let flags = body[1];
        let mut correlation = [0u8; 16];
        correlation.copy_from_slice(&body[2..BODY_PREFIX_LEN]);
        let correlation = Uuid::from_bytes(correlation);

        let mut rest = &body[BODY_PREFIX_LEN..];
        let credentials = if flags & FLAG_CREDENTIALS != 0 {
            let login = take_short_string(&mut rest, "login")?;
            let password = take_short_string(&mut rest, "password")?;
            Some(Credentials { login, password })
        } else {
            None
        };

        Ok(Self {
            cmd,
            correlation,
            payload: Bytes::copy_from_slice(rest),
            credentials,
        })
    }
}

fn take_short_string(rest: &mut &[u8], field: &'static str) -> Result<String, PackageDecodeError> {
    let Some((&len, tail)) = rest.split_first() else {
        return Err(PackageDecodeError::CredentialTruncated { field });
    };
    let len = len as usize;
    if tail.len() < len {
        return Err(PackageDecodeError::CredentialTruncated { field });
    }
    let (raw, tail) = tail.split_at(len);
    let value = std::str::from_utf8(raw)
        .map_err(|_| PackageDecodeError::CredentialInvalidUtf8 { field })?
        .to_string();
    *rest = tail;
    Ok(value)
}

#[derive(Debug, Error)]
pub enum PackageEncodeError {
    #[error("credential field {field} exceeds 255 bytes")]
    CredentialTooLong { field: &'static str },
}

#[derive(Debug, Error)]
pub enum PackageDecodeError {
    #[error("package body truncated: need {need} bytes got {got}")]
    Truncated { need: usize, got: usize },
    #[error("credential field {field} truncated")]
    CredentialTruncated { field: &'static str },
    #[error("credential field {field} is not valid utf-8")]
    CredentialInvalidUtf8 { field: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correlation(byte: u8) -> Uuid {
        Uuid::from_bytes([byte; 16])
    }

    #[test]
    fn package_roundtrip_without_credentials() {
        let package = Package::new(0xB0, correlation(3), Bytes::from_static(b"data"));
        let body = package.encode().unwrap();
        assert_eq!(body[0], 0xB0);
        assert_eq!(body[1], 0);

        let decoded = Package::decode(&body).unwrap();
        assert_eq!(decoded, package);
    }

    #[test]
    fn package_roundtrip_with_credentials() {
        let package = Package::new(0xB0, correlation(7), Bytes::from_static(b"xyz"))
            .with_credentials(Credentials::new("admin", "changeit"));
        let body = package.encode().unwrap();
        assert_eq!(body[1], FLAG_CREDENTIALS);

        let decoded = Package::decode(&body).unwrap();
        assert_eq!(decoded, package);
    }

    #[test]
    fn correlation_encodes_big_endian_bytes() {
        let id = Uuid::parse_str("0102030405060708090a0b0c0d0e0f10").unwrap();
        let body = Package::new(0x01, id, Bytes::new()).encode().unwrap();
        assert_eq!(&body[2..18], id.as_bytes());
    }

    #[test]
    fn decode_rejects_short_body() {
        let err = Package::decode(&[0x01, 0x00]).unwrap_err();
        assert!(matches!(err, PackageDecodeError::Truncated { .. }));
    }

    #[test]
    fn decode_rejects_truncated_credentials() {
        let package = Package::new(0xB0, correlation(1), Bytes::new())
            .with_credentials(Credentials::new("admin", "changeit"));
        let mut body = package.encode().unwrap();
        body.truncate(BODY_PREFIX_LEN + 3);

        let err = Package::decode(&body).unwrap_err();
        assert!(matches!(
            err,
            PackageDecodeError::CredentialTruncated { field: "login" }
        ));
    }

    #[test]
    fn decode_rejects_non_utf8_credentials() {
        let mut body = Package::new(0xB0, correlation(1), Bytes::new())
            .encode()
            .unwrap();
        body[1] = FLAG_CREDENTIALS;
        body.extend_from_slice(&[2, 0xFF, 0xFE, 0]);

        let err = Package::decode(&body).unwrap_err();
        assert!(matches!(
            err,
            PackageDecodeError::CredentialInvalidUtf8 { field: "login" }
        ));
    }

    #[test]
    fn encode_rejects_oversize_login() {
        let package = Package::new(0xB0, correlation(1), Bytes::new())
            .with_credentials(Credentials::new("a".repeat(256), "pw"));
        let err = package.encode().unwrap_err();
        assert!(matches!(
            err,
            PackageEncodeError::CredentialTooLong { field: "login" }
        ));
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let rendered = format!("{:?}", Credentials::new("admin", "changeit"));
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("changeit"));
    }
}
