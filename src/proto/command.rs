//! Command codes for the package protocol.
//!
//! The driver only interprets the handshake and admin subset; every other
//! code is a data command that passes through opaquely.

pub const HEARTBEAT_REQUEST: u8 = 0x01;
pub const HEARTBEAT_RESPONSE: u8 = 0x02;
pub const BAD_REQUEST: u8 = 0xF0;
pub const NOT_HANDLED: u8 = 0xF1;
pub const AUTHENTICATE: u8 = 0xF2;
pub const AUTHENTICATED: u8 = 0xF3;
pub const NOT_AUTHENTICATED: u8 = 0xF4;
pub const IDENTIFY_CLIENT: u8 = 0xF5;
pub const CLIENT_IDENTIFIED: u8 = 0xF6;

/// Protocol version reported in `IdentifyClient`.
pub const CLIENT_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    HeartbeatRequest,
    HeartbeatResponse,
    BadRequest,
    NotHandled,
    Authenticate,
    Authenticated,
    NotAuthenticated,
    IdentifyClient,
    ClientIdentified,
}

impl Command {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            HEARTBEAT_REQUEST => Some(Command::HeartbeatRequest),
            HEARTBEAT_RESPONSE => Some(Command::HeartbeatResponse),
            BAD_REQUEST => Some(Command::BadRequest),
            NOT_HANDLED => Some(Command::NotHandled),
            AUTHENTICATE => Some(Command::Authenticate),
            AUTHENTICATED => Some(Command::Authenticated),
            NOT_AUTHENTICATED => Some(Command::NotAuthenticated),
            IDENTIFY_CLIENT => Some(Command::IdentifyClient),
            CLIENT_IDENTIFIED => Some(Command::ClientIdentified),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Command::HeartbeatRequest => HEARTBEAT_REQUEST,
            Command::HeartbeatResponse => HEARTBEAT_RESPONSE,
            Command::BadRequest => BAD_REQUEST,
            Command::NotHandled => NOT_HANDLED,
            Command::Authenticate => AUTHENTICATE,
            Command::Authenticated => AUTHENTICATED,
            Command::NotAuthenticated => NOT_AUTHENTICATED,
            Command::IdentifyClient => IDENTIFY_CLIENT,
            Command::ClientIdentified => CLIENT_IDENTIFIED,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::HeartbeatRequest => "HEARTBEAT_REQUEST",
            Command::HeartbeatResponse => "HEARTBEAT_RESPONSE",
            Command::BadRequest => "BAD_REQUEST",
            Command::NotHandled => "NOT_HANDLED",
            Command::Authenticate => "AUTHENTICATE",
            Command::Authenticated => "AUTHENTICATED",
            Command::NotAuthenticated => "NOT_AUTHENTICATED",
            Command::IdentifyClient => "IDENTIFY_CLIENT",
            Command::ClientIdentified => "CLIENT_IDENTIFIED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_roundtrip() {
        for raw in 0u8..=u8::MAX {
            if let Some(command) = Command::from_u8(raw) {
                assert_eq!(command.as_u8(), raw);
            }
        }
    }

    #[test]
    fn data_commands_are_unknown() {
        assert!(Command::from_u8(0xB0).is_none());
        assert!(Command::from_u8(0x00).is_none());
    }
}
