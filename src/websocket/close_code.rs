//! Gateway close codes and what each one means for reconnecting.

use std::fmt;

/// Close code this client sends when it wants the next connection to resume.
pub const RESUME_CLOSE_CODE: u16 = 4900;
/// Close code this client sends for a clean close; the server drops the session.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Close codes a gateway connection can end with, sent by the server or
/// generated locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// Clean close (1000).
    Normal,
    /// The peer went away (1001), typically a proxy restart.
    GoingAway,
    /// The socket dropped without a close frame (1006).
    Abnormal,
    UnknownError,
    UnknownOpcode,
    DecodeError,
    NotAuthenticated,
    AuthenticationFailed,
    AlreadyAuthenticated,
    SessionNoLongerValid,
    InvalidSequence,
    RateLimited,
    SessionTimeout,
    InvalidShard,
    ShardingRequired,
    InvalidApiVersion,
    InvalidIntents,
    DisallowedIntents,
    /// Local close asking for a resume on the next connection (4900).
    Resume,
    /// Anything not in the table. Treated as reconnectable.
    Unknown(u16),
}

impl CloseCode {
    /// Maps a raw code; never fails, unlisted codes become [`CloseCode::Unknown`].
    pub fn from_u16(value: u16) -> Self {
        match value {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1006 => Self::Abnormal,
            4000 => Self::UnknownError,
            4001 => Self::UnknownOpcode,
            4002 => Self::DecodeError,
            4003 => Self::NotAuthenticated,
            4004 => Self::AuthenticationFailed,
            4005 => Self::AlreadyAuthenticated,
            4006 => Self::SessionNoLongerValid,
            4007 => Self::InvalidSequence,
            4008 => Self::RateLimited,
            4009 => Self::SessionTimeout,
            4010 => Self::InvalidShard,
            4011 => Self::ShardingRequired,
            4012 => Self::InvalidApiVersion,
            4013 => Self::InvalidIntents,
            4014 => Self::DisallowedIntents,
            RESUME_CLOSE_CODE => Self::Resume,
            other => Self::Unknown(other),
        }
    }

    pub const fn as_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::Abnormal => 1006,
            Self::UnknownError => 4000,
            Self::UnknownOpcode => 4001,
            Self::DecodeError => 4002,
            Self::NotAuthenticated => 4003,
            Self::AuthenticationFailed => 4004,
            Self::AlreadyAuthenticated => 4005,
            Self::SessionNoLongerValid => 4006,
            Self::InvalidSequence => 4007,
            Self::RateLimited => 4008,
            Self::SessionTimeout => 4009,
            Self::InvalidShard => 4010,
            Self::ShardingRequired => 4011,
            Self::InvalidApiVersion => 4012,
            Self::InvalidIntents => 4013,
            Self::DisallowedIntents => 4014,
            Self::Resume => RESUME_CLOSE_CODE,
            Self::Unknown(code) => code,
        }
    }

    /// Whether a new connection may be attempted after this close.
    pub const fn should_reconnect(self) -> bool {
        !matches!(
            self,
            Self::AuthenticationFailed
                | Self::InvalidShard
                | Self::ShardingRequired
                | Self::InvalidApiVersion
                | Self::InvalidIntents
                | Self::DisallowedIntents
        )
    }

    /// Whether the stored session is gone and the next connection must identify.
    pub const fn invalidates_session(self) -> bool {
        matches!(
            self,
            Self::SessionNoLongerValid | Self::InvalidSequence | Self::SessionTimeout
        )
    }

    pub const fn is_authentication_failure(self) -> bool {
        matches!(self, Self::AuthenticationFailed)
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Normal => "Graceful close",
            Self::GoingAway => "Peer is going away",
            Self::Abnormal => "Connection dropped without a close frame",
            Self::UnknownError => "Unknown error occurred",
            Self::UnknownOpcode => "Invalid opcode sent",
            Self::DecodeError => "Invalid payload encoding",
            Self::NotAuthenticated => "Payload sent before identifying",
            Self::AuthenticationFailed => "Authentication failed",
            Self::AlreadyAuthenticated => "Identified more than once",
            Self::SessionNoLongerValid => "Session is no longer valid",
            Self::InvalidSequence => "Invalid sequence number for resume",
            Self::RateLimited => "Sending payloads too quickly",
            Self::SessionTimeout => "Session timed out",
            Self::InvalidShard => "Invalid shard configuration",
            Self::ShardingRequired => "Sharding is required",
            Self::InvalidApiVersion => "Invalid API version",
            Self::InvalidIntents => "Invalid intents",
            Self::DisallowedIntents => "Disallowed intents",
            Self::Resume => "Reconnecting to resume the session",
            Self::Unknown(_) => "Unknown close code",
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.as_u16())
    }
}

impl From<u16> for CloseCode {
    fn from(value: u16) -> Self {
        Self::from_u16(value)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.as_u16()
    }
}
