//! Function and error codes

use crate::ProtocolError;

/// Function code carried in byte 4 of every header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FuncCode {
    Heartbeat = 0x00,
    Login = 0x01,
    Proxy = 0x02,
    GetProxies = 0x03,
    /// Server push to the destination of a new channel
    Access = 0x04,
    /// Server push when a channel goes away
    StopProxy = 0x05,
}

impl FuncCode {
    /// Short name used in logs
    pub fn name(self) -> &'static str {
        match self {
            FuncCode::Heartbeat => "HEARTB",
            FuncCode::Login => "LOGIN",
            FuncCode::Proxy => "PROXY",
            FuncCode::GetProxies => "GETPROXIES",
            FuncCode::Access => "ACCESS",
            FuncCode::StopProxy => "STOPPROXY",
        }
    }
}

impl TryFrom<u8> for FuncCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FuncCode::Heartbeat),
            0x01 => Ok(FuncCode::Login),
            0x02 => Ok(FuncCode::Proxy),
            0x03 => Ok(FuncCode::GetProxies),
            0x04 => Ok(FuncCode::Access),
            0x05 => Ok(FuncCode::StopProxy),
            other => Err(ProtocolError::UnknownFunction(other)),
        }
    }
}

/// Single-byte result code in LOGIN and PROXY responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Success = 0x00,
    RepeatLogin = 0x01,
    NotLoggedIn = 0x02,
    NotFound = 0x03,
    Forbidden = 0x04,
    Unavailable = 0x05,
    Failed = 0xFF,
}

impl ErrorCode {
    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }
}

impl From<u8> for ErrorCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => ErrorCode::Success,
            0x01 => ErrorCode::RepeatLogin,
            0x02 => ErrorCode::NotLoggedIn,
            0x03 => ErrorCode::NotFound,
            0x04 => ErrorCode::Forbidden,
            0x05 => ErrorCode::Unavailable,
            _ => ErrorCode::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_func_code_values() {
        for code in 0u8..=5 {
            let func = FuncCode::try_from(code).unwrap();
            assert_eq!(func as u8, code);
        }
        assert_eq!(
            FuncCode::try_from(0x42),
            Err(ProtocolError::UnknownFunction(0x42))
        );
    }

    #[test]
    fn test_unknown_error_code_maps_to_failed() {
        assert_eq!(ErrorCode::from(0x77), ErrorCode::Failed);
        assert!(ErrorCode::from(0).is_success());
    }
}
