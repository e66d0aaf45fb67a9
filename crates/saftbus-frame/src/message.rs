use std::fmt;

use crate::error::FrameError;

/// Message types carried in the frame header.
///
/// Codes are part of the wire format and must not be renumbered.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    MethodCall = 0,
    MethodReply = 1,
    Signal = 2,
    /// Register a signal pipe; the pipe's write end rides along as `SCM_RIGHTS`.
    SignalFd = 3,
    SignalRemoveFd = 4,
    SignalFlightTime = 5,
    GetState = 6,
    Status = 7,
    EnableStats = 8,
    DisableStats = 9,
    EnableLogging = 10,
    DisableLogging = 11,
    GetStats = 12,
    /// First frame from the server on every accepted connection.
    Hello = 13,
    RemoveObject = 14,
    LoadPlugin = 15,
    Quit = 16,
}

impl MessageType {
    /// Wire code of this message type.
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::MethodCall => "METHOD_CALL",
            MessageType::MethodReply => "METHOD_REPLY",
            MessageType::Signal => "SIGNAL",
            MessageType::SignalFd => "SIGNAL_FD",
            MessageType::SignalRemoveFd => "SIGNAL_REMOVE_FD",
            MessageType::SignalFlightTime => "SIGNAL_FLIGHT_TIME",
            MessageType::GetState => "GET_STATE",
            MessageType::Status => "STATUS",
            MessageType::EnableStats => "ENABLE_STATS",
            MessageType::DisableStats => "DISABLE_STATS",
            MessageType::EnableLogging => "ENABLE_LOGGING",
            MessageType::DisableLogging => "DISABLE_LOGGING",
            MessageType::GetStats => "GET_STATS",
            MessageType::Hello => "HELLO",
            MessageType::RemoveObject => "REMOVE_OBJECT",
            MessageType::LoadPlugin => "LOAD_PLUGIN",
            MessageType::Quit => "QUIT",
        }
    }
}

impl TryFrom<u32> for MessageType {
    type Error = FrameError;

    fn try_from(code: u32) -> Result<Self, FrameError> {
        Ok(match code {
            0 => MessageType::MethodCall,
            1 => MessageType::MethodReply,
            2 => MessageType::Signal,
            3 => MessageType::SignalFd,
            4 => MessageType::SignalRemoveFd,
            5 => MessageType::SignalFlightTime,
            6 => MessageType::GetState,
            7 => MessageType::Status,
            8 => MessageType::EnableStats,
            9 => MessageType::DisableStats,
            10 => MessageType::EnableLogging,
            11 => MessageType::DisableLogging,
            12 => MessageType::GetStats,
            13 => MessageType::Hello,
            14 => MessageType::RemoveObject,
            15 => MessageType::LoadPlugin,
            16 => MessageType::Quit,
            other => return Err(FrameError::UnknownMessageType(other)),
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
