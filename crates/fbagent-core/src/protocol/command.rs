//! Command frame decoding.

use super::ProtocolError;
use super::constants::COMMAND_FRAME_SIZE;

/// Decode a received command frame into the command line.
///
/// The frame is terminated at its received length or at the first NUL,
/// whichever comes first.
pub fn decode_frame(frame: &[u8]) -> Result<String, ProtocolError> {
    if frame.len() > COMMAND_FRAME_SIZE {
        return Err(ProtocolError::MalformedFrame(format!(
            "command frame of {} bytes",
            frame.len()
        )));
    }
    let end = frame.iter().position(|&b| b == 0).unwrap_or(frame.len());
    std::str::from_utf8(&frame[..end])
        .map(str::to_owned)
        .map_err(|_| ProtocolError::MalformedFrame("command is not valid UTF-8".into()))
}

/// Parse the argument of `download:<hex-length>`.
pub fn parse_download_length(arg: &str) -> Result<u32, ProtocolError> {
    let digits = arg.trim();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);
    if digits.is_empty() || digits.len() > 8 {
        return Err(ProtocolError::InvalidArgument(format!(
            "bad download length '{arg}'"
        )));
    }
    u32::from_str_radix(digits, 16)
        .map_err(|_| ProtocolError::InvalidArgument(format!("bad download length '{arg}'")))
}

/// Split an `oem` command line into whitespace-separated arguments.
pub fn split_oem_args(line: &str) -> Vec<&str> {
    line.split([' ', '\t']).filter(|s| !s.is_empty()).collect()
}
