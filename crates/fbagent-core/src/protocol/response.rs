//! Response encoding and parsing.
//!
//! Every response is a 4-byte code followed by ASCII text. Encoding is
//! bounds-checked: a response that does not fit in its frame is an error,
//! never a truncated frame.

use std::fmt;

use super::ProtocolError;
use super::constants::*;

/// Response code sent to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Okay,
    Fail,
    Info,
    Data,
}

impl ResponseCode {
    pub fn as_bytes(&self) -> &'static [u8; 4] {
        match self {
            ResponseCode::Okay => RESPONSE_OKAY,
            ResponseCode::Fail => RESPONSE_FAIL,
            ResponseCode::Info => RESPONSE_INFO,
            ResponseCode::Data => RESPONSE_DATA,
        }
    }

    /// Largest encoded frame allowed for this code.
    pub fn max_len(&self) -> usize {
        match self {
            ResponseCode::Info => MAX_INFO_RESPONSE_SIZE,
            _ => MAX_RESPONSE_SIZE,
        }
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"OKAY" => Some(ResponseCode::Okay),
            b"FAIL" => Some(ResponseCode::Fail),
            b"INFO" => Some(ResponseCode::Info),
            b"DATA" => Some(ResponseCode::Data),
            _ => None,
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // as_bytes() is always ASCII
        write!(f, "{}", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// A single response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: ResponseCode,
    pub text: String,
}

impl Response {
    pub fn okay(text: impl Into<String>) -> Self {
        Self {
            code: ResponseCode::Okay,
            text: text.into(),
        }
    }

    pub fn fail(text: impl Into<String>) -> Self {
        Self {
            code: ResponseCode::Fail,
            text: text.into(),
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self {
            code: ResponseCode::Info,
            text: text.into(),
        }
    }

    /// `DATA` followed by the length as exactly 8 hex digits.
    pub fn data(len: u32) -> Self {
        Self {
            code: ResponseCode::Data,
            text: format!("{len:08x}"),
        }
    }

    /// Encode into a wire frame.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let len = RESPONSE_CODE_LEN + self.text.len();
        let max = self.code.max_len();
        if len > max {
            return Err(ProtocolError::ResponseTooLong { len, max });
        }
        let mut frame = Vec::with_capacity(len);
        frame.extend_from_slice(self.code.as_bytes());
        frame.extend_from_slice(self.text.as_bytes());
        Ok(frame)
    }

    /// Parse a frame as the host would see it.
    pub fn parse(frame: &[u8]) -> Result<Self, ProtocolError> {
        if frame.len() < RESPONSE_CODE_LEN {
            return Err(ProtocolError::MalformedFrame(format!(
                "response of {} bytes",
                frame.len()
            )));
        }
        let code = ResponseCode::from_bytes(&frame[..RESPONSE_CODE_LEN]).ok_or_else(|| {
            ProtocolError::MalformedFrame(String::from_utf8_lossy(frame).into_owned())
        })?;
        Ok(Self {
            code,
            text: String::from_utf8_lossy(&frame[RESPONSE_CODE_LEN..]).into_owned(),
        })
    }

    pub fn is_okay(&self) -> bool {
        self.code == ResponseCode::Okay
    }

    pub fn is_fail(&self) -> bool {
        self.code == ResponseCode::Fail
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.code, self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_okay_encoding() {
        assert_eq!(Response::okay("2.0").encode().unwrap(), b"OKAY2.0");
        assert_eq!(Response::okay("").encode().unwrap(), b"OKAY");
    }

    #[test]
    fn test_data_is_eight_hex_digits() {
        assert_eq!(Response::data(0x1000).encode().unwrap(), b"DATA00001000");
        assert_eq!(Response::data(u32::MAX).encode().unwrap(), b"DATAffffffff");
    }

    #[test]
    fn test_response_limit() {
        let fits = "x".repeat(MAX_RESPONSE_SIZE - RESPONSE_CODE_LEN);
        assert_eq!(Response::fail(fits.clone()).encode().unwrap().len(), 64);

        let too_long = format!("{fits}y");
        let err = Response::fail(too_long.clone()).encode().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ResponseTooLong { len: 65, max: 64 }
        ));

        // INFO gets one extra byte
        assert_eq!(Response::info(too_long).encode().unwrap().len(), 65);
    }

    #[test]
    fn test_parse() {
        let resp = Response::parse(b"FAILunknown command").unwrap();
        assert!(resp.is_fail());
        assert_eq!(resp.text, "unknown command");
        assert!(Response::parse(b"OK").is_err());
        assert!(Response::parse(b"NOPEabc").is_err());
    }
}
