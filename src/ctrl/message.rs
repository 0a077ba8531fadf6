use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rustc_hash::FxHashMap;

use crate::error::XgressError;
use crate::util::buf::{put_bool, put_string, try_get_bool, try_get_string};

pub const CONTENT_TYPE_SESSION_REQUEST: i32 = 1010;
pub const CONTENT_TYPE_SESSION_SUCCESS: i32 = 1011;
pub const CONTENT_TYPE_SESSION_FAILED: i32 = 1012;
pub const CONTENT_TYPE_START_XGRESS: i32 = 1013;
pub const CONTENT_TYPE_BIND_REQUEST: i32 = 1020;
pub const CONTENT_TYPE_BIND_RESPONSE: i32 = 1021;

/// Header of a session success reply, containing the fabric address of the new session
pub const HEADER_SESSION_SUCCESS_ADDRESS: i32 = 1100;

/// A message on the control channel. Framing and sequence numbering is the channel's business.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct CtrlMessage {
    pub content_type: i32,
    pub sequence: i32,
    /// the sequence number of the message this is a reply to
    pub reply_for: Option<i32>,
    pub headers: FxHashMap<i32, Bytes>,
    pub body: Bytes,
}
impl CtrlMessage {
    pub fn new(content_type: i32, body: Bytes) -> CtrlMessage {
        CtrlMessage {
            content_type,
            body,
            ..Default::default()
        }
    }

    pub fn reply_to(&mut self, other: &CtrlMessage) {
        self.reply_for = Some(other.sequence);
    }

    pub fn with_header(mut self, key: i32, value: Bytes) -> CtrlMessage {
        self.headers.insert(key, value);
        self
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SessionRequest {
    pub ingress_id: String,
    pub service_id: String,
}
impl SessionRequest {
    pub fn ser(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.ingress_id);
        put_string(&mut buf, &self.service_id);
        buf.freeze()
    }

    pub fn try_deser(mut buf: &[u8]) -> anyhow::Result<SessionRequest> {
        let ingress_id = try_get_string(&mut buf)?;
        let service_id = try_get_string(&mut buf)?;
        ensure_consumed(buf)?;
        Ok(SessionRequest { ingress_id, service_id })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum BindType {
    Bind = 0,
    Unbind = 1,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BindRequest {
    pub bind_type: BindType,
    pub token: String,
    pub service_id: String,
}
impl BindRequest {
    pub fn ser(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.bind_type.into());
        put_string(&mut buf, &self.token);
        put_string(&mut buf, &self.service_id);
        buf.freeze()
    }

    pub fn try_deser(mut buf: &[u8]) -> anyhow::Result<BindRequest> {
        if !buf.has_remaining() {
            bail!(XgressError::MalformedMessage("empty bind request".to_string()));
        }
        let bind_type = BindType::try_from(buf.get_u8())?;
        let token = try_get_string(&mut buf)?;
        let service_id = try_get_string(&mut buf)?;
        ensure_consumed(buf)?;
        Ok(BindRequest { bind_type, token, service_id })
    }
}

/// The reply to both bind and unbind requests
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BindResponse {
    pub success: bool,
    pub message: String,
}
impl BindResponse {
    pub fn ser(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_bool(&mut buf, self.success);
        put_string(&mut buf, &self.message);
        buf.freeze()
    }

    pub fn try_deser(mut buf: &[u8]) -> anyhow::Result<BindResponse> {
        let success = try_get_bool(&mut buf)?;
        let message = try_get_string(&mut buf)?;
        ensure_consumed(buf)?;
        Ok(BindResponse { success, message })
    }
}

fn ensure_consumed(buf: &[u8]) -> anyhow::Result<()> {
    if !buf.is_empty() {
        bail!(XgressError::MalformedMessage(format!("{} trailing bytes", buf.len())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::regular(SessionRequest { ingress_id: "ingress".to_string(), service_id: "svc".to_string() }, vec![7, b'i',b'n',b'g',b'r',b'e',b's',b's', 3, b's',b'v',b'c'])]
    #[case::empty(SessionRequest { ingress_id: "".to_string(), service_id: "".to_string() }, vec![0, 0])]
    fn test_session_request(#[case] request: SessionRequest, #[case] expected: Vec<u8>) {
        let buf = request.ser();
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(SessionRequest::try_deser(&buf).unwrap(), request);
    }

    #[rstest]
    #[case::bind(BindType::Bind, vec![0, 1, b't', 1, b's'])]
    #[case::unbind(BindType::Unbind, vec![1, 1, b't', 1, b's'])]
    fn test_bind_request(#[case] bind_type: BindType, #[case] expected: Vec<u8>) {
        let request = BindRequest { bind_type, token: "t".to_string(), service_id: "s".to_string() };
        let buf = request.ser();
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(BindRequest::try_deser(&buf).unwrap(), request);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::invalid_bind_type(vec![2, 1, b't', 1, b's'])]
    #[case::truncated(vec![0, 1, b't', 3, b's'])]
    #[case::trailing(vec![0, 1, b't', 1, b's', 0])]
    fn test_bind_request_invalid(#[case] raw: Vec<u8>) {
        assert!(BindRequest::try_deser(&raw).is_err());
    }

    #[rstest]
    #[case::success(true, "", vec![1, 0])]
    #[case::failure(false, "no", vec![0, 2, b'n', b'o'])]
    fn test_bind_response(#[case] success: bool, #[case] message: &str, #[case] expected: Vec<u8>) {
        let response = BindResponse { success, message: message.to_string() };
        let buf = response.ser();
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(BindResponse::try_deser(&buf).unwrap(), response);
    }

    #[test]
    fn test_reply_to() {
        let mut request = CtrlMessage::new(CONTENT_TYPE_SESSION_SUCCESS, Bytes::from_static(b"token"));
        request.sequence = 17;

        let mut reply = CtrlMessage::new(CONTENT_TYPE_START_XGRESS, Bytes::new());
        assert_eq!(reply.reply_for, None);
        reply.reply_to(&request);
        assert_eq!(reply.reply_for, Some(17));
    }
}
