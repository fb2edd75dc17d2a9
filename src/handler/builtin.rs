//! Built-in handlers for the commands every gateway has to answer.
//!
//! These cover the protocol-mandated replies only. Anything that needs
//! business logic (storing locations, validating credentials against a
//! database, ...) is expected to be registered by the owning process.

use bytes::{BufMut, Bytes, BytesMut};

use super::Handler;
use crate::error::{GatewayError, Result};
use crate::protocol::{command, Message, ProtocolVersion};

/// Minimum registration body for the 2011/2013 layout.
const REGISTER_MIN_BODY_2013: usize = 25;

/// Minimum registration body for the 2019 layout.
const REGISTER_MIN_BODY_2019: usize = 76;

/// IMEI and software version trailing a 2019 authentication body.
const AUTH_TRAILER_2019: usize = 15 + 20;

/// Result byte of a general response.
const RESULT_SUCCESS: u8 = 0;
const RESULT_FAILURE: u8 = 1;

/// Handlers shipped with the gateway, one variant per command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinHandler {
    /// 0x0001, answered with 0x8001.
    GeneralRespond,
    /// 0x0002, answered with 0x8001.
    Heartbeat,
    /// 0x0100, answered with 0x8100 carrying the authentication code.
    Register,
    /// 0x0102, answered with 0x8001.
    Authentication,
    /// 0x0104, no reply.
    QueryParameterRespond,
    /// 0x0200, answered with 0x8001.
    LocationReport,
    /// 0x0704, answered with 0x8001.
    LocationBatchUpload,
    /// 0x1003, no reply.
    UploadAudioVideoAttr,
    /// 0x1205, no reply.
    UploadResourceList,
    /// 0x1206, no reply.
    FileUploadCompleteNotice,
    /// 0x8003 sent by the terminal; echoed by the reissue path.
    ReissueSubPackage,
}

impl BuiltinHandler {
    /// Every built-in handler.
    pub const ALL: [BuiltinHandler; 11] = [
        BuiltinHandler::GeneralRespond,
        BuiltinHandler::Heartbeat,
        BuiltinHandler::Register,
        BuiltinHandler::Authentication,
        BuiltinHandler::QueryParameterRespond,
        BuiltinHandler::LocationReport,
        BuiltinHandler::LocationBatchUpload,
        BuiltinHandler::UploadAudioVideoAttr,
        BuiltinHandler::UploadResourceList,
        BuiltinHandler::FileUploadCompleteNotice,
        BuiltinHandler::ReissueSubPackage,
    ];

    /// Command id this handler is registered under.
    pub fn command(self) -> u16 {
        match self {
            BuiltinHandler::GeneralRespond => command::T0001_GENERAL_RESPOND,
            BuiltinHandler::Heartbeat => command::T0002_HEARTBEAT,
            BuiltinHandler::Register => command::T0100_REGISTER,
            BuiltinHandler::Authentication => command::T0102_AUTHENTICATION,
            BuiltinHandler::QueryParameterRespond => command::T0104_QUERY_PARAMETER,
            BuiltinHandler::LocationReport => command::T0200_LOCATION_REPORT,
            BuiltinHandler::LocationBatchUpload => command::T0704_LOCATION_BATCH_UPLOAD,
            BuiltinHandler::UploadAudioVideoAttr => command::T1003_UPLOAD_AUDIO_VIDEO_ATTR,
            BuiltinHandler::UploadResourceList => command::T1205_UPLOAD_RESOURCE_LIST,
            BuiltinHandler::FileUploadCompleteNotice => {
                command::T1206_FILE_UPLOAD_COMPLETE_NOTICE
            }
            BuiltinHandler::ReissueSubPackage => command::P8003_REISSUE_SUB_PACKAGE,
        }
    }
}

impl Handler for BuiltinHandler {
    fn has_reply(&self) -> bool {
        matches!(
            self,
            BuiltinHandler::GeneralRespond
                | BuiltinHandler::Heartbeat
                | BuiltinHandler::Register
                | BuiltinHandler::Authentication
                | BuiltinHandler::LocationReport
                | BuiltinHandler::LocationBatchUpload
        )
    }

    fn reply_body(&self, msg: &Message) -> Result<Bytes> {
        match self {
            BuiltinHandler::Register => register_reply(msg),
            BuiltinHandler::Authentication => {
                let result = if authentication_code(msg)? == msg.header.short_phone().as_bytes() {
                    RESULT_SUCCESS
                } else {
                    RESULT_FAILURE
                };
                Ok(general_respond(msg, result))
            }
            BuiltinHandler::ReissueSubPackage => Ok(msg.body.clone()),
            _ => Ok(general_respond(msg, RESULT_SUCCESS)),
        }
    }

    fn reply_protocol(&self) -> u16 {
        match self {
            BuiltinHandler::Register => command::P8100_REGISTER_RESPOND,
            BuiltinHandler::ReissueSubPackage => command::P8003_REISSUE_SUB_PACKAGE,
            BuiltinHandler::QueryParameterRespond
            | BuiltinHandler::UploadAudioVideoAttr
            | BuiltinHandler::UploadResourceList
            | BuiltinHandler::FileUploadCompleteNotice => 0,
            _ => command::P8001_GENERAL_RESPOND,
        }
    }
}

/// 0x8001 body: terminal serial, terminal command, result.
pub fn general_respond(msg: &Message, result: u8) -> Bytes {
    let mut body = BytesMut::with_capacity(5);
    body.put_u16(msg.header.serial_number);
    body.put_u16(msg.header.msg_id);
    body.put_u8(result);
    body.freeze()
}

/// 0x8100 body: terminal serial, result, authentication code.
fn register_reply(msg: &Message) -> Result<Bytes> {
    let min = match msg.header.version() {
        ProtocolVersion::V2013 => REGISTER_MIN_BODY_2013,
        ProtocolVersion::V2019 => REGISTER_MIN_BODY_2019,
    };
    if msg.body.len() < min {
        return Err(GatewayError::BodyLengthInconsistency(format!(
            "registration body of {} bytes, expected at least {}",
            msg.body.len(),
            min
        )));
    }

    let code = msg.header.short_phone().as_bytes();
    let mut body = BytesMut::with_capacity(3 + code.len());
    body.put_u16(msg.header.serial_number);
    body.put_u8(RESULT_SUCCESS);
    body.put_slice(code);
    Ok(body.freeze())
}

/// Extract the authentication code from a 0x0102 body.
fn authentication_code(msg: &Message) -> Result<&[u8]> {
    let body = msg.body();
    match msg.header.version() {
        ProtocolVersion::V2013 => {
            if body.is_empty() {
                return Err(GatewayError::BodyLengthInconsistency(
                    "authentication body is empty".to_string(),
                ));
            }
            Ok(body)
        }
        ProtocolVersion::V2019 => {
            let code_len = *body.first().ok_or_else(|| {
                GatewayError::BodyLengthInconsistency("authentication body is empty".to_string())
            })? as usize;
            let expected = 1 + code_len + AUTH_TRAILER_2019;
            if body.len() != expected {
                return Err(GatewayError::BodyLengthInconsistency(format!(
                    "authentication body of {} bytes, expected {}",
                    body.len(),
                    expected
                )));
            }
            Ok(&body[1..1 + code_len])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::protocol::FrameBuffer;

    fn decode(frame_hex: &str) -> Message {
        let raw = hex::decode(frame_hex).unwrap();
        FrameBuffer::new().push(&raw).unwrap().remove(0)
    }

    /// Encode the reply the way the writer does, with platform serial 0.
    fn reply(handler: BuiltinHandler, frame_hex: &str) -> Option<String> {
        let msg = decode(frame_hex);
        if !handler.has_reply() {
            return None;
        }
        let body = handler.reply_body(&msg).unwrap();
        let mut header = msg.header.clone();
        header.reply_id = handler.reply_protocol();
        header.platform_serial_number = 0;
        Some(hex::encode(header.encode(&body).unwrap()))
    }

    #[test]
    fn test_heartbeat_reply() {
        assert_eq!(
            reply(BuiltinHandler::Heartbeat, "7e000200000123456789017fff0a7e").unwrap(),
            "7e8001000501234567890100007fff0002008e7e"
        );
        assert_eq!(
            reply(
                BuiltinHandler::Heartbeat,
                "7e000240000100000000017299841738ffff027e"
            )
            .unwrap(),
            "7e8001400501000000000172998417380000ffff000200867e"
        );
    }

    #[test]
    fn test_general_respond_reply() {
        assert_eq!(
            reply(
                BuiltinHandler::GeneralRespond,
                "7e000100050123456789017fff007b01c803bd7e"
            )
            .unwrap(),
            "7e8001000501234567890100007fff0001008d7e"
        );
    }

    #[test]
    fn test_register_reply_all_revisions() {
        let cases = [
            (
                "7e010000200123456789010000001f007363640000007777772e3830382e3736353433323101b2e24131323334a17e",
                "7e8100000e01234567890100000000003132333435363738393031377e",
            ),
            (
                "7e0100002c0123456789010000001f007363640000007777772e3830382e636f6d0000000000000000003736353433323101b2e24131323334cc7e",
                "7e8100000e01234567890100000000003132333435363738393031377e",
            ),
            (
                "7e0100405301000000000172998417380000001f007363640000000000000000007777772e3830382e636f6d0000000000000000000000000000000000000037363534333231000000000000000000000000000000000000000000000001b2e241313233343b7e",
                "7e8100400e010000000001729984173800000000003137323939383431373338ba7e",
            ),
        ];

        for (input, expected) in cases {
            assert_eq!(reply(BuiltinHandler::Register, input).unwrap(), expected);
        }
    }

    #[test]
    fn test_authentication_reply() {
        // 2013: code does not match the phone, result 1
        assert_eq!(
            reply(
                BuiltinHandler::Authentication,
                "7e0102000b01234567890100003137323939383431373338b57e"
            )
            .unwrap(),
            "7e80010005012345678901000000000102010e7e"
        );
        // 2019: code matches the phone, result 0
        assert_eq!(
            reply(
                BuiltinHandler::Authentication,
                "7e0102402f010000000001729984173800000b3137323939383431373338313233343536373839303132333435332e372e31350000000000000000000000000000227e"
            )
            .unwrap(),
            "7e80014005010000000001729984173800000000010200877e"
        );
    }

    #[test]
    fn test_authentication_empty_body() {
        let mut msg = decode(
            "7e0102402f010000000001729984173800000b3137323939383431373338313233343536373839303132333435332e372e31350000000000000000000000000000227e",
        );
        msg.body = Bytes::new();

        let err = BuiltinHandler::Authentication.reply_body(&msg).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BodyLengthInconsistency);
    }

    #[test]
    fn test_register_short_body() {
        let mut msg = decode(
            "7e010000200123456789010000001f007363640000007777772e3830382e3736353433323101b2e24131323334a17e",
        );
        msg.body = msg.body.slice(..10);

        let err = BuiltinHandler::Register.reply_body(&msg).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BodyLengthInconsistency);
    }

    #[test]
    fn test_location_replies() {
        assert_eq!(
            reply(
                BuiltinHandler::LocationReport,
                "7e0200407c0100000000017299841738ffff000004000000080006eeb6ad02633df701380003006320070719235901040000000b02020016030200210402002c051e3737370000000000000000000000000000000000000000000000000000001105420000004212064d0000004d4d1307000000580058582504000000632a02000a2b040000001430011e310128637e"
            )
            .unwrap(),
            "7e8001400501000000000172998417380000ffff020000867e"
        );
        assert_eq!(
            reply(
                BuiltinHandler::LocationBatchUpload,
                "7e0704005d0123456789017fff000301001c000004000000080006eeb6ad02633df7013800030063200707192359001c000004000000080006eeb6ad02633df7013800030063200707192359001c000004000000080006eeb6ad02633df7013800030063200707192359067e"
            )
            .unwrap(),
            "7e8001000501234567890100007fff0704008f7e"
        );
    }

    #[test]
    fn test_no_reply_handlers() {
        assert!(reply(
            BuiltinHandler::FileUploadCompleteNotice,
            "7e120640030112345678901234567890ffff1b8a01c67e"
        )
        .is_none());
        assert!(!BuiltinHandler::QueryParameterRespond.has_reply());
        assert!(!BuiltinHandler::UploadAudioVideoAttr.has_reply());
        assert!(!BuiltinHandler::UploadResourceList.has_reply());
        assert!(!BuiltinHandler::ReissueSubPackage.has_reply());
    }

    #[test]
    fn test_commands_are_unique() {
        let mut commands: Vec<u16> = BuiltinHandler::ALL.iter().map(|h| h.command()).collect();
        commands.sort_unstable();
        commands.dedup();
        assert_eq!(commands.len(), BuiltinHandler::ALL.len());
    }
}
