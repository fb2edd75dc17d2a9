//! Command (message id) constants.
//!
//! `T` prefixes are terminal-originated, `P` prefixes platform-originated.

/// Terminal general response.
pub const T0001_GENERAL_RESPOND: u16 = 0x0001;
/// Terminal heartbeat.
pub const T0002_HEARTBEAT: u16 = 0x0002;
/// Terminal registration.
pub const T0100_REGISTER: u16 = 0x0100;
/// Terminal authentication.
pub const T0102_AUTHENTICATION: u16 = 0x0102;
/// Response to a parameter query.
pub const T0104_QUERY_PARAMETER: u16 = 0x0104;
/// Location report.
pub const T0200_LOCATION_REPORT: u16 = 0x0200;
/// Batch location upload.
pub const T0704_LOCATION_BATCH_UPLOAD: u16 = 0x0704;
/// Upload audio/video attributes.
pub const T1003_UPLOAD_AUDIO_VIDEO_ATTR: u16 = 0x1003;
/// Upload audio/video resource list.
pub const T1205_UPLOAD_RESOURCE_LIST: u16 = 0x1205;
/// File upload complete notice.
pub const T1206_FILE_UPLOAD_COMPLETE_NOTICE: u16 = 0x1206;

/// Platform general response.
pub const P8001_GENERAL_RESPOND: u16 = 0x8001;
/// Reissue sub-package request.
pub const P8003_REISSUE_SUB_PACKAGE: u16 = 0x8003;
/// Registration response.
pub const P8100_REGISTER_RESPOND: u16 = 0x8100;
/// Query terminal parameters.
pub const P8104_QUERY_PARAMETER: u16 = 0x8104;
/// Query audio/video attributes.
pub const P9003_QUERY_AUDIO_VIDEO_ATTR: u16 = 0x9003;
/// Query resource list.
pub const P9205_QUERY_RESOURCE_LIST: u16 = 0x9205;
/// File upload instruction.
pub const P9206_FILE_UPLOAD: u16 = 0x9206;
