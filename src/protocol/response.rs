//! Response headers, result codes and argument decoding.

use std::fmt;

use bytes::{Buf, Bytes};
use tracing::warn;

use crate::error::{AppResult, DaqError};
use crate::protocol::{CommandId, Ticket};

/// Code placed on a response whose parameters could not be decoded.
/// Error severity, outside the range the library itself returns.
pub const RESPONSE_DECODE_FAILED: i32 = 0xC000_0F01_u32 as i32;

// ===== Flags =====

/// Response flag bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseFlags(pub u32);

impl ResponseFlags {
    /// The response answers a query.
    pub const QUERY: u32 = 0x0001;
    /// Unsolicited update pushed by the device.
    pub const UPDATE: u32 = 0x2000;
    /// The device attached a warning.
    pub const WARNING: u32 = 0x4000;
    /// The command failed.
    pub const ERROR: u32 = 0x8000;

    /// Whether `bit` is set.
    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    /// Whether [`Self::QUERY`] is set.
    pub fn is_query(self) -> bool {
        self.contains(Self::QUERY)
    }

    /// Whether [`Self::UPDATE`] is set.
    pub fn is_update(self) -> bool {
        self.contains(Self::UPDATE)
    }

    /// Whether [`Self::WARNING`] is set.
    pub fn is_warning(self) -> bool {
        self.contains(Self::WARNING)
    }

    /// Whether [`Self::ERROR`] is set.
    pub fn is_error(self) -> bool {
        self.contains(Self::ERROR)
    }
}

// ===== Result codes =====

/// Severity encoded in the top two bits of a result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Top bits `00`.
    Success,
    /// Top bits `01`.
    Information,
    /// Top bits `10`.
    Warning,
    /// Top bits `11`.
    Error,
}

/// Library result code. Negative means warning or error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCode(pub i32);

impl ResultCode {
    /// Severity from the top two bits.
    pub fn severity(self) -> Severity {
        match (self.0 as u32) >> 30 {
            0 => Severity::Success,
            1 => Severity::Information,
            2 => Severity::Warning,
            _ => Severity::Error,
        }
    }

    /// Non-negative: success or information.
    pub fn is_ok(self) -> bool {
        self.0 >= 0
    }

    /// Severity is [`Severity::Success`].
    pub fn is_success(self) -> bool {
        self.severity() == Severity::Success
    }

    /// Severity is [`Severity::Information`].
    pub fn is_info(self) -> bool {
        self.severity() == Severity::Information
    }

    /// Severity is [`Severity::Warning`].
    pub fn is_warning(self) -> bool {
        self.severity() == Severity::Warning
    }

    /// Severity is [`Severity::Error`].
    pub fn is_error(self) -> bool {
        self.severity() == Severity::Error
    }
}

// ===== Raw response =====

/// Declared type of one response parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// 32-bit signed integer.
    Integer,
    /// 32-bit float.
    Float,
    /// NUL-terminated text.
    String,
    /// Opaque bytes.
    ByteArray,
    /// Packed 32-bit integers.
    IntegerArray,
    /// Packed 32-bit floats.
    FloatArray,
}

impl ParamType {
    /// Wire tag of this type.
    pub const fn tag(self) -> u8 {
        match self {
            ParamType::Integer => 0,
            ParamType::Float => 1,
            ParamType::String => 2,
            ParamType::ByteArray => 4,
            ParamType::IntegerArray => 254,
            ParamType::FloatArray => 255,
        }
    }

    /// Type for a wire tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => ParamType::Integer,
            1 => ParamType::Float,
            2 => ParamType::String,
            4 => ParamType::ByteArray,
            254 => ParamType::IntegerArray,
            255 => ParamType::FloatArray,
            _ => return None,
        })
    }
}

/// One undecoded parameter: type tag plus little-endian payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RawParam {
    /// Wire type tag, see [`ParamType`].
    pub tag: u8,
    /// Little-endian payload.
    pub payload: Bytes,
}

impl RawParam {
    /// Integer parameter.
    pub fn int(v: i32) -> Self {
        Self {
            tag: ParamType::Integer.tag(),
            payload: Bytes::copy_from_slice(&v.to_le_bytes()),
        }
    }

    /// Float parameter.
    pub fn float(v: f32) -> Self {
        Self {
            tag: ParamType::Float.tag(),
            payload: Bytes::copy_from_slice(&v.to_le_bytes()),
        }
    }

    /// Text parameter.
    pub fn string(v: &str) -> Self {
        Self {
            tag: ParamType::String.tag(),
            payload: Bytes::copy_from_slice(v.as_bytes()),
        }
    }

    /// Byte array parameter.
    pub fn bytes(v: Bytes) -> Self {
        Self {
            tag: ParamType::ByteArray.tag(),
            payload: v,
        }
    }

    /// Integer array parameter.
    pub fn int_array(v: &[i32]) -> Self {
        Self {
            tag: ParamType::IntegerArray.tag(),
            payload: v.iter().flat_map(|i| i.to_le_bytes()).collect(),
        }
    }

    /// Float array parameter.
    pub fn float_array(v: &[f32]) -> Self {
        Self {
            tag: ParamType::FloatArray.tag(),
            payload: v.iter().flat_map(|f| f.to_le_bytes()).collect(),
        }
    }
}

/// Response as delivered by the driver: header plus undecoded parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    /// Command the response belongs to.
    pub command_id: CommandId,
    /// Ticket of the request; 0 when unsolicited.
    pub ticket: Ticket,
    /// Header flags.
    pub flags: ResponseFlags,
    /// Parameter count declared in the header.
    pub param_count: usize,
    /// Library result code; negative on failure.
    pub error_code: i32,
    /// Parameters in wire order.
    pub params: Vec<RawParam>,
}

impl RawResponse {
    /// Successful response whose declared count matches its parameters.
    pub fn ok(command_id: CommandId, ticket: Ticket, params: Vec<RawParam>) -> Self {
        Self {
            command_id,
            ticket,
            flags: ResponseFlags::default(),
            param_count: params.len(),
            error_code: 0,
            params,
        }
    }

    /// Failed response carrying `error_code`.
    pub fn failed(command_id: CommandId, ticket: Ticket, error_code: i32) -> Self {
        Self {
            command_id,
            ticket,
            flags: ResponseFlags(ResponseFlags::ERROR),
            param_count: 0,
            error_code,
            params: Vec::new(),
        }
    }
}

// ===== Decoded response =====

/// Decoded response parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseArg {
    /// Integer.
    Int(i32),
    /// Float, widened.
    Float(f64),
    /// Text without its terminator.
    Text(String),
    /// Opaque bytes.
    Bytes(Bytes),
    /// Integer array.
    IntArray(Vec<i32>),
    /// Float array, widened.
    FloatArray(Vec<f64>),
}

impl ResponseArg {
    /// Numeric value as `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ResponseArg::Int(i) => Some(f64::from(*i)),
            ResponseArg::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Numeric value as `i64`; floats are rounded.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ResponseArg::Int(i) => Some(i64::from(*i)),
            ResponseArg::Float(f) => Some(f.round() as i64),
            _ => None,
        }
    }

    /// Text value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ResponseArg::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer list view of an array, or of a single integer.
    pub fn as_int_list(&self) -> Option<Vec<i32>> {
        match self {
            ResponseArg::Int(i) => Some(vec![*i]),
            ResponseArg::IntArray(v) => Some(v.clone()),
            _ => None,
        }
    }
}

fn decode_param(param: &RawParam) -> Result<ResponseArg, String> {
    let kind = ParamType::from_tag(param.tag)
        .ok_or_else(|| format!("unknown parameter type tag {}", param.tag))?;
    let mut buf = param.payload.clone();
    let need = |buf: &Bytes, n: usize| {
        if buf.remaining() < n {
            Err(format!("{kind:?} parameter truncated ({} bytes)", buf.len()))
        } else {
            Ok(())
        }
    };
    Ok(match kind {
        ParamType::Integer => {
            need(&buf, 4)?;
            ResponseArg::Int(buf.get_i32_le())
        }
        ParamType::Float => {
            need(&buf, 4)?;
            ResponseArg::Float(f64::from(buf.get_f32_le()))
        }
        ParamType::String => {
            let text = String::from_utf8_lossy(&buf);
            ResponseArg::Text(text.trim_end_matches('\0').to_string())
        }
        ParamType::ByteArray => ResponseArg::Bytes(buf),
        ParamType::IntegerArray => {
            if buf.len() % 4 != 0 {
                return Err("integer array length is not a multiple of 4".into());
            }
            let mut out = Vec::with_capacity(buf.len() / 4);
            while buf.has_remaining() {
                out.push(buf.get_i32_le());
            }
            ResponseArg::IntArray(out)
        }
        ParamType::FloatArray => {
            if buf.len() % 4 != 0 {
                return Err("float array length is not a multiple of 4".into());
            }
            let mut out = Vec::with_capacity(buf.len() / 4);
            while buf.has_remaining() {
                out.push(f64::from(buf.get_f32_le()));
            }
            ResponseArg::FloatArray(out)
        }
    })
}

/// A decoded response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Public command id, after translation.
    pub command_id: CommandId,
    /// Ticket of the request; 0 when unsolicited.
    pub ticket: Ticket,
    /// Header flags.
    pub flags: ResponseFlags,
    /// Parameter count declared in the header.
    pub param_count: usize,
    /// Library result code; negative on failure.
    pub error_code: i32,
    /// Decoded parameters.
    pub args: Vec<ResponseArg>,
}

impl Response {
    /// Walk the declared parameters in order. A parameter that fails to decode
    /// stops the walk and marks the response with [`RESPONSE_DECODE_FAILED`].
    pub fn decode(raw: &RawResponse) -> Response {
        let mut response = Response {
            command_id: raw.command_id,
            ticket: raw.ticket,
            flags: raw.flags,
            param_count: raw.param_count,
            error_code: raw.error_code,
            args: Vec::with_capacity(raw.param_count),
        };
        if raw.error_code < 0 {
            return response;
        }
        for index in 0..raw.param_count {
            let decoded = raw
                .params
                .get(index)
                .ok_or_else(|| format!("parameter {index} missing"))
                .and_then(decode_param);
            match decoded {
                Ok(arg) => response.args.push(arg),
                Err(reason) => {
                    warn!(
                        command = %raw.command_id,
                        ticket = raw.ticket.0,
                        index,
                        "response decode failed: {reason}"
                    );
                    response.error_code = RESPONSE_DECODE_FAILED;
                    break;
                }
            }
        }
        response
    }

    /// Result code wrapper of `error_code`.
    pub fn result_code(&self) -> ResultCode {
        ResultCode(self.error_code)
    }

    /// Turn a negative code into an error; `resolve` maps library codes to text.
    pub fn into_result(self, resolve: impl FnOnce(i32) -> String) -> AppResult<Response> {
        match self.error_code {
            RESPONSE_DECODE_FAILED => Err(DaqError::Protocol(format!(
                "malformed response to {}",
                self.command_id
            ))),
            code if code < 0 => Err(DaqError::transport(code, resolve(code))),
            _ => Ok(self),
        }
    }

    /// Argument `index`, or a protocol error when absent.
    pub fn arg(&self, index: usize) -> AppResult<&ResponseArg> {
        self.args.get(index).ok_or_else(|| {
            DaqError::Protocol(format!(
                "response to {} has no argument {index}",
                self.command_id
            ))
        })
    }

    /// Numeric argument `index` as `f64`.
    pub fn f64_arg(&self, index: usize) -> AppResult<f64> {
        self.arg(index)?.as_f64().ok_or_else(|| {
            DaqError::Protocol(format!(
                "argument {index} of {} is not numeric",
                self.command_id
            ))
        })
    }

    /// Numeric argument `index` as `i64`.
    pub fn i64_arg(&self, index: usize) -> AppResult<i64> {
        self.arg(index)?.as_i64().ok_or_else(|| {
            DaqError::Protocol(format!(
                "argument {index} of {} is not numeric",
                self.command_id
            ))
        })
    }

    /// Console rendering: `[Sensor] <<$SHZ? 2000.0`.
    pub fn console_line(&self, as_query: bool, resolve: impl FnOnce(i32) -> String) -> String {
        let mut line = String::from("[Sensor] <<$");
        line.push_str(&self.command_id.public_mnemonic());
        if as_query {
            line.push('?');
        }
        if self.error_code < 0 {
            line.push_str(&format!(
                " error {}: {}",
                self.error_code,
                resolve(self.error_code)
            ));
            return line;
        }
        let rendered: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
        if !rendered.is_empty() {
            line.push(' ');
            line.push_str(&rendered.join("; "));
        }
        line.replace('\0', "")
    }
}

fn format_float(v: f64) -> String {
    let rounded = (v * 1e5).round() / 1e5;
    if rounded.fract() == 0.0 && rounded.abs() < 1e15 {
        format!("{rounded:.1}")
    } else {
        format!("{rounded}")
    }
}

impl fmt::Display for ResponseArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseArg::Int(i) => write!(f, "{i}"),
            ResponseArg::Float(v) => f.write_str(&format_float(*v)),
            ResponseArg::Text(s) => f.write_str(s),
            ResponseArg::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            ResponseArg::IntArray(v) => {
                let parts: Vec<String> = v.iter().map(|i| i.to_string()).collect();
                f.write_str(&parts.join(" "))
            }
            ResponseArg::FloatArray(v) => {
                let parts: Vec<String> = v.iter().map(|x| format_float(*x)).collect();
                f.write_str(&parts.join(" "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shz() -> CommandId {
        CommandId::pack("SHZ")
    }

    #[test]
    fn test_severity_from_top_bits() {
        let cases = [
            (0, Severity::Success),
            (0x3FFF_FFFF, Severity::Success),
            (0x4000_0001, Severity::Information),
            (0x8000_0001_u32 as i32, Severity::Warning),
            (-1, Severity::Error),
            (RESPONSE_DECODE_FAILED, Severity::Error),
        ];
        for (code, expected) in cases {
            let rc = ResultCode(code);
            assert_eq!(rc.severity(), expected, "code {code:#x}");
            assert_eq!(rc.is_error(), (code as u32) >> 30 == 3);
            let classes = [rc.is_success(), rc.is_info(), rc.is_warning(), rc.is_error()];
            assert_eq!(classes.iter().filter(|c| **c).count(), 1);
        }
        assert!(ResultCode(0x4000_0001).is_ok());
        assert!(!ResultCode(0x8000_0001_u32 as i32).is_ok());
    }

    #[test]
    fn test_decode_walks_declared_types() {
        let raw = RawResponse::ok(
            CommandId::pack("SODX"),
            Ticket(3),
            vec![
                RawParam::int(7),
                RawParam::float(2.5),
                RawParam::string("pen\0"),
                RawParam::int_array(&[83, 16640]),
                RawParam::float_array(&[1.5, -2.0]),
            ],
        );
        let rsp = Response::decode(&raw);
        assert_eq!(rsp.error_code, 0);
        assert_eq!(
            rsp.args,
            vec![
                ResponseArg::Int(7),
                ResponseArg::Float(2.5),
                ResponseArg::Text("pen".into()),
                ResponseArg::IntArray(vec![83, 16640]),
                ResponseArg::FloatArray(vec![1.5, -2.0]),
            ]
        );
    }

    #[test]
    fn test_decode_failure_marks_response() {
        let mut raw = RawResponse::ok(shz(), Ticket(0), vec![RawParam::int(1)]);
        raw.params.push(RawParam {
            tag: 9,
            payload: Bytes::new(),
        });
        raw.param_count = 2;
        let rsp = Response::decode(&raw);
        assert_eq!(rsp.error_code, RESPONSE_DECODE_FAILED);
        assert_eq!(rsp.args, vec![ResponseArg::Int(1)]);
        let err = rsp.into_result(|_| String::new()).unwrap_err();
        assert!(matches!(err, DaqError::Protocol(_)));
    }

    #[test]
    fn test_declared_count_larger_than_params_fails() {
        let mut raw = RawResponse::ok(shz(), Ticket(0), vec![RawParam::float(1.0)]);
        raw.param_count = 3;
        assert_eq!(Response::decode(&raw).error_code, RESPONSE_DECODE_FAILED);
    }

    #[test]
    fn test_negative_code_becomes_transport_error() {
        let rsp = Response::decode(&RawResponse::failed(shz(), Ticket(1), -12));
        let err = rsp.into_result(|c| format!("code {c} text")).unwrap_err();
        match err {
            DaqError::Transport { code, message } => {
                assert_eq!(code, -12);
                assert_eq!(message, "code -12 text");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_console_line_formats_args() {
        let raw = RawResponse::ok(shz(), Ticket(0), vec![RawParam::float(2000.0)]);
        let rsp = Response::decode(&raw);
        assert_eq!(rsp.console_line(true, |_| String::new()), "[Sensor] <<$SHZ? 2000.0");

        let raw = RawResponse::ok(
            CommandId::pack("%ETR"),
            Ticket(0),
            vec![RawParam::int(0), RawParam::float(0.123456789)],
        );
        let rsp = Response::decode(&raw);
        assert_eq!(rsp.console_line(false, |_| String::new()), "[Sensor] <<$ETR 0; 0.12346");
    }

    #[test]
    fn test_flags() {
        let flags = ResponseFlags(ResponseFlags::QUERY | ResponseFlags::UPDATE);
        assert!(flags.is_query());
        assert!(flags.is_update());
        assert!(!flags.is_error());
        assert!(!flags.is_warning());
    }
}
