//! Command construction and argument encoding.
//!
//! A command id is the little-endian byte pack of a 1-4 character mnemonic:
//! byte `i` of the id holds the ordinal of character `i`, so `SHZ` becomes
//! `0x005A4853`. Console text of the form `<mnemonic>[?] [arg ...]` is parsed
//! into a [`Command`] whose arguments are typed by their lexical form.

use std::fmt;

use bytes::Bytes;

use crate::error::{AppResult, DaqError};

/// 32-bit command tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(u32);

impl CommandId {
    /// Id from its packed value.
    pub const fn from_raw(raw: u32) -> Self {
        CommandId(raw)
    }

    /// Packed value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Compile-time pack of a known mnemonic. Characters past the fourth are ignored.
    pub const fn pack(mnemonic: &str) -> Self {
        let bytes = mnemonic.as_bytes();
        let mut raw = 0u32;
        let mut i = 0;
        while i < bytes.len() && i < 4 {
            raw |= (bytes[i] as u32) << (8 * i);
            i += 1;
        }
        CommandId(raw)
    }

    /// Pack a mnemonic typed by a user.
    pub fn from_mnemonic(mnemonic: &str) -> AppResult<Self> {
        if mnemonic.is_empty() || mnemonic.len() > 4 {
            return Err(DaqError::Protocol(format!(
                "command mnemonic must be 1-4 characters, got '{mnemonic}'"
            )));
        }
        if !mnemonic.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(DaqError::Protocol(format!(
                "command mnemonic '{mnemonic}' is not printable ASCII"
            )));
        }
        Ok(Self::pack(mnemonic))
    }

    /// Mnemonic text with trailing zero bytes dropped.
    pub fn mnemonic(self) -> String {
        let bytes = self.0.to_le_bytes();
        let len = bytes.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
        bytes[..len].iter().map(|b| *b as char).collect()
    }

    /// Mnemonic without the `%` marker used by library-internal ids.
    pub fn public_mnemonic(self) -> String {
        self.mnemonic().replace('%', "")
    }
}

impl fmt::Debug for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandId({} 0x{:08X})", self.mnemonic(), self.0)
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.mnemonic())
    }
}

// ===== Arguments =====

/// Command argument as built by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Integer.
    Int(i32),
    /// Float; sent as `f32`.
    Float(f64),
    /// Text.
    Text(String),
    /// Opaque bytes.
    Bytes(Bytes),
    /// Array; see [`Command::encode`].
    List(Vec<Arg>),
}

impl Arg {
    /// Parse one console token: integer, then float, then plain text.
    pub fn from_token(token: &str) -> Arg {
        if let Ok(i) = token.parse::<i32>() {
            Arg::Int(i)
        } else if let Ok(f) = token.parse::<f64>() {
            Arg::Float(f)
        } else {
            Arg::Text(token.to_string())
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Arg::Int(_) | Arg::Float(_))
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Int(v)
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Float(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Text(v.to_string())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Text(v)
    }
}

impl From<Bytes> for Arg {
    fn from(v: Bytes) -> Self {
        Arg::Bytes(v)
    }
}

impl From<Vec<i32>> for Arg {
    fn from(v: Vec<i32>) -> Self {
        Arg::List(v.into_iter().map(Arg::Int).collect())
    }
}

impl From<Vec<f64>> for Arg {
    fn from(v: Vec<f64>) -> Self {
        Arg::List(v.into_iter().map(Arg::Float).collect())
    }
}

/// Parameter as handed to the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum WireArg {
    /// Integer.
    Int(i32),
    /// Float.
    Float(f32),
    /// Text.
    Text(String),
    /// Opaque bytes.
    Bytes(Bytes),
    /// Integer array.
    IntArray(Vec<i32>),
    /// Float array.
    FloatArray(Vec<f32>),
}

impl WireArg {
    /// Numeric value as `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            WireArg::Int(i) => Some(f64::from(*i)),
            WireArg::Float(f) => Some(f64::from(*f)),
            _ => None,
        }
    }

    /// Numeric value as `i32`; floats are truncated.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            WireArg::Int(i) => Some(*i),
            WireArg::Float(f) => Some(*f as i32),
            _ => None,
        }
    }
}

fn encode_into(arg: &Arg, out: &mut Vec<WireArg>) {
    match arg {
        Arg::Int(i) => out.push(WireArg::Int(*i)),
        Arg::Float(f) => out.push(WireArg::Float(*f as f32)),
        Arg::Text(s) => out.push(WireArg::Text(s.clone())),
        Arg::Bytes(b) => out.push(WireArg::Bytes(b.clone())),
        Arg::List(items) if items.iter().all(|a| matches!(a, Arg::Int(_))) => {
            let ints = items
                .iter()
                .filter_map(|a| match a {
                    Arg::Int(i) => Some(*i),
                    _ => None,
                })
                .collect();
            out.push(WireArg::IntArray(ints));
        }
        Arg::List(items) if items.iter().all(Arg::is_numeric) => {
            let floats = items
                .iter()
                .filter_map(|a| match a {
                    Arg::Int(i) => Some(*i as f32),
                    Arg::Float(f) => Some(*f as f32),
                    _ => None,
                })
                .collect();
            out.push(WireArg::FloatArray(floats));
        }
        Arg::List(items) => items.iter().for_each(|a| encode_into(a, out)),
    }
}

// ===== Command =====

/// An immutable command: id, query mark and ordered arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    id: CommandId,
    is_query: bool,
    args: Vec<Arg>,
}

impl Command {
    /// Setting without arguments.
    pub fn new(id: CommandId) -> Self {
        Self {
            id,
            is_query: false,
            args: Vec::new(),
        }
    }

    /// Query without arguments.
    pub fn query(id: CommandId) -> Self {
        Self {
            id,
            is_query: true,
            args: Vec::new(),
        }
    }

    /// Setting with `args`.
    pub fn with_args(id: CommandId, args: impl IntoIterator<Item = Arg>) -> Self {
        Self {
            id,
            is_query: false,
            args: args.into_iter().collect(),
        }
    }

    /// Builder: append one argument.
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Builder: mark as query.
    pub fn as_query(mut self) -> Self {
        self.is_query = true;
        self
    }

    /// Parse console text such as `SHZ 2000`, `SHZ?`, `$SENX enum ?` or `ETR 0 ?`.
    pub fn parse(text: &str) -> AppResult<Self> {
        let text = text.trim();
        let text = text.strip_prefix('$').unwrap_or(text);
        let mut tokens = text.split_whitespace();
        let head = tokens
            .next()
            .ok_or_else(|| DaqError::Protocol("empty command".into()))?;

        let (mnemonic, mut is_query) = match head.strip_suffix('?') {
            Some(m) => (m, true),
            None => (head, false),
        };
        let id = CommandId::from_mnemonic(mnemonic)?;

        let mut args = Vec::new();
        for token in tokens {
            if token == "?" {
                is_query = true;
                continue;
            }
            args.push(Arg::from_token(token));
        }
        Ok(Self { id, is_query, args })
    }

    /// Command id.
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Whether the command asks for the current value.
    pub fn is_query(&self) -> bool {
        self.is_query
    }

    /// Arguments in order.
    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// Wire parameters in argument order. Homogeneous integer lists become an
    /// integer array, numeric lists with any float become a float array, and
    /// mixed lists are flattened in place.
    pub fn encode(&self) -> Vec<WireArg> {
        let mut out = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            encode_into(arg, &mut out);
        }
        out
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        if self.is_query {
            f.write_str("?")?;
        }
        for arg in &self.args {
            write!(f, " {}", DisplayArg(arg))?;
        }
        Ok(())
    }
}

struct DisplayArg<'a>(&'a Arg);

impl fmt::Display for DisplayArg<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Arg::Int(i) => write!(f, "{i}"),
            Arg::Float(v) => write!(f, "{v}"),
            Arg::Text(s) => f.write_str(s),
            Arg::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Arg::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", DisplayArg(item))?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mnemonic_packs_little_endian() {
        assert_eq!(CommandId::pack("SHZ").raw(), 0x005A_4853);
        assert_eq!(CommandId::pack("SODX").raw(), 0x5844_4F53);
        assert_eq!(CommandId::from_raw(0x005A_4853).mnemonic(), "SHZ");
    }

    #[test]
    fn test_mnemonic_round_trip_for_all_lengths() {
        for m in ["A", "NOP", "SODX", "%ETR", "DNLD", "LA"] {
            let id = CommandId::from_mnemonic(m).unwrap();
            assert_eq!(id.mnemonic(), m);
            assert_eq!(CommandId::from_raw(id.raw()), id);
        }
    }

    #[test]
    fn test_mnemonic_rejects_bad_text() {
        assert!(CommandId::from_mnemonic("").is_err());
        assert!(CommandId::from_mnemonic("TOOLONG").is_err());
        assert!(CommandId::from_mnemonic("S Z").is_err());
    }

    #[test]
    fn test_parse_query_forms() {
        let q = Command::parse("SHZ?").unwrap();
        assert!(q.is_query());
        assert!(q.args().is_empty());

        let a = Command::parse("$SENX enum ?").unwrap();
        assert_eq!(a.id().mnemonic(), "SENX");
        assert!(a.is_query());
        assert_eq!(a.args(), &[Arg::Text("enum".into())]);

        let etr = Command::parse("ETR 0 ?").unwrap();
        assert!(etr.is_query());
        assert_eq!(etr.args(), &[Arg::Int(0)]);
    }

    #[test]
    fn test_parse_types_tokens_lexically() {
        let cmd = Command::parse("LAI 55.5 3 abc -7").unwrap();
        assert!(!cmd.is_query());
        assert_eq!(
            cmd.args(),
            &[
                Arg::Float(55.5),
                Arg::Int(3),
                Arg::Text("abc".into()),
                Arg::Int(-7)
            ]
        );
        assert!(Command::parse("   ").is_err());
    }

    #[test]
    fn test_encode_lists_by_content() {
        let cmd = Command::new(CommandId::pack("SODX")).arg(vec![83, 16640, 16641]);
        assert_eq!(cmd.encode(), vec![WireArg::IntArray(vec![83, 16640, 16641])]);

        let mixed = Command::new(CommandId::pack("ETR")).arg(Arg::List(vec![
            Arg::Int(1),
            Arg::Float(2.5),
        ]));
        assert_eq!(mixed.encode(), vec![WireArg::FloatArray(vec![1.0, 2.5])]);

        let nested = Command::new(CommandId::pack("CONF")).arg(Arg::List(vec![
            Arg::Text("a".into()),
            Arg::Int(4),
        ]));
        assert_eq!(
            nested.encode(),
            vec![WireArg::Text("a".into()), WireArg::Int(4)]
        );
    }

    #[test]
    fn test_display_renders_console_form() {
        let cmd = Command::query(CommandId::pack("ETR")).arg(0);
        assert_eq!(cmd.to_string(), "ETR? 0");
    }
}
