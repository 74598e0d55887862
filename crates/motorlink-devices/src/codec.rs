/*!
 * CmdMessenger frame codec.
 *
 * Frames follow the Arduino CmdMessenger conventions: the command id (the
 * address's position in the schema) as decimal ASCII, then each argument as
 * little-endian binary, fields separated by `,` and the frame ended by `;`.
 * Any separator, escape, or NUL byte inside a field is prefixed with `/`.
 */
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tracing::trace;

use motorlink_core::error::{Error, Result};
use motorlink_core::types::Value;

use crate::message::Message;
use crate::schema::{ArgType, CommandSchema};

/// Separates fields within a frame
pub const FIELD_SEPARATOR: u8 = b',';
/// Terminates a frame
pub const COMMAND_SEPARATOR: u8 = b';';
/// Escapes the next byte
pub const ESCAPE_CHARACTER: u8 = b'/';

const ESCAPED_BYTES: [u8; 4] = [FIELD_SEPARATOR, COMMAND_SEPARATOR, ESCAPE_CHARACTER, 0];

/// Encodes commands and decodes inbound frames against a schema
#[derive(Debug, Clone)]
pub struct CmdMessengerCodec {
    schema: Arc<CommandSchema>,
}

impl CmdMessengerCodec {
    /// Create a codec for a schema
    pub fn new(schema: Arc<CommandSchema>) -> Self {
        Self { schema }
    }

    /// The schema this codec uses
    pub fn schema(&self) -> &Arc<CommandSchema> {
        &self.schema
    }

    /// Append one encoded frame to `dst`
    pub fn encode(&self, address: &str, args: &[Value], dst: &mut BytesMut) -> Result<()> {
        let position = self
            .schema
            .position(address)
            .ok_or_else(|| Error::codec(format!("unknown address '{}'", address)))?;
        let args = self.schema.validate(address, args)?;

        let types = self
            .schema
            .by_position(position)
            .map(|command| command.signature.types())
            .unwrap_or_default();

        dst.put_slice(position.to_string().as_bytes());
        for (ty, value) in types.iter().zip(&args) {
            dst.put_u8(FIELD_SEPARATOR);
            put_escaped(dst, &encode_arg(*ty, value)?);
        }
        dst.put_u8(COMMAND_SEPARATOR);

        trace!("Encoded '{}' as command {}", address, position);
        Ok(())
    }

    /// Take one complete frame off the front of `src`, if there is one
    ///
    /// Returns `Ok(None)` when `src` holds only a partial frame; the bytes are
    /// left in place for the next call. A malformed frame is consumed and
    /// reported as `Error::Codec` so the caller can skip it.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            let Some(end) = find_terminator(src) else {
                return Ok(None);
            };

            let frame = src.split_to(end + 1);
            let fields = split_fields(&frame[..end]);

            // Blank frames (stray separators, line noise) carry nothing
            if fields.len() == 1 && fields[0].iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            return self.decode_fields(fields).map(Some);
        }
    }

    fn decode_fields(&self, fields: Vec<Vec<u8>>) -> Result<Message> {
        let id = std::str::from_utf8(&fields[0])
            .ok()
            .map(str::trim)
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| {
                Error::codec(format!(
                    "invalid command id {:?}",
                    String::from_utf8_lossy(&fields[0])
                ))
            })?;

        let command = self
            .schema
            .by_position(id)
            .ok_or_else(|| Error::codec(format!("command id {} is not in the schema", id)))?;

        let raw_args = &fields[1..];
        if raw_args.len() != command.signature.len() {
            return Err(Error::codec(format!(
                "'{}' expects {} field(s), got {}",
                command.address,
                command.signature.len(),
                raw_args.len()
            )));
        }

        let args = command
            .signature
            .types()
            .iter()
            .zip(raw_args)
            .map(|(ty, raw)| decode_arg(*ty, raw))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| Error::codec(format!("'{}': {}", command.address, e)))?;

        Ok(Message::new(command.address.clone(), args))
    }
}

fn put_escaped(dst: &mut BytesMut, field: &[u8]) {
    for &b in field {
        if ESCAPED_BYTES.contains(&b) {
            dst.put_u8(ESCAPE_CHARACTER);
        }
        dst.put_u8(b);
    }
}

/// Index of the first unescaped command separator
fn find_terminator(src: &[u8]) -> Option<usize> {
    let mut escaped = false;
    for (i, &b) in src.iter().enumerate() {
        if escaped {
            escaped = false;
        } else if b == ESCAPE_CHARACTER {
            escaped = true;
        } else if b == COMMAND_SEPARATOR {
            return Some(i);
        }
    }
    None
}

/// Split a frame body on unescaped field separators, removing escapes
fn split_fields(body: &[u8]) -> Vec<Vec<u8>> {
    let mut fields = Vec::new();
    let mut current = Vec::new();
    let mut escaped = false;

    for &b in body {
        if escaped {
            if !ESCAPED_BYTES.contains(&b) {
                // Not a real escape sequence; keep it verbatim
                current.push(ESCAPE_CHARACTER);
            }
            current.push(b);
            escaped = false;
        } else if b == ESCAPE_CHARACTER {
            escaped = true;
        } else if b == FIELD_SEPARATOR {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(b);
        }
    }

    fields.push(current);
    fields
}

fn encode_arg(ty: ArgType, value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(4);
    match ty {
        ArgType::Int16 => out.put_i16_le(integer(value)? as i16),
        ArgType::UInt16 => out.put_u16_le(integer(value)? as u16),
        ArgType::Int32 => out.put_i32_le(integer(value)? as i32),
        ArgType::UInt32 => out.put_u32_le(integer(value)? as u32),
        ArgType::Float32 | ArgType::Double32 => {
            let f = value
                .as_float()
                .ok_or_else(|| Error::codec(format!("expected float, got {}", value.kind())))?;
            out.put_f32_le(f as f32)
        }
        ArgType::Bool => {
            let b = value
                .as_bool()
                .ok_or_else(|| Error::codec(format!("expected bool, got {}", value.kind())))?;
            out.put_u8(b as u8)
        }
        ArgType::Char | ArgType::Str => {
            let s = value
                .as_str()
                .ok_or_else(|| Error::codec(format!("expected string, got {}", value.kind())))?;
            out.put_slice(s.as_bytes())
        }
    }
    Ok(out)
}

fn integer(value: &Value) -> Result<i64> {
    value
        .as_integer()
        .ok_or_else(|| Error::codec(format!("expected integer, got {}", value.kind())))
}

fn decode_arg(ty: ArgType, raw: &[u8]) -> Result<Value> {
    let width = match ty {
        ArgType::Int16 | ArgType::UInt16 => Some(2),
        ArgType::Int32 | ArgType::UInt32 | ArgType::Float32 | ArgType::Double32 => Some(4),
        ArgType::Bool | ArgType::Char => Some(1),
        ArgType::Str => None,
    };
    if let Some(width) = width {
        if raw.len() != width {
            return Err(Error::codec(format!(
                "'{}' field is {} byte(s), expected {}",
                ty.code(),
                raw.len(),
                width
            )));
        }
    }

    let mut buf = raw;
    let value = match ty {
        ArgType::Int16 => Value::Integer(buf.get_i16_le() as i64),
        ArgType::UInt16 => Value::Integer(buf.get_u16_le() as i64),
        ArgType::Int32 => Value::Integer(buf.get_i32_le() as i64),
        ArgType::UInt32 => Value::Integer(buf.get_u32_le() as i64),
        ArgType::Float32 | ArgType::Double32 => Value::Float(buf.get_f32_le() as f64),
        ArgType::Bool => Value::Bool(buf.get_u8() != 0),
        ArgType::Char => Value::String((buf.get_u8() as char).to_string()),
        ArgType::Str => {
            let text = String::from_utf8_lossy(raw);
            Value::String(text.trim_end_matches('\0').to_string())
        }
    };
    Ok(value)
}
