/*!
 * Command schema definitions.
 *
 * A schema is the ordered list of addresses both ends of the link agree on,
 * each with a field-type signature. The position of an address in the list is
 * its command id on the wire, so the order must match the firmware's own
 * command enumeration exactly.
 */
use std::collections::HashMap;
use std::fmt;

use motorlink_core::error::{Error, Result};
use motorlink_core::types::Value;

/// The type of a single command argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgType {
    /// `i`: signed 16-bit integer (Arduino `int`)
    Int16,
    /// `I`: unsigned 16-bit integer
    UInt16,
    /// `l`: signed 32-bit integer (Arduino `long`)
    Int32,
    /// `L`: unsigned 32-bit integer
    UInt32,
    /// `f`: 32-bit float
    Float32,
    /// `d`: Arduino `double`, which is 32 bits wide on AVR boards
    Double32,
    /// `?` or `b`: boolean
    Bool,
    /// `c`: single ASCII character
    Char,
    /// `s`: string
    Str,
}

impl ArgType {
    /// Parse a signature character
    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'i' => Some(ArgType::Int16),
            'I' => Some(ArgType::UInt16),
            'l' => Some(ArgType::Int32),
            'L' => Some(ArgType::UInt32),
            'f' => Some(ArgType::Float32),
            'd' => Some(ArgType::Double32),
            '?' | 'b' => Some(ArgType::Bool),
            'c' => Some(ArgType::Char),
            's' => Some(ArgType::Str),
            _ => None,
        }
    }

    /// The canonical signature character
    pub fn code(&self) -> char {
        match self {
            ArgType::Int16 => 'i',
            ArgType::UInt16 => 'I',
            ArgType::Int32 => 'l',
            ArgType::UInt32 => 'L',
            ArgType::Float32 => 'f',
            ArgType::Double32 => 'd',
            ArgType::Bool => '?',
            ArgType::Char => 'c',
            ArgType::Str => 's',
        }
    }

    /// Check a value against this type and normalise it
    ///
    /// Integers come back as `Value::Integer`, floats as `Value::Float`,
    /// and so on, so the codec never has to guess.
    pub fn coerce(&self, value: &Value) -> Result<Value> {
        let mismatch = || {
            Error::schema(format!(
                "expected {} for '{}', got {} ({})",
                self.describe(),
                self.code(),
                value.kind(),
                value
            ))
        };

        match self {
            ArgType::Int16 | ArgType::UInt16 | ArgType::Int32 | ArgType::UInt32 => {
                let i = value.as_integer().ok_or_else(mismatch)?;
                let (min, max) = self.integer_range();
                if i < min || i > max {
                    return Err(Error::schema(format!(
                        "{} out of range for '{}' ({}..={})",
                        i,
                        self.code(),
                        min,
                        max
                    )));
                }
                Ok(Value::Integer(i))
            }
            ArgType::Float32 | ArgType::Double32 => {
                let f = value.as_float().ok_or_else(mismatch)?;
                if f.is_finite() && f.abs() > f32::MAX as f64 {
                    return Err(Error::schema(format!(
                        "{} out of range for '{}'",
                        f,
                        self.code()
                    )));
                }
                Ok(Value::Float(f))
            }
            ArgType::Bool => match value {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                Value::Integer(0) => Ok(Value::Bool(false)),
                Value::Integer(1) => Ok(Value::Bool(true)),
                _ => Err(mismatch()),
            },
            ArgType::Char => match value.as_str() {
                Some(s) if s.len() == 1 && s.is_ascii() => Ok(value.clone()),
                _ => Err(mismatch()),
            },
            ArgType::Str => match value {
                Value::String(_) => Ok(value.clone()),
                Value::Integer(_) | Value::Float(_) | Value::Bool(_) => {
                    Ok(Value::String(value.to_string()))
                }
            },
        }
    }

    fn integer_range(&self) -> (i64, i64) {
        match self {
            ArgType::Int16 => (i16::MIN as i64, i16::MAX as i64),
            ArgType::UInt16 => (0, u16::MAX as i64),
            ArgType::Int32 => (i32::MIN as i64, i32::MAX as i64),
            ArgType::UInt32 => (0, u32::MAX as i64),
            _ => (i64::MIN, i64::MAX),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            ArgType::Int16 | ArgType::UInt16 | ArgType::Int32 | ArgType::UInt32 => "integer",
            ArgType::Float32 | ArgType::Double32 => "float",
            ArgType::Bool => "bool",
            ArgType::Char => "single character",
            ArgType::Str => "string",
        }
    }
}

/// An ordered list of argument types, e.g. `"iff"`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature(Vec<ArgType>);

impl Signature {
    /// Parse a signature string
    pub fn parse(signature: &str) -> Result<Self> {
        signature
            .chars()
            .map(|c| {
                ArgType::from_code(c)
                    .ok_or_else(|| Error::schema(format!("unknown type character '{}'", c)))
            })
            .collect::<Result<Vec<_>>>()
            .map(Signature)
    }

    /// The argument types in order
    pub fn types(&self) -> &[ArgType] {
        &self.0
    }

    /// Number of arguments
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the signature takes no arguments
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ty in &self.0 {
            write!(f, "{}", ty.code())?;
        }
        Ok(())
    }
}

/// One schema entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// The address naming this command
    pub address: String,
    /// The argument signature
    pub signature: Signature,
}

/// The ordered address table shared with the device firmware
#[derive(Debug, Clone, Default)]
pub struct CommandSchema {
    commands: Vec<CommandSpec>,
    index: HashMap<String, usize>,
}

impl CommandSchema {
    /// Start building a schema
    pub fn builder() -> CommandSchemaBuilder {
        CommandSchemaBuilder::default()
    }

    /// Build a schema from `(address, signature)` pairs, in wire order
    pub fn from_pairs<A: AsRef<str>, S: AsRef<str>>(pairs: &[(A, S)]) -> Result<Self> {
        pairs
            .iter()
            .fold(Self::builder(), |b, (a, s)| b.command(a.as_ref(), s.as_ref()))
            .build()
    }

    /// Wire position (command id) of an address
    pub fn position(&self, address: &str) -> Option<usize> {
        self.index.get(address).copied()
    }

    /// Look up an entry by address
    pub fn get(&self, address: &str) -> Option<&CommandSpec> {
        self.position(address).map(|i| &self.commands[i])
    }

    /// Look up an entry by wire position
    pub fn by_position(&self, position: usize) -> Option<&CommandSpec> {
        self.commands.get(position)
    }

    /// Whether an address is part of the schema
    pub fn contains(&self, address: &str) -> bool {
        self.index.contains_key(address)
    }

    /// Entries in wire order
    pub fn iter(&self) -> impl Iterator<Item = &CommandSpec> {
        self.commands.iter()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the schema is empty
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Validate and normalise outbound arguments for an address
    pub fn validate(&self, address: &str, args: &[Value]) -> Result<Vec<Value>> {
        let command = self
            .get(address)
            .ok_or_else(|| Error::schema(format!("unknown address '{}'", address)))?;

        if args.len() != command.signature.len() {
            return Err(Error::schema(format!(
                "'{}' expects {} argument(s) ({}), got {}",
                address,
                command.signature.len(),
                command.signature,
                args.len()
            )));
        }

        command.signature
            .types()
            .iter()
            .zip(args)
            .map(|(ty, value)| ty.coerce(value))
            .collect()
    }
}

/// Builder for [`CommandSchema`]
#[derive(Debug, Default)]
pub struct CommandSchemaBuilder {
    entries: Vec<(String, String)>,
}

impl CommandSchemaBuilder {
    /// Append an address with its signature
    pub fn command<A: Into<String>, S: Into<String>>(mut self, address: A, signature: S) -> Self {
        self.entries.push((address.into(), signature.into()));
        self
    }

    /// Validate entries and build the schema
    pub fn build(self) -> Result<CommandSchema> {
        let mut commands = Vec::with_capacity(self.entries.len());
        let mut index = HashMap::with_capacity(self.entries.len());

        for (address, signature) in self.entries {
            if address.is_empty() {
                return Err(Error::schema("empty address"));
            }
            if index.contains_key(&address) {
                return Err(Error::schema(format!("duplicate address '{}'", address)));
            }
            let signature = Signature::parse(&signature)
                .map_err(|e| Error::schema(format!("address '{}': {}", address, e)))?;
            index.insert(address.clone(), commands.len());
            commands.push(CommandSpec { address, signature });
        }

        Ok(CommandSchema { commands, index })
    }
}
