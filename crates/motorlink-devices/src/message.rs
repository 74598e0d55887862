/*!
 * Typed messages exchanged over a channel.
 */
use motorlink_core::types::Value;

/// A decoded inbound message or an outbound command
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// The schema address naming the message
    pub address: String,
    /// Arguments in signature order
    pub args: Vec<Value>,
}

impl Message {
    /// Create a new message
    pub fn new<A: Into<String>>(address: A, args: Vec<Value>) -> Self {
        Self {
            address: address.into(),
            args,
        }
    }
}

/// Arguments for a send: either a single value or an ordered sequence
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    /// No arguments
    pub fn none() -> Self {
        Self(Vec::new())
    }

    /// The arguments as a slice
    pub fn as_slice(&self) -> &[Value] {
        &self.0
    }

    /// Consume into the underlying vector
    pub fn into_vec(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl From<&[Value]> for Args {
    fn from(values: &[Value]) -> Self {
        Self(values.to_vec())
    }
}

impl From<()> for Args {
    fn from(_: ()) -> Self {
        Self::none()
    }
}

macro_rules! single_arg {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Args {
                fn from(value: $ty) -> Self {
                    Self(vec![Value::from(value)])
                }
            }
        )*
    };
}

single_arg!(Value, bool, i32, i64, u16, u32, f32, f64, char, &str, String);

/// Build an [`Args`] list from heterogeneous values
///
/// ```
/// use motorlink_devices::args;
///
/// let args = args![1, 0.5, -0.5];
/// assert_eq!(args.as_slice().len(), 3);
/// ```
#[macro_export]
macro_rules! args {
    () => {
        $crate::message::Args::none()
    };
    ($($value:expr),+ $(,)?) => {
        $crate::message::Args::from(vec![$($crate::Value::from($value)),+])
    };
}
