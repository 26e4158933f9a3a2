//! Typed remote methods shared by the coordinator and the worker.
//!
//! A [`RemoteMethod`] is a marker type naming a method and fixing its
//! parameter tuple and result type. The worker registers a handler against
//! it and the coordinator calls through it, so both ends agree at compile
//! time on what crosses the channel.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub trait RemoteMethod: Send + Sync + 'static {
    /// Name carried in the request envelope's `method` field.
    const NAME: &'static str;

    /// Positional parameters, usually a tuple.
    type Params: Serialize + DeserializeOwned + Send + 'static;

    type Output: Serialize + DeserializeOwned + Send + 'static;
}

/// Declare a [`RemoteMethod`] marker type.
///
/// ```
/// tether::remote_method! {
///     /// Adds two numbers.
///     pub Add = "add", (i64, i64) -> i64
/// }
///
/// use tether::RemoteMethod;
/// assert_eq!(Add::NAME, "add");
/// ```
#[macro_export]
macro_rules! remote_method {
    ($(#[$meta:meta])* $vis:vis $name:ident = $method:literal, ($($param:ty),* $(,)?) -> $output:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        $vis struct $name;

        impl $crate::RemoteMethod for $name {
            const NAME: &'static str = $method;
            type Params = ($($param,)*);
            type Output = $output;
        }
    };
}

/// Flatten typed params into the positional list carried on the wire.
///
/// Tuples serialize as arrays and become the list itself; `()` serializes as
/// `null` and becomes an empty list; any other value becomes a single param.
pub fn encode_params<P: Serialize>(params: &P) -> Result<Vec<Value>, serde_json::Error> {
    Ok(match serde_json::to_value(params)? {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    })
}

/// Rebuild typed params from the positional list.
pub fn decode_params<P: DeserializeOwned>(params: Vec<Value>) -> Result<P, serde_json::Error> {
    if params.is_empty()
        && let Ok(unit) = serde_json::from_value(Value::Null)
    {
        return Ok(unit);
    }
    serde_json::from_value(Value::Array(params))
}
