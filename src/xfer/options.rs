//! Option registry: typed transfer options.
//!
//! Every [`OptionKey`] declares the [`OptionKind`] of value it accepts. Values
//! are checked against that kind when they are set; anything else about the
//! value (URL syntax, ranges, supported schemes) is left to the connection
//! that receives the option when the handle applies it.

use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;

use super::error::XferError;

/// Opaque user data passed through to a write callback.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Chunk consumer. Receives each delivered chunk and the bound user data and
/// returns the number of bytes it consumed.
pub type WriteCallback = Arc<dyn Fn(&[u8], Option<&UserData>) -> usize + Send + Sync>;

/// The kind of value an option key accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    String,
    Integer,
    Pointer,
    Callback,
}

impl OptionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Pointer => "pointer",
            Self::Callback => "callback",
        }
    }
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configurable transfer property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionKey {
    Url,
    Username,
    Password,
    CustomRequest,
    UserAgent,
    TimeoutMs,
    ConnectTimeoutMs,
    MaxFileSize,
    FollowLocation,
    FailOnError,
    Verbose,
    WriteData,
    WriteFunction,
}

impl OptionKey {
    pub const ALL: [OptionKey; 13] = [
        Self::Url,
        Self::Username,
        Self::Password,
        Self::CustomRequest,
        Self::UserAgent,
        Self::TimeoutMs,
        Self::ConnectTimeoutMs,
        Self::MaxFileSize,
        Self::FollowLocation,
        Self::FailOnError,
        Self::Verbose,
        Self::WriteData,
        Self::WriteFunction,
    ];

    /// The value kind this key accepts. Fixed per key.
    pub fn kind(self) -> OptionKind {
        match self {
            Self::Url | Self::Username | Self::Password | Self::CustomRequest | Self::UserAgent => {
                OptionKind::String
            }
            Self::TimeoutMs
            | Self::ConnectTimeoutMs
            | Self::MaxFileSize
            | Self::FollowLocation
            | Self::FailOnError
            | Self::Verbose => OptionKind::Integer,
            Self::WriteData => OptionKind::Pointer,
            Self::WriteFunction => OptionKind::Callback,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Url => "url",
            Self::Username => "username",
            Self::Password => "password",
            Self::CustomRequest => "custom_request",
            Self::UserAgent => "user_agent",
            Self::TimeoutMs => "timeout_ms",
            Self::ConnectTimeoutMs => "connect_timeout_ms",
            Self::MaxFileSize => "max_file_size",
            Self::FollowLocation => "follow_location",
            Self::FailOnError => "fail_on_error",
            Self::Verbose => "verbose",
            Self::WriteData => "write_data",
            Self::WriteFunction => "write_function",
        }
    }

    /// Keys whose values must never reach the logs.
    pub fn is_secret(self) -> bool {
        matches!(self, Self::Password)
    }
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptionKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown option: {s}"))
    }
}

/// A value for an option key.
#[derive(Clone)]
pub enum OptionValue {
    Str(String),
    Int(i64),
    Pointer(UserData),
    Callback(WriteCallback),
}

impl OptionValue {
    pub fn kind(&self) -> OptionKind {
        match self {
            Self::Str(_) => OptionKind::String,
            Self::Int(_) => OptionKind::Integer,
            Self::Pointer(_) => OptionKind::Pointer,
            Self::Callback(_) => OptionKind::Callback,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Wrap a closure as a write callback value.
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&[u8], Option<&UserData>) -> usize + Send + Sync + 'static,
    {
        Self::Callback(Arc::new(f))
    }

    /// Wrap any shareable value as opaque user data.
    pub fn pointer<T: Any + Send + Sync>(data: Arc<T>) -> Self {
        Self::Pointer(data)
    }
}

impl fmt::Debug for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.debug_tuple("Str").field(s).finish(),
            Self::Int(v) => f.debug_tuple("Int").field(v).finish(),
            Self::Pointer(_) => f.write_str("Pointer(..)"),
            Self::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        Self::Int(i64::from(v))
    }
}

/// Check that `value` has the kind `key` declares.
pub fn validate(key: OptionKey, value: &OptionValue) -> Result<(), XferError> {
    let expected = key.kind();
    let actual = value.kind();
    if expected == actual {
        Ok(())
    } else {
        Err(XferError::InvalidOptionKind {
            key,
            expected,
            actual,
        })
    }
}

/// An ordered set of option values. Re-setting a key replaces its value but
/// keeps the key's original position.
#[derive(Debug, Clone, Default)]
pub struct OptionSet {
    entries: IndexMap<OptionKey, OptionValue>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and record a value.
    pub fn set(&mut self, key: OptionKey, value: OptionValue) -> Result<(), XferError> {
        validate(key, &value)?;
        self.entries.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: OptionKey) -> Option<&OptionValue> {
        self.entries.get(&key)
    }

    pub fn get_str(&self, key: OptionKey) -> Option<&str> {
        self.get(key).and_then(OptionValue::as_str)
    }

    pub fn get_int(&self, key: OptionKey) -> Option<i64> {
        self.get(key).and_then(OptionValue::as_int)
    }

    pub fn remove(&mut self, key: OptionKey) -> Option<OptionValue> {
        self.entries.shift_remove(&key)
    }

    /// Remove and return the first entry.
    pub fn pop_front(&mut self) -> Option<(OptionKey, OptionValue)> {
        self.entries.shift_remove_index(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (OptionKey, &OptionValue)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: OptionKind) -> OptionValue {
        match kind {
            OptionKind::String => OptionValue::from("imaps://mail.example.com"),
            OptionKind::Integer => OptionValue::Int(1),
            OptionKind::Pointer => OptionValue::pointer(Arc::new(42u32)),
            OptionKind::Callback => OptionValue::callback(|chunk, _| chunk.len()),
        }
    }

    const KINDS: [OptionKind; 4] = [
        OptionKind::String,
        OptionKind::Integer,
        OptionKind::Pointer,
        OptionKind::Callback,
    ];

    #[test]
    fn test_matching_kinds_accepted() {
        let mut set = OptionSet::new();
        for key in OptionKey::ALL {
            assert!(set.set(key, sample(key.kind())).is_ok(), "{key} rejected");
        }
        assert_eq!(set.len(), OptionKey::ALL.len());
    }

    #[test]
    fn test_mismatched_kinds_rejected() {
        let mut set = OptionSet::new();
        for key in OptionKey::ALL {
            for kind in KINDS.iter().copied().filter(|k| *k != key.kind()) {
                let err = set.set(key, sample(kind)).unwrap_err();
                assert_eq!(
                    err,
                    XferError::InvalidOptionKind {
                        key,
                        expected: key.kind(),
                        actual: kind,
                    }
                );
            }
        }
        assert!(set.is_empty());
    }

    #[test]
    fn test_reset_keeps_position() {
        let mut set = OptionSet::new();
        set.set(OptionKey::Url, "http://a".into()).unwrap();
        set.set(OptionKey::TimeoutMs, 5i64.into()).unwrap();
        set.set(OptionKey::Url, "http://b".into()).unwrap();
        let keys: Vec<_> = set.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![OptionKey::Url, OptionKey::TimeoutMs]);
        assert_eq!(set.get_str(OptionKey::Url), Some("http://b"));
    }

    #[test]
    fn test_key_names_round_trip() {
        for key in OptionKey::ALL {
            assert_eq!(key.as_str().parse::<OptionKey>().unwrap(), key);
        }
        assert!("nope".parse::<OptionKey>().is_err());
    }
}
