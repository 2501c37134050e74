//! ISO-8583 style message model.
//!
//! An [`IsoMessage`] is a message-type indicator (MTI) followed by a sparse set
//! of numbered fields. The MTI's third digit encodes the message function:
//! even digits are requests/advices, odd digits are their responses.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Value held by a single message field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum FieldValue {
    /// Character data.
    Text(String),
    /// Raw binary data.
    Binary(Vec<u8>),
}

impl FieldValue {
    /// Render the value as a string.
    ///
    /// Binary values are rendered as lowercase hex so that they can take part
    /// in string correlation keys.
    pub fn as_key_part(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Binary(bytes) => bytes.iter().map(|b| format!("{b:02x}")).collect(),
        }
    }

    /// Borrow the text value, if this is a text field.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::Binary(_) => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        FieldValue::Binary(value)
    }
}

/// Errors raised when deriving a response MTI.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MtiError {
    /// The MTI is not four ASCII digits.
    #[error("malformed MTI {mti:?}")]
    Malformed {
        /// The offending MTI.
        mti: String,
    },

    /// The MTI already denotes a response.
    #[error("MTI {mti} is not a request")]
    NotARequest {
        /// The offending MTI.
        mti: String,
    },
}

/// A structured ISO-8583 style message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IsoMessage {
    mti: String,
    fields: BTreeMap<u32, FieldValue>,
}

impl IsoMessage {
    /// Create an empty message with the given MTI.
    pub fn new(mti: impl Into<String>) -> Self {
        Self {
            mti: mti.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Get the message-type indicator.
    pub fn mti(&self) -> &str {
        &self.mti
    }

    /// Replace the message-type indicator.
    pub fn set_mti(&mut self, mti: impl Into<String>) {
        self.mti = mti.into();
    }

    /// Set a field, replacing any previous value.
    pub fn set(&mut self, field: u32, value: impl Into<FieldValue>) -> &mut Self {
        self.fields.insert(field, value.into());
        self
    }

    /// Builder-style variant of [`IsoMessage::set`].
    pub fn with_field(mut self, field: u32, value: impl Into<FieldValue>) -> Self {
        self.set(field, value);
        self
    }

    /// Remove a field, returning its previous value.
    pub fn unset(&mut self, field: u32) -> Option<FieldValue> {
        self.fields.remove(&field)
    }

    /// Get a field value.
    pub fn get(&self, field: u32) -> Option<&FieldValue> {
        self.fields.get(&field)
    }

    /// Get a field rendered as a string (binary fields as hex).
    pub fn get_string(&self, field: u32) -> Option<String> {
        self.fields.get(&field).map(FieldValue::as_key_part)
    }

    /// Check whether a field is present.
    pub fn has_field(&self, field: u32) -> bool {
        self.fields.contains_key(&field)
    }

    /// Iterate over fields in ascending field id order.
    pub fn fields(&self) -> impl Iterator<Item = (u32, &FieldValue)> {
        self.fields.iter().map(|(id, value)| (*id, value))
    }

    /// Number of fields set.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Third MTI digit, if the MTI is well formed.
    fn function_digit(&self) -> Option<u8> {
        let bytes = self.mti.as_bytes();
        if bytes.len() != 4 || !bytes.iter().all(u8::is_ascii_digit) {
            return None;
        }
        Some(bytes[2] - b'0')
    }

    /// Whether the MTI denotes a request (third digit even).
    pub fn is_request(&self) -> bool {
        self.function_digit().is_some_and(|d| d % 2 == 0)
    }

    /// Whether the MTI denotes a response (third digit odd).
    pub fn is_response(&self) -> bool {
        self.function_digit().is_some_and(|d| d % 2 == 1)
    }

    /// Turn a request MTI into its response MTI (`2800` becomes `2810`).
    ///
    /// # Errors
    ///
    /// Returns [`MtiError`] if the MTI is malformed or already a response.
    pub fn set_response_mti(&mut self) -> Result<(), MtiError> {
        let Some(digit) = self.function_digit() else {
            return Err(MtiError::Malformed {
                mti: self.mti.clone(),
            });
        };
        if digit % 2 == 1 {
            return Err(MtiError::NotARequest {
                mti: self.mti.clone(),
            });
        }

        let mut bytes = self.mti.clone().into_bytes();
        bytes[2] = b'0' + digit + 1;
        self.mti = String::from_utf8(bytes).map_err(|_| MtiError::Malformed {
            mti: self.mti.clone(),
        })?;
        Ok(())
    }
}

impl fmt::Display for IsoMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mti)?;
        for (id, value) in &self.fields {
            match value {
                FieldValue::Text(s) => write!(f, " [{id}]={s}")?,
                FieldValue::Binary(b) => write!(f, " [{id}]=<{} bytes>", b.len())?,
            }
        }
        Ok(())
    }
}
