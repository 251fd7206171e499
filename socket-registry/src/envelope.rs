use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Tagged wrapper sent on every broadcast and direct send.
///
/// Wire shape: `{"type": "...", "payload": ...}`. The receiving edge
/// dispatches on `type` without prior schema negotiation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope<'a, T> {
    #[serde(rename = "type", borrow)]
    pub message_type: Cow<'a, str>,
    pub payload: T,
}

impl<T> Envelope<'static, T> {
    /// Wrap `payload`, tagging it with its type name.
    pub fn new(payload: T) -> Self {
        Self {
            message_type: Cow::Borrowed(type_tag::<T>()),
            payload,
        }
    }
}

impl<'a, T> Envelope<'a, T> {
    pub fn with_type(message_type: impl Into<Cow<'a, str>>, payload: T) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
        }
    }
}

impl<T: Serialize> Envelope<'_, T> {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Bare type name of `T`: module path and generic arguments stripped.
///
/// `iot::ota::OtaProgress<u8>` becomes `OtaProgress`; references are
/// tagged as their referent.
pub fn type_tag<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>().trim_start_matches('&');
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
}
