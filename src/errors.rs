//! Error types that are reported by tensor operations.

use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::layout::{Axis, LayoutTag};

/// Error returned when a layout transform request does not match any
/// supported transition for the tensor's current layout tag.
///
/// The tensor is left untouched when this is returned, so callers that want
/// the historical permissive behaviour can simply discard the result.
#[derive(Clone, Debug, PartialEq)]
pub struct UnsupportedTransform {
    /// The tensor's layout tag at the time of the request.
    pub tag: LayoutTag,
    /// The first axis of the requested transform.
    pub axis_a: Axis,
    /// The second axis of the requested transform.
    pub axis_b: Axis,
}

impl Display for UnsupportedTransform {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "transform ({:?}, {:?}) is not supported for layout {:?}",
            self.axis_a, self.axis_b, self.tag
        )
    }
}

impl Error for UnsupportedTransform {}
