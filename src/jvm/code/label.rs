use std::fmt;

/// Opaque position marker inside a method body
///
/// Labels are placed in the body as [`super::CodeElement::Label`] and referenced by branches,
/// exception handlers, and local variable ranges. They only get turned into bytecode offsets
/// when the body is encoded.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Label(pub(crate) usize);

impl Label {
    /// Get the next fresh label
    pub fn next(&self) -> Label {
        Label(self.0 + 1)
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_fmt(format_args!("l{}", self.0))
    }
}
