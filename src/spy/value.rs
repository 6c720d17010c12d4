use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Object owned by the managed runtime
///
/// The engine never looks inside these: it only needs the class name (to report exceptions) and
/// to hand the object back unchanged.
pub trait ManagedObject: Send + Sync + Debug {
    /// Java name of the runtime class of the object
    fn class_name(&self) -> &str;

    fn as_any(&self) -> &dyn Any;
}

pub type ObjectRef = Arc<dyn ManagedObject>;

/// Value crossing the bridge between woven code and the engine
#[derive(Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(ObjectRef),
}

impl Value {
    pub fn object(object: impl ManagedObject + 'static) -> Value {
        Value::Object(Arc::new(object))
    }

    /// Throwable created by the engine itself (the host turns it into a real exception)
    pub fn throwable(class_name: impl Into<String>, message: impl Into<String>) -> Value {
        Value::object(EngineThrowable {
            class_name: class_name.into(),
            message: message.into(),
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Java name of the class the value has once boxed (`None` for `null`)
    pub fn class_name(&self) -> Option<&str> {
        Some(match self {
            Value::Null => return None,
            Value::Boolean(_) => "java.lang.Boolean",
            Value::Byte(_) => "java.lang.Byte",
            Value::Char(_) => "java.lang.Character",
            Value::Short(_) => "java.lang.Short",
            Value::Int(_) => "java.lang.Integer",
            Value::Long(_) => "java.lang.Long",
            Value::Float(_) => "java.lang.Float",
            Value::Double(_) => "java.lang.Double",
            Value::Object(object) => object.class_name(),
        })
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Byte(b) => write!(f, "{}b", b),
            Value::Char(c) => write!(f, "'\\u{:04x}'", c),
            Value::Short(s) => write!(f, "{}s", s),
            Value::Int(i) => write!(f, "{}", i),
            Value::Long(l) => write!(f, "{}L", l),
            Value::Float(x) => write!(f, "{}f", x),
            Value::Double(x) => write!(f, "{}d", x),
            Value::Object(object) => object.fmt(f),
        }
    }
}

/// Objects compare by identity, everything else by value
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Byte(a), Value::Byte(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::Short(a), Value::Short(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Exception raised on behalf of the engine, eg. when a listener fails
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineThrowable {
    pub class_name: String,
    pub message: String,
}

impl ManagedObject for EngineThrowable {
    fn class_name(&self) -> &str {
        &self.class_name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Outcome of a probe call, telling the woven code how to continue
#[derive(Debug, Clone, PartialEq)]
pub enum Ret {
    /// Carry on as if nothing happened
    None,

    /// Return this value from the method right away
    Return(Value),

    /// Throw this throwable from the method right away
    Throws(Value),
}

impl Ret {
    pub const STATE_NONE: i32 = 0;
    pub const STATE_RETURN: i32 = 1;
    pub const STATE_THROWS: i32 = 2;

    /// Value of the `state` field in the bridge's result object
    pub fn state(&self) -> i32 {
        match self {
            Ret::None => Ret::STATE_NONE,
            Ret::Return(_) => Ret::STATE_RETURN,
            Ret::Throws(_) => Ret::STATE_THROWS,
        }
    }

    /// Value of the `respond` field in the bridge's result object
    pub fn respond(&self) -> Option<&Value> {
        match self {
            Ret::None => None,
            Ret::Return(value) | Ret::Throws(value) => Some(value),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn objects_compare_by_identity() {
        let one = Value::throwable("java.lang.RuntimeException", "boom");
        let same = one.clone();
        let other = Value::throwable("java.lang.RuntimeException", "boom");
        assert_eq!(one, same);
        assert_ne!(one, other);
        assert_eq!(one.class_name(), Some("java.lang.RuntimeException"));
    }

    #[test]
    fn ret_states() {
        assert_eq!(Ret::None.state(), 0);
        assert_eq!(Ret::Return(Value::Int(100)).state(), 1);
        assert_eq!(Ret::Return(Value::Int(100)).respond(), Some(&Value::Int(100)));
        assert_eq!(Ret::Throws(Value::Null).state(), 2);
        assert_eq!(Ret::None.respond(), None);
    }
}
