use std::borrow::Cow;
use std::fmt::{Debug, Display, Error as FmtError, Formatter};

/// Names of methods, fields
///
/// See <https://docs.oracle.com/javase/specs/jvms/se16/html/jvms-4.html#jvms-4.2.2>
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct UnqualifiedName(Cow<'static, str>);

/// Names of classes and interfaces, in their internal form (`java/lang/Object`)
///
/// See <https://docs.oracle.com/javase/specs/jvms/se16/html/jvms-4.html#jvms-4.2.1>
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct BinaryName(Cow<'static, str>);

pub trait Name: Sized {
    /// Underlying string, in internal form
    fn as_str(&self) -> &str;

    /// Validate and wrap a name
    fn from_string(name: String) -> Result<Self, String>;
}

/// Check a name segment: not empty, and none of `.`, `;`, `[`, `/`
fn check_segment(kind: &str, whole: &str, segment: &str) -> Result<(), String> {
    if segment.is_empty() {
        Err(format!("{} '{}' has an empty segment", kind, whole))
    } else if segment.contains(&['.', ';', '[', '/'][..]) {
        Err(format!("{} '{}' contains an illegal character", kind, whole))
    } else {
        Ok(())
    }
}

macro_rules! string_name {
    ($name:ident, |$value:ident| $check:expr) => {
        impl $name {
            const fn name(value: &'static str) -> $name {
                $name(Cow::Borrowed(value))
            }
        }

        impl Name for $name {
            fn as_str(&self) -> &str {
                &self.0
            }

            fn from_string($value: String) -> Result<Self, String> {
                $check?;
                Ok($name(Cow::Owned($value)))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
                f.write_str(&self.0)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
                f.write_str(&self.0)
            }
        }
    };
}

string_name!(UnqualifiedName, |name| check_segment(
    "Unqualified name",
    &name,
    &name
));
string_name!(BinaryName, |name| name
    .split('/')
    .try_for_each(|segment| check_segment("Binary name", &name, segment)));

impl UnqualifiedName {
    // JDK names
    pub const BOOLEANVALUE: Self = Self::name("booleanValue");
    pub const BYTEVALUE: Self = Self::name("byteValue");
    pub const CHARVALUE: Self = Self::name("charValue");
    pub const DOUBLEVALUE: Self = Self::name("doubleValue");
    pub const FLOATVALUE: Self = Self::name("floatValue");
    pub const GETCLASS: Self = Self::name("getClass");
    pub const GETNAME: Self = Self::name("getName");
    pub const INTVALUE: Self = Self::name("intValue");
    pub const LONGVALUE: Self = Self::name("longValue");
    pub const MAIN: Self = Self::name("main");
    pub const SHORTVALUE: Self = Self::name("shortValue");
    pub const VALUEOF: Self = Self::name("valueOf");

    // Special unqualified names - only these are allowed to have angle brackets in them
    pub const INIT: Self = Self::name("<init>");
    pub const CLINIT: Self = Self::name("<clinit>");

    // Bridge names
    pub const ON_BEFORE: Self = Self::name("spyMethodOnBefore");
    pub const ON_RETURN: Self = Self::name("spyMethodOnReturn");
    pub const ON_THROWS: Self = Self::name("spyMethodOnThrows");
    pub const ON_LINE: Self = Self::name("spyMethodOnLine");
    pub const ON_CALL_BEFORE: Self = Self::name("spyMethodOnCallBefore");
    pub const ON_CALL_RETURN: Self = Self::name("spyMethodOnCallReturn");
    pub const ON_CALL_THROWS: Self = Self::name("spyMethodOnCallThrows");
    pub const STATE: Self = Self::name("state");
    pub const RESPOND: Self = Self::name("respond");
}

impl BinaryName {
    /// Convert a Java source-style name (`java.lang.String`) into its internal form
    pub fn from_java_name(java_name: &str) -> Result<BinaryName, String> {
        BinaryName::from_string(java_name.replace('.', "/"))
    }

    /// Java source-style rendering of the name (`java.lang.String`)
    pub fn to_java_name(&self) -> String {
        self.as_str().replace('/', ".")
    }

    /// Path of the resource holding the class file for this name
    pub fn resource_path(&self) -> String {
        format!("{}.class", self.as_str())
    }

    // JDK names
    pub const BOOLEAN: Self = Self::name("java/lang/Boolean");
    pub const BYTE: Self = Self::name("java/lang/Byte");
    pub const CHARACTER: Self = Self::name("java/lang/Character");
    pub const CLASS: Self = Self::name("java/lang/Class");
    pub const DOUBLE: Self = Self::name("java/lang/Double");
    pub const FLOAT: Self = Self::name("java/lang/Float");
    pub const INHERITED: Self = Self::name("java/lang/annotation/Inherited");
    pub const INTEGER: Self = Self::name("java/lang/Integer");
    pub const LONG: Self = Self::name("java/lang/Long");
    pub const METHODHANDLE: Self = Self::name("java/lang/invoke/MethodHandle");
    pub const METHODTYPE: Self = Self::name("java/lang/invoke/MethodType");
    pub const NUMBER: Self = Self::name("java/lang/Number");
    pub const OBJECT: Self = Self::name("java/lang/Object");
    pub const SHORT: Self = Self::name("java/lang/Short");
    pub const STRING: Self = Self::name("java/lang/String");
    pub const THROWABLE: Self = Self::name("java/lang/Throwable");

    // Default bridge names
    pub const SPY: Self = Self::name("java/sandbox/spy/Spy");
    pub const SPY_RET: Self = Self::name("java/sandbox/spy/Spy$Ret");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn java_name_conversions() {
        let name = BinaryName::from_java_name("com.example.Calculator$Inner").unwrap();
        assert_eq!(name.as_str(), "com/example/Calculator$Inner");
        assert_eq!(name.to_java_name(), "com.example.Calculator$Inner");
        assert_eq!(name.resource_path(), "com/example/Calculator$Inner.class");
    }

    #[test]
    fn invalid_names() {
        assert!(UnqualifiedName::from_string(String::from("a.b")).is_err());
        assert!(UnqualifiedName::from_string(String::new()).is_err());
        assert!(BinaryName::from_string(String::from("java//Object")).is_err());
        assert!(BinaryName::from_string(String::from("java/lang/Object")).is_ok());
    }
}
