use super::{BinaryName, Name};
use crate::util::Width;
use std::fmt::{Display, Formatter};

/// Malformed field or method descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorError {
    pub descriptor: String,

    /// Byte position at which parsing gave up
    pub position: usize,
    pub message: &'static str,
}

impl Display for DescriptorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at position {} of '{}'",
            self.message, self.position, self.descriptor
        )
    }
}

impl std::error::Error for DescriptorError {}

/// Position in a descriptor being parsed
pub struct DescriptorCursor<'a> {
    source: &'a str,
    position: usize,
}

impl<'a> DescriptorCursor<'a> {
    fn new(source: &'a str) -> DescriptorCursor<'a> {
        DescriptorCursor {
            source,
            position: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.source.as_bytes().get(self.position).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let next = self.peek()?;
        self.position += 1;
        Some(next)
    }

    /// Consume up to (and including) `terminator`, returning what came before it
    fn take_until(&mut self, terminator: u8) -> Option<&'a str> {
        let rest = &self.source[self.position..];
        let end = rest.find(terminator as char)?;
        self.position += end + 1;
        Some(&rest[..end])
    }

    fn fail<T>(&self, message: &'static str) -> Result<T, DescriptorError> {
        Err(DescriptorError {
            descriptor: String::from(self.source),
            position: self.position,
            message,
        })
    }
}

/// Rendering to descriptor syntax (`I`, `[Ljava/lang/String;`, `(JI)V`)
pub trait RenderDescriptor {
    fn render(&self) -> String {
        let mut rendered = String::new();
        self.render_to(&mut rendered);
        rendered
    }

    fn render_to(&self, out: &mut String);
}

/// Parsing from descriptor syntax
pub trait ParseDescriptor: Sized {
    /// Parse all of `source`, leftovers being an error
    fn parse(source: &str) -> Result<Self, DescriptorError> {
        let mut cursor = DescriptorCursor::new(source);
        let parsed = Self::read(&mut cursor)?;
        match cursor.peek() {
            None => Ok(parsed),
            Some(_) => cursor.fail("Unexpected trailing input"),
        }
    }

    fn read(cursor: &mut DescriptorCursor) -> Result<Self, DescriptorError>;
}

/// Rendering the way Java source (and `Class.getName` for non-arrays) spells a type
pub trait RenderJavaName {
    fn java_name(&self) -> String;
}

/// Primitive value types
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BaseType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
}

impl BaseType {
    const ALL: [BaseType; 8] = [
        BaseType::Byte,
        BaseType::Char,
        BaseType::Double,
        BaseType::Float,
        BaseType::Int,
        BaseType::Long,
        BaseType::Short,
        BaseType::Boolean,
    ];

    const fn descriptor_char(&self) -> u8 {
        match self {
            BaseType::Byte => b'B',
            BaseType::Char => b'C',
            BaseType::Double => b'D',
            BaseType::Float => b'F',
            BaseType::Int => b'I',
            BaseType::Long => b'J',
            BaseType::Short => b'S',
            BaseType::Boolean => b'Z',
        }
    }

    /// Keyword for the type in Java source
    pub const fn keyword(&self) -> &'static str {
        match self {
            BaseType::Byte => "byte",
            BaseType::Char => "char",
            BaseType::Double => "double",
            BaseType::Float => "float",
            BaseType::Int => "int",
            BaseType::Long => "long",
            BaseType::Short => "short",
            BaseType::Boolean => "boolean",
        }
    }

    pub fn from_keyword(keyword: &str) -> Option<BaseType> {
        BaseType::ALL
            .iter()
            .copied()
            .find(|base| base.keyword() == keyword)
    }

    fn from_descriptor_char(c: u8) -> Option<BaseType> {
        BaseType::ALL
            .iter()
            .copied()
            .find(|base| base.descriptor_char() == c)
    }

    /// Wrapper class used when boxing the primitive
    pub const fn boxed(&self) -> BinaryName {
        match self {
            BaseType::Byte => BinaryName::BYTE,
            BaseType::Char => BinaryName::CHARACTER,
            BaseType::Double => BinaryName::DOUBLE,
            BaseType::Float => BinaryName::FLOAT,
            BaseType::Int => BinaryName::INTEGER,
            BaseType::Long => BinaryName::LONG,
            BaseType::Short => BinaryName::SHORT,
            BaseType::Boolean => BinaryName::BOOLEAN,
        }
    }
}

impl Width for BaseType {
    fn width(&self) -> usize {
        match self {
            BaseType::Double | BaseType::Long => 2,
            _ => 1,
        }
    }
}

impl RenderDescriptor for BaseType {
    fn render_to(&self, out: &mut String) {
        out.push(self.descriptor_char() as char);
    }
}

impl ParseDescriptor for BaseType {
    fn read(cursor: &mut DescriptorCursor) -> Result<Self, DescriptorError> {
        match cursor.peek().and_then(BaseType::from_descriptor_char) {
            Some(base) => {
                cursor.bump();
                Ok(base)
            }
            None => cursor.fail("Expected a primitive type"),
        }
    }
}

impl RenderJavaName for BaseType {
    fn java_name(&self) -> String {
        String::from(self.keyword())
    }
}

/// Reference type
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum RefType<Class> {
    Object(Class),
    ObjectArray(ArrayType<Class>),
    PrimitiveArray(ArrayType<BaseType>),
}

/// Array type, by its innermost element type
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ArrayType<T> {
    /// Dimensions beyond the first (`A[]` has 0, `A[][][]` has 2)
    pub additional_dimensions: usize,
    pub element_type: T,
}

impl<T: RenderDescriptor> RenderDescriptor for ArrayType<T> {
    fn render_to(&self, out: &mut String) {
        out.extend(std::iter::repeat('[').take(self.additional_dimensions + 1));
        self.element_type.render_to(out);
    }
}

impl<T: RenderJavaName> RenderJavaName for ArrayType<T> {
    fn java_name(&self) -> String {
        self.element_type.java_name() + &"[]".repeat(self.additional_dimensions + 1)
    }
}

impl RenderJavaName for BinaryName {
    fn java_name(&self) -> String {
        self.to_java_name()
    }
}

impl RenderDescriptor for BinaryName {
    fn render_to(&self, out: &mut String) {
        out.push('L');
        out.push_str(self.as_str());
        out.push(';');
    }
}

impl ParseDescriptor for BinaryName {
    fn read(cursor: &mut DescriptorCursor) -> Result<Self, DescriptorError> {
        if cursor.bump() != Some(b'L') {
            return cursor.fail("Expected an object type");
        }
        let name = match cursor.take_until(b';') {
            Some(name) => name,
            None => return cursor.fail("Unterminated object type"),
        };
        match BinaryName::from_string(String::from(name)) {
            Ok(name) => Ok(name),
            Err(_) => cursor.fail("Invalid class name"),
        }
    }
}

impl<C: RenderDescriptor> RenderDescriptor for RefType<C> {
    fn render_to(&self, out: &mut String) {
        match self {
            RefType::Object(class) => class.render_to(out),
            RefType::PrimitiveArray(array) => array.render_to(out),
            RefType::ObjectArray(array) => array.render_to(out),
        }
    }
}

impl<C: RenderJavaName> RenderJavaName for RefType<C> {
    fn java_name(&self) -> String {
        match self {
            RefType::Object(class) => class.java_name(),
            RefType::PrimitiveArray(array) => array.java_name(),
            RefType::ObjectArray(array) => array.java_name(),
        }
    }
}

impl<C: ParseDescriptor> ParseDescriptor for RefType<C> {
    fn read(cursor: &mut DescriptorCursor) -> Result<Self, DescriptorError> {
        let mut dimensions = 0;
        while cursor.peek() == Some(b'[') {
            cursor.bump();
            dimensions += 1;
        }
        if dimensions == 0 {
            return C::read(cursor).map(RefType::Object);
        }
        let additional_dimensions = dimensions - 1;
        if cursor.peek() == Some(b'L') {
            Ok(RefType::ObjectArray(ArrayType {
                additional_dimensions,
                element_type: C::read(cursor)?,
            }))
        } else {
            Ok(RefType::PrimitiveArray(ArrayType {
                additional_dimensions,
                element_type: BaseType::read(cursor)?,
            }))
        }
    }
}

impl RefType<BinaryName> {
    /// Parse the contents of a `CONSTANT_Class_info`: an internal class name, or an array
    /// descriptor
    pub fn from_class_constant(name: &str) -> Result<Self, DescriptorError> {
        if name.starts_with('[') {
            return RefType::parse(name);
        }
        BinaryName::from_string(String::from(name))
            .map(RefType::Object)
            .map_err(|_| DescriptorError {
                descriptor: String::from(name),
                position: 0,
                message: "Invalid class name",
            })
    }

    /// Inverse of [`RefType::from_class_constant`]
    pub fn class_constant_name(&self) -> String {
        match self {
            RefType::Object(class) => String::from(class.as_str()),
            array => array.render(),
        }
    }
}

/// Type of a field, local variable, or stack slot
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum FieldType<Class> {
    Base(BaseType),
    Ref(RefType<Class>),
}

impl<C> Width for FieldType<C> {
    fn width(&self) -> usize {
        match self {
            FieldType::Base(base) => base.width(),
            FieldType::Ref(_) => 1,
        }
    }
}

impl<C> FieldType<C> {
    pub const fn object(class: C) -> FieldType<C> {
        FieldType::Ref(RefType::Object(class))
    }

    /// One-dimensional array of this type
    pub fn array_of(self) -> FieldType<C> {
        let array = match self {
            FieldType::Base(element_type) => RefType::PrimitiveArray(ArrayType {
                additional_dimensions: 0,
                element_type,
            }),
            FieldType::Ref(RefType::Object(element_type)) => RefType::ObjectArray(ArrayType {
                additional_dimensions: 0,
                element_type,
            }),
            FieldType::Ref(RefType::PrimitiveArray(mut array)) => {
                array.additional_dimensions += 1;
                RefType::PrimitiveArray(array)
            }
            FieldType::Ref(RefType::ObjectArray(mut array)) => {
                array.additional_dimensions += 1;
                RefType::ObjectArray(array)
            }
        };
        FieldType::Ref(array)
    }
}

impl FieldType<BinaryName> {
    /// Parse a Java source spelling: `int`, `java.lang.String`, `java.lang.String[][]`
    pub fn from_java_name(name: &str) -> Option<FieldType<BinaryName>> {
        let element = name.trim_end_matches("[]");
        let dimensions = (name.len() - element.len()) / 2;
        let element = match BaseType::from_keyword(element) {
            Some(base) => FieldType::Base(base),
            None => FieldType::object(BinaryName::from_java_name(element).ok()?),
        };
        Some((0..dimensions).fold(element, |typ, _| typ.array_of()))
    }
}

impl<C: RenderDescriptor> RenderDescriptor for FieldType<C> {
    fn render_to(&self, out: &mut String) {
        match self {
            FieldType::Base(base) => base.render_to(out),
            FieldType::Ref(reference) => reference.render_to(out),
        }
    }
}

impl<C: RenderJavaName> RenderJavaName for FieldType<C> {
    fn java_name(&self) -> String {
        match self {
            FieldType::Base(base) => base.java_name(),
            FieldType::Ref(reference) => reference.java_name(),
        }
    }
}

impl<C: ParseDescriptor> ParseDescriptor for FieldType<C> {
    fn read(cursor: &mut DescriptorCursor) -> Result<Self, DescriptorError> {
        match cursor.peek() {
            Some(b'L' | b'[') => RefType::read(cursor).map(FieldType::Ref),
            Some(_) => BaseType::read(cursor).map(FieldType::Base),
            None => cursor.fail("Missing field type"),
        }
    }
}

/// Signature of a method
#[derive(PartialEq, Eq, Hash, Debug, Clone)]
pub struct MethodDescriptor<Class> {
    pub parameters: Vec<FieldType<Class>>,

    /// `None` for `void`
    pub return_type: Option<FieldType<Class>>,
}

impl<C: RenderDescriptor> RenderDescriptor for MethodDescriptor<C> {
    fn render_to(&self, out: &mut String) {
        out.push('(');
        for parameter in &self.parameters {
            parameter.render_to(out);
        }
        out.push(')');
        match &self.return_type {
            None => out.push('V'),
            Some(typ) => typ.render_to(out),
        }
    }
}

impl<C: ParseDescriptor> ParseDescriptor for MethodDescriptor<C> {
    fn read(cursor: &mut DescriptorCursor) -> Result<Self, DescriptorError> {
        if cursor.bump() != Some(b'(') {
            return cursor.fail("Expected '(' opening the parameters");
        }
        let mut parameters = vec![];
        loop {
            match cursor.peek() {
                Some(b')') => break,
                None => return cursor.fail("Expected ')' closing the parameters"),
                Some(_) => parameters.push(FieldType::read(cursor)?),
            }
        }
        cursor.bump();

        let return_type = if cursor.peek() == Some(b'V') {
            cursor.bump();
            None
        } else {
            Some(FieldType::read(cursor)?)
        };
        Ok(MethodDescriptor {
            parameters,
            return_type,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    type FT = FieldType<BinaryName>;

    const INT: FT = FieldType::Base(BaseType::Int);
    const DOUBLE: FT = FieldType::Base(BaseType::Double);
    const OBJECT: FT = FieldType::object(BinaryName::OBJECT);
    const STRING: FT = FieldType::object(BinaryName::STRING);

    #[test]
    fn field_types() {
        assert_eq!(FT::parse("I").unwrap(), INT);
        assert_eq!(
            FT::parse("[[[D").unwrap(),
            DOUBLE.array_of().array_of().array_of()
        );
        assert_eq!(FT::parse("[Ljava/lang/String;").unwrap(), STRING.array_of());
        assert_eq!(STRING.array_of().array_of().render(), "[[Ljava/lang/String;");
    }

    #[test]
    fn method_descriptors() {
        let parsed =
            MethodDescriptor::<BinaryName>::parse("(IDLjava/lang/String;)Ljava/lang/Object;")
                .unwrap();
        assert_eq!(parsed.parameters, vec![INT, DOUBLE, STRING]);
        assert_eq!(parsed.return_type, Some(OBJECT));

        let void = MethodDescriptor::<BinaryName>::parse("()V").unwrap();
        assert!(void.parameters.is_empty());
        assert_eq!(void.return_type, None);
        assert_eq!(void.render(), "()V");
    }

    #[test]
    fn malformed_descriptors() {
        let err = MethodDescriptor::<BinaryName>::parse("(ILjava/lang/String").unwrap_err();
        assert_eq!(err.message, "Unterminated object type");
        assert!(MethodDescriptor::<BinaryName>::parse("(I").is_err());
        assert!(FT::parse("IV").is_err());
        assert!(FT::parse("Q").is_err());
        assert!(FT::parse("").is_err());
    }

    #[test]
    fn java_names() {
        assert_eq!(INT.java_name(), "int");
        assert_eq!(STRING.array_of().java_name(), "java.lang.String[]");
        assert_eq!(INT.array_of().array_of().java_name(), "int[][]");

        assert_eq!(FT::from_java_name("int"), Some(INT));
        assert_eq!(FT::from_java_name("java.lang.String[]"), Some(STRING.array_of()));
        assert_eq!(
            FT::from_java_name("double[][]"),
            Some(DOUBLE.array_of().array_of())
        );
        assert_eq!(FT::from_java_name(""), None);
    }

    #[test]
    fn class_constants() {
        let array = RefType::from_class_constant("[Ljava/lang/String;").unwrap();
        assert_eq!(
            array,
            RefType::ObjectArray(ArrayType {
                additional_dimensions: 0,
                element_type: BinaryName::STRING,
            })
        );
        assert_eq!(array.class_constant_name(), "[Ljava/lang/String;");
        let class = RefType::from_class_constant("java/lang/String").unwrap();
        assert_eq!(class.class_constant_name(), "java/lang/String");
    }
}
