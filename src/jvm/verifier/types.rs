use super::TypeHierarchy;
use crate::jvm::class_file::{ClassConstantIndex, ConstantPool, Serialize};
use crate::jvm::{BaseType, BinaryName, Error, FieldType, RefType};
use crate::util::Width;
use byteorder::WriteBytesExt;

/// These types are from [this hierarchy][0]
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se7/html/jvms-4.html#jvms-4.10.1.2
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub enum VerificationType<Cls, U> {
    /// Unusable slot (eg. a local that was never written, or that has conflicting types)
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,

    /// In the constructor, the `this` parameter starts with this type then turns into an object
    /// type after `<init>` is called
    UninitializedThis,

    /// Object type
    Object(Cls),

    /// State of an object after `new` has been called by `<init>` has not been called
    ///
    ///   - during analysis, `U` is the position in the method body of the `new` instruction
    ///   - when serializing into a classfile, we use `u16` for `U`, corresponding to the offset of
    ///     the `new` instruction from the start of the method body
    Uninitialized(U),
}

impl<Cls, U> VerificationType<Cls, U> {
    /// Is this type is a reference type?
    pub fn is_reference(&self) -> bool {
        match self {
            VerificationType::Top
            | VerificationType::Integer
            | VerificationType::Float
            | VerificationType::Double
            | VerificationType::Long => false,

            VerificationType::Null
            | VerificationType::UninitializedThis
            | VerificationType::Object(_)
            | VerificationType::Uninitialized(_) => true,
        }
    }
}

impl<C, U> From<FieldType<C>> for VerificationType<RefType<C>, U> {
    fn from(field_type: FieldType<C>) -> Self {
        match field_type {
            FieldType::Base(BaseType::Int)
            | FieldType::Base(BaseType::Char)
            | FieldType::Base(BaseType::Short)
            | FieldType::Base(BaseType::Byte)
            | FieldType::Base(BaseType::Boolean) => VerificationType::Integer,
            FieldType::Base(BaseType::Float) => VerificationType::Float,
            FieldType::Base(BaseType::Long) => VerificationType::Long,
            FieldType::Base(BaseType::Double) => VerificationType::Double,
            FieldType::Ref(ref_type) => VerificationType::Object(ref_type),
        }
    }
}

impl Serialize for VerificationType<ClassConstantIndex, u16> {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        match self {
            VerificationType::Top => 0u8.serialize(writer)?,
            VerificationType::Integer => 1u8.serialize(writer)?,
            VerificationType::Float => 2u8.serialize(writer)?,
            VerificationType::Double => 3u8.serialize(writer)?,
            VerificationType::Long => 4u8.serialize(writer)?,
            VerificationType::Null => 5u8.serialize(writer)?,
            VerificationType::UninitializedThis => 6u8.serialize(writer)?,
            VerificationType::Object(cls) => {
                7u8.serialize(writer)?;
                cls.serialize(writer)?;
            }
            VerificationType::Uninitialized(off) => {
                8u8.serialize(writer)?;
                off.serialize(writer)?;
            }
        };
        Ok(())
    }
}

impl<Cls, A> Width for VerificationType<Cls, A> {
    fn width(&self) -> usize {
        match self {
            VerificationType::Double | VerificationType::Long => 2,
            _ => 1,
        }
    }
}

/// Verification type used while analyzing a method body
pub type AnalysisType = VerificationType<RefType<BinaryName>, usize>;

impl AnalysisType {
    pub fn object(class_name: BinaryName) -> AnalysisType {
        VerificationType::Object(RefType::Object(class_name))
    }

    /// Least upper bound of two types, falling back to `Top` when they are incompatible
    pub fn merge(&self, other: &AnalysisType, hierarchy: &dyn TypeHierarchy) -> AnalysisType {
        use VerificationType::*;

        match (self, other) {
            (a, b) if a == b => a.clone(),
            (Null, Object(r)) | (Object(r), Null) => Object(r.clone()),
            (Object(RefType::Object(a)), Object(RefType::Object(b))) => {
                AnalysisType::object(hierarchy.common_super_class(a, b))
            }
            (Object(RefType::ObjectArray(a)), Object(RefType::ObjectArray(b)))
                if a.additional_dimensions == b.additional_dimensions =>
            {
                let element_type = hierarchy.common_super_class(&a.element_type, &b.element_type);
                Object(RefType::ObjectArray(crate::jvm::ArrayType {
                    additional_dimensions: a.additional_dimensions,
                    element_type,
                }))
            }
            (Object(_), Object(_)) => AnalysisType::object(BinaryName::OBJECT),
            _ => Top,
        }
    }

    /// Resolve the type into its serializable form
    pub fn into_serializable(
        &self,
        constants: &mut ConstantPool,
        new_offset: &impl Fn(usize) -> u16,
    ) -> Result<VerificationType<ClassConstantIndex, u16>, Error> {
        Ok(match self {
            VerificationType::Top => VerificationType::Top,
            VerificationType::Integer => VerificationType::Integer,
            VerificationType::Float => VerificationType::Float,
            VerificationType::Long => VerificationType::Long,
            VerificationType::Double => VerificationType::Double,
            VerificationType::Null => VerificationType::Null,
            VerificationType::UninitializedThis => VerificationType::UninitializedThis,
            VerificationType::Object(ref_type) => {
                VerificationType::Object(constants.get_class(&ref_type.class_constant_name())?)
            }
            VerificationType::Uninitialized(position) => {
                VerificationType::Uninitialized(new_offset(*position))
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::verifier::ObjectHierarchy;

    fn class(name: &str) -> AnalysisType {
        VerificationType::Object(RefType::from_class_constant(name).unwrap())
    }

    #[test]
    fn merging_primitives() {
        let h = ObjectHierarchy;
        assert_eq!(AnalysisType::Integer.merge(&AnalysisType::Integer, &h), AnalysisType::Integer);
        assert_eq!(AnalysisType::Integer.merge(&AnalysisType::Float, &h), AnalysisType::Top);
        assert_eq!(AnalysisType::Long.merge(&AnalysisType::Top, &h), AnalysisType::Top);
    }

    #[test]
    fn merging_references() {
        let h = ObjectHierarchy;
        let string = class("java/lang/String");
        assert_eq!(AnalysisType::Null.merge(&string, &h), string);
        assert_eq!(string.merge(&AnalysisType::Null, &h), string);
        assert_eq!(string.merge(&string, &h), string);
        assert_eq!(
            string.merge(&class("java/lang/Integer"), &h),
            class("java/lang/Object")
        );
        assert_eq!(
            class("[Ljava/lang/String;").merge(&class("[Ljava/lang/Integer;"), &h),
            class("[Ljava/lang/Object;")
        );
        assert_eq!(class("[I").merge(&class("[J"), &h), class("java/lang/Object"));
        assert_eq!(
            AnalysisType::Uninitialized(3).merge(&string, &h),
            AnalysisType::Top
        );
    }

    #[test]
    fn widths() {
        assert_eq!(AnalysisType::Long.width(), 2);
        assert_eq!(AnalysisType::Double.width(), 2);
        assert_eq!(AnalysisType::Top.width(), 1);
    }
}
