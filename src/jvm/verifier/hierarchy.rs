use crate::jvm::BinaryName;

/// Knowledge of the class hierarchy needed to merge reference types in frames
///
/// When two control flow paths meet with different classes in the same slot, the frame at the
/// meeting point must hold their closest common super class. Only the loader that will define
/// the class can say what that is, so the answer is provided from outside.
pub trait TypeHierarchy {
    /// Closest common super class of two classes (by internal name)
    fn common_super_class(&self, left: &BinaryName, right: &BinaryName) -> BinaryName;
}

/// Hierarchy which knows nothing and merges everything to `java/lang/Object`
///
/// This is enough for code where types never meet (eg. generated bridge classes).
#[derive(Debug, Default, Clone, Copy)]
pub struct ObjectHierarchy;

impl TypeHierarchy for ObjectHierarchy {
    fn common_super_class(&self, left: &BinaryName, right: &BinaryName) -> BinaryName {
        if left == right {
            left.clone()
        } else {
            BinaryName::OBJECT
        }
    }
}
