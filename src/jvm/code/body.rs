use super::{CodeElement, Instruction, Label};
use crate::jvm::class_file::{Attribute, ClassConstantIndex, Utf8ConstantIndex};
use std::collections::HashMap;

/// Editable method body
///
/// This is the decoded form of a `Code` attribute: a flat sequence of labels, line markers, and
/// instructions, along with the tables that refer into it by label. Code can be spliced in
/// anywhere without worrying about offsets, which are only computed again on encoding.
#[derive(Debug, Clone)]
pub struct MethodBody {
    /// Locals declared by the original `Code` attribute (a lower bound on what gets encoded)
    pub max_locals: u16,
    pub elements: Vec<CodeElement>,

    /// Exception handlers, in priority order
    pub handlers: Vec<Handler>,
    pub local_variables: Vec<LocalVariableRange>,

    /// Code attributes which are carried over without being interpreted
    pub attributes: Vec<Attribute>,

    next_label: Label,
}

/// Entry in the exception table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handler {
    /// Start of the protected range (inclusive)
    pub start: Label,

    /// End of the protected range (exclusive)
    pub end: Label,
    pub handler: Label,

    /// Type of exception caught (`None` catches everything)
    pub catch_type: Option<ClassConstantIndex>,
}

/// Entry of `LocalVariableTable` or `LocalVariableTypeTable`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariableRange {
    pub start: Label,
    pub end: Label,
    pub name_index: Utf8ConstantIndex,

    /// Descriptor, or signature when `is_generic_signature`
    pub descriptor_index: Utf8ConstantIndex,
    pub index: u16,
    pub is_generic_signature: bool,
}

impl MethodBody {
    /// Empty body
    pub fn new(max_locals: u16) -> MethodBody {
        MethodBody {
            max_locals,
            elements: vec![],
            handlers: vec![],
            local_variables: vec![],
            attributes: vec![],
            next_label: Label(0),
        }
    }

    /// Get a label which isn't used anywhere yet
    pub fn fresh_label(&mut self) -> Label {
        let label = self.next_label;
        self.next_label = label.next();
        label
    }

    /// Make sure labels from `fresh_label` won't collide with `label`
    pub(crate) fn reserve_label(&mut self, label: Label) {
        if label >= self.next_label {
            self.next_label = label.next();
        }
    }

    /// Push an element at the end of the body
    pub fn push(&mut self, element: impl Into<CodeElement>) {
        self.elements.push(element.into());
    }

    /// Position of every placed label in `elements`
    pub fn label_positions(&self) -> HashMap<Label, usize> {
        self.elements
            .iter()
            .enumerate()
            .filter_map(|(idx, elem)| match elem {
                CodeElement::Label(label) => Some((*label, idx)),
                _ => None,
            })
            .collect()
    }

    /// Iterate over just the instructions, with their positions in `elements`
    pub fn instructions(&self) -> impl Iterator<Item = (usize, &Instruction)> {
        self.elements
            .iter()
            .enumerate()
            .filter_map(|(idx, elem)| match elem {
                CodeElement::Insn(insn) => Some((idx, insn)),
                _ => None,
            })
    }
}
