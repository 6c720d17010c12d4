use super::*;
use crate::jvm::class_file::{ClassConstantIndex, ConstantPool, StackMapFrame};
use crate::jvm::Error;
use crate::util::{OffsetVec, Width};

/// Snapshot of the stack and local variables at a point in the bytecode
///
/// Locals are stored one entry per value (so a `long` is one entry spanning two slots), which is
/// how stack map frames list them.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct Frame<Cls, U> {
    /// Local variables in scope
    pub locals: OffsetVec<VerificationType<Cls, U>>,

    /// Types of values on the stack
    pub stack: OffsetVec<VerificationType<Cls, U>>,
}

/// Frame as stored in a class file
pub type SerializableFrame = Frame<ClassConstantIndex, u16>;

impl Frame<crate::jvm::RefType<crate::jvm::BinaryName>, usize> {
    /// Build a frame from locals indexed by slot (where the second slot of `long`/`double` holds
    /// a `Top`) and stack entries
    pub fn from_slots<'a>(
        slots: &[AnalysisType],
        stack: impl IntoIterator<Item = &'a AnalysisType>,
    ) -> Self {
        let mut locals = vec![];
        let mut idx = 0;
        while idx < slots.len() {
            let local = slots[idx].clone();
            idx += local.width();
            locals.push(local);
        }

        // Trailing unusable locals are implicit
        while let Some(VerificationType::Top) = locals.last() {
            locals.pop();
        }

        Frame {
            locals: locals.into_iter().collect(),
            stack: stack.into_iter().cloned().collect(),
        }
    }

    /// Resolve the frame into its serializable form
    pub fn into_serializable(
        &self,
        constants: &mut ConstantPool,
        new_offset: &impl Fn(usize) -> u16,
    ) -> Result<SerializableFrame, Error> {
        Ok(Frame {
            stack: self
                .stack
                .iter()
                .map(|(_, _, t)| t.into_serializable(constants, new_offset))
                .collect::<Result<_, _>>()?,
            locals: self
                .locals
                .iter()
                .map(|(_, _, t)| t.into_serializable(constants, new_offset))
                .collect::<Result<_, _>>()?,
        })
    }
}

impl SerializableFrame {
    /// Compute a stack map frame for this frame, given the previous frame
    ///
    /// This will fall back to the `Full` option using [`Self::full_stack_map_frame`] only if none
    /// of the other stack map frame variants are enough to encode the transition.
    pub fn stack_map_frame(&self, offset_delta: u16, previous_frame: &Self) -> StackMapFrame {
        match self.stack.len() {
            0 => {
                let this_locals_len = self.locals.len();
                let prev_locals_len = previous_frame.locals.len();

                if this_locals_len <= prev_locals_len {
                    let len_difference = prev_locals_len - this_locals_len;
                    if len_difference < 4 {
                        let this_is_prefix_of_prev = self
                            .locals
                            .iter()
                            .zip(previous_frame.locals.iter())
                            .all(|((_, _, t1), (_, _, t2))| t1 == t2);

                        if this_is_prefix_of_prev {
                            if len_difference == 0 {
                                return StackMapFrame::SameLocalsNoStack { offset_delta };
                            } else {
                                return StackMapFrame::ChopLocalsNoStack {
                                    offset_delta,
                                    chopped_k: len_difference as u8,
                                };
                            }
                        }
                    }
                } else if this_locals_len - prev_locals_len < 4 {
                    let prev_is_prefix_of_this = previous_frame
                        .locals
                        .iter()
                        .zip(self.locals.iter())
                        .all(|((_, _, t1), (_, _, t2))| t1 == t2);

                    if prev_is_prefix_of_this {
                        return StackMapFrame::AppendLocalsNoStack {
                            offset_delta,
                            locals: self
                                .locals
                                .iter()
                                .skip(prev_locals_len)
                                .map(|(_, _, t)| *t)
                                .collect(),
                        };
                    }
                }
            }
            1 if self.locals == previous_frame.locals => {
                if let Some((_, _, stack)) = self.stack.iter().next() {
                    return StackMapFrame::SameLocalsOneStack {
                        offset_delta,
                        stack: *stack,
                    };
                }
            }
            _ => (),
        }

        self.full_stack_map_frame(offset_delta)
    }

    /// Compute a `Full` stack map frame
    pub fn full_stack_map_frame(&self, offset_delta: u16) -> StackMapFrame {
        StackMapFrame::Full {
            offset_delta,
            stack: self.stack.iter().map(|(_, _, t)| *t).collect(),
            locals: self.locals.iter().map(|(_, _, t)| *t).collect(),
        }
    }
}
