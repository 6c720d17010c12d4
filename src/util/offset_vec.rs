use std::fmt::{Debug, Formatter};
use std::iter::FromIterator;

/// Number of slots a value takes up
pub trait Width {
    fn width(&self) -> usize;
}

/// Slot position in an [`OffsetVec`]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Offset(pub usize);

/// Vector addressed by slot offsets rather than by element positions
///
/// Constant pools (`long` and `double` constants take two indices, and the first index is 1) and
/// the operand stack of a frame (`long` and `double` take two slots) both work like this.
#[derive(Clone)]
pub struct OffsetVec<T> {
    elements: Vec<T>,

    /// `starts[i]` is the offset of `elements[i]`
    starts: Vec<usize>,

    /// Offset the next element will get
    end: usize,
}

impl<T: Width> OffsetVec<T> {
    pub fn new() -> OffsetVec<T> {
        OffsetVec::new_starting_at(Offset(0))
    }

    pub fn new_starting_at(first: Offset) -> OffsetVec<T> {
        OffsetVec {
            elements: vec![],
            starts: vec![],
            end: first.0,
        }
    }

    /// Number of elements (not slots)
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Offset the next pushed element will get
    pub fn offset_len(&self) -> Offset {
        Offset(self.end)
    }

    pub fn push(&mut self, element: T) -> Offset {
        let start = self.end;
        self.end += element.width();
        self.starts.push(start);
        self.elements.push(element);
        Offset(start)
    }

    /// Remove the last element, returning its offset and its position
    pub fn pop(&mut self) -> Option<(Offset, usize, T)> {
        let element = self.elements.pop()?;
        let start = self.starts.pop()?;
        self.end = start;
        Some((Offset(start), self.elements.len(), element))
    }

    /// Element starting exactly at `offset`, if any
    pub fn get_offset(&self, offset: Offset) -> Option<&T> {
        let position = self.starts.binary_search(&offset.0).ok()?;
        self.elements.get(position)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Offset, usize, &T)> + '_ {
        self.starts
            .iter()
            .zip(self.elements.iter())
            .enumerate()
            .map(|(position, (start, element))| (Offset(*start), position, element))
    }
}

impl<T: PartialEq> PartialEq for OffsetVec<T> {
    fn eq(&self, other: &Self) -> bool {
        self.starts == other.starts && self.elements == other.elements
    }
}

impl<T: Eq> Eq for OffsetVec<T> {}

impl<T: Width> Default for OffsetVec<T> {
    fn default() -> Self {
        OffsetVec::new()
    }
}

impl<T: Width> FromIterator<T> for OffsetVec<T> {
    fn from_iter<I: IntoIterator<Item = T>>(elements: I) -> Self {
        let mut vec = OffsetVec::new();
        for element in elements {
            vec.push(element);
        }
        vec
    }
}

impl<T: Debug> Debug for OffsetVec<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.starts.iter().zip(self.elements.iter()))
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    enum Slot {
        Narrow(u8),
        Wide(u8),
    }

    impl Width for Slot {
        fn width(&self) -> usize {
            match self {
                Slot::Narrow(_) => 1,
                Slot::Wide(_) => 2,
            }
        }
    }

    #[test]
    fn wide_elements_take_two_offsets() {
        let slots: OffsetVec<Slot> = vec![Slot::Narrow(1), Slot::Wide(2), Slot::Narrow(3)]
            .into_iter()
            .collect();
        let offsets: Vec<(usize, usize)> = slots
            .iter()
            .map(|(offset, position, _)| (offset.0, position))
            .collect();
        assert_eq!(offsets, vec![(0, 0), (1, 1), (3, 2)]);
        assert_eq!(slots.offset_len(), Offset(4));
    }

    #[test]
    fn lookups_must_hit_the_start_of_an_element() {
        let mut pool: OffsetVec<Slot> = OffsetVec::new_starting_at(Offset(1));
        pool.push(Slot::Wide(7));
        pool.push(Slot::Narrow(8));

        assert_eq!(pool.get_offset(Offset(1)), Some(&Slot::Wide(7)));
        assert_eq!(pool.get_offset(Offset(2)), None);
        assert_eq!(pool.get_offset(Offset(3)), Some(&Slot::Narrow(8)));
        assert_eq!(pool.get_offset(Offset(4)), None);

        let popped = pool.pop().map(|(offset, _, slot)| (offset, slot));
        assert_eq!(popped, Some((Offset(3), Slot::Narrow(8))));
        assert_eq!(pool.offset_len(), Offset(3));
    }
}
