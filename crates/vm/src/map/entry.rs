use alloc::sync::{Arc, Weak};

use super::VmMap;
use crate::object::VmObject;

bitflags::bitflags! {
    /// Access rights of a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;

        const DEFAULT = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// What a child map receives from an entry when its parent is forked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Inheritance {
    /// Both maps reference the same object.
    Share,
    /// The child gets a copy-on-write copy.
    #[default]
    Copy,
    /// The range is left unmapped in the child.
    None,
}

/// What an entry maps.
#[derive(Clone, Default)]
pub enum EntryObject {
    /// Anonymous memory whose object has not been created yet.
    #[default]
    None,
    Object(Arc<VmObject>),
    /// The range is managed by a nested map.
    SubMap(Arc<VmMap>),
}

impl EntryObject {
    pub fn object(&self) -> Option<&Arc<VmObject>> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn is_submap(&self) -> bool {
        matches!(self, Self::SubMap(_))
    }

    /// Identity comparison: the same object, the same submap, or both empty.
    pub(crate) fn same_as(&self, other: &EntryObject) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Object(a), Self::Object(b)) => Arc::ptr_eq(a, b),
            (Self::SubMap(a), Self::SubMap(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl core::fmt::Debug for EntryObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Object(object) => write!(f, "Object({})", object.id()),
            Self::SubMap(map) => write!(f, "SubMap({:#x}..{:#x})", map.min(), map.max()),
        }
    }
}

/// Link from a projected user entry to the kernel buffer it shows.
#[derive(Clone)]
pub(crate) struct Projection {
    pub(crate) map: Weak<VmMap>,
    /// Kernel address corresponding to the entry's start.
    pub(crate) start: usize,
}

#[derive(Clone)]
pub(crate) struct MapEntry {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) object: EntryObject,
    pub(crate) offset: usize,
    pub(crate) protection: Protection,
    pub(crate) max_protection: Protection,
    pub(crate) inheritance: Inheritance,
    /// Writes must copy the object first.
    pub(crate) needs_copy: bool,
    pub(crate) wired_count: u32,
    /// Another thread is changing this entry with the map unlocked.
    pub(crate) in_transition: bool,
    pub(crate) projected_on: Option<Projection>,
    /// Size of the unmapped range following this entry.
    pub(crate) gap_after: usize,
}

impl MapEntry {
    pub(crate) fn new(start: usize, end: usize, object: EntryObject, offset: usize) -> Self {
        Self {
            start,
            end,
            object,
            offset,
            protection: Protection::DEFAULT,
            max_protection: Protection::all(),
            inheritance: Inheritance::default(),
            needs_copy: false,
            wired_count: 0,
            in_transition: false,
            projected_on: None,
            gap_after: 0,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.end - self.start
    }

    pub(crate) fn contains(&self, address: usize) -> bool {
        self.start <= address && address < self.end
    }

    /// Object offset backing `address`.
    pub(crate) fn offset_of(&self, address: usize) -> usize {
        self.offset + (address - self.start)
    }

    /// Protection to give page table entries: never writable while a copy is pending.
    pub(crate) fn effective_protection(&self) -> Protection {
        if self.needs_copy {
            self.protection - Protection::WRITE
        } else {
            self.protection
        }
    }

    /// Splits off and returns the part of this entry starting at `at`.
    pub(crate) fn split_at(&mut self, at: usize) -> MapEntry {
        debug_assert!(self.start < at && at < self.end);
        let delta = at - self.start;
        let mut tail = self.clone();
        tail.start = at;
        tail.offset = self.offset + delta;
        if let Some(projection) = tail.projected_on.as_mut() {
            projection.start += delta;
        }
        self.end = at;
        self.gap_after = 0;
        tail
    }

    /// Whether `next` could be folded into this entry without changing any mapping.
    pub(crate) fn can_absorb(&self, next: &MapEntry) -> bool {
        self.end == next.start
            && self.object.same_as(&next.object)
            && !self.object.is_submap()
            && (matches!(self.object, EntryObject::None) || self.offset_of(self.end) == next.offset)
            && self.protection == next.protection
            && self.max_protection == next.max_protection
            && self.inheritance == next.inheritance
            && self.needs_copy == next.needs_copy
            && self.wired_count == 0
            && next.wired_count == 0
            && !self.in_transition
            && !next.in_transition
            && self.projected_on.is_none()
            && next.projected_on.is_none()
    }

    pub(crate) fn info(&self) -> EntryInfo {
        EntryInfo {
            start: self.start,
            end: self.end,
            object: self.object.object().map(|o| o.id()),
            is_submap: self.object.is_submap(),
            offset: self.offset,
            protection: self.protection,
            max_protection: self.max_protection,
            inheritance: self.inheritance,
            needs_copy: self.needs_copy,
            wired_count: self.wired_count,
            in_transition: self.in_transition,
            projected: self.projected_on.is_some(),
            gap_after: self.gap_after,
        }
    }
}

/// A snapshot of one map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub start: usize,
    pub end: usize,
    /// Identity of the backing object, if one exists yet.
    pub object: Option<usize>,
    pub is_submap: bool,
    pub offset: usize,
    pub protection: Protection,
    pub max_protection: Protection,
    pub inheritance: Inheritance,
    pub needs_copy: bool,
    pub wired_count: u32,
    pub in_transition: bool,
    pub projected: bool,
    pub gap_after: usize,
}

impl EntryInfo {
    pub fn size(&self) -> usize {
        self.end - self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_adjusts_offset_and_projection() {
        let mut head = MapEntry::new(0x1000, 0x5000, EntryObject::None, 0x8000);
        head.projected_on = Some(Projection { map: Weak::new(), start: 0xFFFF_9000_0000_0000 });
        head.gap_after = 0x3000;

        let tail = head.split_at(0x3000);
        assert_eq!((head.start, head.end, head.gap_after), (0x1000, 0x3000, 0));
        assert_eq!((tail.start, tail.end, tail.offset, tail.gap_after), (0x3000, 0x5000, 0xA000, 0x3000));
        assert_eq!(tail.projected_on.map(|p| p.start), Some(0xFFFF_9000_0000_2000));
    }

    #[test]
    fn absorb_requires_identical_attributes() {
        let a = MapEntry::new(0x1000, 0x2000, EntryObject::None, 0);
        let mut b = MapEntry::new(0x2000, 0x3000, EntryObject::None, 0);
        assert!(a.can_absorb(&b));
        b.protection = Protection::READ;
        assert!(!a.can_absorb(&b));
        b.protection = a.protection;
        b.wired_count = 1;
        assert!(!a.can_absorb(&b));
    }

    #[test]
    fn pending_copies_are_mapped_read_only() {
        let mut entry = MapEntry::new(0, 0x1000, EntryObject::None, 0);
        entry.needs_copy = true;
        assert_eq!(entry.effective_protection(), Protection::READ);
    }
}
