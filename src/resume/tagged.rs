//! Bit-packed tagged slots.
//!
//! A [`TaggedSlot`] is the unit of resume-data encoding: a 16-bit value
//! packing a 2-bit tag and a 14-bit signed payload. The payload is either
//! a literal small integer ([`Tag::SmallInt`]) or an index into one of the
//! per-guard tables (fail-args, constants, virtuals). Payloads outside
//! [-8192, 8191] cannot be represented; the encoder reports [`TagOverflow`]
//! and the caller falls back to the unoptimized trace.

/// The 2-bit tag of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    /// Payload indexes the guard's fail-args (live boxes). Negative
    /// payloads wrap around the end of the list.
    Box = 0,
    /// Payload indexes the shared constants table. Payload -1 is the
    /// null reference, with no table entry.
    Const = 1,
    /// Payload is the integer itself.
    SmallInt = 2,
    /// Payload indexes the guard's virtuals table. Negative payloads wrap.
    Virtual = 3,
}

impl Tag {
    #[inline]
    const fn from_bits(bits: i16) -> Tag {
        match bits & 3 {
            0 => Tag::Box,
            1 => Tag::Const,
            2 => Tag::SmallInt,
            _ => Tag::Virtual,
        }
    }
}

/// Payload does not fit in 14 signed bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagOverflow;

impl std::fmt::Display for TagOverflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("resume payload out of 14-bit range")
    }
}

impl std::error::Error for TagOverflow {}

/// One encoded slot: 2-bit tag in the low bits, 14-bit signed payload above.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaggedSlot(i16);

impl TaggedSlot {
    /// Largest representable payload.
    pub const MAX_PAYLOAD: i32 = (1 << 13) - 1;
    /// Smallest representable payload.
    pub const MIN_PAYLOAD: i32 = -(1 << 13);

    /// Placeholder for a live box not yet assigned an index.
    pub const UNASSIGNED: TaggedSlot = TaggedSlot::new_unchecked(-1, Tag::Box);
    /// Placeholder for a virtual not yet assigned a table slot.
    pub const UNASSIGNED_VIRTUAL: TaggedSlot = TaggedSlot::new_unchecked(-1, Tag::Virtual);
    /// The null reference constant, with no constants-table entry.
    pub const NULLREF: TaggedSlot = TaggedSlot::new_unchecked(-1, Tag::Const);

    const fn new_unchecked(payload: i32, tag: Tag) -> TaggedSlot {
        TaggedSlot(((payload << 2) | tag as i32) as i16)
    }

    /// Pack a payload and tag, checking the payload range.
    #[inline]
    pub fn new(payload: i32, tag: Tag) -> Result<TaggedSlot, TagOverflow> {
        if payload < Self::MIN_PAYLOAD || payload > Self::MAX_PAYLOAD {
            return Err(TagOverflow);
        }
        Ok(Self::new_unchecked(payload, tag))
    }

    /// Unpack into (payload, tag).
    #[inline]
    pub const fn untag(self) -> (i32, Tag) {
        ((self.0 >> 2) as i32, Tag::from_bits(self.0))
    }

    /// The tag alone.
    #[inline]
    pub const fn tag(self) -> Tag {
        Tag::from_bits(self.0)
    }

    /// The payload alone.
    #[inline]
    pub const fn payload(self) -> i32 {
        (self.0 >> 2) as i32
    }

    /// Raw 16-bit representation.
    #[inline]
    pub const fn bits(self) -> i16 {
        self.0
    }
}

impl std::fmt::Debug for TaggedSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == Self::UNASSIGNED {
            return f.write_str("?b");
        }
        if *self == Self::UNASSIGNED_VIRTUAL {
            return f.write_str("?v");
        }
        if *self == Self::NULLREF {
            return f.write_str("null");
        }
        let (payload, tag) = self.untag();
        match tag {
            Tag::Box => write!(f, "b{}", payload),
            Tag::Const => write!(f, "c{}", payload),
            Tag::SmallInt => write!(f, "{}", payload),
            Tag::Virtual => write!(f, "v{}", payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        for &payload in &[0, 1, -1, 55, -56, 8191, -8192] {
            for &tag in &[Tag::Box, Tag::Const, Tag::SmallInt, Tag::Virtual] {
                let slot = TaggedSlot::new(payload, tag).unwrap();
                assert_eq!(slot.untag(), (payload, tag));
            }
        }
    }

    #[test]
    fn test_overflow() {
        assert_eq!(TaggedSlot::new(8192, Tag::SmallInt), Err(TagOverflow));
        assert_eq!(TaggedSlot::new(-8193, Tag::SmallInt), Err(TagOverflow));
        assert!(TaggedSlot::new(8191, Tag::SmallInt).is_ok());
        assert!(TaggedSlot::new(-8192, Tag::SmallInt).is_ok());
    }

    #[test]
    fn test_sentinels_distinct() {
        assert_ne!(TaggedSlot::UNASSIGNED, TaggedSlot::UNASSIGNED_VIRTUAL);
        assert_ne!(TaggedSlot::UNASSIGNED, TaggedSlot::NULLREF);
        assert_eq!(TaggedSlot::UNASSIGNED.untag(), (-1, Tag::Box));
        assert_eq!(TaggedSlot::NULLREF.untag(), (-1, Tag::Const));
    }
}
