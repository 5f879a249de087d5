// SPDX-License-Identifier: LGPL-3.0-only

use crate::{utils, OTRError};

/// `InstanceTag` distinguishes between multiple clients that are logged in
/// simultaneously on the same account.
pub type InstanceTag = u32;

/// The zero tag, reserved to mean "any instance". Used before the other
/// party's instance tag is known.
pub const INSTANCE_ZERO: InstanceTag = 0;

/// Smallest legal non-zero instance tag. Values in `1..0x100` are illegal
/// on the wire.
pub const INSTANCE_MIN_VALID: InstanceTag = 0x0000_0100;

pub fn verify_instance_tag(tag: u32) -> Result<InstanceTag, OTRError> {
    if tag > INSTANCE_ZERO && tag < INSTANCE_MIN_VALID {
        Err(OTRError::ProtocolViolation("Illegal instance tag."))
    } else {
        Ok(tag)
    }
}

/// `random_tag` generates a valid sender instance tag, drawn uniformly
/// from `[0x100, 0xFFFFFFFF]`.
#[must_use]
pub fn random_tag() -> InstanceTag {
    loop {
        let tag = u32::from_be_bytes(utils::random::secure_bytes::<4>());
        if tag >= INSTANCE_MIN_VALID {
            return tag;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{random_tag, verify_instance_tag, INSTANCE_MIN_VALID};

    #[test]
    fn test_verify_zero_tag_allowed() {
        assert!(verify_instance_tag(0).is_ok());
    }

    #[test]
    fn test_verify_reserved_range_rejected() {
        for tag in [1u32, 2, 0x10, 0xff] {
            assert!(verify_instance_tag(tag).is_err());
        }
    }

    #[test]
    fn test_verify_valid_tags() {
        for tag in [0x100u32, 0x101, 0xabcdef, u32::MAX] {
            assert!(verify_instance_tag(tag).is_ok());
        }
    }

    #[test]
    fn test_random_tag_in_valid_range() {
        for _ in 0..50 {
            assert!(random_tag() >= INSTANCE_MIN_VALID);
        }
    }
}
