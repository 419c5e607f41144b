// SPDX-License-Identifier: LGPL-3.0-only

use crate::utils;

pub const INSTANCE_ZERO: InstanceTag = 0;
const INSTANCE_MIN_VALID: InstanceTag = 0x0000_0100;

/// `InstanceTag` represents a client instance tag. The instance tag is used to distinguish between
/// multiple clients using the same account. Introduced in OTR version 3, this tag allows treating
/// multiple (chat) clients operating on the same account independently.
///
/// Instance tag `0` (`INSTANCE_ZERO`) is reserved as it is used to indicate the lack of instance
/// tag, both for OTR version 2 protocol and for operations before the other party's tag is known.
pub type InstanceTag = u32;

/// `verify` checks that the tag is either `INSTANCE_ZERO` or outside of the reserved range.
pub fn verify(tag: u32) -> Result<InstanceTag, InstanceTagError> {
    if tag > INSTANCE_ZERO && tag < INSTANCE_MIN_VALID {
        Err(InstanceTagError::IllegalValue(tag))
    } else {
        Ok(tag)
    }
}

/// `verify_own` checks a tag that is to be used as our own tag. Zero is not acceptable here.
pub fn verify_own(tag: u32) -> Result<InstanceTag, InstanceTagError> {
    if tag < INSTANCE_MIN_VALID {
        Err(InstanceTagError::IllegalValue(tag))
    } else {
        Ok(tag)
    }
}

pub fn random_tag() -> InstanceTag {
    loop {
        let num = u32::from_be_bytes(utils::random::secure_bytes::<4>());
        if num >= INSTANCE_MIN_VALID {
            return num;
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum InstanceTagError {
    /// As a safety-margin, the instance tags have a predefined invalid range (0, 256). 0 is
    /// excluded as it is used for backwards-compatibility.
    IllegalValue(u32),
}

#[cfg(test)]
mod tests {
    use super::{random_tag, verify, verify_own, InstanceTagError, INSTANCE_ZERO};

    #[test]
    fn test_verify_reserved_range() {
        assert_eq!(Ok(INSTANCE_ZERO), verify(0));
        assert_eq!(Err(InstanceTagError::IllegalValue(1)), verify(1));
        assert_eq!(Err(InstanceTagError::IllegalValue(0xff)), verify(0xff));
        assert_eq!(Ok(0x100), verify(0x100));
        assert_eq!(Ok(u32::MAX), verify(u32::MAX));
    }

    #[test]
    fn test_verify_own_rejects_zero() {
        assert!(verify_own(0).is_err());
        assert!(verify_own(0x100).is_ok());
    }

    #[test]
    fn test_random_tag_is_valid() {
        for _ in 0..100 {
            assert!(verify_own(random_tag()).is_ok());
        }
    }
}
