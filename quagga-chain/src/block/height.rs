use std::ops::{Add, Sub};

/// The height of a block is the length of the chain back to the genesis block.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(
    any(test, feature = "proptest-impl"),
    derive(proptest_derive::Arbitrary)
)]
pub struct Height(pub u32);

impl Height {
    /// The minimum Height.
    ///
    /// Due to the underlying type, it is impossible to construct block
    /// heights less than `Height::MIN`.
    pub const MIN: Height = Height(0);

    /// The maximum Height.
    ///
    /// Users should not construct block heights greater than `Height::MAX`;
    /// heights at or above the lock-time threshold are interpreted as times.
    pub const MAX: Height = Height(499_999_999);

    /// The maximum Height as a u32, for range patterns.
    pub const MAX_AS_U32: u32 = Self::MAX.0;
}

impl Add<u32> for Height {
    type Output = Option<Height>;

    fn add(self, rhs: u32) -> Option<Height> {
        let result = self.0.checked_add(rhs)?;
        if result <= Height::MAX.0 {
            Some(Height(result))
        } else {
            None
        }
    }
}

impl Sub<u32> for Height {
    type Output = Option<Height>;

    fn sub(self, rhs: u32) -> Option<Height> {
        self.0.checked_sub(rhs).map(Height)
    }
}
