//! Strongly-typed satoshi amounts.
//!
//! Amounts are `i64` values constrained by a marker type, so that
//! transaction values (never negative) and fee deltas (possibly negative)
//! cannot be mixed up without an explicit `constrain` call.

use std::{
    cmp::Ordering,
    convert::TryFrom,
    marker::PhantomData,
    ops::RangeInclusive,
};

use crate::{BchDeserialize, BchSerialize, SerializationError};

/// One bitcoin cash, in satoshis.
pub const COIN: i64 = 100_000_000;

/// The maximum amount of money that can ever exist, in satoshis.
pub const MAX_MONEY: i64 = 21_000_000 * COIN;

/// A runtime validated type for representing amounts of satoshis
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount<C = NonNegative>(i64, PhantomData<C>);

impl<C> std::fmt::Debug for Amount<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple(&format!("Amount<{}>", std::any::type_name::<C>()))
            .field(&self.0)
            .finish()
    }
}

impl<C> Clone for Amount<C> {
    fn clone(&self) -> Self {
        Amount(self.0, PhantomData)
    }
}

impl<C> Copy for Amount<C> {}

impl<C> PartialEq for Amount<C> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<C> Eq for Amount<C> {}

impl<C> PartialOrd for Amount<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.0.cmp(&other.0))
    }
}

impl<C> Ord for Amount<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl<C> std::hash::Hash for Amount<C> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<C> Amount<C> {
    /// Returns the number of satoshis in this amount.
    pub fn value(&self) -> i64 {
        self.0
    }

    /// Convert this amount to a different Amount type if it satisfies the
    /// new constraint
    pub fn constrain<C2: Constraint>(self) -> Result<Amount<C2>, Error> {
        Amount::try_from(self.0)
    }

    /// Checked addition, erroring when the result leaves the constraint's
    /// valid range.
    pub fn checked_add(self, rhs: Amount<C>) -> Result<Amount<C>, Error>
    where
        C: Constraint,
    {
        let value = self
            .0
            .checked_add(rhs.0)
            .ok_or(Error::Overflow)?;
        Amount::try_from(value)
    }

    /// Checked subtraction, erroring when the result leaves the constraint's
    /// valid range.
    pub fn checked_sub(self, rhs: Amount<C>) -> Result<Amount<C>, Error>
    where
        C: Constraint,
    {
        let value = self
            .0
            .checked_sub(rhs.0)
            .ok_or(Error::Overflow)?;
        Amount::try_from(value)
    }

    /// The zero amount.
    pub fn zero() -> Amount<C> {
        Amount(0, PhantomData)
    }
}

impl<C: Constraint> TryFrom<i64> for Amount<C> {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if !C::valid_range().contains(&value) {
            return Err(Error::Contains {
                range: C::valid_range(),
                value,
            });
        }
        Ok(Amount(value, PhantomData))
    }
}

impl<C> From<Amount<C>> for i64 {
    fn from(amount: Amount<C>) -> Self {
        amount.0
    }
}

/// Errors that can be returned when validating `Amount`s
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    /// input {value} is outside of valid range for zatoshi Amount, valid_range={range:?}
    #[error("input {value} is outside of valid satoshi range {range:?}")]
    Contains {
        range: RangeInclusive<i64>,
        value: i64,
    },
    /// overflow on amount arithmetic
    #[error("overflow on amount arithmetic")]
    Overflow,
}

/// Marker type for `Amount` constraints.
pub trait Constraint {
    /// The range of values that are valid under this constraint.
    fn valid_range() -> RangeInclusive<i64>;
}

/// Marker type for `Amount` that restricts the values to `-MAX_MONEY..=MAX_MONEY`
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NegativeAllowed;

impl Constraint for NegativeAllowed {
    fn valid_range() -> RangeInclusive<i64> {
        -MAX_MONEY..=MAX_MONEY
    }
}

/// Marker type for `Amount` that restricts the value to positive numbers `0..=MAX_MONEY`
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NonNegative;

impl Constraint for NonNegative {
    fn valid_range() -> RangeInclusive<i64> {
        0..=MAX_MONEY
    }
}

impl<C: Constraint> BchSerialize for Amount<C> {
    fn bch_serialize<W>(&self, mut target: W) -> Result<(), std::io::Error>
    where
        W: std::io::Write,
    {
        self.0.bch_serialize(&mut target)
    }
}

impl<C: Constraint> BchDeserialize for Amount<C> {
    fn bch_deserialize<R: std::io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        let value = i64::bch_deserialize(&mut reader)?;
        Amount::try_from(value).map_err(|_| SerializationError::Parse("amount out of range"))
    }
}

#[cfg(any(test, feature = "proptest-impl"))]
mod arbitrary {
    use super::*;
    use proptest::prelude::*;

    impl<C: Constraint + std::fmt::Debug> Arbitrary for Amount<C> {
        type Parameters = ();

        fn arbitrary_with(_args: ()) -> Self::Strategy {
            C::valid_range()
                .prop_map(|value| Amount::try_from(value).expect("value sampled from valid range"))
                .boxed()
        }

        type Strategy = BoxedStrategy<Self>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_within_range() {
        let one: Amount = Amount::try_from(1).unwrap();
        let two = one.checked_add(one).unwrap();
        assert_eq!(two.value(), 2);
    }

    #[test]
    fn add_beyond_max_money_fails() {
        let max: Amount = Amount::try_from(MAX_MONEY).unwrap();
        let one: Amount = Amount::try_from(1).unwrap();
        assert!(max.checked_add(one).is_err());
    }

    #[test]
    fn negative_rejected_by_non_negative() {
        assert!(Amount::<NonNegative>::try_from(-1).is_err());
        assert!(Amount::<NegativeAllowed>::try_from(-1).is_ok());
    }
}
