use chrono::{TimeZone, Utc};
use proptest::{arbitrary::any, collection::vec, prelude::*};

use crate::{block, transparent};

use super::{LockTime, Transaction};

impl Arbitrary for LockTime {
    type Parameters = ();

    fn arbitrary_with(_args: ()) -> Self::Strategy {
        prop_oneof![
            (0u32..=block::Height::MAX_AS_U32).prop_map(|h| LockTime::Height(block::Height(h))),
            (LockTime::MIN_TIMESTAMP..=u32::max_value() as i64)
                .prop_map(|t| LockTime::Time(Utc.timestamp(t, 0))),
        ]
        .boxed()
    }

    type Strategy = BoxedStrategy<Self>;
}

impl Arbitrary for Transaction {
    type Parameters = ();

    fn arbitrary_with(_args: ()) -> Self::Strategy {
        (
            1i32..=4,
            vec(any::<transparent::Input>(), 1..4),
            vec(any::<transparent::Output>(), 1..4),
            any::<LockTime>(),
        )
            .prop_map(|(version, inputs, outputs, locktime)| {
                Transaction::new(version, inputs, outputs, locktime)
            })
            .boxed()
    }

    type Strategy = BoxedStrategy<Self>;
}
