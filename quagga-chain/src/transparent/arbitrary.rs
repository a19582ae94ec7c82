use proptest::{arbitrary::any, collection::vec, prelude::*};

use crate::{block, cached::Cached};

use super::{CoinbaseData, Input, OutPoint, Script};

impl Arbitrary for OutPoint {
    type Parameters = ();

    fn arbitrary_with(_args: ()) -> Self::Strategy {
        // The all-ones index is reserved for coinbase inputs, which have
        // their own serialization.
        (any::<crate::transaction::Hash>(), 0u32..0xffff_fffe)
            .prop_map(|(hash, index)| OutPoint { hash, index })
            .boxed()
    }

    type Strategy = BoxedStrategy<Self>;
}

impl Arbitrary for Input {
    type Parameters = ();

    fn arbitrary_with(_args: ()) -> Self::Strategy {
        prop_oneof![
            (any::<OutPoint>(), any::<Script>(), any::<u32>()).prop_map(
                |(outpoint, unlock_script, sequence)| Input::PrevOut {
                    outpoint,
                    unlock_script,
                    sequence,
                }
            ),
            (vec(any::<u8>(), 0..50), any::<u32>(), 0u32..500).prop_map(
                |(data, sequence, height)| Input::Coinbase {
                    height: Some(Cached::from(block::Height(height))),
                    data: CoinbaseData(data),
                    sequence,
                }
            ),
        ]
        .boxed()
    }

    type Strategy = BoxedStrategy<Self>;
}
