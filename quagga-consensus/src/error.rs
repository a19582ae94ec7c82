//! Errors that can occur while validating blocks and transactions.
//!
//! Every rejection carries three pieces of policy data: the wire-visible
//! code string, a punishment (0..=100) fed into the transport's ban scorer
//! when the block came from a peer, and a corruption-possible flag. The
//! flag marks failures that can be caused by receiving the wrong
//! transactions for an honest header, in which case the header must not be
//! marked permanently invalid.

use displaydoc::Display;
use thiserror::Error;

/// A transaction-level validation failure.
#[derive(Error, Debug, Display, Clone, PartialEq)]
pub enum TransactionError {
    /// transaction has no inputs
    NoInputs,
    /// transaction has no outputs
    NoOutputs,
    /// first transaction in a block is not a coinbase
    CoinbasePosition,
    /// coinbase transaction found outside the first slot
    CoinbaseInputFound,
    /// transaction is below the post-fork minimum size
    Undersize,
    /// an input spends an output that is not in the UTXO set
    MissingInputs,
    /// a relative lock time is not yet satisfied
    NonFinal,
    /// transaction spends more than its inputs provide
    OutputsExceedInputs,
    /// an output value is out of range
    InvalidValue,
    /// a script failed verification
    Script,
    /// duplicate transaction
    Duplicate,
}

impl TransactionError {
    /// The wire-visible reject code.
    pub fn code(&self) -> &'static str {
        use TransactionError::*;
        match self {
            NoInputs => "bad-txns-vin-empty",
            NoOutputs => "bad-txns-vout-empty",
            CoinbasePosition => "bad-cb-missing",
            CoinbaseInputFound => "bad-cb-multiple",
            Undersize => "bad-txns-undersize",
            MissingInputs => "missing-inputs",
            NonFinal => "bad-txns-nonfinal",
            OutputsExceedInputs => "bad-txns-in-belowout",
            InvalidValue => "bad-txns-vout-notlegalmoney",
            Script => "mandatory-script-verify-flag-failed",
            Duplicate => "bad-txns-duplicate",
        }
    }

    /// How much to punish the peer that relayed this failure.
    pub fn punishment(&self) -> u32 {
        use TransactionError::*;
        match self {
            // Missing inputs are expected during races and reorgs.
            MissingInputs => 0,
            _ => 100,
        }
    }
}

/// A block-level validation failure.
#[derive(Error, Debug, Display, Clone, PartialEq)]
pub enum BlockError {
    /// block is malformed or above the accept limit, punishing {0}
    Length(u32),
    /// block header hash is above its difficulty target
    HighHash,
    /// block timestamp is more than two hours in the future
    TimeTooNew,
    /// block timestamp is not past the median time of its ancestors
    TimeTooOld,
    /// difficulty bits do not match the next work required
    BadDiffBits,
    /// obsolete block version
    BadVersion,
    /// merkle root does not commit to the transaction list
    BadMerkleRoot,
    /// duplicate transactions mutate the merkle tree
    DuplicateTransaction,
    /// transactions are not in canonical order
    NotCtorOrdered,
    /// block has more signature operations than allowed
    TooManySigOps,
    /// coinbase pays out more than the subsidy plus fees
    BadCoinbaseAmount,
    /// coinbase script does not begin with the serialized block height
    BadCoinbaseHeight,
    /// parent block is invalid
    BadParent,
    /// transaction failed: {0}
    Transaction(#[from] TransactionError),
    /// block data is not present
    BlockDataMissing,
    /// the unspent output database is inconsistent
    UtxoInconsistent,
    /// the validation engine is shutting down
    Shutdown,
}

impl BlockError {
    /// The wire-visible reject code.
    pub fn code(&self) -> &'static str {
        use BlockError::*;
        match self {
            Length(_) => "bad-blk-length",
            HighHash => "high-hash",
            TimeTooNew => "time-too-new",
            TimeTooOld => "time-too-old",
            BadDiffBits => "bad-diffbits",
            BadVersion => "bad-version",
            BadMerkleRoot => "bad-txnmrklroot",
            DuplicateTransaction => "bad-txns-duplicate",
            NotCtorOrdered => "tx-ordering-not-CTOR",
            TooManySigOps => "bad-blk-sigops",
            BadCoinbaseAmount => "bad-cb-amount",
            BadCoinbaseHeight => "bad-cb-height",
            BadParent => "bad-parent",
            Transaction(inner) => inner.code(),
            BlockDataMissing => "blockdata-not-present",
            UtxoInconsistent => "utxo-db-inconsistent",
            Shutdown => "shutdown",
        }
    }

    /// How much to punish the peer that relayed this failure.
    pub fn punishment(&self) -> u32 {
        use BlockError::*;
        match self {
            Length(punishment) => *punishment,
            HighHash => 50,
            // Local conditions, never the peer's fault.
            BlockDataMissing | UtxoInconsistent | Shutdown => 0,
            BadParent => 0,
            Transaction(inner) => inner.punishment(),
            _ => 100,
        }
    }

    /// Whether this failure can be caused by receiving the wrong
    /// transactions for an honest header.
    pub fn corruption_possible(&self) -> bool {
        matches!(
            self,
            BlockError::BadMerkleRoot | BlockError::DuplicateTransaction
        )
    }

    /// Whether this failure indicates local corruption and must abort the
    /// node rather than reject the block.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BlockError::BlockDataMissing | BlockError::UtxoInconsistent
        )
    }

    /// Whether this failure permanently condemns the block (and with it
    /// every descendant) in the fork tree.
    ///
    /// Corruption-possible failures blame the transaction list rather than
    /// the header, clock-rule rejections heal as the wall clock catches
    /// up, and local conditions say nothing about the block at all.
    pub fn marks_subtree_invalid(&self) -> bool {
        !self.corruption_possible()
            && !matches!(
                self,
                BlockError::TimeTooNew
                    | BlockError::Shutdown
                    | BlockError::BlockDataMissing
                    | BlockError::UtxoInconsistent
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_punishments() {
        quagga_test::init();

        assert_eq!(BlockError::HighHash.code(), "high-hash");
        assert_eq!(BlockError::HighHash.punishment(), 50);
        assert_eq!(
            BlockError::Transaction(TransactionError::MissingInputs).punishment(),
            0
        );
        assert_eq!(BlockError::NotCtorOrdered.code(), "tx-ordering-not-CTOR");
        assert!(BlockError::DuplicateTransaction.corruption_possible());
        assert!(!BlockError::HighHash.corruption_possible());
        assert!(BlockError::UtxoInconsistent.is_fatal());

        // Transient and list-blaming failures spare the header subtree.
        assert!(BlockError::HighHash.marks_subtree_invalid());
        assert!(!BlockError::TimeTooNew.marks_subtree_invalid());
        assert!(!BlockError::BadMerkleRoot.marks_subtree_invalid());
        assert!(!BlockError::Shutdown.marks_subtree_invalid());
    }
}
