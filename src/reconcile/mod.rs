//! Settlement view over a producer's transaction log.
//!
//! This is the only place amounts owed are derived. Store entries are priced
//! at the bank's storage fee and charged to the producer; consume entries are
//! priced at the producer's fixed rate and owed by the owner. Presentation
//! code should render [`Reconciliation`] and [`StatementLine`] values rather
//! than redo the arithmetic.

use serde::{Deserialize, Serialize};

use crate::{
    error::{LedgerError, Result},
    ledger::{Amount, BatteryBank, Price, ProducerLedger, Timestamp, TransactionType},
};

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reconciliation {
    pub owed_by_producer_to_owner: u128,
    pub owed_by_owner_to_producer: u128,
    /// Positive: owner owes producer. Negative: producer owes owner.
    pub net_balance: i128,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "direction", content = "amount", rename_all = "snake_case")]
pub enum Settlement {
    OwnerOwesProducer(u128),
    ProducerOwesOwner(u128),
    Settled,
}

impl Reconciliation {
    fn from_totals(
        owed_by_producer_to_owner: u128,
        owed_by_owner_to_producer: u128,
    ) -> Result<Self> {
        let overflow = |_| LedgerError::ArithmeticOverflow {
            context: "net balance",
        };
        let to_owner = i128::try_from(owed_by_producer_to_owner).map_err(overflow)?;
        let to_producer = i128::try_from(owed_by_owner_to_producer).map_err(overflow)?;
        Ok(Self {
            owed_by_producer_to_owner,
            owed_by_owner_to_producer,
            net_balance: to_producer - to_owner,
        })
    }

    pub fn settlement(&self) -> Settlement {
        match self.net_balance {
            n if n > 0 => Settlement::OwnerOwesProducer(n.unsigned_abs()),
            n if n < 0 => Settlement::ProducerOwesOwner(n.unsigned_abs()),
            _ => Settlement::Settled,
        }
    }

    /// Sums two settlement views, e.g. to total the owner's position.
    pub fn combine(&self, other: &Reconciliation) -> Result<Reconciliation> {
        let to_owner = self
            .owed_by_producer_to_owner
            .checked_add(other.owed_by_producer_to_owner)
            .ok_or(LedgerError::ArithmeticOverflow {
                context: "total owed to owner",
            })?;
        let to_producer = self
            .owed_by_owner_to_producer
            .checked_add(other.owed_by_owner_to_producer)
            .ok_or(LedgerError::ArithmeticOverflow {
                context: "total owed to producers",
            })?;
        Reconciliation::from_totals(to_owner, to_producer)
    }
}

/// One priced row of a producer's history.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatementLine {
    pub index: u64,
    pub tx_type: TransactionType,
    pub amount: Amount,
    pub unit_price: Price,
    pub total: u128,
    pub timestamp: Timestamp,
}

impl StatementLine {
    /// Signed view of `total`: store charges count against the producer.
    pub fn signed_total(&self) -> Result<i128> {
        let total = i128::try_from(self.total).map_err(|_| LedgerError::ArithmeticOverflow {
            context: "statement line total",
        })?;
        Ok(match self.tx_type {
            TransactionType::Store => -total,
            TransactionType::Consume => total,
        })
    }
}

/// A producer's priced history together with its totals, rendered as one
/// JSON object: `{ "statement": [...], "reconciliation": {...} }`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatementReport {
    pub statement: Vec<StatementLine>,
    pub reconciliation: Reconciliation,
}

pub struct ReconciliationEngine;

impl ReconciliationEngine {
    pub fn unit_price(bank: &BatteryBank, ledger: &ProducerLedger, tx_type: TransactionType) -> Price {
        match tx_type {
            TransactionType::Store => bank.storage_fee,
            TransactionType::Consume => ledger.rate(),
        }
    }

    pub fn compute(bank: &BatteryBank, ledger: &ProducerLedger) -> Result<Reconciliation> {
        let mut to_owner: u128 = 0;
        let mut to_producer: u128 = 0;
        for tx in ledger.transactions() {
            let charge = price(tx.amount, Self::unit_price(bank, ledger, tx.tx_type))?;
            let (acc, context) = match tx.tx_type {
                TransactionType::Store => (&mut to_owner, "storage fees owed to owner"),
                TransactionType::Consume => (&mut to_producer, "consumption owed to producer"),
            };
            *acc = acc
                .checked_add(charge)
                .ok_or(LedgerError::ArithmeticOverflow { context })?;
        }
        let reconciliation = Reconciliation::from_totals(to_owner, to_producer)?;
        tracing::debug!(
            producer = %ledger.producer,
            transactions = ledger.transactions().len(),
            net = reconciliation.net_balance,
            "reconciled ledger"
        );
        Ok(reconciliation)
    }

    pub fn statement(bank: &BatteryBank, ledger: &ProducerLedger) -> Result<Vec<StatementLine>> {
        ledger
            .transactions()
            .iter()
            .enumerate()
            .map(|(idx, tx)| -> Result<StatementLine> {
                let unit_price = Self::unit_price(bank, ledger, tx.tx_type);
                Ok(StatementLine {
                    index: idx as u64,
                    tx_type: tx.tx_type,
                    amount: tx.amount,
                    unit_price,
                    total: price(tx.amount, unit_price)?,
                    timestamp: tx.timestamp,
                })
            })
            .collect()
    }

    /// Lines and totals taken from the same ledger value.
    pub fn report(bank: &BatteryBank, ledger: &ProducerLedger) -> Result<StatementReport> {
        Ok(StatementReport {
            reconciliation: Self::compute(bank, ledger)?,
            statement: Self::statement(bank, ledger)?,
        })
    }
}

fn price(amount: Amount, unit_price: Price) -> Result<u128> {
    (amount as u128)
        .checked_mul(unit_price as u128)
        .ok_or(LedgerError::ArithmeticOverflow {
            context: "amount times price",
        })
}
