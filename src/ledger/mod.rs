use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{LedgerError, Result};

pub type Amount = u64;
pub type Price = u64;
pub type Timestamp = i64; // unix seconds

/// Identity of a producer or of the bank owner, as authenticated by the caller.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let identity = Identity(value.into());
        identity.ensure_named()?;
        Ok(identity)
    }

    /// A blank identity can never hold the producer or owner role.
    pub fn ensure_named(&self) -> Result<()> {
        if self.0.trim().is_empty() {
            return Err(LedgerError::Unauthorized {
                caller: self.clone(),
                required: Identity("<non-empty identity>".into()),
            });
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Unchecked. Service entry points refuse blank identities.
impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Identity(value.to_string())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable reference to the battery bank record.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BankRef(#[serde(with = "serde_hex")] pub [u8; 32]);

impl BankRef {
    pub fn derive(owner: &Identity) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"battery_bank");
        hasher.update(owner.as_str().as_bytes());
        BankRef(hasher.finalize().into())
    }
}

impl fmt::Display for BankRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Key of a producer ledger, derived from the bank and the producer identity.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LedgerKey(#[serde(with = "serde_hex")] pub [u8; 32]);

impl LedgerKey {
    pub fn derive(bank: &BankRef, producer: &Identity) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"producer");
        hasher.update(bank.0);
        hasher.update(producer.as_str().as_bytes());
        LedgerKey(hasher.finalize().into())
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Position of one transaction in one producer's log.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxRef {
    pub ledger: LedgerKey,
    pub index: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatteryBank {
    pub id: BankRef,
    pub owner: Identity,
    pub storage_fee: Price,
}

impl BatteryBank {
    pub fn new(owner: Identity, storage_fee: Price) -> Self {
        Self {
            id: BankRef::derive(&owner),
            owner,
            storage_fee,
        }
    }

    pub fn ledger_key(&self, producer: &Identity) -> LedgerKey {
        LedgerKey::derive(&self.id, producer)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Store,
    Consume,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionType::Store => f.pad("store"),
            TransactionType::Consume => f.pad("consume"),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub tx_type: TransactionType,
    pub amount: Amount,
    pub timestamp: Timestamp,
}

/// Per-producer account of stored and consumed energy.
///
/// State is the triple `(stored_amount, consumed_amount, rate)`; the only
/// transitions are [`ProducerLedger::store`] and [`ProducerLedger::consume`].
/// Both validate before touching any field, so a failed call leaves the
/// ledger as it was.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProducerLedger {
    pub key: LedgerKey,
    pub producer: Identity,
    stored_amount: Amount,
    consumed_amount: Amount,
    rate: Price,
    last_reconciled: Timestamp,
    transactions: Vec<Transaction>,
}

impl ProducerLedger {
    /// Creates the ledger from its first deposit. `rate` is fixed here for good.
    pub fn open(
        bank: &BatteryBank,
        producer: Identity,
        amount: Amount,
        rate: Price,
        now: Timestamp,
    ) -> Result<Self> {
        check_amount(amount)?;
        Ok(Self {
            key: bank.ledger_key(&producer),
            producer,
            stored_amount: amount,
            consumed_amount: 0,
            rate,
            last_reconciled: now,
            transactions: vec![Transaction {
                tx_type: TransactionType::Store,
                amount,
                timestamp: now,
            }],
        })
    }

    pub fn stored_amount(&self) -> Amount {
        self.stored_amount
    }

    pub fn consumed_amount(&self) -> Amount {
        self.consumed_amount
    }

    pub fn rate(&self) -> Price {
        self.rate
    }

    pub fn last_reconciled(&self) -> Timestamp {
        self.last_reconciled
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Energy stored but not yet consumed.
    pub fn balance(&self) -> Amount {
        self.stored_amount - self.consumed_amount
    }

    pub fn ensure_capacity(&self, limit: Option<usize>) -> Result<()> {
        check_capacity(&self.producer, self.transactions.len(), limit)
    }

    pub fn store(&mut self, amount: Amount, now: Timestamp) -> Result<TxRef> {
        check_amount(amount)?;
        let stored = self
            .stored_amount
            .checked_add(amount)
            .ok_or(LedgerError::ArithmeticOverflow {
                context: "stored amount",
            })?;
        self.stored_amount = stored;
        Ok(self.append(TransactionType::Store, amount, now))
    }

    pub fn consume(&mut self, amount: Amount, now: Timestamp) -> Result<TxRef> {
        check_amount(amount)?;
        if amount > self.balance() {
            return Err(LedgerError::InsufficientBalance {
                producer: self.producer.clone(),
                available: self.balance(),
                requested: amount,
            });
        }
        self.consumed_amount += amount;
        Ok(self.append(TransactionType::Consume, amount, now))
    }

    fn append(&mut self, tx_type: TransactionType, amount: Amount, now: Timestamp) -> TxRef {
        // clock skew must not reorder the log
        let timestamp = now.max(self.last_reconciled);
        self.transactions.push(Transaction {
            tx_type,
            amount,
            timestamp,
        });
        self.last_reconciled = timestamp;
        TxRef {
            ledger: self.key,
            index: (self.transactions.len() - 1) as u64,
        }
    }

    /// Checks that counters, log and key agree. Used when loading persisted state.
    pub fn verify(&self, bank: &BatteryBank) -> Result<()> {
        let corrupt = |msg: String| -> Result<()> {
            Err(LedgerError::CorruptSnapshot(format!(
                "ledger {}: {msg}",
                self.producer
            )))
        };
        if self.key != bank.ledger_key(&self.producer) {
            return corrupt("key does not match bank and producer".into());
        }
        match self.transactions.first() {
            Some(tx) if tx.tx_type == TransactionType::Store => {}
            _ => return corrupt("log must start with a store".into()),
        }
        let mut stored: u128 = 0;
        let mut consumed: u128 = 0;
        let mut last = Timestamp::MIN;
        for (idx, tx) in self.transactions.iter().enumerate() {
            if tx.amount == 0 {
                return corrupt(format!("transaction {idx} has zero amount"));
            }
            if tx.timestamp < last {
                return corrupt(format!("transaction {idx} goes back in time"));
            }
            last = tx.timestamp;
            match tx.tx_type {
                TransactionType::Store => stored += tx.amount as u128,
                TransactionType::Consume => consumed += tx.amount as u128,
            }
            if consumed > stored {
                return corrupt(format!("transaction {idx} overdraws the ledger"));
            }
        }
        if stored != self.stored_amount as u128 || consumed != self.consumed_amount as u128 {
            return corrupt("counters disagree with the transaction log".into());
        }
        if self.last_reconciled != last {
            return corrupt("last_reconciled disagrees with the last transaction".into());
        }
        Ok(())
    }
}

pub fn check_amount(amount: Amount) -> Result<()> {
    if amount == 0 {
        return Err(LedgerError::InvalidAmount {
            reason: "amount must be greater than zero".into(),
        });
    }
    Ok(())
}

/// Validates a fee as received from the outside world, where it may be signed.
pub fn check_fee(raw: i128, max: Price) -> Result<Price> {
    if raw < 0 {
        return Err(LedgerError::InvalidFee {
            reason: format!("{raw} is negative"),
        });
    }
    if raw > max as i128 {
        return Err(LedgerError::InvalidFee {
            reason: format!("{raw} exceeds maximum {max}"),
        });
    }
    Ok(raw as Price)
}

/// Fails with `LedgerFull` when a log of `len` entries cannot take another.
/// A ledger that does not exist yet counts as `len == 0`.
pub fn check_capacity(producer: &Identity, len: usize, limit: Option<usize>) -> Result<()> {
    match limit {
        Some(limit) if len >= limit => Err(LedgerError::LedgerFull {
            producer: producer.clone(),
            limit,
        }),
        _ => Ok(()),
    }
}

/// Parses a signed amount coming from the outside world.
pub fn parse_amount(raw: i128) -> Result<Amount> {
    if raw <= 0 {
        return Err(LedgerError::InvalidAmount {
            reason: format!("{raw} is not positive"),
        });
    }
    Amount::try_from(raw).map_err(|_| LedgerError::InvalidAmount {
        reason: format!("{raw} is out of range"),
    })
}

/// Parses a signed per-unit rate coming from the outside world.
pub fn parse_rate(raw: i128) -> Result<Price> {
    if raw < 0 {
        return Err(LedgerError::InvalidAmount {
            reason: format!("rate {raw} is negative"),
        });
    }
    Price::try_from(raw).map_err(|_| LedgerError::InvalidAmount {
        reason: format!("rate {raw} is out of range"),
    })
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub bank: Option<BatteryBank>,
    pub ledgers: BTreeMap<LedgerKey, ProducerLedger>,
    #[serde(with = "serde_hex")]
    pub state_root: [u8; 32],
}

impl LedgerSnapshot {
    pub fn new(bank: Option<BatteryBank>, ledgers: BTreeMap<LedgerKey, ProducerLedger>) -> Self {
        let state_root = compute_state_root(bank.as_ref(), &ledgers);
        Self {
            bank,
            ledgers,
            state_root,
        }
    }

    pub fn empty() -> Self {
        Self::new(None, BTreeMap::new())
    }

    /// Recomputes the root and every ledger invariant.
    pub fn verify(&self) -> Result<()> {
        let expected = compute_state_root(self.bank.as_ref(), &self.ledgers);
        if expected != self.state_root {
            return Err(LedgerError::CorruptSnapshot(format!(
                "state root mismatch: stored {}, computed {}",
                hex::encode(self.state_root),
                hex::encode(expected)
            )));
        }
        match &self.bank {
            None if !self.ledgers.is_empty() => Err(LedgerError::CorruptSnapshot(
                "producer ledgers without a battery bank".into(),
            )),
            None => Ok(()),
            Some(bank) => {
                for (key, ledger) in &self.ledgers {
                    if *key != ledger.key {
                        return Err(LedgerError::CorruptSnapshot(format!(
                            "ledger {} filed under foreign key {key}",
                            ledger.producer
                        )));
                    }
                    ledger.verify(bank)?;
                }
                Ok(())
            }
        }
    }
}

fn compute_state_root(
    bank: Option<&BatteryBank>,
    ledgers: &BTreeMap<LedgerKey, ProducerLedger>,
) -> [u8; 32] {
    let bank_leaf = bank.map(|bank| {
        let mut hasher = Sha256::new();
        hasher.update(b"bank");
        hasher.update(bank.id.0);
        hasher.update(bank.owner.as_str().as_bytes());
        hasher.update(bank.storage_fee.to_le_bytes());
        <[u8; 32]>::from(hasher.finalize())
    });
    let mut level: Vec<[u8; 32]> = bank_leaf
        .into_iter()
        .chain(ledgers.iter().map(|(key, ledger)| ledger_leaf(key, ledger)))
        .collect();
    if level.is_empty() {
        return Sha256::digest(b"gridbalance-empty").into();
    }
    // An unpaired node moves up a level unchanged.
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| -> [u8; 32] {
                match pair {
                    [left, right] => {
                        let mut hasher = Sha256::new();
                        hasher.update(b"node");
                        hasher.update(left);
                        hasher.update(right);
                        hasher.finalize().into()
                    }
                    _ => pair[0],
                }
            })
            .collect();
    }
    level[0]
}

/// Commits to the ledger's counters and to every logged transaction in order.
fn ledger_leaf(key: &LedgerKey, ledger: &ProducerLedger) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"ledger");
    hasher.update(key.0);
    hasher.update((ledger.producer.as_str().len() as u64).to_le_bytes());
    hasher.update(ledger.producer.as_str().as_bytes());
    hasher.update(ledger.stored_amount.to_le_bytes());
    hasher.update(ledger.consumed_amount.to_le_bytes());
    hasher.update(ledger.rate.to_le_bytes());
    hasher.update(ledger.last_reconciled.to_le_bytes());
    hasher.update((ledger.transactions.len() as u64).to_le_bytes());
    for tx in &ledger.transactions {
        let tag: u8 = match tx.tx_type {
            TransactionType::Store => 0,
            TransactionType::Consume => 1,
        };
        hasher.update([tag]);
        hasher.update(tx.amount.to_le_bytes());
        hasher.update(tx.timestamp.to_le_bytes());
    }
    hasher.finalize().into()
}

pub(crate) mod serde_hex {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(D::Error::custom)?;
        <[u8; 32]>::try_from(bytes.as_slice())
            .map_err(|_| D::Error::custom(format!("expected 32 bytes, got {}", bytes.len())))
    }
}
