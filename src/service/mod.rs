//! Mutation entry points for the battery bank and its producer ledgers.
//!
//! Each producer ledger sits in its own cell with a writer gate and a
//! published snapshot. Mutations hold the gate, build the next ledger value
//! off to the side and publish it with a single pointer swap, so readers
//! always see either the old or the new ledger and never a half-applied one.
//! Ledgers of different producers share nothing but the key index.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::{
    clock::{Clock, SystemClock},
    config::{ContentionPolicy, ServiceConfig},
    error::{LedgerError, Result},
    ledger::{
        check_amount, check_capacity, Amount, BankRef, BatteryBank, Identity, LedgerKey, LedgerSnapshot, Price,
        ProducerLedger, TxRef,
    },
    reconcile::{Reconciliation, ReconciliationEngine, StatementLine, StatementReport},
};

#[derive(Default)]
struct LedgerCell {
    writer: Mutex<()>,
    current: RwLock<Option<Arc<ProducerLedger>>>,
}

impl LedgerCell {
    fn with_ledger(ledger: ProducerLedger) -> Self {
        Self {
            writer: Mutex::new(()),
            current: RwLock::new(Some(Arc::new(ledger))),
        }
    }

    fn snapshot(&self) -> Option<Arc<ProducerLedger>> {
        self.current.read().clone()
    }

    fn publish(&self, ledger: ProducerLedger) {
        *self.current.write() = Some(Arc::new(ledger));
    }
}

pub struct LedgerService {
    config: ServiceConfig,
    clock: Arc<dyn Clock>,
    bank: RwLock<Option<Arc<BatteryBank>>>,
    ledgers: RwLock<BTreeMap<LedgerKey, Arc<LedgerCell>>>,
}

impl Default for LedgerService {
    fn default() -> Self {
        Self::new(ServiceConfig::default())
    }
}

impl LedgerService {
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ServiceConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            bank: RwLock::new(None),
            ledgers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Rebuilds a service from persisted state after checking every invariant.
    pub fn restore(
        snapshot: LedgerSnapshot,
        config: ServiceConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        snapshot.verify()?;
        let ledgers = snapshot
            .ledgers
            .into_iter()
            .map(|(key, ledger)| (key, Arc::new(LedgerCell::with_ledger(ledger))))
            .collect::<BTreeMap<_, _>>();
        debug!(
            ledgers = ledgers.len(),
            initialized = snapshot.bank.is_some(),
            "restored ledger state"
        );
        Ok(Self {
            config,
            clock,
            bank: RwLock::new(snapshot.bank.map(Arc::new)),
            ledgers: RwLock::new(ledgers),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Creates the battery bank. Succeeds at most once per service.
    pub fn initialize(&self, storage_fee: Price, owner: Identity) -> Result<BankRef> {
        owner.ensure_named().map_err(|err| rejected("initialize", err))?;
        if storage_fee > self.config.max_storage_fee {
            return Err(rejected(
                "initialize",
                LedgerError::InvalidFee {
                    reason: format!(
                        "{storage_fee} exceeds maximum {}",
                        self.config.max_storage_fee
                    ),
                },
            ));
        }
        let mut slot = self.bank.write();
        if slot.is_some() {
            return Err(rejected("initialize", LedgerError::AlreadyInitialized));
        }
        let bank = BatteryBank::new(owner, storage_fee);
        let id = bank.id;
        info!(bank = %id, owner = %bank.owner, storage_fee, "battery bank initialized");
        *slot = Some(Arc::new(bank));
        Ok(id)
    }

    pub fn bank(&self) -> Option<Arc<BatteryBank>> {
        self.bank.read().clone()
    }

    fn require_bank(&self) -> Result<Arc<BatteryBank>> {
        self.bank().ok_or(LedgerError::NotInitialized)
    }

    /// Records a deposit by `producer`. The rate only matters on the first
    /// deposit; later values are ignored and the original rate is kept.
    pub fn store_energy(
        &self,
        caller: &Identity,
        producer: &Identity,
        amount: Amount,
        rate: Price,
    ) -> Result<TxRef> {
        self.try_store(caller, producer, amount, rate)
            .map_err(|err| rejected("store_energy", err))
    }

    fn try_store(
        &self,
        caller: &Identity,
        producer: &Identity,
        amount: Amount,
        rate: Price,
    ) -> Result<TxRef> {
        let bank = self.require_bank()?;
        caller.ensure_named()?;
        if caller != producer {
            return Err(LedgerError::Unauthorized {
                caller: caller.clone(),
                required: producer.clone(),
            });
        }
        check_amount(amount)?;

        let key = bank.ledger_key(producer);
        let cell = self.cell_or_insert(key);
        let _gate = self.acquire(&cell, producer)?;
        let now = self.clock.now();

        let (next, tx) = match cell.snapshot() {
            None => {
                check_capacity(producer, 0, self.config.max_transactions_per_ledger)?;
                let ledger = ProducerLedger::open(&bank, producer.clone(), amount, rate, now)?;
                let tx = TxRef { ledger: key, index: 0 };
                info!(producer = %producer, amount, rate, "producer ledger opened");
                (ledger, tx)
            }
            Some(current) => {
                current.ensure_capacity(self.config.max_transactions_per_ledger)?;
                let mut next = ProducerLedger::clone(&current);
                let tx = next.store(amount, now)?;
                if rate != next.rate() {
                    debug!(
                        producer = %producer,
                        requested = rate,
                        fixed = next.rate(),
                        "ignoring rate on repeat deposit"
                    );
                }
                info!(producer = %producer, amount, stored = next.stored_amount(), "energy stored");
                (next, tx)
            }
        };
        cell.publish(next);
        Ok(tx)
    }

    /// Records the owner drawing `amount` from `producer`'s available balance.
    pub fn consume_energy(
        &self,
        caller: &Identity,
        producer: &Identity,
        amount: Amount,
    ) -> Result<TxRef> {
        self.try_consume(caller, producer, amount)
            .map_err(|err| rejected("consume_energy", err))
    }

    fn try_consume(&self, caller: &Identity, producer: &Identity, amount: Amount) -> Result<TxRef> {
        let bank = self.require_bank()?;
        caller.ensure_named()?;
        if *caller != bank.owner {
            return Err(LedgerError::Unauthorized {
                caller: caller.clone(),
                required: bank.owner.clone(),
            });
        }
        check_amount(amount)?;

        let not_found = || LedgerError::LedgerNotFound {
            producer: producer.clone(),
        };
        let cell = self.cell(&bank.ledger_key(producer)).ok_or_else(not_found)?;
        let _gate = self.acquire(&cell, producer)?;
        let current = cell.snapshot().ok_or_else(not_found)?;
        current.ensure_capacity(self.config.max_transactions_per_ledger)?;

        let mut next = ProducerLedger::clone(&current);
        let tx = next.consume(amount, self.clock.now())?;
        info!(
            producer = %producer,
            amount,
            consumed = next.consumed_amount(),
            balance = next.balance(),
            "energy consumed"
        );
        cell.publish(next);
        Ok(tx)
    }

    /// Consistent snapshot of one producer's ledger.
    pub fn ledger(&self, producer: &Identity) -> Result<Arc<ProducerLedger>> {
        let bank = self.require_bank()?;
        self.cell(&bank.ledger_key(producer))
            .and_then(|cell| cell.snapshot())
            .ok_or_else(|| LedgerError::LedgerNotFound {
                producer: producer.clone(),
            })
    }

    pub fn producers(&self) -> Vec<Identity> {
        self.ledger_snapshots()
            .into_iter()
            .map(|ledger| ledger.producer.clone())
            .collect()
    }

    pub fn reconcile(&self, producer: &Identity) -> Result<Reconciliation> {
        let bank = self.require_bank()?;
        let ledger = self.ledger(producer)?;
        ReconciliationEngine::compute(&bank, &ledger)
    }

    pub fn statement(&self, producer: &Identity) -> Result<Vec<StatementLine>> {
        let bank = self.require_bank()?;
        let ledger = self.ledger(producer)?;
        ReconciliationEngine::statement(&bank, &ledger)
    }

    /// Statement and totals computed from one ledger snapshot.
    pub fn statement_report(&self, producer: &Identity) -> Result<StatementReport> {
        let bank = self.require_bank()?;
        let ledger = self.ledger(producer)?;
        ReconciliationEngine::report(&bank, &ledger)
    }

    /// The owner's position summed over every producer.
    pub fn reconcile_all(&self) -> Result<Reconciliation> {
        let bank = self.require_bank()?;
        self.ledger_snapshots()
            .iter()
            .try_fold(Reconciliation::default(), |total, ledger| {
                total.combine(&ReconciliationEngine::compute(&bank, ledger)?)
            })
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let bank = self.bank().map(|bank| BatteryBank::clone(&bank));
        let ledgers = self
            .ledger_snapshots()
            .into_iter()
            .map(|ledger| (ledger.key, ProducerLedger::clone(&ledger)))
            .collect();
        LedgerSnapshot::new(bank, ledgers)
    }

    fn ledger_snapshots(&self) -> Vec<Arc<ProducerLedger>> {
        let cells: Vec<Arc<LedgerCell>> = self.ledgers.read().values().cloned().collect();
        cells.iter().filter_map(|cell| cell.snapshot()).collect()
    }

    fn cell(&self, key: &LedgerKey) -> Option<Arc<LedgerCell>> {
        self.ledgers.read().get(key).cloned()
    }

    fn cell_or_insert(&self, key: LedgerKey) -> Arc<LedgerCell> {
        if let Some(cell) = self.cell(&key) {
            return cell;
        }
        Arc::clone(self.ledgers.write().entry(key).or_default())
    }

    fn acquire<'a>(&self, cell: &'a LedgerCell, producer: &Identity) -> Result<MutexGuard<'a, ()>> {
        match self.config.contention {
            ContentionPolicy::Queue => Ok(cell.writer.lock()),
            ContentionPolicy::Reject => cell.writer.try_lock().ok_or_else(|| LedgerError::Conflict {
                resource: format!("producer {producer}"),
            }),
        }
    }
}

fn rejected(op: &'static str, err: LedgerError) -> LedgerError {
    warn!(op, error = %err, retryable = err.is_retryable(), "ledger operation rejected");
    err
}
