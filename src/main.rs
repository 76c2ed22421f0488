use std::{path::PathBuf, process, sync::Arc};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gridbalance_ledger::{
    ledger::{check_fee, parse_amount, parse_rate},
    CliConfig, Identity, JsonFileStore, LedgerService, LedgerSnapshot, LedgerStore,
    Reconciliation, Result, Settlement, StatementLine, SystemClock,
};

#[derive(Parser)]
#[command(name = "gridbalance", version, about = "Energy storage ledger and reconciliation")]
struct Cli {
    /// JSON config file (state_path, log_level, service limits)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State file, overrides config
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the battery bank
    Init {
        #[arg(long, allow_negative_numbers = true)]
        fee: i128,
        #[arg(long)]
        owner: String,
    },
    /// Deposit energy as a producer
    Store {
        #[arg(long)]
        caller: String,
        #[arg(long)]
        producer: String,
        #[arg(long, allow_negative_numbers = true)]
        amount: i128,
        /// Only used on the producer's first deposit
        #[arg(long, allow_negative_numbers = true, default_value_t = 0)]
        rate: i128,
    },
    /// Withdraw a producer's stored energy as the owner
    Consume {
        #[arg(long)]
        caller: String,
        #[arg(long)]
        producer: String,
        #[arg(long, allow_negative_numbers = true)]
        amount: i128,
    },
    /// Amounts owed for one producer, or totals over all producers
    Reconcile {
        #[arg(long)]
        producer: Option<String>,
        /// Also list each priced transaction
        #[arg(long)]
        statement: bool,
    },
    /// Show the bank and ledgers
    Show {
        #[arg(long)]
        producer: Option<String>,
    },
    /// Check the state file's root hash and ledger invariants
    Verify,
}

impl Command {
    fn mutates(&self) -> bool {
        matches!(
            self,
            Command::Init { .. } | Command::Store { .. } | Command::Consume { .. }
        )
    }
}

fn identity(raw: &str) -> Result<Identity> {
    Identity::new(raw.trim())
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text());
    }
    Ok(())
}

fn describe(rec: &Reconciliation) -> String {
    let direction = match rec.settlement() {
        Settlement::OwnerOwesProducer(n) => format!("{n} owed to producer"),
        Settlement::ProducerOwesOwner(n) => format!("{n} owed to owner"),
        Settlement::Settled => "settled".to_string(),
    };
    format!(
        "producer owes owner (storage): {}\nowner owes producer (consumed): {}\nnet balance: {}",
        rec.owed_by_producer_to_owner, rec.owed_by_owner_to_producer, direction
    )
}

fn render_statement(lines: &[StatementLine]) -> Result<String> {
    let rows = lines
        .iter()
        .map(|l| -> Result<String> {
            Ok(format!(
                "#{:<4} {:<8} {:>12} x {:<8} = {:>+16}  @{}",
                l.index,
                l.tx_type,
                l.amount,
                l.unit_price,
                l.signed_total()?,
                l.timestamp
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(rows.join("\n"))
}

fn run(cli: Cli) -> Result<()> {
    let mut config = CliConfig::load_or_default(cli.config.as_deref())?;
    if let Some(state) = cli.state {
        config.state_path = state;
    }
    init_tracing(&config.log_level);

    let store = JsonFileStore::new(&config.state_path);
    let mutates = cli.command.mutates();
    // The state file stays locked from load to save.
    store.update(config.service.contention, |snapshot| {
        let snapshot = snapshot.unwrap_or_else(LedgerSnapshot::empty);
        let service =
            LedgerService::restore(snapshot, config.service.clone(), Arc::new(SystemClock))?;
        execute(&service, cli.command, cli.json)?;
        Ok(((), mutates.then(|| service.snapshot())))
    })?;
    if mutates {
        info!(path = %config.state_path.display(), "state saved");
    }
    Ok(())
}

fn execute(service: &LedgerService, command: Command, json: bool) -> Result<()> {
    match command {
        Command::Init { fee, owner } => {
            let fee = check_fee(fee, service.config().max_storage_fee)?;
            let bank = service.initialize(fee, identity(&owner)?)?;
            emit(json, &bank, || format!("battery bank {bank}"))?;
        }
        Command::Store {
            caller,
            producer,
            amount,
            rate,
        } => {
            let tx = service.store_energy(
                &identity(&caller)?,
                &identity(&producer)?,
                parse_amount(amount)?,
                parse_rate(rate)?,
            )?;
            emit(json, &tx, || format!("stored: ledger {} tx #{}", tx.ledger, tx.index))?;
        }
        Command::Consume {
            caller,
            producer,
            amount,
        } => {
            let tx = service.consume_energy(
                &identity(&caller)?,
                &identity(&producer)?,
                parse_amount(amount)?,
            )?;
            emit(json, &tx, || format!("consumed: ledger {} tx #{}", tx.ledger, tx.index))?;
        }
        Command::Reconcile {
            producer: Some(producer),
            statement: true,
        } => {
            let report = service.statement_report(&identity(&producer)?)?;
            let text = if json {
                String::new()
            } else {
                format!(
                    "{}\n{}",
                    render_statement(&report.statement)?,
                    describe(&report.reconciliation)
                )
            };
            emit(json, &report, || text)?;
        }
        Command::Reconcile {
            producer: Some(producer),
            statement: false,
        } => {
            let rec = service.reconcile(&identity(&producer)?)?;
            emit(json, &rec, || describe(&rec))?;
        }
        Command::Reconcile { producer: None, .. } => {
            let rec = service.reconcile_all()?;
            emit(json, &rec, || describe(&rec))?;
        }
        Command::Show {
            producer: Some(producer),
        } => {
            let ledger = service.ledger(&identity(&producer)?)?;
            emit(json, &*ledger, || {
                format!(
                    "producer {}\n  stored {}  consumed {}  balance {}  rate {}\n  transactions {}  last update {}",
                    ledger.producer,
                    ledger.stored_amount(),
                    ledger.consumed_amount(),
                    ledger.balance(),
                    ledger.rate(),
                    ledger.transactions().len(),
                    ledger.last_reconciled()
                )
            })?;
        }
        Command::Show { producer: None } => {
            let snapshot = service.snapshot();
            emit(json, &snapshot, || {
                let mut out = match &snapshot.bank {
                    Some(bank) => format!(
                        "bank {} owner {} storage fee {}",
                        bank.id, bank.owner, bank.storage_fee
                    ),
                    None => "bank not initialized".to_string(),
                };
                for ledger in snapshot.ledgers.values() {
                    out.push_str(&format!(
                        "\n  {:<24} stored {:>12} consumed {:>12} rate {}",
                        ledger.producer.as_str(),
                        ledger.stored_amount(),
                        ledger.consumed_amount(),
                        ledger.rate()
                    ));
                }
                out
            })?;
        }
        Command::Verify => {
            // restore already checked the root and every ledger
            let root = hex::encode(service.snapshot().state_root);
            emit(json, &serde_json::json!({ "state_root": root.clone() }), || {
                format!("ok {root}")
            })?;
        }
    }
    Ok(())
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        let code = if err.is_rejection() { 2 } else { 1 };
        process::exit(code);
    }
}
