use std::sync::Arc;

use gridbalance_ledger::{
    Identity, LedgerError, LedgerService, ManualClock, ServiceConfig, TransactionType,
};
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Op {
    Store { producer: u8, amount: u64, rate: u64 },
    Consume { producer: u8, amount: u64 },
    Tick(i64),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..3, 0u64..1_000, 0u64..50).prop_map(|(producer, amount, rate)| Op::Store {
            producer,
            amount,
            rate
        }),
        (0u8..3, 0u64..1_500).prop_map(|(producer, amount)| Op::Consume { producer, amount }),
        (-5i64..60).prop_map(Op::Tick),
    ]
}

fn producer(idx: u8) -> Identity {
    Identity::from(format!("producer-{idx}").as_str())
}

proptest! {
    #[test]
    fn ledger_invariants_hold_for_any_sequence(ops in prop::collection::vec(arb_op(), 1..80)) {
        let clock = Arc::new(ManualClock::new(0));
        let svc = LedgerService::with_clock(ServiceConfig::default(), clock.clone());
        let owner = Identity::from("owner");
        svc.initialize(3, owner.clone()).unwrap();

        let mut first_rate: [Option<u64>; 3] = [None; 3];
        for op in ops {
            let before = svc.snapshot();
            let result = match &op {
                Op::Store { producer: p, amount, rate } => {
                    let who = producer(*p);
                    let res = svc.store_energy(&who, &who, *amount, *rate);
                    if res.is_ok() && first_rate[*p as usize].is_none() {
                        first_rate[*p as usize] = Some(*rate);
                    }
                    res.map(|_| ())
                }
                Op::Consume { producer: p, amount } => {
                    svc.consume_energy(&owner, &producer(*p), *amount).map(|_| ())
                }
                Op::Tick(secs) => {
                    clock.advance(*secs);
                    Ok(())
                }
            };

            if let Err(err) = result {
                prop_assert!(matches!(
                    err,
                    LedgerError::InvalidAmount { .. }
                        | LedgerError::InsufficientBalance { .. }
                        | LedgerError::LedgerNotFound { .. }
                ), "unexpected {err}");
                prop_assert_eq!(svc.snapshot(), before.clone());
            }

            let after = svc.snapshot();
            for (key, ledger) in &after.ledgers {
                prop_assert!(ledger.consumed_amount() <= ledger.stored_amount());
                if let Some(prev) = before.ledgers.get(key) {
                    prop_assert!(ledger.stored_amount() >= prev.stored_amount());
                    prop_assert!(ledger.consumed_amount() >= prev.consumed_amount());
                    prop_assert_eq!(ledger.rate(), prev.rate());
                }
                let stamps: Vec<_> = ledger.transactions().iter().map(|t| t.timestamp).collect();
                prop_assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
            }
            after.verify().unwrap();
        }

        for idx in 0..3u8 {
            if let Some(rate) = first_rate[idx as usize] {
                prop_assert_eq!(svc.ledger(&producer(idx)).unwrap().rate(), rate);
            }
        }
    }

    #[test]
    fn reconciliation_matches_counters(
        fee in 0u64..1_000,
        rate in 0u64..1_000,
        deposits in prop::collection::vec(1u64..10_000, 1..20),
        draw_ratio in 0u64..=100,
    ) {
        let svc = LedgerService::default();
        let owner = Identity::from("owner");
        let p = Identity::from("p");
        svc.initialize(fee, owner.clone()).unwrap();
        for amount in &deposits {
            svc.store_energy(&p, &p, *amount, rate).unwrap();
        }
        let total: u64 = deposits.iter().sum();
        let draw = total * draw_ratio / 100;
        if draw > 0 {
            svc.consume_energy(&owner, &p, draw).unwrap();
        }

        let rec = svc.reconcile(&p).unwrap();
        prop_assert_eq!(rec.owed_by_producer_to_owner, total as u128 * fee as u128);
        prop_assert_eq!(rec.owed_by_owner_to_producer, draw as u128 * rate as u128);
        prop_assert_eq!(
            rec.net_balance,
            (draw as i128 * rate as i128) - (total as i128 * fee as i128)
        );
        prop_assert_eq!(svc.reconcile(&p).unwrap(), rec);

        let ledger = svc.ledger(&p).unwrap();
        let stores = ledger
            .transactions()
            .iter()
            .filter(|t| t.tx_type == TransactionType::Store)
            .count();
        prop_assert_eq!(stores, deposits.len());
    }
}
