//! Property-based checks of the overlay stream against a model
//!
//! - Version monotonicity across flushes and reopen
//! - Dedicated batches preserve submission order
//! - Truncation never removes a record above the truncation point
//! - Failed reserved writes leave the reservation untouched

use crate::common::*;
use ktlog::{LogError, ReadType, RecordStream, StreamId, StreamType};
use proptest::prelude::*;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum Op {
    Write { asn: u64, version: u64 },
    Flush,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (1u64..16, 1u64..6).prop_map(|(asn, version)| Op::Write { asn, version }),
        1 => Just(Op::Flush),
    ]
}

fn record_data(asn: u64, version: u64) -> Vec<u8> {
    format!("{}-{}", asn, version).into_bytes()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_version_monotonicity_survives_reopen(ops in prop::collection::vec(op(), 1..40)) {
        let fx = OverlayFixture::new();
        let id = StreamId::new();
        let mut model: BTreeMap<u64, u64> = BTreeMap::new();
        {
            let s = fx.log.create_log_stream(id, StreamType::new()).unwrap();
            for op in &ops {
                match *op {
                    Op::Flush => s.flush().unwrap(),
                    Op::Write { asn: a, version } => {
                        let result = s.write(asn(a), version, b"", &record_data(a, version));
                        match model.get(&a) {
                            Some(stored) if *stored >= version => {
                                prop_assert!(matches!(result, Err(LogError::NameCollision(_))));
                            }
                            _ => {
                                prop_assert!(result.is_ok());
                                model.insert(a, version);
                            }
                        }
                    }
                }
            }
            for (a, version) in &model {
                let record = s.read(asn(*a), ReadType::Exact).unwrap();
                prop_assert_eq!(record.version, *version);
            }
        }

        let s = fx.log.open_log_stream(id).unwrap();
        for (a, version) in &model {
            let record = s.read(asn(*a), ReadType::Exact).unwrap();
            prop_assert_eq!(record.version, *version);
            prop_assert_eq!(record.data, record_data(*a, *version));
        }
    }

    #[test]
    fn prop_batches_follow_submission_order(count in 1u64..60, flush_every in 1u64..20) {
        let fx = OverlayFixture::new();
        let s = fx.stream();
        for n in 1..=count {
            s.write(asn(n), 1, b"", &payload(n)).unwrap();
            if n % flush_every == 0 {
                s.flush().unwrap();
            }
        }
        s.flush().unwrap();

        let mut out = Vec::new();
        s.query_records(asn(1), asn(count), &mut out).unwrap();
        prop_assert_eq!(out.len() as u64, count);
        // The batch number stands in for the LSN of a flushed record
        prop_assert!(out.windows(2).all(|w| w[0].asn < w[1].asn && w[0].lsn <= w[1].lsn));

        let batches = s.dedicated_batches().unwrap();
        prop_assert!(batches.windows(2).all(|w| w[0].asn < w[1].asn));
    }

    #[test]
    fn prop_truncation_safety(
        count in 1u64..30,
        point in 0u64..35,
        preferred in 0u64..35,
        flush_first in any::<bool>(),
    ) {
        let fx = OverlayFixture::new();
        let s = fx.stream();
        write_all(&s, 1..=count);
        if flush_first {
            s.flush().unwrap();
        }
        s.truncate(asn(point), asn(preferred)).unwrap();

        for n in (point + 1)..=count {
            prop_assert_eq!(s.read(asn(n), ReadType::Exact).unwrap().data, payload(n));
        }
    }

    #[test]
    fn prop_failed_reserved_writes_conserve_reservation(
        reserved in 1u64..2000,
        attempts in prop::collection::vec((1u64..8, 0u64..3000, any::<bool>()), 1..20),
    ) {
        let fx = OverlayFixture::new();
        let s = fx.stream();
        s.update_reservation(reserved as i64).unwrap();

        for (a, reserve, oversized) in attempts {
            let before = s.query_reservation();
            let data = if oversized { vec![0u8; 1024 * 1024] } else { payload(a) };
            match s.reserved_write(reserve, asn(a), 1, b"", &data) {
                Ok(_) => prop_assert_eq!(s.query_reservation(), before - reserve),
                Err(_) => prop_assert_eq!(s.query_reservation(), before),
            }
        }
    }
}
