use chrono::{Duration, NaiveDate, NaiveDateTime};
use proptest::prelude::*;
use weightdur_core::{
    reconcile, reconcile_stay, EchoStrategy, Observation, ReconcileConfig, SourceClass, Stay,
    StayObservations, WeightDurations, WeightInterval, WeightType,
};

fn base() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2130, 6, 1)
        .and_then(|d| d.and_hms_opt(8, 0, 0))
        .expect("valid base timestamp")
}

#[derive(Debug, Clone)]
struct Reading {
    offset_min: i64,
    admit: bool,
    echo: bool,
    kg: f64,
}

fn reading() -> impl Strategy<Value = Reading> {
    (-600i64..6000, any::<bool>(), any::<bool>(), 0.5f64..250.0).prop_map(
        |(offset_min, admit, echo, kg)| Reading {
            offset_min,
            admit,
            echo,
            kg,
        },
    )
}

fn stay_case() -> impl Strategy<Value = (i64, Vec<Reading>)> {
    (60i64..5000, prop::collection::vec(reading(), 0..10))
}

fn build(cases: &[(i64, Vec<Reading>)]) -> (Vec<Stay>, Vec<Observation>) {
    let mut stays = Vec::new();
    let mut observations = Vec::new();
    for (idx, (length_min, readings)) in cases.iter().enumerate() {
        let stay_id = 200_000 + idx as i64;
        let intime = base() + Duration::days(idx as i64);
        stays.push(Stay {
            stay_id,
            encounter_id: stay_id,
            intime,
            outtime: intime + Duration::minutes(*length_min),
        });
        for r in readings {
            let (weight_type, source_class) = match (r.echo, r.admit) {
                (true, _) => (WeightType::Daily, SourceClass::Echo),
                (false, true) => (WeightType::Admit, SourceClass::Chart),
                (false, false) => (WeightType::Daily, SourceClass::Chart),
            };
            observations.push(
                Observation::new(
                    stay_id,
                    intime + Duration::minutes(r.offset_min),
                    r.kg,
                    weight_type,
                    source_class,
                )
                .expect("positive weight"),
            );
        }
    }
    (stays, observations)
}

fn assert_contiguous(intervals: &[WeightInterval]) {
    for interval in intervals {
        assert!(interval.start_time < interval.end_time);
    }
    for pair in intervals.windows(2) {
        assert_eq!(pair[0].end_time, pair[1].start_time);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn stays_are_covered_contiguously(
        cases in prop::collection::vec(stay_case(), 1..6),
        median in any::<bool>(),
    ) {
        let config = ReconcileConfig {
            echo_strategy: if median { EchoStrategy::Median } else { EchoStrategy::Sequential },
            ..ReconcileConfig::default()
        };
        let margin = config.margin();
        let (stays, observations) = build(&cases);
        let durations = reconcile(&stays, observations.clone(), &config).expect("valid config");

        for stay in &stays {
            let intervals = durations.for_stay(stay.stay_id);
            let mine: Vec<&Observation> =
                observations.iter().filter(|o| o.stay_id == stay.stay_id).collect();
            let primary: Vec<f64> = mine
                .iter()
                .filter(|o| o.source_class.is_primary())
                .map(|o| o.value_kg)
                .collect();
            let echoes: Vec<f64> = mine
                .iter()
                .filter(|o| !o.source_class.is_primary())
                .map(|o| o.value_kg)
                .collect();

            if mine.is_empty() {
                prop_assert!(intervals.is_empty());
                continue;
            }

            prop_assert!(!intervals.is_empty());
            assert_contiguous(intervals);

            let last = intervals[intervals.len() - 1];
            prop_assert!(last.end_time >= stay.outtime + margin);

            if !primary.is_empty() {
                prop_assert!(intervals[0].start_time <= stay.intime);
                prop_assert!(intervals.iter().all(|i| primary.contains(&i.value_kg)));
            } else if !median {
                prop_assert!(intervals[0].start_time <= stay.intime - margin);
                prop_assert!(intervals.iter().all(|i| echoes.contains(&i.value_kg)));
            } else {
                prop_assert_eq!(intervals.len(), 1);
                prop_assert_eq!(intervals[0].start_time, stay.intime - margin);
            }
        }
    }

    #[test]
    fn reconcile_is_idempotent(cases in prop::collection::vec(stay_case(), 1..6)) {
        let config = ReconcileConfig::default();
        let (stays, observations) = build(&cases);

        let first = reconcile(&stays, observations.clone(), &config).expect("valid config");
        let second = reconcile(&stays, observations, &config).expect("valid config");

        prop_assert_eq!(first, second);
    }

    // Built with the `rayon` feature this compares the parallel map against
    // a plain per-stay loop run in reverse order.
    #[test]
    fn matches_per_stay_reconciliation(
        cases in prop::collection::vec(stay_case(), 1..8),
        median in any::<bool>(),
    ) {
        let config = ReconcileConfig {
            echo_strategy: if median { EchoStrategy::Median } else { EchoStrategy::Sequential },
            ..ReconcileConfig::default()
        };
        let (stays, observations) = build(&cases);

        let mut expected = Vec::new();
        for stay in stays.iter().rev() {
            let mut mine = StayObservations::default();
            for observation in observations.iter().filter(|o| o.stay_id == stay.stay_id) {
                mine.push(*observation);
            }
            expected.extend(reconcile_stay(stay, &mine, &config));
        }

        let durations = reconcile(&stays, observations, &config).expect("valid config");
        prop_assert_eq!(durations, WeightDurations::new(expected));
    }
}
