//! Property-based tests for campaign-etl
//!
//! - Filters: narrowing never accepts more rows, `and` is row-wise conjunction
//! - Cache artifacts: a Parquet round trip returns the normalized table
//! - Sampling: deterministic, sorted, bounded by the limit
//! - Filtered repositories: every dataset keeps a subset of the parent rows

mod common;

use arrow::record_batch::RecordBatch;
use campaign_etl::constants::{GID, NEURON_CLASS, SIMULATION_ID, TIME};
use campaign_etl::extract::{sample_gids, DatasetName};
use campaign_etl::filter::SimulationsFilter;
use campaign_etl::storage::{load_parquet, write_parquet_atomic};
use campaign_etl::table::{column_names, scalar_values, TableBuilder};
use proptest::prelude::*;
use std::collections::BTreeSet;

fn campaign_table(seeds: &[i64]) -> RecordBatch {
    let n = i64::try_from(seeds.len()).unwrap();
    TableBuilder::new()
        .int64(SIMULATION_ID, (0..n).collect())
        .int64("seed", seeds.to_vec())
        .build()
        .unwrap()
}

/// A set of seeds and a subset of it
fn arb_nested_sets() -> impl Strategy<Value = (Vec<i64>, Vec<i64>)> {
    proptest::collection::btree_set(0i64..10, 1..8).prop_flat_map(|outer| {
        let outer: Vec<i64> = outer.into_iter().collect();
        let len = outer.len();
        (Just(outer), proptest::sample::subsequence((0..len).collect::<Vec<_>>(), 0..=len))
            .prop_map(|(outer, picks)| {
                let inner = picks.iter().map(|i| outer[*i]).collect();
                (outer, inner)
            })
    })
}

/// Rows rendered as strings, for set comparisons
fn rows(table: &RecordBatch) -> Vec<String> {
    let columns: Vec<_> = column_names(table)
        .iter()
        .map(|name| scalar_values(table, name).unwrap())
        .collect();
    (0..table.num_rows())
        .map(|i| format!("{:?}", columns.iter().map(|c| &c[i]).collect::<Vec<_>>()))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: a narrower membership filter is a subfilter and accepts a subset
    #[test]
    fn prop_narrower_filter_accepts_subset(
        seeds in proptest::collection::vec(0i64..10, 0..30),
        (outer, inner) in arb_nested_sets()
    ) {
        let table = campaign_table(&seeds);
        let wide = SimulationsFilter::new().isin("seed", outer);
        let narrow = SimulationsFilter::new().isin("seed", inner);
        prop_assert!(narrow.is_subfilter_of(&wide));
        prop_assert!(narrow.is_subfilter_of(&SimulationsFilter::new()));

        let wide_mask = wide.mask(&table).unwrap();
        let narrow_mask = narrow.mask(&table).unwrap();
        for (n, w) in narrow_mask.iter().zip(&wide_mask) {
            prop_assert!(!n || *w);
        }
        let (narrow_rows, wide_rows) = (
            narrow.apply(&table).unwrap().num_rows(),
            wide.apply(&table).unwrap().num_rows(),
        );
        prop_assert!(narrow_rows <= wide_rows);
    }

    /// Property: the conjunction accepts exactly the rows both filters accept
    #[test]
    fn prop_and_is_rowwise_conjunction(
        seeds in proptest::collection::vec(0i64..10, 0..30),
        a in proptest::collection::vec(0i64..10, 1..5),
        b in 0i64..10
    ) {
        let table = campaign_table(&seeds);
        let left = SimulationsFilter::new().isin("seed", a);
        let right = SimulationsFilter::new().eq("seed", b);
        let both = left.and(&right);
        let expected: Vec<bool> = left
            .mask(&table)
            .unwrap()
            .into_iter()
            .zip(right.mask(&table).unwrap())
            .map(|(l, r)| l && r)
            .collect();
        prop_assert_eq!(both.mask(&table).unwrap(), expected);
        prop_assert!(both.is_subfilter_of(&left));
        prop_assert!(both.is_subfilter_of(&right));
    }

    /// Property: cache artifacts round trip to the normalized table
    #[test]
    fn prop_parquet_round_trip(
        rows in proptest::collection::vec(
            (0i64..5, prop::sample::select(vec!["L2", "L5", "L6"]), 0i64..1000, 0.0f64..1000.0),
            1..50
        )
    ) {
        let dir = tempfile::tempdir().unwrap();
        let table = TableBuilder::new()
            .int64(SIMULATION_ID, rows.iter().map(|r| r.0).collect())
            .utf8(NEURON_CLASS, rows.iter().map(|r| r.1.to_string()).collect())
            .int64(GID, rows.iter().map(|r| r.2).collect())
            .float64(TIME, rows.iter().map(|r| r.3).collect())
            .build()
            .unwrap();
        let path = dir.path().join("spikes.parquet");
        write_parquet_atomic(&path, &table).unwrap();
        prop_assert_eq!(load_parquet(&path).unwrap(), table);
    }

    /// Property: sampling is deterministic, sorted and bounded
    #[test]
    fn prop_sampling_is_deterministic(
        gids in proptest::collection::btree_set(0i64..10_000, 0..200),
        limit in 0usize..100,
        seed in any::<u64>(),
        circuit_id in 0i16..4
    ) {
        let gids: Vec<i64> = gids.into_iter().collect();
        let first = sample_gids(gids.clone(), Some(limit), seed, circuit_id);
        let second = sample_gids(gids.clone(), Some(limit), seed, circuit_id);
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.len(), limit.min(gids.len()));
        prop_assert!(first.windows(2).all(|w| w[0] < w[1]));
        let all: BTreeSet<i64> = gids.iter().copied().collect();
        prop_assert!(first.iter().all(|g| all.contains(g)));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Property: a filtered repository holds a row subset of every parent dataset
    #[test]
    fn prop_apply_filter_keeps_row_subsets(
        seeds in proptest::collection::btree_set(1i64..=3, 1..=3)
    ) {
        let dir = tempfile::tempdir().unwrap();
        let mut parent = common::repository(dir.path());
        parent.extract_all().unwrap();
        let before: Vec<RecordBatch> = DatasetName::ALL
            .iter()
            .map(|name| parent.table(*name).unwrap().clone())
            .collect();

        let filter = SimulationsFilter::new().isin("seed", seeds.iter().copied());
        let child = parent.apply_filter(&filter).unwrap();

        // seeds 1 and 2 are simulations 0 and 1, seed 3 is incomplete
        let expected: Vec<i16> = [(1, 0), (2, 1)]
            .iter()
            .filter(|(seed, _)| seeds.contains(seed))
            .map(|(_, id)| *id)
            .collect();
        prop_assert_eq!(child.simulations().unwrap().simulation_ids().unwrap(), expected);

        for (name, parent_table) in DatasetName::ALL.iter().zip(&before) {
            prop_assert_eq!(parent.table(*name).unwrap(), parent_table);
            let child_table = child.table(*name).unwrap();
            prop_assert_eq!(column_names(child_table), column_names(parent_table));
            prop_assert!(child_table.num_rows() <= parent_table.num_rows());
            let parent_rows: BTreeSet<String> = rows(parent_table).into_iter().collect();
            for row in rows(child_table) {
                prop_assert!(parent_rows.contains(&row), "{} row {} not in parent", name, row);
            }
        }
    }
}
