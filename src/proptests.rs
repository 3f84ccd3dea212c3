use std::collections::HashSet;

use approx::relative_eq;
use proptest::prelude::*;

use crate::{label_cells, Accumulator, Extent, Fragment, GridSpec};

fn extent_and_cell_size() -> impl Strategy<Value = (Extent, f64)> {
    (
        -1e4..1e4f64,
        0. ..500f64,
        -1e4..1e4f64,
        0. ..500f64,
        0.05..50f64,
    )
        .prop_map(|(xmin, dx, ymin, dy, cell_size)| {
            (Extent::new(xmin, xmin + dx, ymin, ymin + dy), cell_size)
        })
}

fn small_grid() -> impl Strategy<Value = GridSpec> {
    (0usize..25, 0usize..25, 0.1..10f64).prop_map(|(cols, rows, cell_size)| {
        let extent = Extent::new(0., cols as f64 * cell_size, 0., rows as f64 * cell_size);
        GridSpec::from_extent(&extent, cell_size).unwrap()
    })
}

proptest! {
    #[test]
    fn grid_dimensions_follow_the_floor_formula((extent, cell_size) in extent_and_cell_size()) {
        let grid = GridSpec::from_extent(&extent, cell_size).unwrap();
        let width = (extent.width() / cell_size).floor() as usize + 1;
        let height = (extent.height() / cell_size).floor() as usize + 1;
        prop_assert_eq!(grid.width(), width);
        prop_assert_eq!(grid.height(), height);

        // 网格总能盖住整个范围
        let tolerance = 1e-9 * (1. + extent.xmax.abs().max(extent.ymax.abs()));
        prop_assert!(extent.xmin + grid.width() as f64 * cell_size >= extent.xmax - tolerance);
        prop_assert!(grid.top() >= extent.ymax - tolerance);
    }

    #[test]
    fn labels_are_a_bijection_onto_cell_ids(grid in small_grid()) {
        let labels = label_cells::<u32>(&grid).unwrap();
        let mut seen = HashSet::new();
        for ((row, col), label) in labels.indexed_iter() {
            prop_assert!(seen.insert(*label));
            prop_assert_eq!(grid.cell_index(u64::from(*label)).unwrap(), (row, col));
        }
        prop_assert_eq!(seen.len(), grid.cell_count());
        prop_assert_eq!(seen.iter().min().copied(), Some(1));
        prop_assert_eq!(seen.iter().max().copied(), Some(grid.cell_count() as u32));
    }

    #[test]
    fn cell_sums_match_the_weighted_formula(
        grid in small_grid(),
        pieces in prop::collection::vec((0usize..10_000, -1e3..1e3f64, 0. ..1f64), 1..60),
    ) {
        let cell_area = grid.cell_area();
        let fragments: Vec<Fragment> = pieces
            .iter()
            .map(|(slot, value, share)| Fragment {
                cell_id: (slot % grid.cell_count()) as u64 + 1,
                value: Some(*value),
                area: share * cell_area,
            })
            .collect();

        let mut acc = Accumulator::new(&grid);
        // 顺序打乱不影响结果
        for fragment in fragments.iter().rev() {
            acc.add(fragment).unwrap();
        }
        let cells = acc.finish(-9999.);

        for ((row, col), cell) in cells.indexed_iter() {
            let id = grid.cell_id(row, col);
            let mine: Vec<&Fragment> = fragments.iter().filter(|f| f.cell_id == id).collect();
            if mine.is_empty() {
                prop_assert_eq!(*cell, -9999.);
            } else {
                let expected = mine
                    .iter()
                    .map(|f| f.value.unwrap() * f.area)
                    .sum::<f64>()
                    / cell_area;
                prop_assert!(
                    relative_eq!(*cell, expected, epsilon = 1e-6, max_relative = 1e-6),
                    "cell ({}, {}) = {} but expected {}", row, col, cell, expected
                );
            }
        }
    }

    #[test]
    fn nodata_choice_does_not_touch_covered_cells(
        grid in small_grid(),
        ids in prop::collection::vec(0usize..10_000, 0..30),
        nodata in -1e6..1e6f64,
    ) {
        let mut acc = Accumulator::new(&grid);
        for slot in &ids {
            let fragment = Fragment {
                cell_id: (slot % grid.cell_count()) as u64 + 1,
                value: Some(1.5),
                area: grid.cell_area() / 3.,
            };
            acc.add(&fragment).unwrap();
        }
        let coverage = acc.coverage().clone();
        let first = acc.clone().finish(-9999.);
        let second = acc.finish(nodata);

        for ((a, b), covered) in first.iter().zip(&second).zip(&coverage) {
            if *covered {
                prop_assert_eq!(a, b);
            } else {
                prop_assert_eq!(*a, -9999.);
                prop_assert_eq!(*b, nodata);
            }
        }
    }
}
