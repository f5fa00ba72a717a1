//! Priority calculator (C7, spec §4.7).
//!
//! Pure functions grounded verbatim on
//! `core/translation/translation_priority_calculator.py` in
//! `examples/original_source/` (the `base_weight`/`decay`/direction-multiplier
//! formula is unchanged from the original).

use serde::{Deserialize, Serialize};

use super::model::Priority;

/// Reading direction, affecting which side of the current page is favored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadingDirection {
    Ltr,
    Rtl,
}

const BASE_WEIGHT: f64 = 100.0;
const DISTANCE_DECAY: f64 = 0.8;
const DIFFERENT_WORK_WEIGHT: f64 = 0.1;
const CURRENT_PAGE_WEIGHT: f64 = 1000.0;
const BEYOND_PRELOAD_WEIGHT: f64 = 0.5;

/// Priority class for a task relative to the current reading position.
pub fn priority_class(
    task_manga_ref: &str,
    task_page_index: u32,
    current_manga_ref: &str,
    current_page_index: u32,
) -> Priority {
    if task_manga_ref != current_manga_ref {
        return Priority::P3Other;
    }

    let distance = page_distance(task_page_index, current_page_index);
    if distance == 0 {
        Priority::P0Current
    } else if distance <= 2 {
        Priority::P1Adjacent
    } else {
        Priority::P2SameWork
    }
}

/// Continuous reading weight used for ordering within a class and for
/// preload decisions.
pub fn reading_weight(
    task_manga_ref: &str,
    task_page_index: u32,
    current_manga_ref: &str,
    current_page_index: u32,
    direction: ReadingDirection,
    max_preload_distance: u32,
) -> f64 {
    if task_manga_ref != current_manga_ref {
        return DIFFERENT_WORK_WEIGHT;
    }

    let distance = page_distance(task_page_index, current_page_index);
    if distance == 0 {
        return CURRENT_PAGE_WEIGHT;
    }
    if distance > max_preload_distance {
        return BEYOND_PRELOAD_WEIGHT;
    }

    let distance_weight = BASE_WEIGHT * DISTANCE_DECAY.powi(distance as i32);
    distance_weight * direction_multiplier(task_page_index, current_page_index, direction)
}

/// `1.2` when `task_page_index` is on the side of `current_page_index` that
/// the reader is moving toward, `0.8` otherwise.
pub fn direction_multiplier(
    task_page_index: u32,
    current_page_index: u32,
    direction: ReadingDirection,
) -> f64 {
    let favored = match direction {
        ReadingDirection::Ltr => task_page_index > current_page_index,
        ReadingDirection::Rtl => task_page_index < current_page_index,
    };
    if favored {
        1.2
    } else {
        0.8
    }
}

fn page_distance(a: u32, b: u32) -> u32 {
    a.abs_diff(b)
}

/// Top-`count` pages to preload around `current_page_index`, by weight,
/// excluding the current page and any out-of-range index.
pub fn preload_pages(
    current_page_index: u32,
    total_pages: u32,
    direction: ReadingDirection,
    max_preload_distance: u32,
    count: usize,
) -> Vec<u32> {
    let manga_ref = "__self__";
    let mut candidates: Vec<(u32, f64)> = Vec::new();

    for offset in 1..=max_preload_distance {
        if current_page_index >= offset {
            let page = current_page_index - offset;
            let weight = reading_weight(
                manga_ref,
                page,
                manga_ref,
                current_page_index,
                direction,
                max_preload_distance,
            );
            candidates.push((page, weight));
        }
        let next = current_page_index + offset;
        if next < total_pages {
            let weight = reading_weight(
                manga_ref,
                next,
                manga_ref,
                current_page_index,
                direction,
                max_preload_distance,
            );
            candidates.push((next, weight));
        }
    }

    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    candidates.into_iter().take(count).map(|(p, _)| p).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn different_manga_is_p3_with_low_weight() {
        assert_eq!(
            priority_class("/m/a.zip", 5, "/m/b.zip", 5),
            Priority::P3Other
        );
        assert_eq!(
            reading_weight("/m/a.zip", 5, "/m/b.zip", 5, ReadingDirection::Ltr, 5),
            0.1
        );
    }

    #[test]
    fn current_page_is_p0_with_max_weight() {
        assert_eq!(priority_class("/m/a.zip", 5, "/m/a.zip", 5), Priority::P0Current);
        assert_eq!(
            reading_weight("/m/a.zip", 5, "/m/a.zip", 5, ReadingDirection::Ltr, 5),
            1000.0
        );
    }

    #[test]
    fn distance_two_is_adjacent_distance_three_is_same_work() {
        assert_eq!(priority_class("/m/a.zip", 7, "/m/a.zip", 5), Priority::P1Adjacent);
        assert_eq!(priority_class("/m/a.zip", 8, "/m/a.zip", 5), Priority::P2SameWork);
    }

    #[test]
    fn beyond_preload_distance_gets_flat_low_weight() {
        let w = reading_weight("/m/a.zip", 20, "/m/a.zip", 5, ReadingDirection::Ltr, 5);
        assert_eq!(w, 0.5);
    }

    #[test]
    fn scenario_b_prefetch_ordering_weights() {
        // current = page 10, rtl.
        let w = |page: u32| {
            reading_weight("/m/a.zip", page, "/m/a.zip", 10, ReadingDirection::Rtl, 5)
        };
        // rtl favors pages below the current index.
        assert!(w(9) > w(11));
        assert!(w(8) > w(12));
    }

    #[test]
    fn preload_pages_excludes_current_and_out_of_range() {
        let pages = preload_pages(0, 3, ReadingDirection::Ltr, 5, 10);
        assert!(!pages.contains(&0));
        assert!(pages.iter().all(|&p| p < 3));
    }
}
