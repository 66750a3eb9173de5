//! Cascading close: deep trees, exactly-once release, and resilience to
//! individual release failures.

mod common;

use ndscope::{DataType, NdScope, Shape};

#[test]
fn three_level_tree_releases_everything() {
    let (runtime, backend) = common::runtime();
    let top = runtime.new_scope(None).unwrap();
    let mid = top.new_sub_scope(None).unwrap();
    let leaf = mid.new_sub_scope(None).unwrap();

    let mut arrays = Vec::new();
    for scope in [&top, &mid, &leaf] {
        for _ in 0..3 {
            arrays.push(scope.create(Shape::of(&[16]), DataType::F32, None).unwrap());
        }
    }
    assert_eq!(backend.live_handles(), 9);

    top.close().unwrap();

    assert!(!mid.is_open());
    assert!(!leaf.is_open());
    for array in &arrays {
        assert!(array.is_released());
    }
    assert_eq!(backend.live_handles(), 0);
    assert_eq!(backend.release_count(), 9);
}

#[test]
fn closing_an_inner_scope_spares_the_outer() {
    let (runtime, backend) = common::runtime();
    let outer = runtime.new_scope(None).unwrap();
    let inner = outer.new_sub_scope(None).unwrap();

    let kept = outer.create(Shape::of(&[4]), DataType::F32, None).unwrap();
    let dropped = inner.create(Shape::of(&[4]), DataType::F32, None).unwrap();

    inner.close().unwrap();

    assert!(dropped.is_released());
    assert!(!kept.is_released());
    assert!(outer.is_open());
    assert_eq!(backend.live_handles(), 1);

    outer.close().unwrap();
    assert_eq!(backend.live_handles(), 0);
}

#[test]
fn release_failure_does_not_stop_the_cascade() {
    let (runtime, backend) = common::runtime();
    let scope = runtime.new_scope(None).unwrap();

    let arrays: Vec<_> = (0..5)
        .map(|_| scope.create(Shape::of(&[4]), DataType::F32, None).unwrap())
        .collect();
    backend.fail_release_of(arrays[2].handle());

    // Close succeeds despite the failure; the other four are freed
    scope.close().unwrap();

    for array in &arrays {
        assert!(array.is_released());
    }
    assert_eq!(backend.release_count(), 4);
    assert_eq!(backend.live_handles(), 1);
}

#[test]
fn failure_in_a_child_scope_spares_siblings() {
    let (runtime, backend) = common::runtime();
    let top = runtime.new_scope(None).unwrap();
    let bad = top.new_sub_scope(None).unwrap();
    let good = top.new_sub_scope(None).unwrap();

    let poisoned = bad.create(Shape::of(&[4]), DataType::F32, None).unwrap();
    let fine = good.create(Shape::of(&[4]), DataType::F32, None).unwrap();
    backend.fail_release_of(poisoned.handle());

    top.close().unwrap();

    assert!(!bad.is_open());
    assert!(!good.is_open());
    assert!(fine.is_released());
    assert_eq!(backend.live_handles(), 1);
}

#[test]
fn deep_nesting_closes_bottom_up() {
    let (runtime, backend) = common::runtime();
    let top = runtime.new_scope(None).unwrap();

    let mut scopes: Vec<NdScope> = vec![top.clone()];
    for _ in 0..20 {
        let next = scopes.last().unwrap().new_sub_scope(None).unwrap();
        next.create(Shape::of(&[2]), DataType::F32, None).unwrap();
        scopes.push(next);
    }
    assert_eq!(backend.live_handles(), 20);

    top.close().unwrap();

    for scope in &scopes {
        assert!(!scope.is_open());
    }
    assert_eq!(backend.live_handles(), 0);
}

#[test]
fn cascade_skips_arrays_already_closed_by_hand() {
    let (runtime, backend) = common::runtime();
    let scope = runtime.new_scope(None).unwrap();

    let early = scope.create(Shape::of(&[4]), DataType::F32, None).unwrap();
    let late = scope.create(Shape::of(&[4]), DataType::F32, None).unwrap();

    early.close().unwrap();
    scope.close().unwrap();

    assert!(late.is_released());
    assert_eq!(backend.release_count(), 2);
}

#[test]
fn moved_array_follows_its_new_scope() {
    let (runtime, backend) = common::runtime();
    let from = runtime.new_scope(None).unwrap();
    let to = runtime.new_scope(None).unwrap();

    let array = from.create(Shape::of(&[4]), DataType::F32, None).unwrap();
    array.move_to(&to).unwrap();

    from.close().unwrap();
    assert!(!array.is_released());

    to.close().unwrap();
    assert!(array.is_released());
    assert_eq!(backend.live_handles(), 0);
}
