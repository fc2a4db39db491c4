//! Image lifecycle tests
//!
//! - Release is idempotent and hooks fire exactly once
//! - Mutation never touches the source image
//! - Evaluation progress and kill
//! - Concurrent calls on shared images
//! - Descriptor snapshots

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use vipsbridge_engine::{
    BandFormat, CachePolicy, Image, ProgressSignal, VOption, Value, Vips, VipsError,
};
use vipsbridge_sim::SimLibrary;

fn setup() -> (Arc<SimLibrary>, Vips) {
    let sim = Arc::new(SimLibrary::new());
    let vips = Vips::new(sim.clone());
    CachePolicy::disabled().apply(sim.as_ref());
    (sim, vips)
}

fn ramp(vips: &Vips, width: i32, height: i32) -> Image {
    let pixels: Vec<u8> = (0..width * height).map(|i| (i % 256) as u8).collect();
    Image::new_from_memory(vips, &pixels, width, height, 1, BandFormat::UChar).unwrap()
}

// ===== Release and hooks =====

#[test]
fn test_double_release_fires_hook_once() {
    let (sim, vips) = setup();
    let img = ramp(&vips, 4, 4);
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    img.on_post_close(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    img.release();
    img.release();
    drop(img);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(sim.live_objects(), 0);
}

#[test]
fn test_hooks_run_in_registration_order() {
    let (_sim, vips) = setup();
    let order = Arc::new(Mutex::new(Vec::new()));
    {
        let img = ramp(&vips, 2, 2);
        for name in ["first", "second", "third"] {
            let order = order.clone();
            img.on_post_close(move || order.lock().push(name)).unwrap();
        }
    }
    assert_eq!(*order.lock(), vec!["first", "second", "third"]);
}

#[test]
fn test_hook_on_operation_output() {
    let (_sim, vips) = setup();
    let fired = Arc::new(AtomicUsize::new(0));
    let src = ramp(&vips, 3, 3);
    let out = src.add(&src).unwrap();
    let counter = fired.clone();
    out.on_post_close(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    assert_eq!(out.avg().unwrap(), 8.0);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    drop(out);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_released_image_rejected_as_argument() {
    let (_sim, vips) = setup();
    let a = ramp(&vips, 2, 2);
    let b = ramp(&vips, 2, 2);
    b.release();
    let err = vips
        .call("add", &[Value::from(&a), Value::from(&b)], &VOption::new())
        .unwrap_err();
    assert!(matches!(err, VipsError::DisposedHandle));
}

// ===== Mutation =====

#[test]
fn test_mutate_leaves_source_untouched() {
    let (_sim, vips) = setup();
    let src = ramp(&vips, 4, 4);
    let before = src.write_to_memory().unwrap();

    let out = src
        .mutate(|m| {
            m.draw_rect(&[200.0], 0, 0, 4, 4, true)?;
            m.set("title", &Value::from("boxed"))
        })
        .unwrap();

    assert_eq!(src.write_to_memory().unwrap(), before);
    assert!(src.get_typeof("title").unwrap().is_none());
    assert_eq!(out.avg().unwrap(), 200.0);
    assert_eq!(out.get("title").unwrap().as_str(), Some("boxed"));
}

#[test]
fn test_nested_mutation_rejected() {
    let (_sim, vips) = setup();
    let src = ramp(&vips, 2, 2);
    let alias = src.clone();
    let err = src
        .mutate(|_| alias.mutate(|_| Ok(())).map(|_| ()))
        .unwrap_err();
    assert!(matches!(err, VipsError::MutationInProgress));
}

#[test]
fn test_mutations_on_different_images_proceed() {
    let (_sim, vips) = setup();
    let a = ramp(&vips, 2, 2);
    let b = ramp(&vips, 2, 2);
    let out = a
        .mutate(|outer| {
            let inner = b.mutate(|m| m.draw_line(&[1.0], 0, 0, 1, 1))?;
            outer.draw_rect(&[0.0], 0, 0, 2, 2, true)?;
            assert_eq!(inner.getpoint(1, 1).unwrap(), vec![1.0]);
            Ok(())
        })
        .unwrap();
    assert_eq!(out.avg().unwrap(), 0.0);
}

// ===== Progress =====

#[test]
fn test_progress_reports_and_kill() {
    let (_sim, vips) = setup();
    let img = ramp(&vips, 8, 10);
    let signal = Arc::new(ProgressSignal::new());
    img.set_progress(signal.clone()).unwrap();

    img.avg().unwrap();
    assert_eq!(signal.percent(), 100);
    assert_eq!(signal.reports(), 10);

    signal.reset();
    signal.request_kill();
    let err = img.avg().unwrap_err();
    assert!(matches!(err, VipsError::NativeOperation(ref m) if m.contains("killed")));
}

// ===== Concurrency =====

#[test]
fn test_concurrent_calls_share_images() {
    let (sim, vips) = setup();
    let src = ramp(&vips, 16, 16);
    let expected = src.avg().unwrap() * 2.0;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let src = src.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    let sum = src.add(&src).unwrap();
                    assert_eq!(sum.avg().unwrap(), expected);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    drop(src);
    assert_eq!(vips.live_images(), 0);
    assert_eq!(sim.live_objects(), 0);
}

#[test]
fn test_concurrent_describe_is_shared() {
    let (_sim, vips) = setup();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let vips = vips.clone();
            thread::spawn(move || vips.introspector().describe(vips.api(), "linear").unwrap())
        })
        .collect();
    let descriptors: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(descriptors.iter().all(|d| d.args() == descriptors[0].args()));
    assert_eq!(vips.introspector().cached_count(), 1);
}

// ===== Snapshots =====

#[test]
fn test_descriptor_snapshot() {
    let (_sim, vips) = setup();
    let img = ramp(&vips, 2, 2);
    img.avg().unwrap();
    img.call("max", &[], &VOption::new()).unwrap();

    let json = vips.introspector().snapshot_json().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    let names: Vec<_> = parsed
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["name"].as_str().unwrap().to_string())
        .collect();
    assert!(names.contains(&"avg".to_string()));
    assert!(names.contains(&"max".to_string()));
}
