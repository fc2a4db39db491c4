//! End-to-end call tests
//!
//! Drives the binding against the in-process reference library:
//! - Calls with positional arguments, options and output requests
//! - Result shapes (single value, tuple)
//! - Validation failures that never reach the native side
//! - File round trips through the foreign loader/saver lookup
//!
//! # Running Tests
//! ```bash
//! cargo test -p vipsbridge-engine --test call_tests
//! ```

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use vipsbridge_engine::{
    BandFormat, CacheConfig, CallResult, Image, NativeApi, Operation, VOption, Value, ValueBox,
    Vips, VipsConfig, VipsError,
};
use vipsbridge_sim::{OperationDefinition, SimLibrary};

const BUILTIN_OPERATIONS: [&str; 16] = [
    "black",
    "add",
    "subtract",
    "linear",
    "invert",
    "avg",
    "min",
    "max",
    "getpoint",
    "extract_band",
    "copy",
    "profile",
    "draw_rect",
    "draw_line",
    "csvload",
    "csvsave",
];

fn setup() -> (Arc<SimLibrary>, Vips) {
    let sim = Arc::new(SimLibrary::new());
    let vips = Vips::new(sim.clone());
    (sim, vips)
}

fn uncached() -> (Arc<SimLibrary>, Vips) {
    let sim = Arc::new(SimLibrary::new());
    let config = VipsConfig {
        cache: CacheConfig {
            max: 0,
            ..CacheConfig::default()
        },
        ..VipsConfig::default()
    };
    let vips = Vips::with_config(sim.clone(), config).unwrap();
    (sim, vips)
}

fn image(vips: &Vips, pixels: &[u8], width: i32, height: i32) -> Image {
    Image::new_from_memory(vips, pixels, width, height, 1, BandFormat::UChar).unwrap()
}

// ===== Calls =====

#[test]
fn test_add_then_average() {
    let (_sim, vips) = setup();
    let a = image(&vips, &[1, 2, 3, 4], 2, 2);
    let b = image(&vips, &[10, 20, 30, 40], 2, 2);

    let sum = vips
        .call("add", &[Value::from(&a), Value::from(&b)], &VOption::new())
        .unwrap()
        .into_image()
        .unwrap();
    let mean = vips
        .call("avg", &[Value::from(sum)], &VOption::new())
        .unwrap()
        .into_double()
        .unwrap();
    assert_eq!(mean, 27.5);
}

#[test]
fn test_requested_output_makes_tuple() {
    let (sim, vips) = setup();
    sim.register_operation(
        OperationDefinition::new("op_with_two_outputs")
            .required_input("in", "VipsImage", 1)
            .required_output("out", "gdouble", 2)
            .optional_output("out2", "gint", 3)
            .build(|ctx| {
                let width = ctx.image("in")?.width;
                ctx.set_double("out", 0.5);
                ctx.set_int("out2", width * 2);
                Ok(())
            }),
    )
    .unwrap();
    let img = image(&vips, &[0; 6], 3, 2);

    let single = vips
        .call("op_with_two_outputs", &[Value::from(&img)], &VOption::new())
        .unwrap();
    assert_eq!(single, CallResult::Single(Value::Double(0.5)));

    let both = vips
        .call(
            "op_with_two_outputs",
            &[Value::from(&img)],
            &VOption::new().set("out2", true),
        )
        .unwrap();
    assert_eq!(both.into_values(), vec![Value::Double(0.5), Value::Int(6)]);

    let unrequested = vips
        .call(
            "op_with_two_outputs",
            &[Value::from(&img)],
            &VOption::new().set("out2", false),
        )
        .unwrap();
    assert_eq!(unrequested.len(), 1);
}

#[test]
fn test_optional_outputs_in_declaration_order() {
    let (_sim, vips) = setup();
    let img = image(&vips, &[5, 1, 9, 3], 2, 2);
    let values = img
        .call("max", &[], &VOption::new().request("y").request("x"))
        .unwrap()
        .into_values();
    assert_eq!(values, vec![Value::Double(9.0), Value::Int(0), Value::Int(1)]);
}

#[test]
fn test_profile_returns_both_images() {
    let (_sim, vips) = setup();
    let img = image(&vips, &[0, 0, 0, 7], 2, 2);
    let result = img.call("profile", &[], &VOption::new()).unwrap();
    let CallResult::Tuple(images) = result else {
        panic!("expected a tuple");
    };
    assert_eq!(images.len(), 2);
    let columns = images[0].as_image().unwrap();
    let rows = images[1].as_image().unwrap();
    assert_eq!(columns.width().unwrap(), 2);
    assert_eq!(rows.height().unwrap(), 2);
}

#[test]
fn test_constant_operand_is_promoted() {
    let (_sim, vips) = setup();
    let img = image(&vips, &[1, 2, 3, 4], 2, 2);
    let out = vips
        .call("add", &[Value::from(&img), Value::from(10.0)], &VOption::new())
        .unwrap()
        .into_image()
        .unwrap();
    assert_eq!(out.avg().unwrap(), 12.5);
}

#[test]
fn test_named_option_reaches_native_side() {
    let (_sim, vips) = setup();
    let img = Image::new_from_memory(&vips, &[1, 2, 3, 4, 5, 6], 1, 1, 6, BandFormat::UChar).unwrap();
    let out = img
        .call("extract_band", &[Value::from(2)], &VOption::new().set("n", 3))
        .unwrap()
        .into_image()
        .unwrap();
    assert_eq!(out.getpoint(0, 0).unwrap(), vec![3.0, 4.0, 5.0]);
}

#[test]
fn test_bool_value_round_trip() {
    let (sim, vips) = setup();
    let ty = sim.type_from_name("gboolean").unwrap();
    for flag in [true, false] {
        let mut slot = ValueBox::init(&vips, ty);
        slot.set(&Value::Bool(flag)).unwrap();
        assert_eq!(slot.get().unwrap(), Value::Bool(flag));
        assert!(matches!(slot.set(&Value::Bool(!flag)), Err(VipsError::SlotAlreadyWritten)));
        slot.release();
    }
    assert_eq!(sim.live_values(), 0);
}

// ===== Failures =====

#[test]
fn test_unknown_option_then_recover() {
    let (_sim, vips) = setup();
    let err = vips
        .call(
            "black",
            &[Value::from(4), Value::from(4)],
            &VOption::new().set("bogus_option", 1),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        VipsError::UnknownArgument { ref argument, .. } if argument == "bogus_option"
    ));

    let img = vips
        .call("black", &[Value::from(4), Value::from(4)], &VOption::new())
        .unwrap()
        .into_image()
        .unwrap();
    assert_eq!(img.width().unwrap(), 4);
}

#[test]
fn test_unknown_operation() {
    let (sim, vips) = setup();
    let err = vips.call("unknown_op_xyz", &[], &VOption::new()).unwrap_err();
    assert!(matches!(err, VipsError::OperationNotFound(ref name) if name == "unknown_op_xyz"));
    assert!(sim.error_buffer().is_empty());
}

#[test]
fn test_build_failure_message() {
    let (sim, vips) = setup();
    let img = image(&vips, &[0; 4], 2, 2);
    let err = img
        .call("getpoint", &[Value::from(5), Value::from(5)], &VOption::new())
        .unwrap_err();
    let VipsError::NativeOperation(message) = err else {
        panic!("expected a native failure");
    };
    assert!(message.starts_with("getpoint:"));
    assert!(message.contains("outside the image"));
    assert!(sim.error_buffer().is_empty());
}

#[test]
fn test_validation_makes_no_native_calls() {
    let (sim, vips) = setup();
    for name in BUILTIN_OPERATIONS {
        let descriptor = vips.introspector().describe(vips.api(), name).unwrap();
        let too_many = vec![Value::from(1); descriptor.required_input_count() + 1];

        let before = sim.native_calls();
        let err = Operation::call(&vips, name, &too_many, &VOption::new()).unwrap_err();
        assert!(matches!(err, VipsError::ArgumentCount { .. }), "{}: {}", name, err);
        assert_eq!(sim.native_calls(), before, "{} reached the native side", name);
    }
}

#[test]
fn test_too_few_arguments_make_no_native_calls() {
    let (sim, vips) = setup();
    let a = image(&vips, &[1, 2, 3, 4], 2, 2);
    vips.introspector().describe(vips.api(), "add").unwrap();

    let before = sim.native_calls();
    let err = vips.call("add", &[Value::from(&a)], &VOption::new()).unwrap_err();
    assert!(matches!(
        err,
        VipsError::ArgumentCount { expected: 2, got: 1, .. }
    ));
    assert_eq!(sim.native_calls(), before);
}

#[test]
fn test_bad_enum_nick_makes_no_native_calls() {
    let (sim, vips) = setup();
    let img = image(&vips, &[0; 4], 2, 2);
    vips.introspector().describe(vips.api(), "copy").unwrap();

    let before = sim.native_calls();
    let err = img
        .call("copy", &[], &VOption::new().set("format", "bogus"))
        .unwrap_err();
    assert!(matches!(
        err,
        VipsError::ArgumentType { ref argument, ref expected, .. }
            if argument == "format" && expected == "VipsBandFormat"
    ));
    assert_eq!(sim.native_calls(), before);

    let out = img
        .call("copy", &[], &VOption::new().set("format", "ushort"))
        .unwrap()
        .into_image()
        .unwrap();
    assert_eq!(out.format().unwrap(), BandFormat::UShort);
}

#[test]
fn test_in_place_operation_outside_mutate_rejected() {
    let (sim, vips) = uncached();
    let img = image(&vips, &[0; 4], 2, 2);
    vips.introspector().describe(vips.api(), "draw_rect").unwrap();

    let before = sim.native_calls();
    let err = vips
        .call(
            "draw_rect",
            &[
                Value::from(&img),
                Value::from(vec![255.0]),
                Value::from(0),
                Value::from(0),
                Value::from(2),
                Value::from(2),
            ],
            &VOption::new().set("fill", true),
        )
        .unwrap_err();
    assert!(matches!(err, VipsError::ArgumentType { ref argument, .. } if argument == "image"));
    assert!(err.is_validation());
    assert_eq!(sim.native_calls(), before);
    assert_eq!(img.getpoint(0, 0).unwrap(), vec![0.0]);

    let drawn = img
        .mutate(|m| m.draw_rect(&[255.0], 0, 0, 2, 2, true))
        .unwrap();
    assert_eq!(drawn.getpoint(0, 0).unwrap(), vec![255.0]);
    assert_eq!(img.getpoint(0, 0).unwrap(), vec![0.0]);
}

#[test]
fn test_unknown_option_makes_no_native_calls() {
    let (sim, vips) = setup();
    let img = image(&vips, &[0; 4], 2, 2);
    vips.introspector().describe(vips.api(), "invert").unwrap();

    let before = sim.native_calls();
    let err = vips
        .call(
            "invert",
            &[Value::from(&img)],
            &VOption::new().set("not_an_argument", true),
        )
        .unwrap_err();
    assert!(matches!(err, VipsError::UnknownArgument { .. }));
    assert_eq!(sim.native_calls(), before);
}

#[test]
fn test_option_naming_input_and_output_is_ambiguous() {
    let (sim, vips) = setup();
    sim.register_operation(
        OperationDefinition::new("level_both_ways")
            .required_output("out", "gdouble", 1)
            .optional_input("level", "gint", 2)
            .optional_output("level", "gint", 3)
            .build(|ctx| {
                ctx.set_double("out", 1.0);
                Ok(())
            }),
    )
    .unwrap();

    let err = vips
        .call("level_both_ways", &[], &VOption::new().set("level", 3))
        .unwrap_err();
    assert!(matches!(err, VipsError::AmbiguousArgument { ref argument, .. } if argument == "level"));
    assert!(err.is_validation());

    let out = vips
        .call("level_both_ways", &[], &VOption::new())
        .unwrap()
        .into_double()
        .unwrap();
    assert_eq!(out, 1.0);
}

#[test]
fn test_wrong_positional_type() {
    let (_sim, vips) = setup();
    let err = vips
        .call("black", &[Value::from("wide"), Value::from(4)], &VOption::new())
        .unwrap_err();
    assert!(matches!(err, VipsError::ArgumentType { ref argument, .. } if argument == "width"));
}

#[test]
fn test_outputs_released_when_dropped() {
    let (sim, vips) = uncached();
    {
        let a = image(&vips, &[1, 2, 3, 4], 2, 2);
        let b = a.add(&a).unwrap();
        let c = b.extract_band(0, 1).unwrap();
        assert_eq!(c.avg().unwrap(), 5.0);
        assert_eq!(vips.live_images(), 3);
    }
    assert_eq!(vips.live_images(), 0);
    assert_eq!(sim.live_objects(), 0);
}

// ===== Files =====

#[test]
fn test_csv_round_trip() {
    let (_sim, vips) = setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grid.csv");

    let img = image(&vips, &[1, 2, 3, 4, 5, 6], 3, 2);
    img.write_to_file(&path, &VOption::new()).unwrap();
    assert!(path.is_file());

    let back = Image::new_from_file(&vips, &path, &VOption::new()).unwrap();
    assert_eq!((back.width().unwrap(), back.height().unwrap()), (3, 2));
    assert_eq!(back.getpoint(2, 1).unwrap(), vec![6.0]);
}

#[test]
fn test_csv_options_and_flags() {
    let (_sim, vips) = setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("semi.csv");
    std::fs::write(&path, "header line\n1;2\n3;4\n").unwrap();

    let result = vips
        .call(
            "csvload",
            &[Value::from(path.to_string_lossy().into_owned())],
            &VOption::new()
                .set("skip", 1)
                .set("separator", ";")
                .request("flags"),
        )
        .unwrap();
    let values = result.into_values();
    assert_eq!(values.len(), 2);
    assert_eq!(values[0].as_image().unwrap().avg().unwrap(), 2.5);
    assert_eq!(values[1], Value::Flags(0));
}

#[test]
fn test_missing_file() {
    let (sim, vips) = setup();
    let dir = tempfile::tempdir().unwrap();
    let err = Image::new_from_file(&vips, dir.path().join("nope.csv"), &VOption::new())
        .unwrap_err();
    assert!(matches!(err, VipsError::NativeOperation(ref m) if m.contains("does not exist")));
    assert!(sim.error_buffer().is_empty());
}

// ===== Log channel =====

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_native_warning_is_logged_not_raised() {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .with_writer(move || writer.clone())
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let (_sim, vips) = setup();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragged.csv");
        std::fs::write(&path, "1\t2\t3\n4\n").unwrap();

        let img = Image::new_from_file(&vips, &path, &VOption::new()).unwrap();
        assert_eq!(img.width().unwrap(), 3);
    });

    let text = String::from_utf8(captured.0.lock().clone()).unwrap();
    assert!(text.contains("WARN"), "{}", text);
    assert!(text.contains("padding"), "{}", text);
    assert!(text.contains("csvload"), "{}", text);
}
