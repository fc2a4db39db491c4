//! Mutation scope
//!
//! A [`MutableImage`] wraps a private copy of an image for the duration of
//! [`Image::mutate`]. Only here may in-place (MODIFY) operations run and
//! header fields be written.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::error::{Result, VipsError};
use crate::image::Image;
use crate::operation::{CallResult, Operation, VOption};
use crate::value::{Value, ValueBox};

/// Native type used to store a header value of each shape
static FIELD_TYPES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("bool", "gboolean"),
        ("int", "gint"),
        ("uint64", "guint64"),
        ("double", "gdouble"),
        ("string", "gchararray"),
        ("double array", "VipsArrayDouble"),
        ("int array", "VipsArrayInt"),
        ("blob", "VipsBlob"),
        ("image", "VipsImage"),
        ("image array", "VipsArrayImage"),
    ])
});

/// Image open for in-place modification.
pub struct MutableImage {
    image: Image,
}

impl MutableImage {
    pub(crate) fn new(image: Image) -> Self {
        Self { image }
    }

    /// The image being modified
    pub fn image(&self) -> &Image {
        &self.image
    }

    pub(crate) fn into_image(self) -> Image {
        self.image
    }

    /// Run an operation that modifies this image in place. The image fills
    /// the operation's first positional argument.
    pub fn call(&mut self, name: &str, args: &[Value], options: &VOption) -> Result<CallResult> {
        let descriptor = self
            .image
            .vips()
            .introspector()
            .describe(self.image.vips().api(), name)?;
        if descriptor.modify_position() != Some(0) {
            return Err(VipsError::argument_type(
                name,
                "an operation that modifies its first argument",
                "a plain operation",
            ));
        }

        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(Value::from(&self.image));
        all.extend_from_slice(args);
        let result = Operation::call_in_place(self.image.vips(), name, &all, options)?;
        self.image.invalidate()?;
        Ok(result)
    }

    /// Paint a rectangle; `fill = false` draws the outline only
    pub fn draw_rect(
        &mut self,
        ink: &[f64],
        left: i32,
        top: i32,
        width: i32,
        height: i32,
        fill: bool,
    ) -> Result<()> {
        self.call(
            "draw_rect",
            &[
                Value::from(ink),
                Value::from(left),
                Value::from(top),
                Value::from(width),
                Value::from(height),
            ],
            &VOption::new().set("fill", fill),
        )?;
        Ok(())
    }

    pub fn draw_line(&mut self, ink: &[f64], x1: i32, y1: i32, x2: i32, y2: i32) -> Result<()> {
        self.call(
            "draw_line",
            &[
                Value::from(ink),
                Value::from(x1),
                Value::from(y1),
                Value::from(x2),
                Value::from(y2),
            ],
            &VOption::new(),
        )?;
        Ok(())
    }

    // ========================================================================
    // Header
    // ========================================================================

    /// Write a header field, typed from the shape of `value`
    pub fn set(&mut self, name: &str, value: &Value) -> Result<()> {
        let type_name = FIELD_TYPES.get(value.type_name()).ok_or_else(|| {
            VipsError::argument_type(name, "a header value", value.type_name())
        })?;
        self.set_typed(name, type_name, value)
    }

    /// Write a header field with an explicit native type
    pub fn set_typed(&mut self, name: &str, type_name: &str, value: &Value) -> Result<()> {
        let ptr = self.image.ptr()?;
        let vips = self.image.vips();
        let ty = vips
            .api()
            .type_from_name(type_name)
            .ok_or_else(|| VipsError::argument_type(name, "a registered type", type_name))?;

        let mut slot = ValueBox::init(vips, ty);
        slot.set(value)?;
        vips.api().image_set(ptr, name, slot.ptr());
        Ok(())
    }

    /// Remove a header field; returns whether it existed
    pub fn remove(&mut self, name: &str) -> Result<bool> {
        let ptr = self.image.ptr()?;
        Ok(self.image.vips().api().image_remove(ptr, name))
    }
}
