//! Declarative defaults for configuration objects.
//!
//! Configuration structs declare `(field, literal, slot)` entries and
//! [`set_defaults`] interprets each literal by the slot's semantic type.
//! The registry of slot types is closed: strings, comma-delimited string
//! sequences, plain booleans and optional booleans. Any other slot type
//! fails with [`BuildError::UnsupportedDefault`].
//!
//! Plain booleans carry a trap that is part of the contract: an unset
//! `bool` is indistinguishable from an explicit `false`, so a declared
//! default of `true` overrides a caller's `false`. Callers that need to
//! express `false` against a `true` default must use `Option<bool>`.
//! Optional booleans are always materialised to `Some` so later code can
//! rely on the value being present.

use crate::error::BuildError;
use std::any::Any;

/// One defaultable field: a stable name for diagnostics, the declared
/// literal, and a mutable handle on the storage.
pub struct DefaultEntry<'a> {
    pub field: &'static str,
    pub value: &'static str,
    pub slot: &'a mut dyn Any,
}

/// Implemented by configuration objects that declare defaults.
///
/// The engine only ever sees objects through a mutable handle, so the
/// original requirement that the root be mutable is enforced by the type
/// system rather than checked at runtime.
pub trait FillDefaults {
    /// The object's own defaultable fields.
    fn defaults(&mut self) -> Vec<DefaultEntry<'_>>;

    /// Nested owned objects to default recursively; sequences contribute
    /// one child per element.
    fn children(&mut self) -> Vec<&mut dyn FillDefaults> {
        Vec::new()
    }
}

/// Apply declared defaults to `root` and, recursively, to its children.
/// Non-empty fields are left untouched; applying twice is the same as
/// applying once.
pub fn set_defaults(root: &mut dyn FillDefaults) -> Result<(), BuildError> {
    for entry in root.defaults() {
        apply(entry)?;
    }
    for child in root.children() {
        set_defaults(child)?;
    }
    Ok(())
}

fn apply(entry: DefaultEntry<'_>) -> Result<(), BuildError> {
    let DefaultEntry { field, value, slot } = entry;

    if let Some(s) = slot.downcast_mut::<String>() {
        if s.is_empty() {
            *s = value.to_string();
        }
        return Ok(());
    }
    if let Some(v) = slot.downcast_mut::<Vec<String>>() {
        if v.is_empty() {
            *v = value.split(',').map(str::to_string).collect();
        }
        return Ok(());
    }
    if let Some(b) = slot.downcast_mut::<bool>() {
        // false may be "unset" or an explicit caller false; the two cannot
        // be told apart, so the declared default wins over false.
        if !*b {
            *b = parse_bool(field, value)?;
        }
        return Ok(());
    }
    if let Some(ob) = slot.downcast_mut::<Option<bool>>() {
        if ob.is_none() {
            *ob = Some(parse_bool(field, value)?);
        }
        return Ok(());
    }

    Err(BuildError::UnsupportedDefault {
        field: field.to_string(),
    })
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool, BuildError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(BuildError::UnsupportedDefault {
            field: field.to_string(),
        }),
    }
}
