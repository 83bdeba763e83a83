// SPDX-License-Identifier: Apache-2.0 OR MIT
// Type-erased single-value cell with value semantics

use std::any::Any;
use std::fmt;

use crate::error::Error;
use crate::reflect::{Reflection, TypeTraits};

/// Interface a cell exposes over its stored value.
trait Cell: Send + Sync {
    fn reflect(&self) -> Reflection<'_>;
    fn render(&self, out: &mut dyn fmt::Write) -> fmt::Result;
    fn try_clone(&self) -> Result<Box<dyn Cell>, Error>;
    fn type_name(&self) -> &'static str;
}

/// Cell for values that support duplication.
struct CloneCell<T>(T);

impl<T> Cell for CloneCell<T>
where
    T: fmt::Display + Any + Send + Sync + Clone,
{
    fn reflect(&self) -> Reflection<'_> {
        Reflection::of(&self.0).with_traits(TypeTraits::CLONEABLE)
    }

    fn render(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "{}", self.0)
    }

    fn try_clone(&self) -> Result<Box<dyn Cell>, Error> {
        Ok(Box::new(CloneCell(self.0.clone())))
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Cell for values without a usable `Clone`.
struct SealedCell<T>(T);

impl<T> Cell for SealedCell<T>
where
    T: fmt::Display + Any + Send + Sync,
{
    fn reflect(&self) -> Reflection<'_> {
        Reflection::of(&self.0)
    }

    fn render(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "{}", self.0)
    }

    fn try_clone(&self) -> Result<Box<dyn Cell>, Error> {
        Err(Error::CloneUnsupported(std::any::type_name::<T>()))
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A wrapper that may hold any streamable value, preserving value
/// semantics.
///
/// Moving an `Erasure` moves the stored value with it; [`try_clone`]
/// duplicates it. Cells created with [`Erasure::sealed`] refuse
/// duplication with [`Error::CloneUnsupported`] and leave both sides
/// untouched.
///
/// Storage is a single boxed cell; the stored value is reachable only
/// through [`Reflection`], keeping access type-checked.
///
/// [`try_clone`]: Erasure::try_clone
pub struct Erasure {
    cell: Option<Box<dyn Cell>>,
}

impl Erasure {
    /// Capture a cloneable value.
    pub fn new<T>(value: T) -> Self
    where
        T: fmt::Display + Any + Send + Sync + Clone,
    {
        Erasure {
            cell: Some(Box::new(CloneCell(value))),
        }
    }

    /// Capture a value that cannot (or must not) be duplicated.
    pub fn sealed<T>(value: T) -> Self
    where
        T: fmt::Display + Any + Send + Sync,
    {
        Erasure {
            cell: Some(Box::new(SealedCell(value))),
        }
    }

    /// An erasure holding nothing.
    pub const fn empty() -> Self {
        Erasure { cell: None }
    }

    pub fn is_empty(&self) -> bool {
        self.cell.is_none()
    }

    /// Drop the stored value, leaving the erasure empty.
    pub fn clear(&mut self) {
        self.cell = None;
    }

    /// Reflect the stored value; `None` when empty.
    pub fn reflect(&self) -> Option<Reflection<'_>> {
        self.cell.as_ref().map(|cell| cell.reflect())
    }

    /// Check the stored type.
    pub fn is<T: Any>(&self) -> bool {
        self.reflect().map(|r| r.is::<T>()).unwrap_or(false)
    }

    /// Borrow the stored value as `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.cell.as_ref()?.reflect().downcast_ref::<T>()
    }

    /// Duplicate the stored value into a fresh erasure.
    ///
    /// Fails with [`Error::CloneUnsupported`] for sealed cells; no
    /// state is mutated on failure. Cloning an empty erasure yields an
    /// empty erasure.
    pub fn try_clone(&self) -> Result<Erasure, Error> {
        match &self.cell {
            None => Ok(Erasure::empty()),
            Some(cell) => Ok(Erasure {
                cell: Some(cell.try_clone()?),
            }),
        }
    }

    /// Name of the stored type, for diagnostics.
    pub fn type_name(&self) -> Option<&'static str> {
        self.cell.as_ref().map(|cell| cell.type_name())
    }

    pub(crate) fn render(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        match &self.cell {
            Some(cell) => cell.render(out),
            None => Ok(()),
        }
    }
}

impl Default for Erasure {
    fn default() -> Self {
        Erasure::empty()
    }
}

impl fmt::Display for Erasure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f)
    }
}

impl fmt::Debug for Erasure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.type_name() {
            Some(name) => write!(f, "Erasure<{}>", name),
            None => f.write_str("Erasure<empty>"),
        }
    }
}
