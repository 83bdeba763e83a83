// SPDX-License-Identifier: Apache-2.0 OR MIT
// Message closures: heterogeneous capture with deferred formatting

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::erasure::Erasure;
use crate::reflect::{Inspect, Reflection};

/// A value a call site may capture into a message.
///
/// Blanket-implemented for every streamable, sendable `'static` type;
/// user types qualify by implementing `Display`.
pub trait Element: fmt::Display + Any + Send + Sync {}

impl<T> Element for T where T: fmt::Display + Any + Send + Sync {}

/// The closure interface over captured data.
///
/// `serialize` writes each captured element's text rendering in
/// capture order; `len`/`reflect` expose the elements for runtime
/// inspection.
pub trait Content: Send + Sync {
    /// Write the enclosed contents to the provided stream.
    fn serialize(&self, out: &mut dyn fmt::Write) -> fmt::Result;

    /// Number of captured elements.
    fn len(&self) -> usize;

    /// Reflect the element at `index`.
    fn reflect(&self, index: usize) -> Option<Reflection<'_>>;
}

/// Tuple closure body; one allocation sized exactly for its elements.
struct Body<T> {
    elements: T,
}

mod sealed {
    pub trait Sealed {}
}

/// Tuples of [`Element`]s accepted by [`Message::capture`] and
/// [`MessageBuilder::format`]. Implemented for arities 1 through 12;
/// [`MessageBuilder::push`] covers larger or dynamic captures.
pub trait Arguments: sealed::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_content(self) -> Arc<dyn Content>;
}

macro_rules! tuple_arguments {
    ($($name:ident => $idx:tt),+) => {
        impl<$($name,)+> sealed::Sealed for ($($name,)+)
        where
            $($name: Element,)+
        {
        }

        impl<$($name,)+> Arguments for ($($name,)+)
        where
            $($name: Element,)+
        {
            fn into_content(self) -> Arc<dyn Content> {
                Arc::new(Body { elements: self })
            }
        }

        impl<$($name,)+> Content for Body<($($name,)+)>
        where
            $($name: Element,)+
        {
            fn serialize(&self, out: &mut dyn fmt::Write) -> fmt::Result {
                $(write!(out, "{}", self.elements.$idx)?;)+
                Ok(())
            }

            fn len(&self) -> usize {
                [$(stringify!($name)),+].len()
            }

            fn reflect(&self, index: usize) -> Option<Reflection<'_>> {
                match index {
                    $($idx => Some(Reflection::of(&self.elements.$idx)),)+
                    _ => None,
                }
            }
        }
    };
}

tuple_arguments!(A => 0);
tuple_arguments!(A => 0, B => 1);
tuple_arguments!(A => 0, B => 1, C => 2);
tuple_arguments!(A => 0, B => 1, C => 2, D => 3);
tuple_arguments!(A => 0, B => 1, C => 2, D => 3, E => 4);
tuple_arguments!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5);
tuple_arguments!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6);
tuple_arguments!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7);
tuple_arguments!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7, I => 8);
tuple_arguments!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7, I => 8, J => 9);
tuple_arguments!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7, I => 8, J => 9, K => 10);
tuple_arguments!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7, I => 8, J => 9, K => 10, L => 11);

/// Closure body over individually erased cells, for captures assembled
/// one element at a time.
struct DynamicBody {
    parts: Box<[Erasure]>,
}

impl Content for DynamicBody {
    fn serialize(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        for part in self.parts.iter() {
            part.render(out)?;
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.parts.len()
    }

    fn reflect(&self, index: usize) -> Option<Reflection<'_>> {
        self.parts.get(index)?.reflect()
    }
}

/// A portable closure over a call site's captured arguments.
///
/// Formatting is deferred: capture moves the argument values into a
/// refcounted body, and serialization renders them later, typically on
/// a sink worker thread. Cloning a message shares the body without
/// copying the elements, so several consumers may observe one capture.
#[derive(Clone, Default)]
pub struct Message {
    content: Option<Arc<dyn Content>>,
}

impl Message {
    /// A message holding nothing.
    ///
    /// Serializing it produces a `<Empty Message@...>` placeholder
    /// rather than failing.
    pub const fn empty() -> Self {
        Message { content: None }
    }

    /// Capture a tuple of arguments into a fresh closure.
    pub fn capture<A: Arguments>(args: A) -> Self {
        Message {
            content: Some(args.into_content()),
        }
    }

    /// Build a closure from pre-erased cells.
    pub fn from_parts(parts: Vec<Erasure>) -> Self {
        Message {
            content: Some(Arc::new(DynamicBody {
                parts: parts.into_boxed_slice(),
            })),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none()
    }

    /// Access the closure contents, if populated.
    pub fn content(&self) -> Option<&dyn Content> {
        self.content.as_deref()
    }

    /// Write the message text to `out`.
    ///
    /// Elements are rendered in capture order with no separators; an
    /// empty message renders a diagnostic placeholder including its
    /// address.
    pub fn serialize(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        match &self.content {
            Some(content) => content.serialize(out),
            None => write!(out, "<Empty Message@{:p}>", self as *const Message),
        }
    }
}

impl Inspect for Message {
    fn len(&self) -> usize {
        self.content.as_ref().map(|c| c.len()).unwrap_or(0)
    }

    fn reflect(&self, index: usize) -> Option<Reflection<'_>> {
        self.content.as_ref()?.reflect(index)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.serialize(f)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("elements", &Inspect::len(self))
            .finish()
    }
}

/// Builder handed to a call site's record when a message is
/// materialized.
///
/// The fast path calls [`format`] with the argument tuple; arbitrary-
/// arity or programmatic captures go through [`push`]. A builder that
/// was never fed yields an empty message.
///
/// [`format`]: MessageBuilder::format
/// [`push`]: MessageBuilder::push
#[derive(Default)]
pub struct MessageBuilder {
    content: Option<Arc<dyn Content>>,
    parts: Vec<Erasure>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        MessageBuilder::default()
    }

    /// Capture a tuple of arguments, replacing any prior capture.
    pub fn format<A: Arguments>(&mut self, args: A) {
        self.content = Some(args.into_content());
        self.parts.clear();
    }

    /// Append one pre-erased cell.
    pub fn push(&mut self, part: Erasure) -> &mut Self {
        self.parts.push(part);
        self
    }

    /// Append one cloneable value.
    pub fn push_value<T>(&mut self, value: T) -> &mut Self
    where
        T: fmt::Display + Any + Send + Sync + Clone,
    {
        self.push(Erasure::new(value))
    }

    pub fn finish(self) -> Message {
        if let Some(content) = self.content {
            Message {
                content: Some(content),
            }
        } else if !self.parts.is_empty() {
            Message::from_parts(self.parts)
        } else {
            Message::empty()
        }
    }
}
