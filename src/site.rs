// SPDX-License-Identifier: Apache-2.0 OR MIT
// Call-site records and the emission fast path

use arc_swap::ArcSwapOption;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::level::{Level, LevelSet};
use crate::message::MessageBuilder;
use crate::sink::{Sink, SinkRef};

/// The statically scoped record installed at every log site.
///
/// A record is constructed once (usually by a macro, as a `static`)
/// and never moves for the life of the process. The sink slot is the
/// only field the fast path consults before the level mask: the site
/// is **enabled** iff the slot holds a sink. Policies rewrite the slot
/// and mask from any thread; the fast path reads both without locks.
///
/// A freshly constructed record is unregistered: its first activation
/// takes the cold path, which registers it with the global
/// configuration so that policies installed before the site ever ran
/// take effect on its very first call.
pub struct CallSite {
    sink: ArcSwapOption<Box<dyn Sink>>,
    levels: AtomicU8,
    registered: AtomicBool,
    tag: &'static str,
    location: &'static str,
    context: &'static str,
}

impl CallSite {
    /// Build a record; `const` so macros can install it statically.
    ///
    /// The level mask starts all-ones and the sink slot empty.
    pub const fn new(tag: &'static str, location: &'static str, context: &'static str) -> Self {
        CallSite {
            sink: ArcSwapOption::const_empty(),
            levels: AtomicU8::new(LevelSet::all().bits()),
            registered: AtomicBool::new(false),
            tag,
            location,
            context,
        }
    }

    /// Matching key chosen by the author.
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// Unique identifier, conventionally `file:line`.
    pub fn location(&self) -> &'static str {
        self.location
    }

    /// Enclosing scope, conventionally the module path.
    pub fn context(&self) -> &'static str {
        self.context
    }

    /// Currently enabled levels.
    #[inline]
    pub fn levels(&self) -> LevelSet {
        LevelSet::from_bits(self.levels.load(Ordering::Relaxed))
    }

    /// Rewrite the level mask. Takes effect on subsequent calls.
    pub fn set_levels(&self, levels: LevelSet) {
        self.levels.store(levels.bits(), Ordering::Relaxed);
    }

    /// Current sink, if the site is enabled.
    pub fn sink(&self) -> Option<SinkRef> {
        self.sink.load_full()
    }

    /// Install or clear the sink. `None` disables the site.
    pub fn set_sink(&self, sink: Option<SinkRef>) {
        self.sink.store(sink);
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.load().is_some()
    }

    pub(crate) fn mark_registered(&self) {
        self.registered.store(true, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Relaxed)
    }

    /// Fast conditional logging.
    ///
    /// Order: relaxed sink load, level-mask test, materialize the
    /// closure through `build`, hand `(site, message)` to the sink.
    /// When the site is disabled the builder never runs, so argument
    /// formatting costs nothing.
    #[inline]
    pub fn log<F>(&'static self, level: Level, build: F)
    where
        F: FnOnce(&mut MessageBuilder),
    {
        {
            let guard = self.sink.load();
            if let Some(sink) = guard.as_ref() {
                if !self.levels().contains(level) {
                    return;
                }
                let mut builder = MessageBuilder::new();
                build(&mut builder);
                // The guard pins the sink for the duration of emit, so
                // a concurrent policy swap cannot free it under us.
                sink.emit(self, builder.finish());
                return;
            }
            if self.registered.load(Ordering::Relaxed) {
                return;
            }
        }
        self.first_use(build);
    }

    /// Cold path for a site's first activation(s): materialize the
    /// message and let the bootstrap register the site, gate and
    /// deliver.
    #[cold]
    fn first_use<F>(&'static self, build: F)
    where
        F: FnOnce(&mut MessageBuilder),
    {
        let mut builder = MessageBuilder::new();
        build(&mut builder);
        crate::global::bootstrap_emit(self, builder.finish());
    }
}

impl std::fmt::Debug for CallSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSite")
            .field("tag", &self.tag)
            .field("location", &self.location)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Pointer-identity handle to a process-lifetime call site.
///
/// Policies and the engine track sites in hash sets keyed by record
/// address; two handles are equal iff they reference the same record.
#[derive(Clone, Copy)]
pub struct SiteRef(&'static CallSite);

impl SiteRef {
    pub fn new(site: &'static CallSite) -> Self {
        SiteRef(site)
    }

    pub fn get(self) -> &'static CallSite {
        self.0
    }
}

impl Deref for SiteRef {
    type Target = CallSite;

    fn deref(&self) -> &Self::Target {
        self.0
    }
}

impl PartialEq for SiteRef {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl Eq for SiteRef {}

impl Hash for SiteRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.0 as *const CallSite as usize).hash(state);
    }
}

impl std::fmt::Debug for SiteRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SiteRef({})", self.0.location)
    }
}
