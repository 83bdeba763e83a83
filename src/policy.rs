// SPDX-License-Identifier: Apache-2.0 OR MIT
// Policy contract and the reference policies

use std::collections::HashSet;
use std::sync::Mutex;

use crate::level::LevelSet;
use crate::site::{CallSite, SiteRef};
use crate::sink::SinkRef;

/// Membership deltas handed to a policy's `update`.
///
/// `inserted` holds sites new to the policy, `removed` sites it must
/// relinquish, `kept` everything else it still manages. The engine
/// folds `inserted` into `kept` after a successful update.
#[derive(Default)]
pub struct ChangeSet {
    pub inserted: HashSet<SiteRef>,
    pub removed: HashSet<SiteRef>,
    pub kept: HashSet<SiteRef>,
}

impl ChangeSet {
    pub fn new() -> Self {
        ChangeSet::default()
    }

    /// Check if any membership changes are pending.
    pub fn pending(&self) -> bool {
        !self.inserted.is_empty() || !self.removed.is_empty()
    }

    /// Collapse applied changes into the kept set.
    pub(crate) fn apply(&mut self) {
        self.kept.extend(self.inserted.drain());
        self.removed.clear();
    }

    /// Stage sites as newly owned by this policy.
    pub(crate) fn stage_insert<I: IntoIterator<Item = SiteRef>>(&mut self, sites: I) {
        self.inserted.extend(sites);
    }

    /// Stage currently kept sites for relinquishment.
    pub(crate) fn stage_remove<I: IntoIterator<Item = SiteRef>>(&mut self, sites: I) {
        for site in sites {
            self.kept.remove(&site);
            self.removed.insert(site);
        }
    }

    /// Drop sites from this policy without staging a disable write;
    /// used when another policy takes over and installs its own sink.
    pub(crate) fn forget<'a, I: IntoIterator<Item = &'a SiteRef>>(&mut self, sites: I) {
        for site in sites {
            self.kept.remove(site);
        }
    }
}

/// A matcher-plus-configurator controlling a subset of call sites.
///
/// `select` is a pure predicate the engine may invoke repeatedly;
/// `update` pushes the policy's desired sink and mask into the sites
/// of a change set. The contract: write sink and mask to
/// `inserted` and `kept`, write `None` to the sinks of `removed`.
pub trait Policy: Send + Sync {
    /// Select the subset of `sites` this policy matches.
    fn select(&self, sites: &HashSet<SiteRef>) -> Vec<SiteRef>;

    /// Push configuration into the sites of `changes`.
    fn update(&self, changes: &ChangeSet);
}

/// Site predicate over (tag, location, context).
pub trait SitePredicate: Send + Sync {
    fn matches(&self, site: &CallSite) -> bool;
}

impl<F> SitePredicate for F
where
    F: Fn(&CallSite) -> bool + Send + Sync,
{
    fn matches(&self, site: &CallSite) -> bool {
        self(site)
    }
}

/// Predicate that matches every site.
pub struct MatchAll;

impl SitePredicate for MatchAll {
    fn matches(&self, _site: &CallSite) -> bool {
        true
    }
}

struct Desired {
    sink: Option<SinkRef>,
    levels: LevelSet,
}

/// Policy applying one sink/mask configuration to every site its
/// predicate matches.
pub struct PredicatePolicy<P: SitePredicate> {
    desired: Mutex<Desired>,
    predicate: P,
}

/// Catch-all policy; the global configuration installs one at the
/// lowest priority.
pub type DefaultPolicy = PredicatePolicy<MatchAll>;

impl DefaultPolicy {
    /// Match-all policy with the given configuration.
    pub fn match_all(sink: Option<SinkRef>, levels: LevelSet) -> Self {
        PredicatePolicy::new(sink, levels, MatchAll)
    }
}

impl<P: SitePredicate> PredicatePolicy<P> {
    pub fn new(sink: Option<SinkRef>, levels: LevelSet, predicate: P) -> Self {
        PredicatePolicy {
            desired: Mutex::new(Desired { sink, levels }),
            predicate,
        }
    }

    /// Change the sink for matched sites.
    ///
    /// Call `Configuration::update` on this policy's priority to push
    /// the change into already-managed sites.
    pub fn set_sink(&self, sink: Option<SinkRef>) {
        lock(&self.desired).sink = sink;
    }

    /// Change the enabled levels for matched sites.
    ///
    /// Call `Configuration::update` to take effect.
    pub fn set_levels(&self, levels: LevelSet) {
        lock(&self.desired).levels = levels;
    }

    pub fn sink(&self) -> Option<SinkRef> {
        lock(&self.desired).sink.clone()
    }

    pub fn levels(&self) -> LevelSet {
        lock(&self.desired).levels
    }
}

impl<P: SitePredicate> Policy for PredicatePolicy<P> {
    fn select(&self, sites: &HashSet<SiteRef>) -> Vec<SiteRef> {
        sites
            .iter()
            .copied()
            .filter(|site| self.predicate.matches(site))
            .collect()
    }

    fn update(&self, changes: &ChangeSet) {
        let desired = lock(&self.desired);
        for site in changes.inserted.iter().chain(changes.kept.iter()) {
            // Mask first so an enabling swap exposes the right levels.
            site.set_levels(desired.levels);
            site.set_sink(desired.sink.clone());
        }
        for site in changes.removed.iter() {
            site.set_sink(None);
        }
    }
}

/// Poison-tolerant lock: a panicking policy must not wedge the engine.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::Level;
    use crate::message::Message;
    use crate::sink::{sink_ref, Sink};

    struct CountingSink;

    impl Sink for CountingSink {
        fn emit(&self, _site: &'static CallSite, _message: Message) {}
    }

    fn leaked_site(tag: &'static str) -> SiteRef {
        let site = Box::leak(Box::new(CallSite::new(tag, "policy.rs:0", "policy::tests")));
        site.mark_registered();
        SiteRef::new(site)
    }

    #[test]
    fn test_match_all_selects_everything() {
        let policy = DefaultPolicy::match_all(None, LevelSet::all());
        let sites: HashSet<_> = [leaked_site("a"), leaked_site("b")].into_iter().collect();
        assert_eq!(policy.select(&sites).len(), 2);
    }

    #[test]
    fn test_predicate_selects_by_tag() {
        let policy = PredicatePolicy::new(None, LevelSet::all(), |site: &CallSite| {
            site.tag() == "wanted"
        });
        let wanted = leaked_site("wanted");
        let sites: HashSet<_> = [wanted, leaked_site("other")].into_iter().collect();
        let matched = policy.select(&sites);
        assert_eq!(matched, vec![wanted]);
    }

    #[test]
    fn test_update_writes_inserted_and_kept() {
        let mask = LevelSet::of(&[Level::Error]);
        let policy = DefaultPolicy::match_all(Some(sink_ref(CountingSink)), mask);

        let inserted = leaked_site("ins");
        let kept = leaked_site("kept");
        let removed = leaked_site("rem");
        removed.get().set_sink(Some(sink_ref(CountingSink)));

        let mut changes = ChangeSet::new();
        changes.stage_insert([inserted]);
        changes.kept.insert(kept);
        changes.stage_remove([removed]);

        policy.update(&changes);

        assert!(inserted.get().is_enabled());
        assert_eq!(inserted.get().levels(), mask);
        assert!(kept.get().is_enabled());
        assert!(!removed.get().is_enabled());
    }

    #[test]
    fn test_reconfigure_desired_state() {
        let policy = DefaultPolicy::match_all(None, LevelSet::all());
        policy.set_levels(LevelSet::only(Level::Critical));
        policy.set_sink(Some(sink_ref(CountingSink)));
        assert_eq!(policy.levels(), LevelSet::only(Level::Critical));
        assert!(policy.sink().is_some());
    }

    #[test]
    fn test_changeset_apply_folds_inserts() {
        let mut changes = ChangeSet::new();
        let site = leaked_site("fold");
        changes.stage_insert([site]);
        assert!(changes.pending());

        changes.apply();
        assert!(!changes.pending());
        assert!(changes.kept.contains(&site));
    }

    #[test]
    fn test_changeset_forget_skips_disable() {
        let mut changes = ChangeSet::new();
        let site = leaked_site("forget");
        changes.kept.insert(site);
        changes.forget([&site]);
        assert!(changes.kept.is_empty());
        assert!(changes.removed.is_empty());
    }
}
